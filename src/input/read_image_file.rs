// 该文件是 Qingyan （清眼） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use chrono::Utc;
use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{CameraFrame, PixelData},
  input::{FrameOptions, InvalidParameter, url_path},
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error(transparent)]
  InvalidParameter(#[from] InvalidParameter),
}

/// 将一张静态图片作为一帧或多帧 RGB 相机帧
pub struct ImageFileInput {
  image: RgbImage,
  options: FrameOptions,
  repeat: u64,
  emitted: u64,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  /// `image:///path/to/a.jpg?repeat=100&rotation=90&facing=front`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let options = FrameOptions::from_url(url)?;
    let repeat = match url.query_pairs().find(|(k, _)| k == "repeat") {
      Some((_, v)) => v.parse::<u64>().map_err(|_| InvalidParameter {
        key: "repeat".to_string(),
        value: v.to_string(),
      })?,
      None => 1,
    };

    let path = url_path(url);
    let image = ImageReader::open(&path)?.decode()?.into_rgb8();
    info!(
      "读取图像 {}: {}x{}",
      path,
      image.width(),
      image.height()
    );

    Ok(ImageFileInput::new(image, options, repeat))
  }
}

impl ImageFileInput {
  pub fn new(image: RgbImage, options: FrameOptions, repeat: u64) -> Self {
    Self {
      image,
      options,
      repeat,
      emitted: 0,
    }
  }
}

impl Iterator for ImageFileInput {
  type Item = CameraFrame;

  fn next(&mut self) -> Option<Self::Item> {
    if self.emitted >= self.repeat {
      return None;
    }
    let index = self.emitted;
    self.emitted += 1;
    let frame = CameraFrame::new(index, PixelData::Rgb(self.image.clone()))
      .with_timestamp(Utc::now().timestamp_millis().max(0) as u64);
    Some(self.options.apply(frame))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::Rotation;

  #[test]
  fn repeats_frames_with_options() {
    let options = FrameOptions {
      rotation: Rotation::Deg180,
      ..Default::default()
    };
    let frames: Vec<_> = ImageFileInput::new(RgbImage::new(3, 2), options, 3).collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[2].index, 2);
    assert_eq!(frames[0].rotation, Rotation::Deg180);
    assert_eq!(frames[0].pixels.dimensions(), (3, 2));
    assert!(frames[0].timestamp_ms > 0);
  }

  #[test]
  fn reads_image_from_url() {
    let file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
    let path = file.path();
    RgbImage::new(5, 4).save(path).unwrap();
    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    assert_eq!(input.next().unwrap().pixels.dimensions(), (5, 4));
    assert!(input.next().is_none());

    let bad = Url::parse("image:///nonexistent/qingyan.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&bad),
      Err(ImageFileInputError::IoError(_))
    ));
  }
}
