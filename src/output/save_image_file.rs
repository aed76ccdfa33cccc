// 该文件是 Qingyan （清眼） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{
    Render,
    draw::{Draw, DrawError, parse_view},
  },
  pipeline::FrameReport,
};

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("绘制错误: {0}")]
  DrawError(#[from] DrawError),
  #[error("无效的视图尺寸: {0}")]
  InvalidView(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub struct SaveImageFileOutput {
  path: PathBuf,
  draw: Draw,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  /// `image:///out/frame.png?view=640x480&font=/usr/share/fonts/x.ttf`
  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let mut draw = Draw::default();
    for (key, value) in uri.query_pairs() {
      match key.as_ref() {
        "view" => {
          let view = parse_view(&value)
            .ok_or_else(|| SaveImageFileError::InvalidView(value.to_string()))?;
          draw = draw.with_view(Some(view));
        }
        "font" => draw = draw.with_font_file(value.into_owned())?,
        _ => {}
      }
    }

    let path = urlencoding::decode(uri.path())
      .map(|p| p.into_owned())
      .unwrap_or_else(|_| uri.path().to_string());

    Ok(SaveImageFileOutput {
      path: PathBuf::from(path),
      draw,
    })
  }
}

impl SaveImageFileOutput {
  pub fn path(&self) -> &Path {
    &self.path
  }

  fn save_image(&self, image: RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(&self.path)?;

    info!("保存图像到文件: {}", self.path.display());

    Ok(())
  }
}

impl Render<RgbImage, FrameReport> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, frame: &RgbImage, result: &FrameReport) -> Result<(), Self::Error> {
    let image = self
      .draw
      .annotate(frame, &result.detections, result.mirrored);
    self.save_image(image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn from_url_reads_path_and_view() {
    let url = Url::parse("image:///tmp/out%20dir/a.png?view=32x16").unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();
    assert_eq!(output.path(), Path::new("/tmp/out dir/a.png"));

    let bad = Url::parse("image:///tmp/a.png?view=wide").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&bad),
      Err(SaveImageFileError::InvalidView(_))
    ));

    let wrong = Url::parse("folder:///tmp").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&wrong),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn writes_annotated_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("frame.png");
    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();

    let report = FrameReport {
      frame_index: 0,
      detections: Vec::new(),
      source_size: (8, 8),
      mirrored: false,
      fps: 0.0,
      preview: None,
    };
    output.render_result(&RgbImage::new(8, 8), &report).unwrap();
    let saved = image::open(&path).unwrap();
    assert_eq!((saved.width(), saved.height()), (8, 8));
  }
}
