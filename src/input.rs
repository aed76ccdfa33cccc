// 该文件是 Qingyan （清眼） 项目的一部分。
// src/input.rs - 采集帧输入
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

//! 采集端的替代实现：从文件产生 [`CameraFrame`] 序列。

use thiserror::Error;
use url::Url;

use crate::FromUrl;
use crate::frame::{CameraFrame, Facing, Rotation};

#[derive(Error, Debug, PartialEq, Eq)]
#[error("无效的输入参数 {key}={value}")]
pub struct InvalidParameter {
  pub key: String,
  pub value: String,
}

/// 每帧附带的采集信息，取自 URL 查询参数 `rotation` 与 `facing`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOptions {
  pub rotation: Rotation,
  pub facing: Facing,
}

impl FrameOptions {
  pub fn from_url(url: &Url) -> Result<Self, InvalidParameter> {
    let mut options = FrameOptions::default();
    for (key, value) in url.query_pairs() {
      let invalid = || InvalidParameter {
        key: key.to_string(),
        value: value.to_string(),
      };
      match key.as_ref() {
        "rotation" => {
          let degrees = value.parse().map_err(|_| invalid())?;
          options.rotation = Rotation::from_degrees(degrees).map_err(|_| invalid())?;
        }
        "facing" => {
          options.facing = match value.as_ref() {
            "front" => Facing::Front,
            "back" => Facing::Back,
            _ => return Err(invalid()),
          }
        }
        _ => {}
      }
    }
    Ok(options)
  }

  pub fn apply(&self, frame: CameraFrame) -> CameraFrame {
    frame.with_rotation(self.rotation).with_facing(self.facing)
  }
}

/// 取得 URL 中的文件路径
pub(crate) fn url_path(url: &Url) -> String {
  urlencoding::decode(url.path())
    .map(|p| p.into_owned())
    .unwrap_or_else(|_| url.path().to_string())
}

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "raw_yuv_file")]
mod raw_yuv_file;
#[cfg(feature = "raw_yuv_file")]
pub use self::raw_yuv_file::{RawYuvFileInput, RawYuvFileInputError, YuvLayout};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "raw_yuv_file")]
  #[error("YUV 文件输入错误: {0}")]
  RawYuvFileInputError(#[from] RawYuvFileInputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "raw_yuv_file")]
  RawYuvFile(RawYuvFileInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    #[cfg(feature = "raw_yuv_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == RawYuvFileInput::SCHEME {
        let input = RawYuvFileInput::from_url(url)?;
        return Ok(InputWrapper::RawYuvFile(input));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}

impl Iterator for InputWrapper {
  type Item = CameraFrame;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next(),
      #[cfg(feature = "raw_yuv_file")]
      InputWrapper::RawYuvFile(input) => input.next(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_options_from_query() {
    let url = Url::parse("yuv:///a.yuv?rotation=90&facing=front").unwrap();
    let options = FrameOptions::from_url(&url).unwrap();
    assert_eq!(options.rotation, Rotation::Deg90);
    assert_eq!(options.facing, Facing::Front);

    let url = Url::parse("yuv:///a.yuv").unwrap();
    assert_eq!(FrameOptions::from_url(&url).unwrap(), FrameOptions::default());
  }

  #[test]
  fn frame_options_reject_bad_values() {
    let url = Url::parse("yuv:///a.yuv?rotation=45").unwrap();
    assert_eq!(
      FrameOptions::from_url(&url),
      Err(InvalidParameter {
        key: "rotation".to_string(),
        value: "45".to_string()
      })
    );
    let url = Url::parse("yuv:///a.yuv?facing=side").unwrap();
    assert!(FrameOptions::from_url(&url).is_err());
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://camera/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch)
    ));
  }
}
