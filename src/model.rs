// 该文件是 Qingyan （清眼） 项目的一部分。
// src/model.rs - 模型描述与检测结果
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

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, geometry::BoundingBox};

pub mod catalog;
mod decoder;

pub use self::catalog::{LabelTable, LayerGroup};
pub use self::decoder::{
  DEFAULT_IOU_THRESHOLD, DecodeError, DecoderConfig, DetectionDecoder, TieBreak, non_max_suppression,
};

pub const UNKNOWN_LABEL: &str = "Unknown";

/// 单个检测结果，坐标为源图像像素
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
  pub class_id: usize,
  pub label: String,
  pub confidence: f32,
  pub bounding_box: BoundingBox,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("不支持的边界框格式: {0}")]
  UnsupportedRectFormat(String),
  #[error("缺少输出层分组: {0}")]
  MissingLayerGroup(usize),
  #[error("目录中不存在模型: {0}")]
  UnknownModel(String),
  #[error("无效的模型描述参数 {key}={value}")]
  InvalidParameter { key: String, value: String },
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch { expected: String, actual: String },
}

/// 网络输出的框坐标格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RectFormat {
  /// (cx, cy, w, h)
  Center,
  /// (x1, y1, x2, y2)
  Corner,
}

impl FromStr for RectFormat {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "center" => Ok(RectFormat::Center),
      "corner" => Ok(RectFormat::Corner),
      other => Err(ConfigError::UnsupportedRectFormat(other.to_string())),
    }
  }
}

impl RectFormat {
  pub fn decode(&self, raw: &[f32; 4]) -> BoundingBox {
    match self {
      RectFormat::Center => BoundingBox::from_center(raw[0], raw[1], raw[2], raw[3]),
      RectFormat::Corner => BoundingBox::new(raw[0], raw[1], raw[2], raw[3]),
    }
  }
}

/// 模型描述
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
  pub display_name: String,
  pub storage_path: PathBuf,
  pub rect_format: RectFormat,
  pub output_group: usize,
}

impl ModelDescriptor {
  pub fn layer_group(&self) -> Result<&'static LayerGroup, ConfigError> {
    catalog::layer_group(self.output_group)
  }

  pub fn label_table(&self) -> Result<&'static LabelTable, ConfigError> {
    catalog::label_table(self.output_group)
  }
}

const MODEL_SCHEME: &str = "model";

impl FromUrlWithScheme for ModelDescriptor {
  const SCHEME: &'static str = MODEL_SCHEME;
}

impl FromUrl for ModelDescriptor {
  type Error = ConfigError;

  /// `model:///path/to/net.dlc?catalog=YOLO-NAS&format=corner&group=0&name=...`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigError::SchemeMismatch {
        expected: Self::SCHEME.to_string(),
        actual: url.scheme().to_string(),
      });
    }

    let query = |key: &str| {
      url
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
    };

    let mut descriptor = match query("catalog") {
      Some(name) => match catalog::find(&name) {
        Some(descriptor) => descriptor,
        None => {
          let available: Vec<_> = catalog::entries()
            .into_iter()
            .map(|d| d.display_name)
            .collect();
          warn!("目录中不存在模型 {}, 可用模型: {:?}", name, available);
          return Err(ConfigError::UnknownModel(name));
        }
      },
      None => ModelDescriptor {
        display_name: String::new(),
        storage_path: PathBuf::new(),
        rect_format: RectFormat::Center,
        output_group: 0,
      },
    };

    let path = urlencoding::decode(url.path())
      .map(|p| p.into_owned())
      .unwrap_or_else(|_| url.path().to_string());
    if !path.is_empty() && path != "/" {
      descriptor.storage_path = PathBuf::from(path);
    }
    if let Some(format) = query("format") {
      descriptor.rect_format = format.parse()?;
    }
    if let Some(group) = query("group") {
      descriptor.output_group = group
        .parse()
        .map_err(|_| ConfigError::InvalidParameter {
          key: "group".to_string(),
          value: group.clone(),
        })?;
    }
    if let Some(name) = query("name") {
      descriptor.display_name = name;
    }
    if descriptor.display_name.is_empty() {
      descriptor.display_name = descriptor
        .storage_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    }

    // 分组必须存在
    descriptor.layer_group()?;
    Ok(descriptor)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_rect_formats() {
    assert_eq!("center".parse::<RectFormat>().unwrap(), RectFormat::Center);
    assert_eq!("corner".parse::<RectFormat>().unwrap(), RectFormat::Corner);
    assert_eq!(
      "xywh".parse::<RectFormat>(),
      Err(ConfigError::UnsupportedRectFormat("xywh".to_string()))
    );
  }

  #[test]
  fn center_format_decodes_to_corners() {
    let b = RectFormat::Center.decode(&[10.0, 20.0, 4.0, 6.0]);
    assert_eq!(b, BoundingBox::new(8.0, 17.0, 12.0, 23.0));
    let c = RectFormat::Corner.decode(&[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(c, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
  }

  #[test]
  fn descriptor_from_url_with_explicit_fields() {
    let url = Url::parse("model:///data/nets/hands.dlc?format=center&group=1").unwrap();
    let d = ModelDescriptor::from_url(&url).unwrap();
    assert_eq!(d.display_name, "hands");
    assert_eq!(d.storage_path, PathBuf::from("/data/nets/hands.dlc"));
    assert_eq!(d.rect_format, RectFormat::Center);
    assert_eq!(d.output_group, 1);
  }

  #[test]
  fn descriptor_from_catalog_keeps_entry_defaults() {
    let url = Url::parse("model:///opt/yolo.dlc?catalog=YOLO-NAS").unwrap();
    let d = ModelDescriptor::from_url(&url).unwrap();
    assert_eq!(d.display_name, "YOLO-NAS");
    assert_eq!(d.rect_format, RectFormat::Corner);
    assert_eq!(d.storage_path, PathBuf::from("/opt/yolo.dlc"));
  }

  #[test]
  fn descriptor_from_url_rejects_bad_config() {
    let bad_format = Url::parse("model:///a.dlc?format=polygon").unwrap();
    assert!(matches!(
      ModelDescriptor::from_url(&bad_format),
      Err(ConfigError::UnsupportedRectFormat(_))
    ));
    let bad_group = Url::parse("model:///a.dlc?group=9").unwrap();
    assert_eq!(
      ModelDescriptor::from_url(&bad_group),
      Err(ConfigError::MissingLayerGroup(9))
    );
    let bad_scheme = Url::parse("image:///a.png").unwrap();
    assert!(matches!(
      ModelDescriptor::from_url(&bad_scheme),
      Err(ConfigError::SchemeMismatch { .. })
    ));
    let unknown = Url::parse("model:///a.dlc?catalog=nope").unwrap();
    assert_eq!(
      ModelDescriptor::from_url(&unknown),
      Err(ConfigError::UnknownModel("nope".to_string()))
    );
  }
}
