// 该文件是 Qingyan （清眼） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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
use std::sync::atomic::{AtomicU16, Ordering};

use chrono::{DateTime, Datelike, Utc};
use image::RgbImage;
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::DetectionResult,
  output::{
    Render,
    draw::{Draw, DrawError, Record, parse_view},
  },
  pipeline::FrameReport,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("无效的视图尺寸: {0}")]
  InvalidView(String),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("绘制错误: {0}")]
  DrawError(#[from] DrawError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 绘制后保存，或保存原图并附带文本记录
pub enum DrawWrapper {
  Draw(Box<Draw>),
  Record(Record),
}

impl DrawWrapper {
  pub fn save_result(
    &self,
    path: &Path,
    frame: &RgbImage,
    detections: &[DetectionResult],
    mirrored: bool,
  ) -> Result<(), DirectoryRecordOutputError> {
    match self {
      DrawWrapper::Draw(draw) => {
        draw.annotate(frame, detections, mirrored).save(path)?;
      }
      DrawWrapper::Record(record) => {
        frame.save(path)?;
        record.record(detections, path)?;
      }
    };

    Ok(())
  }
}

pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: DrawWrapper,
  frame_counter: AtomicU16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  /// `folder:///records?record=name&always` 或 `folder:///records?view=640x480`
  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let mut record = None;
    let mut draw = Draw::default();
    let mut always = false;
    for (key, value) in uri.query_pairs() {
      match key.as_ref() {
        "record" => {
          record = Some(Record {
            label_with_name: value != "id",
          })
        }
        "always" => always = true,
        "view" => {
          let view = parse_view(&value)
            .ok_or_else(|| DirectoryRecordOutputError::InvalidView(value.to_string()))?;
          draw = draw.with_view(Some(view));
        }
        "font" => draw = draw.with_font_file(value.into_owned())?,
        _ => {}
      }
    }

    let directory = urlencoding::decode(uri.path())
      .map(|p| p.into_owned())
      .unwrap_or_else(|_| uri.path().to_string());

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(directory),
      draw: match record {
        Some(record) => DrawWrapper::Record(record),
        None => DrawWrapper::Draw(Box::new(draw)),
      },
      frame_counter: AtomicU16::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
  }

  /// `<dir>/YYYY/MM/DD/HH-MM-SS-XXXX.png`
  fn frame_path(&self, now: DateTime<Utc>) -> Result<PathBuf, DirectoryRecordOutputError> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render<RgbImage, FrameReport> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &RgbImage, result: &FrameReport) -> Result<(), Self::Error> {
    if !self.always && result.detections.is_empty() {
      debug!("第 {} 帧没有检测结果, 跳过记录", result.frame_index);
      return Ok(());
    }
    let path = self.frame_path(Utc::now())?;
    self
      .draw
      .save_result(&path, frame, &result.detections, result.mirrored)?;
    debug!("记录第 {} 帧到 {}", result.frame_index, path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::BoundingBox;
  use url::Url;

  fn report(detections: Vec<DetectionResult>) -> FrameReport {
    FrameReport {
      frame_index: 1,
      detections,
      source_size: (4, 4),
      mirrored: false,
      fps: 0.0,
      preview: None,
    }
  }

  /// `<dir>/YYYY/MM/DD/*`
  fn files_under(dir: &Path) -> Vec<PathBuf> {
    let pattern = dir.join("*").join("*").join("*").join("*");
    let mut found: Vec<_> = glob::glob(&pattern.to_string_lossy())
      .unwrap()
      .map(|entry| entry.unwrap())
      .collect();
    found.sort();
    found
  }

  #[test]
  fn from_url_selects_record_mode() {
    let url = Url::parse("folder:///tmp/rec?record=id&always").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert!(output.always);
    assert!(matches!(
      output.draw,
      DrawWrapper::Record(Record {
        label_with_name: false
      })
    ));
    assert_eq!(output.directory(), Path::new("/tmp/rec"));

    let url = Url::parse("folder:///tmp/rec").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert!(!output.always);
    assert!(matches!(output.draw, DrawWrapper::Draw(_)));

    let wrong = Url::parse("image:///tmp/rec").unwrap();
    assert!(matches!(
      DirectoryRecordOutput::from_url(&wrong),
      Err(DirectoryRecordOutputError::SchemeMismatch)
    ));
  }

  #[test]
  fn records_frames_with_text() {
    let scratch = tempfile::tempdir().unwrap();
    let dir = scratch.path();
    let url = Url::parse(&format!("folder://{}?record=name", dir.display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    let frame = RgbImage::new(4, 4);

    // 无检测结果且未设置 always 时不记录
    output.render_result(&frame, &report(Vec::new())).unwrap();
    assert!(files_under(dir).is_empty());

    let detection = DetectionResult {
      class_id: 0,
      label: "person".to_string(),
      confidence: 0.5,
      bounding_box: BoundingBox::new(0.0, 0.0, 2.0, 2.0),
    };
    output.render_result(&frame, &report(vec![detection])).unwrap();
    let files = files_under(dir);
    assert_eq!(files.len(), 2, "{files:?}");
    let text = files
      .iter()
      .find(|p| p.extension().is_some_and(|e| e == "txt"))
      .unwrap();
    assert!(std::fs::read_to_string(text).unwrap().starts_with("person, 0.5000"));
  }

  #[test]
  fn frame_ids_increase() {
    let url = Url::parse("folder:///tmp/rec").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert_eq!(output.frame_id(), 1);
    assert_eq!(output.frame_id(), 2);
  }
}
