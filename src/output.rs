// 该文件是 Qingyan （清眼） 项目的一部分。
// src/output.rs - 叠加层映射与输出定义
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

use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::FromUrl;
#[cfg(any(feature = "save_image_file", feature = "directory_record"))]
use crate::FromUrlWithScheme;
use crate::geometry::{BoundingBox, ViewTransform};
use crate::model::DetectionResult;
use crate::pipeline::FrameReport;

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

/// 叠加层绘制目标
pub trait Canvas {
  /// 画布（视图）尺寸
  fn size(&self) -> (u32, u32);
  fn stroke_rect(&mut self, rect: &BoundingBox, color: [u8; 3], width: f32);
  fn fill_rect(&mut self, rect: &BoundingBox, color: [u8; 3]);
  /// 文本的宽和高
  fn text_size(&self, text: &str) -> (f32, f32);
  /// 以 (x, y) 为文本左上角绘制
  fn draw_text(&mut self, x: f32, y: f32, text: &str, color: [u8; 3]);
}

/// 映射到视图坐标后的检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct MappedDetection {
  pub class_id: usize,
  pub bounding_box: BoundingBox,
  pub text: String,
}

/// `"{label} {round(confidence*100)}%"`
pub fn label_text(detection: &DetectionResult) -> String {
  format!(
    "{} {}%",
    detection.label,
    (detection.confidence * 100.0).round() as i32
  )
}

pub struct OverlayMapper;

impl OverlayMapper {
  /// 将源图像坐标的检测框映射到视图坐标
  ///
  /// 先按源宽度做水平镜像（前置摄像头），再按保持宽高比的缩放与居中偏移变换。
  /// 任一尺寸为零时返回空列表。
  pub fn map(
    detections: &[DetectionResult],
    source: (u32, u32),
    view: (u32, u32),
    mirror: bool,
  ) -> Vec<MappedDetection> {
    let Some(transform) = ViewTransform::fit(
      source.0 as f32,
      source.1 as f32,
      view.0 as f32,
      view.1 as f32,
    ) else {
      return Vec::new();
    };

    detections
      .iter()
      .map(|detection| {
        let bbox = if mirror {
          detection.bounding_box.mirror_horizontal(source.0 as f32)
        } else {
          detection.bounding_box
        };
        MappedDetection {
          class_id: detection.class_id,
          bounding_box: transform.apply(&bbox),
          text: label_text(detection),
        }
      })
      .collect()
  }
}

const DEFAULT_STROKE_WIDTH: f32 = 2.0;
const DEFAULT_LABEL_PADDING: f32 = 4.0;
const DEFAULT_TEXT_COLOR: [u8; 3] = [255, 255, 255];

/// 按类别序号循环取色
pub const DEFAULT_PALETTE: [[u8; 3]; 8] = [
  [0, 0, 255],
  [255, 56, 56],
  [72, 249, 10],
  [255, 157, 151],
  [0, 194, 255],
  [255, 178, 29],
  [146, 204, 23],
  [132, 56, 255],
];

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
  pub stroke_width: f32,
  pub label_padding: f32,
  pub text_color: [u8; 3],
  pub palette: Vec<[u8; 3]>,
}

impl Default for OverlayStyle {
  fn default() -> Self {
    Self {
      stroke_width: DEFAULT_STROKE_WIDTH,
      label_padding: DEFAULT_LABEL_PADDING,
      text_color: DEFAULT_TEXT_COLOR,
      palette: DEFAULT_PALETTE.to_vec(),
    }
  }
}

impl OverlayStyle {
  pub fn color(&self, class_id: usize) -> [u8; 3] {
    if self.palette.is_empty() {
      return DEFAULT_PALETTE[0];
    }
    self.palette[class_id % self.palette.len()]
  }
}

#[derive(Debug, Clone, Default)]
pub struct OverlayRenderer {
  style: OverlayStyle,
}

impl OverlayRenderer {
  pub fn new(style: OverlayStyle) -> Self {
    Self { style }
  }

  pub fn style(&self) -> &OverlayStyle {
    &self.style
  }

  /// 在画布上绘制框、标签背景与标签文本，返回绘制的检测数
  pub fn render<C: Canvas>(
    &self,
    canvas: &mut C,
    detections: &[DetectionResult],
    source: (u32, u32),
    mirror: bool,
  ) -> usize {
    let view = canvas.size();
    if view.0 == 0 || view.1 == 0 {
      return 0;
    }

    let mapped = OverlayMapper::map(detections, source, view, mirror);
    let padding = self.style.label_padding;
    for item in mapped.iter() {
      let color = self.style.color(item.class_id);
      let bbox = &item.bounding_box;
      canvas.stroke_rect(bbox, color, self.style.stroke_width);

      // 标签位于框上方
      let (text_width, text_height) = canvas.text_size(&item.text);
      let background = BoundingBox::new(
        bbox.left,
        bbox.top - text_height - 2.0 * padding,
        bbox.left + text_width + 2.0 * padding,
        bbox.top,
      );
      canvas.fill_rect(&background, color);
      canvas.draw_text(
        background.left + padding,
        background.top + padding,
        &item.text,
        self.style.text_color,
      );
    }
    mapped.len()
  }
}

#[cfg(feature = "draw")]
pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper {
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl Render<RgbImage, FrameReport> for OutputWrapper {
  type Error = OutputError;

  #[allow(unused_variables)]
  fn render_result(&self, frame: &RgbImage, result: &FrameReport) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detection(class_id: usize, label: &str, confidence: f32, b: [f32; 4]) -> DetectionResult {
    DetectionResult {
      class_id,
      label: label.to_string(),
      confidence,
      bounding_box: BoundingBox::from(b),
    }
  }

  #[derive(Default)]
  struct RecordingCanvas {
    size: (u32, u32),
    strokes: Vec<(BoundingBox, [u8; 3])>,
    fills: Vec<BoundingBox>,
    texts: Vec<(f32, f32, String)>,
  }

  impl Canvas for RecordingCanvas {
    fn size(&self) -> (u32, u32) {
      self.size
    }

    fn stroke_rect(&mut self, rect: &BoundingBox, color: [u8; 3], _width: f32) {
      self.strokes.push((*rect, color));
    }

    fn fill_rect(&mut self, rect: &BoundingBox, _color: [u8; 3]) {
      self.fills.push(*rect);
    }

    fn text_size(&self, text: &str) -> (f32, f32) {
      (text.len() as f32 * 10.0, 20.0)
    }

    fn draw_text(&mut self, x: f32, y: f32, text: &str, _color: [u8; 3]) {
      self.texts.push((x, y, text.to_string()));
    }
  }

  #[test]
  fn label_text_rounds_percent() {
    assert_eq!(label_text(&detection(0, "person", 0.876, [0.0; 4])), "person 88%");
    assert_eq!(label_text(&detection(0, "cup", 1.0, [0.0; 4])), "cup 100%");
    assert_eq!(label_text(&detection(0, "cup", 0.004, [0.0; 4])), "cup 0%");
  }

  #[test]
  fn maps_with_pillarbox_offset() {
    // 100x100 源图放入 200x100 视图: 缩放 1, 水平偏移 50
    let d = [detection(0, "person", 0.9, [10.0, 20.0, 30.0, 40.0])];
    let mapped = OverlayMapper::map(&d, (100, 100), (200, 100), false);
    assert_eq!(mapped.len(), 1);
    assert_eq!(
      mapped[0].bounding_box,
      BoundingBox::new(60.0, 20.0, 80.0, 40.0)
    );
    assert_eq!(mapped[0].text, "person 90%");
  }

  #[test]
  fn maps_with_mirror_before_scaling() {
    // 镜像: left' = 100 - 30, right' = 100 - 10; 再放大 2 倍
    let d = [detection(0, "person", 0.9, [10.0, 0.0, 30.0, 10.0])];
    let mapped = OverlayMapper::map(&d, (100, 50), (200, 100), true);
    assert_eq!(
      mapped[0].bounding_box,
      BoundingBox::new(140.0, 0.0, 180.0, 20.0)
    );
  }

  #[test]
  fn zero_view_is_noop() {
    let d = [detection(0, "person", 0.9, [10.0, 0.0, 30.0, 10.0])];
    assert!(OverlayMapper::map(&d, (100, 50), (0, 100), false).is_empty());

    let mut canvas = RecordingCanvas {
      size: (100, 0),
      ..Default::default()
    };
    let drawn = OverlayRenderer::default().render(&mut canvas, &d, (100, 50), false);
    assert_eq!(drawn, 0);
    assert!(canvas.strokes.is_empty());
    assert!(canvas.texts.is_empty());
  }

  #[test]
  fn label_background_sits_above_box() {
    let d = [detection(2, "car", 0.5, [10.0, 50.0, 40.0, 80.0])];
    let mut canvas = RecordingCanvas {
      size: (100, 100),
      ..Default::default()
    };
    let renderer = OverlayRenderer::default();
    assert_eq!(renderer.render(&mut canvas, &d, (100, 100), false), 1);

    // 文本 "car 50%" 宽 70 高 20, 内边距 4
    assert_eq!(canvas.strokes[0].0, BoundingBox::new(10.0, 50.0, 40.0, 80.0));
    assert_eq!(canvas.strokes[0].1, renderer.style().color(2));
    assert_eq!(canvas.fills[0], BoundingBox::new(10.0, 22.0, 88.0, 50.0));
    assert_eq!(canvas.texts[0], (14.0, 26.0, "car 50%".to_string()));
  }

  #[test]
  fn palette_cycles_by_class() {
    let style = OverlayStyle::default();
    assert_eq!(style.color(0), style.color(DEFAULT_PALETTE.len()));
    assert_ne!(style.color(0), style.color(1));
    let empty = OverlayStyle {
      palette: Vec::new(),
      ..Default::default()
    };
    assert_eq!(empty.color(5), DEFAULT_PALETTE[0]);
  }
}
