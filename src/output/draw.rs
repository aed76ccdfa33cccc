// 该文件是 Qingyan （清眼） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use std::path::Path;
use std::sync::Once;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage, imageops};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::debug;

use crate::geometry::{BoundingBox, ViewTransform};
use crate::model::DetectionResult;
use crate::output::{Canvas, OverlayRenderer};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;

static TEXT_SKIPPED: Once = Once::new();
const LABEL_TEXT_HEIGHT: f32 = 24.0;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体错误: {0}")]
  FontError(#[from] ab_glyph::InvalidFont),
}

/// 解析 `WxH` 形式的尺寸
pub fn parse_view(value: &str) -> Option<(u32, u32)> {
  let (w, h) = value.split_once(['x', 'X'])?;
  Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// 基于 `RgbImage` 的画布
///
/// 没有字体时按字符数估算文本尺寸，只绘制标签背景。
pub struct RgbImageCanvas<'a> {
  image: &'a mut RgbImage,
  font: Option<&'a FontArc>,
  scale: PxScale,
  skipped_text: usize,
}

impl<'a> RgbImageCanvas<'a> {
  pub fn new(image: &'a mut RgbImage, font: Option<&'a FontArc>) -> Self {
    Self {
      image,
      font,
      scale: PxScale::from(LABEL_FONT_SIZE),
      skipped_text: 0,
    }
  }

  /// 因缺少字体而未绘制的标签文本数
  pub fn skipped_text(&self) -> usize {
    self.skipped_text
  }

  /// 裁剪到图像范围内的整数矩形
  fn clip(&self, rect: &BoundingBox) -> Option<Rect> {
    let (w, h) = self.image.dimensions();
    if w == 0 || h == 0 {
      return None;
    }
    let max_x = (w - 1) as f32;
    let max_y = (h - 1) as f32;
    let left = rect.left.min(rect.right).floor().clamp(0.0, max_x) as i32;
    let right = rect.left.max(rect.right).ceil().clamp(0.0, max_x) as i32;
    let top = rect.top.min(rect.bottom).floor().clamp(0.0, max_y) as i32;
    let bottom = rect.top.max(rect.bottom).ceil().clamp(0.0, max_y) as i32;
    if left >= right || top >= bottom {
      return None;
    }
    Some(Rect::at(left, top).of_size((right - left + 1) as u32, (bottom - top + 1) as u32))
  }
}

impl Canvas for RgbImageCanvas<'_> {
  fn size(&self) -> (u32, u32) {
    self.image.dimensions()
  }

  fn stroke_rect(&mut self, rect: &BoundingBox, color: [u8; 3], width: f32) {
    let Some(outer) = self.clip(rect) else {
      return;
    };
    let thickness = width.round().max(1.0) as i32;
    for t in 0..thickness {
      let w = outer.width() as i32 - 2 * t;
      let h = outer.height() as i32 - 2 * t;
      if w <= 0 || h <= 0 {
        break;
      }
      let inner = Rect::at(outer.left() + t, outer.top() + t).of_size(w as u32, h as u32);
      draw_hollow_rect_mut(self.image, inner, Rgb(color));
    }
  }

  fn fill_rect(&mut self, rect: &BoundingBox, color: [u8; 3]) {
    if let Some(rect) = self.clip(rect) {
      draw_filled_rect_mut(self.image, rect, Rgb(color));
    }
  }

  fn text_size(&self, text: &str) -> (f32, f32) {
    match self.font {
      Some(font) => {
        let (w, h) = text_size(self.scale, font, text);
        (w as f32, h as f32)
      }
      None => (
        text.chars().count() as f32 * LABEL_CHAR_WIDTH,
        LABEL_TEXT_HEIGHT,
      ),
    }
  }

  fn draw_text(&mut self, x: f32, y: f32, text: &str, color: [u8; 3]) {
    let Some(font) = self.font else {
      self.skipped_text += 1;
      TEXT_SKIPPED.call_once(|| debug!("未指定字体 (font=), 不绘制标签文本: {}", text));
      return;
    };
    draw_text_mut(
      self.image,
      Rgb(color),
      x.round() as i32,
      y.round() as i32,
      self.scale,
      font,
      text,
    );
  }
}

/// 将检测结果绘制到图像上
#[derive(Clone, Default)]
pub struct Draw {
  renderer: OverlayRenderer,
  font: Option<FontArc>,
  view: Option<(u32, u32)>,
}

impl Draw {
  pub fn with_renderer(mut self, renderer: OverlayRenderer) -> Self {
    self.renderer = renderer;
    self
  }

  pub fn with_font_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, DrawError> {
    let data = std::fs::read(path.as_ref())?;
    self.font = Some(FontArc::try_from_vec(data)?);
    debug!("加载字体: {}", path.as_ref().display());
    Ok(self)
  }

  /// 输出视图尺寸，`None` 表示与源图像相同
  pub fn with_view(mut self, view: Option<(u32, u32)>) -> Self {
    self.view = view;
    self
  }

  /// 生成视图大小的底图：镜像后等比缩放并居中，其余部分为黑色
  pub fn compose(&self, image: &RgbImage, mirrored: bool) -> RgbImage {
    let source = image.dimensions();
    let view = self.view.unwrap_or(source);
    let flipped;
    let image = if mirrored {
      flipped = imageops::flip_horizontal(image);
      &flipped
    } else {
      image
    };

    if view == source {
      return image.clone();
    }

    let mut canvas = RgbImage::new(view.0, view.1);
    let Some(transform) = ViewTransform::fit(
      source.0 as f32,
      source.1 as f32,
      view.0 as f32,
      view.1 as f32,
    ) else {
      return canvas;
    };
    let width = ((source.0 as f32 * transform.scale).round() as u32).max(1);
    let height = ((source.1 as f32 * transform.scale).round() as u32).max(1);
    let scaled = imageops::resize(image, width, height, imageops::FilterType::Triangle);
    imageops::overlay(
      &mut canvas,
      &scaled,
      transform.offset_x.round() as i64,
      transform.offset_y.round() as i64,
    );
    canvas
  }

  pub fn annotate(
    &self,
    image: &RgbImage,
    detections: &[DetectionResult],
    mirrored: bool,
  ) -> RgbImage {
    let mut output = self.compose(image, mirrored);
    let mut canvas = RgbImageCanvas::new(&mut output, self.font.as_ref());
    let drawn = self
      .renderer
      .render(&mut canvas, detections, image.dimensions(), mirrored);
    debug!("绘制 {} 个检测框", drawn);
    output
  }
}

/// 文本记录，每行 `label, confidence, left, top, right, bottom`
pub struct Record {
  pub label_with_name: bool,
}

impl Record {
  pub fn lines(&self, detections: &[DetectionResult]) -> Vec<String> {
    detections
      .iter()
      .map(|item| {
        let name = if self.label_with_name {
          item.label.clone()
        } else {
          item.class_id.to_string()
        };
        let b = &item.bounding_box;
        format!(
          "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
          name, item.confidence, b.left, b.top, b.right, b.bottom
        )
      })
      .collect()
  }

  pub fn record(&self, detections: &[DetectionResult], path: &Path) -> Result<(), std::io::Error> {
    std::fs::write(path.with_extension("txt"), self.lines(detections).join("\n"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::output::DEFAULT_PALETTE;

  fn person(b: [f32; 4]) -> DetectionResult {
    DetectionResult {
      class_id: 0,
      label: "person".to_string(),
      confidence: 0.9,
      bounding_box: BoundingBox::from(b),
    }
  }

  #[test]
  fn parses_view_sizes() {
    assert_eq!(parse_view("640x480"), Some((640, 480)));
    assert_eq!(parse_view("10X20"), Some((10, 20)));
    assert_eq!(parse_view("640"), None);
    assert_eq!(parse_view("axb"), None);
  }

  #[test]
  fn stroke_is_drawn_inside_image() {
    let mut image = RgbImage::new(40, 40);
    let mut canvas = RgbImageCanvas::new(&mut image, None);
    canvas.stroke_rect(&BoundingBox::new(10.0, 20.0, 30.0, 35.0), [255, 0, 0], 2.0);
    assert_eq!(image.get_pixel(10, 25), &Rgb([255, 0, 0]));
    assert_eq!(image.get_pixel(11, 25), &Rgb([255, 0, 0]));
    assert_eq!(image.get_pixel(30, 25), &Rgb([255, 0, 0]));
    assert_eq!(image.get_pixel(20, 28), &Rgb([0, 0, 0]));
  }

  #[test]
  fn out_of_bounds_rect_is_clipped() {
    let mut image = RgbImage::new(10, 10);
    let mut canvas = RgbImageCanvas::new(&mut image, None);
    canvas.fill_rect(&BoundingBox::new(-50.0, -50.0, 5.0, 5.0), [0, 255, 0]);
    canvas.fill_rect(&BoundingBox::new(20.0, 20.0, 30.0, 30.0), [255, 0, 0]);
    assert_eq!(image.get_pixel(0, 0), &Rgb([0, 255, 0]));
    assert_eq!(image.get_pixel(5, 5), &Rgb([0, 255, 0]));
    assert_eq!(image.get_pixel(9, 9), &Rgb([0, 0, 0]));
  }

  #[test]
  fn text_size_without_font_is_estimated() {
    let mut image = RgbImage::new(10, 10);
    let canvas = RgbImageCanvas::new(&mut image, None);
    assert_eq!(canvas.text_size("abcd"), (44.0, 24.0));
  }

  #[test]
  fn label_text_without_font_is_counted_as_skipped() {
    let mut image = RgbImage::new(80, 80);
    let mut canvas = RgbImageCanvas::new(&mut image, None);
    let drawn = OverlayRenderer::default().render(
      &mut canvas,
      &[person([10.0, 40.0, 30.0, 60.0])],
      (80, 80),
      false,
    );
    assert_eq!(drawn, 1);
    assert_eq!(canvas.skipped_text(), 1);
    // 标签背景仍在框上方
    assert_eq!(image.get_pixel(12, 30), &Rgb(DEFAULT_PALETTE[0]));
  }

  #[test]
  fn compose_letterboxes_into_view() {
    let image = RgbImage::from_pixel(20, 10, Rgb([200, 100, 50]));
    let draw = Draw::default().with_view(Some((40, 40)));
    let composed = draw.compose(&image, false);
    assert_eq!(composed.dimensions(), (40, 40));
    assert_eq!(composed.get_pixel(0, 0), &Rgb([0, 0, 0]));
    assert_eq!(composed.get_pixel(20, 20), &Rgb([200, 100, 50]));
    assert_eq!(composed.get_pixel(20, 35), &Rgb([0, 0, 0]));
  }

  #[test]
  fn compose_mirrors_image() {
    let mut image = RgbImage::new(4, 1);
    image.put_pixel(0, 0, Rgb([255, 255, 255]));
    let composed = Draw::default().compose(&image, true);
    assert_eq!(composed.get_pixel(3, 0), &Rgb([255, 255, 255]));
    assert_eq!(composed.get_pixel(0, 0), &Rgb([0, 0, 0]));
  }

  #[test]
  fn annotate_draws_box_in_class_colour() {
    let image = RgbImage::new(40, 40);
    let out = Draw::default().annotate(&image, &[person([10.0, 20.0, 30.0, 35.0])], false);
    assert_eq!(out.get_pixel(10, 30), &Rgb(DEFAULT_PALETTE[0]));
    assert_eq!(out.get_pixel(20, 30), &Rgb([0, 0, 0]));
  }

  #[test]
  fn record_lines_by_name_and_id() {
    let d = [person([1.0, 2.0, 3.0, 4.0])];
    let by_name = Record {
      label_with_name: true,
    };
    assert_eq!(
      by_name.lines(&d),
      vec!["person, 0.9000, 1.0000, 2.0000, 3.0000, 4.0000".to_string()]
    );
    let by_id = Record {
      label_with_name: false,
    };
    assert!(by_id.lines(&d)[0].starts_with("0, "));
  }
}
