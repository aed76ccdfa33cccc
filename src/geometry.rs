// 该文件是 Qingyan （清眼） 项目的一部分。
// src/geometry.rs - 边界框几何运算
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

/// 轴对齐边界框，坐标为像素单位 `[left, top, right, bottom]`
///
/// 解码器不保证 `left <= right`、`top <= bottom`，所有运算都需要容忍反向的框。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
}

impl BoundingBox {
  pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
    Self {
      left,
      top,
      right,
      bottom,
    }
  }

  /// 由中心点与宽高构造
  pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
    Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
  }

  pub fn width(&self) -> f32 {
    self.right - self.left
  }

  pub fn height(&self) -> f32 {
    self.bottom - self.top
  }

  /// 面积，反向的框面积为 0
  pub fn area(&self) -> f32 {
    self.width().max(0.0) * self.height().max(0.0)
  }

  /// 两轴独立缩放
  pub fn scale(&self, scale_x: f32, scale_y: f32) -> Self {
    Self::new(
      self.left * scale_x,
      self.top * scale_y,
      self.right * scale_x,
      self.bottom * scale_y,
    )
  }

  /// 以图像宽度为轴做水平镜像，两次镜像恢复原值
  pub fn mirror_horizontal(&self, width: f32) -> Self {
    Self::new(width - self.right, self.top, width - self.left, self.bottom)
  }

  pub fn intersection_area(&self, other: &Self) -> f32 {
    let left = self.left.max(other.left);
    let top = self.top.max(other.top);
    let right = self.right.min(other.right);
    let bottom = self.bottom.min(other.bottom);
    (right - left).max(0.0) * (bottom - top).max(0.0)
  }

  /// 交并比；并集面积不为正时返回 0
  pub fn iou(&self, other: &Self) -> f32 {
    let intersection = self.intersection_area(other);
    let union = self.area() + other.area() - intersection;
    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }

  pub fn as_array(&self) -> [f32; 4] {
    [self.left, self.top, self.right, self.bottom]
  }
}

impl From<[f32; 4]> for BoundingBox {
  fn from(v: [f32; 4]) -> Self {
    Self::new(v[0], v[1], v[2], v[3])
  }
}

/// 保持宽高比的缩放与居中偏移（letterbox / pillarbox）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransform {
  pub scale: f32,
  pub offset_x: f32,
  pub offset_y: f32,
}

impl ViewTransform {
  /// 将 `src` 尺寸的内容等比放入 `dst` 尺寸的视图中并居中
  ///
  /// 任何一边为 0 时返回 `None`。
  pub fn fit(src_width: f32, src_height: f32, dst_width: f32, dst_height: f32) -> Option<Self> {
    if src_width <= 0.0 || src_height <= 0.0 || dst_width <= 0.0 || dst_height <= 0.0 {
      return None;
    }
    let scale = (dst_width / src_width).min(dst_height / src_height);
    Some(Self {
      scale,
      offset_x: (dst_width - src_width * scale) / 2.0,
      offset_y: (dst_height - src_height * scale) / 2.0,
    })
  }

  pub fn apply(&self, bbox: &BoundingBox) -> BoundingBox {
    BoundingBox::new(
      bbox.left * self.scale + self.offset_x,
      bbox.top * self.scale + self.offset_y,
      bbox.right * self.scale + self.offset_x,
      bbox.bottom * self.scale + self.offset_y,
    )
  }
}
