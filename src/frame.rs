// 该文件是 Qingyan （清眼） 项目的一部分。
// src/frame.rs - 相机帧定义
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

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
  #[error("平面数据长度不足: {plane} 期望至少 {expected} 字节, 实际 {actual} 字节")]
  PlaneTooShort {
    plane: &'static str,
    expected: usize,
    actual: usize,
  },
  #[error("无效的帧尺寸: {width}x{height}")]
  InvalidSize { width: u32, height: u32 },
  #[error("不支持的旋转角度: {0}")]
  UnsupportedRotation(u32),
}

/// 单个图像平面
#[derive(Debug, Clone)]
pub struct Plane {
  pub data: Vec<u8>,
  pub row_stride: usize,
  pub pixel_stride: usize,
}

impl Plane {
  pub fn new(data: Vec<u8>, row_stride: usize, pixel_stride: usize) -> Self {
    Self {
      data,
      row_stride,
      pixel_stride,
    }
  }

  /// 读取 (x, y) 处的采样，越界时返回 `None`
  #[inline]
  pub fn sample(&self, x: usize, y: usize) -> Option<u8> {
    self
      .data
      .get(y * self.row_stride + x * self.pixel_stride)
      .copied()
  }

  fn required_len(&self, width: usize, height: usize) -> usize {
    if width == 0 || height == 0 {
      return 0;
    }
    (height - 1) * self.row_stride + (width - 1) * self.pixel_stride + 1
  }
}

/// YUV 4:2:0 三平面图像（亮度全分辨率，色度宽高各减半）
///
/// 色度平面可以是独立平面（pixel_stride = 1），也可以是交错存储
/// （pixel_stride = 2，U/V 平面互相偏移一个字节）。
#[derive(Debug, Clone)]
pub struct PlanarImage {
  pub width: u32,
  pub height: u32,
  pub y: Plane,
  pub u: Plane,
  pub v: Plane,
}

impl PlanarImage {
  pub fn new(width: u32, height: u32, y: Plane, u: Plane, v: Plane) -> Result<Self, FrameError> {
    let image = Self {
      width,
      height,
      y,
      u,
      v,
    };
    image.validate()?;
    Ok(image)
  }

  /// 从 I420 连续缓冲区构造（Y 平面后紧跟 U、V 平面）
  pub fn from_i420(width: u32, height: u32, data: &[u8]) -> Result<Self, FrameError> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let expected = w * h + 2 * cw * ch;
    if data.len() < expected {
      return Err(FrameError::PlaneTooShort {
        plane: "i420",
        expected,
        actual: data.len(),
      });
    }
    let y = Plane::new(data[..w * h].to_vec(), w, 1);
    let u = Plane::new(data[w * h..w * h + cw * ch].to_vec(), cw, 1);
    let v = Plane::new(data[w * h + cw * ch..expected].to_vec(), cw, 1);
    Self::new(width, height, y, u, v)
  }

  /// 从 NV21 连续缓冲区构造（Y 平面后为 VU 交错平面）
  pub fn from_nv21(width: u32, height: u32, data: &[u8]) -> Result<Self, FrameError> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let expected = w * h + 2 * cw * ch;
    if data.len() < expected {
      return Err(FrameError::PlaneTooShort {
        plane: "nv21",
        expected,
        actual: data.len(),
      });
    }
    let y = Plane::new(data[..w * h].to_vec(), w, 1);
    let vu = &data[w * h..expected];
    let v = Plane::new(vu.to_vec(), 2 * cw, 2);
    let u = Plane::new(vu[1..].to_vec(), 2 * cw, 2);
    Self::new(width, height, y, u, v)
  }

  pub fn chroma_width(&self) -> usize {
    (self.width as usize).div_ceil(2)
  }

  pub fn chroma_height(&self) -> usize {
    (self.height as usize).div_ceil(2)
  }

  fn validate(&self) -> Result<(), FrameError> {
    if self.width == 0 || self.height == 0 {
      return Err(FrameError::InvalidSize {
        width: self.width,
        height: self.height,
      });
    }
    let (w, h) = (self.width as usize, self.height as usize);
    let (cw, ch) = (self.chroma_width(), self.chroma_height());
    for (name, plane, pw, ph) in [
      ("y", &self.y, w, h),
      ("u", &self.u, cw, ch),
      ("v", &self.v, cw, ch),
    ] {
      let expected = plane.required_len(pw, ph);
      if plane.data.len() < expected {
        return Err(FrameError::PlaneTooShort {
          plane: name,
          expected,
          actual: plane.data.len(),
        });
      }
    }
    Ok(())
  }
}

/// 顺时针旋转角度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
  #[default]
  Deg0,
  Deg90,
  Deg180,
  Deg270,
}

impl Rotation {
  pub fn from_degrees(degrees: u32) -> Result<Self, FrameError> {
    match degrees % 360 {
      0 => Ok(Rotation::Deg0),
      90 => Ok(Rotation::Deg90),
      180 => Ok(Rotation::Deg180),
      270 => Ok(Rotation::Deg270),
      _ => Err(FrameError::UnsupportedRotation(degrees)),
    }
  }

  pub fn degrees(&self) -> u32 {
    match self {
      Rotation::Deg0 => 0,
      Rotation::Deg90 => 90,
      Rotation::Deg180 => 180,
      Rotation::Deg270 => 270,
    }
  }
}

/// 摄像头朝向，前置摄像头的叠加层需要水平镜像
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Facing {
  #[default]
  Back,
  Front,
}

impl Facing {
  pub fn mirrored(&self) -> bool {
    matches!(self, Facing::Front)
  }
}

#[derive(Debug, Clone)]
pub enum PixelData {
  Yuv420(PlanarImage),
  Rgb(RgbImage),
}

impl PixelData {
  pub fn dimensions(&self) -> (u32, u32) {
    match self {
      PixelData::Yuv420(image) => (image.width, image.height),
      PixelData::Rgb(image) => image.dimensions(),
    }
  }
}

type ReleaseHook = Box<dyn FnOnce(u64) + Send>;

/// 来自采集端的一帧
///
/// 每一帧都必须恰好归还采集端一次。归还动作在 drop 时执行，
/// 无论帧是被处理完、提前退出还是被新帧替换丢弃。
pub struct CameraFrame {
  pub index: u64,
  pub timestamp_ms: u64,
  pub rotation: Rotation,
  pub facing: Facing,
  pub pixels: PixelData,
  release: Option<ReleaseHook>,
}

impl CameraFrame {
  pub fn new(index: u64, pixels: PixelData) -> Self {
    Self {
      index,
      timestamp_ms: 0,
      rotation: Rotation::default(),
      facing: Facing::default(),
      pixels,
      release: None,
    }
  }

  pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
    self.timestamp_ms = timestamp_ms;
    self
  }

  pub fn with_rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  pub fn with_facing(mut self, facing: Facing) -> Self {
    self.facing = facing;
    self
  }

  /// 追加归还回调，参数为帧序号
  ///
  /// 已有的回调先执行，新回调随后执行，均只执行一次。
  pub fn on_release<F>(mut self, hook: F) -> Self
  where
    F: FnOnce(u64) + Send + 'static,
  {
    self.release = Some(match self.release.take() {
      Some(previous) => Box::new(move |index| {
        previous(index);
        hook(index);
      }),
      None => Box::new(hook),
    });
    self
  }
}

impl std::fmt::Debug for CameraFrame {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CameraFrame")
      .field("index", &self.index)
      .field("timestamp_ms", &self.timestamp_ms)
      .field("rotation", &self.rotation)
      .field("facing", &self.facing)
      .field("dimensions", &self.pixels.dimensions())
      .finish()
  }
}

impl Drop for CameraFrame {
  fn drop(&mut self) {
    if let Some(release) = self.release.take() {
      release(self.index);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn i420_layout_is_validated() {
    let data = vec![0u8; 4 * 2 + 2 * 2];
    let image = PlanarImage::from_i420(4, 2, &data).unwrap();
    assert_eq!(image.chroma_width(), 2);
    assert_eq!(image.chroma_height(), 1);
    assert!(PlanarImage::from_i420(4, 2, &data[..10]).is_err());
  }

  #[test]
  fn nv21_shares_interleaved_chroma() {
    // 2x2 图像：4 字节亮度 + V,U
    let data = [16, 16, 16, 16, 200, 50];
    let image = PlanarImage::from_nv21(2, 2, &data).unwrap();
    assert_eq!(image.v.sample(0, 0), Some(200));
    assert_eq!(image.u.sample(0, 0), Some(50));
  }

  #[test]
  fn short_planes_are_rejected() {
    let y = Plane::new(vec![0; 3], 2, 1);
    let u = Plane::new(vec![0; 1], 1, 1);
    let v = Plane::new(vec![0; 1], 1, 1);
    let err = PlanarImage::new(2, 2, y, u, v).unwrap_err();
    assert_eq!(
      err,
      FrameError::PlaneTooShort {
        plane: "y",
        expected: 4,
        actual: 3
      }
    );
  }

  #[test]
  fn rotation_parsing() {
    assert_eq!(Rotation::from_degrees(270).unwrap(), Rotation::Deg270);
    assert_eq!(Rotation::from_degrees(450).unwrap(), Rotation::Deg90);
    assert!(Rotation::from_degrees(45).is_err());
  }

  #[test]
  fn frame_is_released_exactly_once_on_drop() {
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let frame = CameraFrame::new(7, PixelData::Rgb(RgbImage::new(2, 2))).on_release(move |index| {
      assert_eq!(index, 7);
      counter.fetch_add(1, Ordering::SeqCst);
    });
    drop(frame);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn chained_release_hooks_all_run_in_order() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (first, second) = (order.clone(), order.clone());
    let frame = CameraFrame::new(3, PixelData::Rgb(RgbImage::new(2, 2)))
      .on_release(move |index| first.lock().unwrap().push(("capture", index)))
      .on_release(move |index| second.lock().unwrap().push(("counter", index)));
    drop(frame);
    assert_eq!(
      order.lock().unwrap().as_slice(),
      &[("capture", 3), ("counter", 3)]
    );
  }
}
