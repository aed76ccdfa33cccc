// 该文件是 Qingyan （清眼） 项目的一部分。
// src/normalize.rs - 像素归一化
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
use tracing::debug;

const RGB_CHANNELS: usize = 3;

/// 经验阈值：蓝色通道平均值低于该值的帧视为黑帧
pub const DEFAULT_BLACK_THRESHOLD: u32 = 13;

/// 网络期望的通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
  #[default]
  Rgb,
  Bgr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeConfig {
  pub channel_order: ChannelOrder,
  pub black_threshold: u32,
}

impl Default for NormalizeConfig {
  fn default() -> Self {
    Self {
      channel_order: ChannelOrder::Rgb,
      black_threshold: DEFAULT_BLACK_THRESHOLD,
    }
  }
}

/// 归一化的复用缓冲区
///
/// 仅在图像字节数变化时重新分配，保证容量不小于当前帧的像素字节数。
#[derive(Debug, Default)]
pub struct NormalizeBuffers {
  bytes: Vec<u8>,
  floats: Vec<f32>,
  reallocations: usize,
}

impl NormalizeBuffers {
  fn ensure(&mut self, byte_len: usize) {
    if self.bytes.len() != byte_len {
      debug!("归一化缓冲区重新分配: {} -> {} 字节", self.bytes.len(), byte_len);
      self.bytes = vec![0u8; byte_len];
      self.floats = vec![0f32; byte_len];
      self.reallocations += 1;
    }
  }

  /// 缓冲区被重新分配的次数
  pub fn reallocations(&self) -> usize {
    self.reallocations
  }

  pub fn capacity(&self) -> usize {
    self.bytes.len()
  }
}

/// 归一化结果，借用归一化器内部的浮点缓冲区
#[derive(Debug)]
pub struct Normalized<'a> {
  pub tensor: &'a [f32],
  pub degenerate: bool,
}

/// 像素归一化器
///
/// 只在单个推理线程上使用；如需跨线程共享需由调用方加锁。
#[derive(Debug, Default)]
pub struct PixelNormalizer {
  config: NormalizeConfig,
  buffers: NormalizeBuffers,
}

impl PixelNormalizer {
  pub fn new(config: NormalizeConfig) -> Self {
    Self {
      config,
      buffers: NormalizeBuffers::default(),
    }
  }

  pub fn config(&self) -> &NormalizeConfig {
    &self.config
  }

  pub fn buffers(&self) -> &NormalizeBuffers {
    &self.buffers
  }

  /// 将 RGB 图像按 `1/255` 缩放为交错排列的浮点张量，同时判定黑帧
  pub fn normalize(&mut self, image: &RgbImage) -> Normalized<'_> {
    let raw = image.as_raw();
    self.buffers.ensure(raw.len());
    self.buffers.bytes.copy_from_slice(raw);

    let pixel_count = raw.len() / RGB_CHANNELS;
    let mut blue_sum = 0u64;
    let bytes = &self.buffers.bytes;
    let floats = &mut self.buffers.floats;
    for (src, dst) in bytes
      .chunks_exact(RGB_CHANNELS)
      .zip(floats.chunks_exact_mut(RGB_CHANNELS))
    {
      let (r, g, b) = (src[0], src[1], src[2]);
      blue_sum += b as u64;
      let ordered = match self.config.channel_order {
        ChannelOrder::Rgb => [r, g, b],
        ChannelOrder::Bgr => [b, g, r],
      };
      for (d, s) in dst.iter_mut().zip(ordered) {
        *d = s as f32 / 255.0;
      }
    }

    let degenerate = blue_sum < self.config.black_threshold as u64 * pixel_count as u64;
    Normalized {
      tensor: &self.buffers.floats,
      degenerate,
    }
  }
}
