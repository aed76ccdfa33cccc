// 该文件是 Qingyan （清眼） 项目的一部分。
// src/convert.rs - 相机帧到 RGB 图像的转换
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

use image::{ExtendedColorType, ImageFormat, RgbImage, codecs::jpeg::JpegEncoder, imageops};
use thiserror::Error;
use tracing::debug;

use crate::frame::{CameraFrame, FrameError, PixelData, PlanarImage, Rotation};

#[derive(Error, Debug)]
pub enum ConvertError {
  #[error("帧数据错误: {0}")]
  FrameError(#[from] FrameError),
  #[error("图像编解码错误: {0}")]
  ImageError(#[from] image::ImageError),
}

/// 转换路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvertPath {
  /// NV21 直接解码为 RGB
  #[default]
  Direct,
  /// 经由 JPEG 有损压缩再解码，结果与直接解码近似
  JpegRoundTrip { quality: u8 },
}

/// 相机帧转换器
///
/// 将 YUV 4:2:0 平面打包为 NV21，解码为 RGB 并按帧声明的角度旋转到正向。
/// NV21 缓冲区在帧尺寸不变时复用。
#[derive(Debug, Default)]
pub struct FrameConverter {
  path: ConvertPath,
  nv21: Vec<u8>,
}

impl FrameConverter {
  pub fn new(path: ConvertPath) -> Self {
    Self {
      path,
      nv21: Vec::new(),
    }
  }

  pub fn path(&self) -> ConvertPath {
    self.path
  }

  /// 转换相机帧。帧本身的所有权仍归调用方，转换后即可归还采集端。
  pub fn convert(&mut self, frame: &CameraFrame) -> Result<RgbImage, ConvertError> {
    let upright = match &frame.pixels {
      PixelData::Yuv420(planar) => {
        pack_nv21(planar, &mut self.nv21);
        let rgb = nv21_to_rgb(planar.width, planar.height, &self.nv21)?;
        match self.path {
          ConvertPath::Direct => rgb,
          ConvertPath::JpegRoundTrip { quality } => jpeg_round_trip(&rgb, quality)?,
        }
      }
      PixelData::Rgb(image) => image.clone(),
    };
    debug!(
      "帧 {} 转换完成: {}x{}, 旋转 {}°",
      frame.index,
      upright.width(),
      upright.height(),
      frame.rotation.degrees()
    );
    Ok(rotate(upright, frame.rotation))
  }
}

/// 将三平面 YUV 4:2:0 打包为 NV21（Y 平面 + VU 交错平面）
pub fn pack_nv21(image: &PlanarImage, out: &mut Vec<u8>) {
  let (w, h) = (image.width as usize, image.height as usize);
  let (cw, ch) = (image.chroma_width(), image.chroma_height());
  out.clear();
  out.reserve(w * h + 2 * cw * ch);

  for y in 0..h {
    let start = y * image.y.row_stride;
    if image.y.pixel_stride == 1 {
      out.extend_from_slice(&image.y.data[start..start + w]);
    } else {
      out.extend((0..w).map(|x| image.y.sample(x, y).unwrap_or(0)));
    }
  }

  for y in 0..ch {
    for x in 0..cw {
      out.push(image.v.sample(x, y).unwrap_or(128));
      out.push(image.u.sample(x, y).unwrap_or(128));
    }
  }
}

/// NV21 解码为 RGB（BT.601 全范围）
pub fn nv21_to_rgb(width: u32, height: u32, nv21: &[u8]) -> Result<RgbImage, FrameError> {
  let (w, h) = (width as usize, height as usize);
  let cw = w.div_ceil(2);
  let expected = w * h + 2 * cw * h.div_ceil(2);
  if nv21.len() < expected {
    return Err(FrameError::PlaneTooShort {
      plane: "nv21",
      expected,
      actual: nv21.len(),
    });
  }
  let (luma, chroma) = nv21.split_at(w * h);

  let mut rgb = vec![0u8; w * h * 3];
  for j in 0..h {
    for i in 0..w {
      let y = luma[j * w + i] as f32;
      let uv = (j / 2) * cw * 2 + (i / 2) * 2;
      let v = chroma[uv] as f32 - 128.0;
      let u = chroma[uv + 1] as f32 - 128.0;

      let base = (j * w + i) * 3;
      rgb[base] = (y + 1.402 * v).round().clamp(0.0, 255.0) as u8;
      rgb[base + 1] = (y - 0.344_136 * u - 0.714_136 * v).round().clamp(0.0, 255.0) as u8;
      rgb[base + 2] = (y + 1.772 * u).round().clamp(0.0, 255.0) as u8;
    }
  }

  RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidSize { width, height })
}

fn jpeg_round_trip(image: &RgbImage, quality: u8) -> Result<RgbImage, ConvertError> {
  let mut encoded = Vec::new();
  JpegEncoder::new_with_quality(&mut encoded, quality.clamp(1, 100)).encode(
    image.as_raw(),
    image.width(),
    image.height(),
    ExtendedColorType::Rgb8,
  )?;
  Ok(image::load_from_memory_with_format(&encoded, ImageFormat::Jpeg)?.into_rgb8())
}

pub fn rotate(image: RgbImage, rotation: Rotation) -> RgbImage {
  match rotation {
    Rotation::Deg0 => image,
    Rotation::Deg90 => imageops::rotate90(&image),
    Rotation::Deg180 => imageops::rotate180(&image),
    Rotation::Deg270 => imageops::rotate270(&image),
  }
}
