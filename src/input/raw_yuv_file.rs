// 该文件是 Qingyan （清眼） 项目的一部分。
// src/input/raw_yuv_file.rs - 原始 YUV 4:2:0 文件输入
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

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{CameraFrame, FrameError, PixelData, PlanarImage},
  input::{FrameOptions, InvalidParameter, url_path},
};

#[derive(Error, Debug)]
pub enum RawYuvFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("缺少参数: {0}")]
  MissingParameter(&'static str),
  #[error(transparent)]
  InvalidParameter(#[from] InvalidParameter),
  #[error("帧格式错误: {0}")]
  FrameError(#[from] FrameError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 文件中每帧的排列方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum YuvLayout {
  /// Y 平面, U 平面, V 平面
  #[default]
  I420,
  /// Y 平面, VU 交错平面
  Nv21,
}

impl YuvLayout {
  pub fn frame_len(&self, width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    w * h + 2 * w.div_ceil(2) * h.div_ceil(2)
  }

  fn planar(&self, width: u32, height: u32, data: &[u8]) -> Result<PlanarImage, FrameError> {
    match self {
      YuvLayout::I420 => PlanarImage::from_i420(width, height, data),
      YuvLayout::Nv21 => PlanarImage::from_nv21(width, height, data),
    }
  }
}

/// 连续存放的原始 YUV 帧
pub struct RawYuvFileInput {
  reader: Box<dyn Read + Send>,
  width: u32,
  height: u32,
  layout: YuvLayout,
  options: FrameOptions,
  buffer: Vec<u8>,
  index: u64,
}

impl FromUrlWithScheme for RawYuvFileInput {
  const SCHEME: &'static str = "yuv";
}

impl FromUrl for RawYuvFileInput {
  type Error = RawYuvFileInputError;

  /// `yuv:///dump.yuv?width=640&height=480&layout=nv21&rotation=90&facing=front`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RawYuvFileInputError::SchemeMismatch);
    }

    let options = FrameOptions::from_url(url)?;
    let mut width = None;
    let mut height = None;
    let mut layout = YuvLayout::default();
    for (key, value) in url.query_pairs() {
      let invalid = || InvalidParameter {
        key: key.to_string(),
        value: value.to_string(),
      };
      match key.as_ref() {
        "width" => width = Some(value.parse::<u32>().map_err(|_| invalid())?),
        "height" => height = Some(value.parse::<u32>().map_err(|_| invalid())?),
        "layout" => {
          layout = match value.as_ref() {
            "i420" => YuvLayout::I420,
            "nv21" => YuvLayout::Nv21,
            _ => return Err(invalid().into()),
          }
        }
        _ => {}
      }
    }
    let width = width.ok_or(RawYuvFileInputError::MissingParameter("width"))?;
    let height = height.ok_or(RawYuvFileInputError::MissingParameter("height"))?;
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidSize { width, height }.into());
    }

    let path = url_path(url);
    let file = File::open(&path)?;
    info!("打开 YUV 文件 {}: {}x{} {:?}", path, width, height, layout);

    Ok(Self::new(
      Box::new(BufReader::new(file)),
      width,
      height,
      layout,
      options,
    ))
  }
}

impl RawYuvFileInput {
  pub fn new(
    reader: Box<dyn Read + Send>,
    width: u32,
    height: u32,
    layout: YuvLayout,
    options: FrameOptions,
  ) -> Self {
    Self {
      reader,
      width,
      height,
      layout,
      options,
      buffer: vec![0; layout.frame_len(width, height)],
      index: 0,
    }
  }
}

impl Iterator for RawYuvFileInput {
  type Item = CameraFrame;

  fn next(&mut self) -> Option<Self::Item> {
    match self.reader.read_exact(&mut self.buffer) {
      Ok(()) => {}
      Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
        info!("YUV 文件读取完毕, 共 {} 帧", self.index);
        return None;
      }
      Err(e) => {
        warn!("读取 YUV 帧失败: {}", e);
        return None;
      }
    }

    let planar = match self.layout.planar(self.width, self.height, &self.buffer) {
      Ok(planar) => planar,
      Err(e) => {
        warn!("YUV 帧格式错误: {}", e);
        return None;
      }
    };
    let frame = CameraFrame::new(self.index, PixelData::Yuv420(planar))
      .with_timestamp(Utc::now().timestamp_millis().max(0) as u64);
    self.index += 1;
    Some(self.options.apply(frame))
  }
}
