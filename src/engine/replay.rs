// 该文件是 Qingyan （清眼） 项目的一部分。
// src/engine/replay.rs - 回放推理引擎
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

//! 回放引擎从 JSON 录制文件中按顺序返回输出张量，用于在没有加速器的
//! 机器上复现后处理与叠加层结果。
//!
//! ```json
//! {
//!   "input": { "layer": "images", "height": 320, "width": 320, "channels": 3 },
//!   "unavailable": ["D"],
//!   "frames": [
//!     {
//!       "boxes": { "shape": [2, 4], "data": [0, 0, 10, 10, 1, 1, 11, 11] },
//!       "scores": { "shape": [2, 2], "data": [0.9, 0.1, 0.8, 0.1] }
//!     }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::{
  Engine, EngineError, EngineHandle, InputShape, Runtime, Tensor, TensorMap, TensorView,
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("录制文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("录制文件解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedInput {
  pub layer: String,
  pub height: usize,
  pub width: usize,
  pub channels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedTensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
  pub input: RecordedInput,
  /// 构建时会失败的后端代码，用于模拟设备不支持某个后端
  #[serde(default)]
  pub unavailable: Vec<char>,
  #[serde(default)]
  pub frames: Vec<HashMap<String, RecordedTensor>>,
}

#[derive(Debug, Clone)]
pub struct ReplayEngine {
  recording: Recording,
}

impl ReplayEngine {
  pub fn new(recording: Recording) -> Self {
    Self { recording }
  }

  pub fn from_json(json: &str) -> Result<Self, ReplayError> {
    Ok(Self::new(serde_json::from_str(json)?))
  }

  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
    let path = path.as_ref();
    info!("加载回放录制文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    let engine = Self::from_json(&text)?;
    debug!("录制帧数: {}", engine.recording.frames.len());
    Ok(engine)
  }

  pub fn recording(&self) -> &Recording {
    &self.recording
  }
}

impl Engine for ReplayEngine {
  type Handle = ReplayHandle;

  fn build(
    &self,
    model: &[u8],
    output_layers: &[&str],
    runtime: Runtime,
    _unsigned_precision: bool,
  ) -> Result<Self::Handle, EngineError> {
    if model.is_empty() {
      return Err(EngineError::Build {
        runtime,
        reason: "模型数据为空".to_string(),
      });
    }
    if self
      .recording
      .unavailable
      .iter()
      .any(|c| Runtime::from_code(*c) == runtime)
    {
      return Err(EngineError::Build {
        runtime,
        reason: "该后端不可用".to_string(),
      });
    }

    if let Some(first) = self.recording.frames.first() {
      for layer in output_layers {
        if !first.contains_key(*layer) {
          warn!("录制中缺少输出层: {}", layer);
        }
      }
    }

    let frames = self
      .recording
      .frames
      .iter()
      .map(|frame| {
        frame
          .iter()
          .map(|(name, t)| (name.clone(), Tensor::new(t.shape.clone(), t.data.clone())))
          .collect::<TensorMap>()
      })
      .collect();

    Ok(ReplayHandle {
      input: self.recording.input.clone(),
      frames,
      cursor: 0,
    })
  }
}

pub struct ReplayHandle {
  input: RecordedInput,
  frames: Vec<TensorMap>,
  cursor: usize,
}

impl EngineHandle for ReplayHandle {
  fn input_shape(&self, layer: &str) -> Option<InputShape> {
    (layer == self.input.layer).then_some(InputShape {
      height: self.input.height,
      width: self.input.width,
      channels: self.input.channels,
    })
  }

  fn execute(&mut self, inputs: &[(&str, TensorView<'_>)]) -> Result<TensorMap, EngineError> {
    let (_, view) = inputs
      .iter()
      .find(|(name, _)| *name == self.input.layer)
      .ok_or_else(|| EngineError::Input(format!("缺少输入层 {}", self.input.layer)))?;

    let expected = self.input.height * self.input.width * self.input.channels;
    if view.data.len() != expected {
      return Err(EngineError::Input(format!(
        "输入长度不匹配: 期望 {}, 实际 {}",
        expected,
        view.data.len()
      )));
    }

    if self.frames.is_empty() {
      return Ok(TensorMap::new());
    }
    let outputs = self.frames[self.cursor % self.frames.len()].clone();
    self.cursor = self.cursor.wrapping_add(1);
    Ok(outputs)
  }

  fn release(self) {
    debug!("回放句柄释放, 已执行 {} 次", self.cursor);
  }
}
