// 该文件是 Qingyan （清眼） 项目的一部分。
// src/engine.rs - 神经网络推理引擎接口
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

//! 推理引擎是厂商提供的黑盒运行时，这里只定义核心流程需要的能力：
//! 构建句柄、查询输入形状、执行、释放。

use std::collections::HashMap;

use thiserror::Error;

/// 推理后端偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Runtime {
  #[default]
  Cpu,
  Gpu,
  Dsp,
}

impl Runtime {
  /// 单字符代码：`C` CPU，`G` GPU，`D` DSP/NPU，其他一律回落到 CPU
  pub fn from_code(code: char) -> Self {
    match code.to_ascii_uppercase() {
      'G' => Runtime::Gpu,
      'D' => Runtime::Dsp,
      _ => Runtime::Cpu,
    }
  }

  pub fn code(&self) -> char {
    match self {
      Runtime::Cpu => 'C',
      Runtime::Gpu => 'G',
      Runtime::Dsp => 'D',
    }
  }
}

impl std::fmt::Display for Runtime {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Runtime::Cpu => write!(f, "CPU"),
      Runtime::Gpu => write!(f, "GPU"),
      Runtime::Dsp => write!(f, "DSP"),
    }
  }
}

/// 输入层形状 (高, 宽, 通道)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
  pub height: usize,
  pub width: usize,
  pub channels: usize,
}

/// 引擎输出的浮点张量
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl Tensor {
  pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
    Self { shape, data }
  }

  /// 形状声明的元素个数，溢出时为 None
  pub fn declared_len(&self) -> Option<usize> {
    self
      .shape
      .iter()
      .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
  }

  pub fn view(&self) -> TensorView<'_> {
    TensorView {
      shape: &self.shape,
      data: &self.data,
    }
  }
}

/// 借用的输入张量，避免每帧复制归一化缓冲区
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
  pub shape: &'a [usize],
  pub data: &'a [f32],
}

pub type TensorMap = HashMap<String, Tensor>;

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("模型构建失败 ({runtime}): {reason}")]
  Build { runtime: Runtime, reason: String },
  #[error("输入张量写入失败: {0}")]
  Input(String),
  #[error("推理执行失败: {0}")]
  Execute(String),
  #[error("引擎 I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 推理引擎
pub trait Engine: Send {
  type Handle: EngineHandle;

  /// 以模型字节、输出层名与后端偏好构建网络句柄
  fn build(
    &self,
    model: &[u8],
    output_layers: &[&str],
    runtime: Runtime,
    unsigned_precision: bool,
  ) -> Result<Self::Handle, EngineError>;
}

/// 已加载的网络句柄
pub trait EngineHandle: Send {
  fn input_shape(&self, layer: &str) -> Option<InputShape>;

  fn execute(&mut self, inputs: &[(&str, TensorView<'_>)]) -> Result<TensorMap, EngineError>;

  /// 释放底层资源，句柄随之失效
  fn release(self)
  where
    Self: Sized;
}

#[cfg(feature = "replay_engine")]
mod replay;
#[cfg(feature = "replay_engine")]
pub use self::replay::{ReplayEngine, ReplayError, ReplayHandle, Recording};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn runtime_codes() {
    assert_eq!(Runtime::from_code('C'), Runtime::Cpu);
    assert_eq!(Runtime::from_code('G'), Runtime::Gpu);
    assert_eq!(Runtime::from_code('d'), Runtime::Dsp);
    assert_eq!(Runtime::from_code('x'), Runtime::Cpu);
    assert_eq!(Runtime::from_code(' '), Runtime::Cpu);
    for runtime in [Runtime::Cpu, Runtime::Gpu, Runtime::Dsp] {
      assert_eq!(Runtime::from_code(runtime.code()), runtime);
    }
  }

  #[test]
  fn declared_len_is_shape_product() {
    let t = Tensor::new(vec![1, 300, 4], vec![]);
    assert_eq!(t.declared_len(), Some(1200));
    let huge = Tensor::new(vec![usize::MAX / 2 + 1, 4], vec![0.0; 8]);
    assert_eq!(huge.declared_len(), None);
  }
}
