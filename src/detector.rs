// 该文件是 Qingyan （清眼） 项目的一部分。
// src/detector.rs - 推理编排：模型生命周期与逐帧推理
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

use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Instant;

use image::{RgbImage, imageops};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineError, EngineHandle, InputShape, Runtime, TensorView};
use crate::model::{
  ConfigError, DecodeError, DecoderConfig, DetectionDecoder, DetectionResult, ModelDescriptor,
};
use crate::normalize::{NormalizeConfig, PixelNormalizer};

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum LoadError {
  #[error("模型配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("模型文件读取错误 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("推理引擎错误: {0}")]
  Engine(#[from] EngineError),
  #[error("模型缺少输入层形状: {0}")]
  MissingInputShape(String),
  #[error("模型输入形状无效: {height}x{width}x{channels}")]
  InvalidInputShape {
    height: usize,
    width: usize,
    channels: usize,
  },
}

/// 模型生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
  Unloaded,
  Loading,
  Ready,
}

/// 单帧推理结果
#[derive(Debug, Clone, PartialEq)]
pub enum Inference {
  /// 模型未就绪
  NotReady,
  /// 黑帧，跳过推理
  Degenerate,
  /// 本帧推理失败，已记录日志
  Failed,
  Detections(Vec<DetectionResult>),
}

impl Inference {
  pub fn detections(&self) -> &[DetectionResult] {
    match self {
      Inference::Detections(items) => items,
      _ => &[],
    }
  }
}

struct LoadedModel<H> {
  handle: H,
  descriptor: ModelDescriptor,
  runtime: Runtime,
  input: InputShape,
}

enum State<H> {
  Unloaded,
  Loading,
  Ready(LoadedModel<H>),
}

/// 检测器
///
/// 同一时刻最多持有一个网络句柄：重新加载前总是先释放旧句柄。
pub struct Detector<E: Engine> {
  engine: E,
  state: State<E::Handle>,
  normalizer: PixelNormalizer,
  decoder: DetectionDecoder,
  unsigned_precision: bool,
}

impl<E: Engine> Detector<E> {
  pub fn new(engine: E) -> Self {
    Self::with_config(engine, NormalizeConfig::default(), DecoderConfig::default())
  }

  pub fn with_config(engine: E, normalize: NormalizeConfig, decoder: DecoderConfig) -> Self {
    Self {
      engine,
      state: State::Unloaded,
      normalizer: PixelNormalizer::new(normalize),
      decoder: DetectionDecoder::new(decoder),
      unsigned_precision: true,
    }
  }

  pub fn unsigned_precision(mut self, enabled: bool) -> Self {
    self.unsigned_precision = enabled;
    self
  }

  pub fn state(&self) -> ModelState {
    match self.state {
      State::Unloaded => ModelState::Unloaded,
      State::Loading => ModelState::Loading,
      State::Ready(_) => ModelState::Ready,
    }
  }

  pub fn is_ready(&self) -> bool {
    matches!(self.state, State::Ready(_))
  }

  /// 当前模型输入尺寸 (宽, 高)
  pub fn input_size(&self) -> Option<(u32, u32)> {
    match &self.state {
      State::Ready(loaded) => Some((loaded.input.width as u32, loaded.input.height as u32)),
      _ => None,
    }
  }

  pub fn descriptor(&self) -> Option<&ModelDescriptor> {
    match &self.state {
      State::Ready(loaded) => Some(&loaded.descriptor),
      _ => None,
    }
  }

  pub fn runtime(&self) -> Option<Runtime> {
    match &self.state {
      State::Ready(loaded) => Some(loaded.runtime),
      _ => None,
    }
  }

  pub fn engine(&self) -> &E {
    &self.engine
  }

  /// 从描述中的存储路径读取模型并加载
  pub fn load_model(
    &mut self,
    runtime: Runtime,
    descriptor: &ModelDescriptor,
  ) -> Result<(), LoadError> {
    self.dispose();
    info!("加载模型文件: {}", descriptor.storage_path.display());
    let model = match std::fs::read(&descriptor.storage_path) {
      Ok(data) => data,
      Err(source) => {
        let err = LoadError::Io {
          path: descriptor.storage_path.clone(),
          source,
        };
        error!("模型加载失败: {}", err);
        return Err(err);
      }
    };
    self.load_model_bytes(runtime, descriptor, &model)
  }

  /// 以内存中的模型数据加载；失败时回到未加载状态并返回原因
  pub fn load_model_bytes(
    &mut self,
    runtime: Runtime,
    descriptor: &ModelDescriptor,
    model: &[u8],
  ) -> Result<(), LoadError> {
    self.dispose();
    self.state = State::Loading;
    debug!(
      "模型文件大小: {:.2} MB",
      model.len() as f64 / (1024.0 * 1024.0)
    );

    match self.build(runtime, descriptor, model) {
      Ok(loaded) => {
        info!(
          "模型 {} 加载完成 ({}), 输入 {}x{}x{}",
          descriptor.display_name,
          runtime,
          loaded.input.height,
          loaded.input.width,
          loaded.input.channels
        );
        self.state = State::Ready(loaded);
        Ok(())
      }
      Err(err) => {
        error!("模型 {} 加载失败 ({}): {}", descriptor.display_name, runtime, err);
        self.state = State::Unloaded;
        Err(err)
      }
    }
  }

  fn build(
    &self,
    runtime: Runtime,
    descriptor: &ModelDescriptor,
    model: &[u8],
  ) -> Result<LoadedModel<E::Handle>, LoadError> {
    let group = descriptor.layer_group()?;
    descriptor.label_table()?;

    let handle = self
      .engine
      .build(model, &group.output_layers(), runtime, self.unsigned_precision)?;

    let input = match handle.input_shape(group.input) {
      Some(shape) => shape,
      None => {
        handle.release();
        return Err(LoadError::MissingInputShape(group.input.to_string()));
      }
    };
    if input.height == 0 || input.width == 0 || input.channels != RGB_CHANNELS {
      handle.release();
      return Err(LoadError::InvalidInputShape {
        height: input.height,
        width: input.width,
        channels: input.channels,
      });
    }

    Ok(LoadedModel {
      handle,
      descriptor: descriptor.clone(),
      runtime,
      input,
    })
  }

  /// 释放当前网络句柄
  pub fn dispose(&mut self) {
    if let State::Ready(loaded) = std::mem::replace(&mut self.state, State::Unloaded) {
      info!("释放模型 {}", loaded.descriptor.display_name);
      loaded.handle.release();
    }
  }

  /// 对一帧执行推理
  ///
  /// 引擎执行失败等瞬时错误只记录日志并返回 [`Inference::Failed`]；
  /// 输出张量形状不合法属于数据完整性错误，直接返回 `Err`。
  pub fn infer(&mut self, image: &RgbImage, threshold: f32) -> Result<Inference, DecodeError> {
    let State::Ready(loaded) = &mut self.state else {
      debug!("模型未就绪, 跳过推理");
      return Ok(Inference::NotReady);
    };
    let started = Instant::now();

    let (width, height) = (loaded.input.width as u32, loaded.input.height as u32);
    let resized: Cow<'_, RgbImage> = if image.dimensions() == (width, height) {
      Cow::Borrowed(image)
    } else {
      Cow::Owned(imageops::resize(
        image,
        width,
        height,
        imageops::FilterType::Triangle,
      ))
    };
    if resized.dimensions() != (width, height) {
      warn!(
        "缩放尺寸不匹配: 期望 {}x{}, 实际 {}x{}",
        width,
        height,
        resized.width(),
        resized.height()
      );
      return Ok(Inference::Failed);
    }

    let normalized = self.normalizer.normalize(&resized);
    if normalized.degenerate {
      debug!("检测到黑帧, 跳过推理");
      return Ok(Inference::Degenerate);
    }
    let expected = loaded.input.height * loaded.input.width * loaded.input.channels;
    if normalized.tensor.len() != expected {
      warn!(
        "输入张量长度不匹配: 期望 {}, 实际 {}",
        expected,
        normalized.tensor.len()
      );
      return Ok(Inference::Failed);
    }

    let group = loaded.descriptor.layer_group()?;
    let shape = [1, loaded.input.height, loaded.input.width, loaded.input.channels];
    let input = TensorView {
      shape: &shape,
      data: normalized.tensor,
    };
    let outputs = match loaded.handle.execute(&[(group.input, input)]) {
      Ok(outputs) => outputs,
      Err(e) => {
        warn!("推理执行失败: {}", e);
        return Ok(Inference::Failed);
      }
    };
    let inferred = started.elapsed();

    let detections = self.decoder.decode_outputs(
      &outputs,
      threshold,
      image.dimensions(),
      (width, height),
      &loaded.descriptor,
    )?;
    debug!(
      "推理完成, 耗时: {:.2?} / {:.2?}, 检测到 {} 个物体",
      inferred,
      started.elapsed(),
      detections.len()
    );
    Ok(Inference::Detections(detections))
  }
}

impl<E: Engine> Drop for Detector<E> {
  fn drop(&mut self) {
    self.dispose();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::{Tensor, TensorMap};
  use crate::model::{RectFormat, catalog};
  use image::Rgb;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Default, Clone)]
  struct Counters {
    built: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    executed: Arc<AtomicUsize>,
  }

  impl Counters {
    fn live(&self) -> usize {
      self.built.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }
  }

  struct FakeEngine {
    counters: Counters,
    input: Option<InputShape>,
    outputs: TensorMap,
    fail_execute: bool,
  }

  struct FakeHandle {
    counters: Counters,
    input: Option<InputShape>,
    outputs: TensorMap,
    fail_execute: bool,
  }

  impl Engine for FakeEngine {
    type Handle = FakeHandle;

    fn build(
      &self,
      _model: &[u8],
      output_layers: &[&str],
      runtime: Runtime,
      _unsigned_precision: bool,
    ) -> Result<FakeHandle, EngineError> {
      assert_eq!(output_layers, &["boxes", "scores"]);
      if runtime == Runtime::Dsp {
        return Err(EngineError::Build {
          runtime,
          reason: "no dsp".to_string(),
        });
      }
      self.counters.built.fetch_add(1, Ordering::SeqCst);
      Ok(FakeHandle {
        counters: self.counters.clone(),
        input: self.input,
        outputs: self.outputs.clone(),
        fail_execute: self.fail_execute,
      })
    }
  }

  impl EngineHandle for FakeHandle {
    fn input_shape(&self, layer: &str) -> Option<InputShape> {
      if layer == "images" { self.input } else { None }
    }

    fn execute(&mut self, inputs: &[(&str, TensorView<'_>)]) -> Result<TensorMap, EngineError> {
      self.counters.executed.fetch_add(1, Ordering::SeqCst);
      assert_eq!(inputs.len(), 1);
      assert_eq!(inputs[0].1.shape, &[1, 4, 4, 3]);
      if self.fail_execute {
        return Err(EngineError::Execute("boom".to_string()));
      }
      Ok(self.outputs.clone())
    }

    fn release(self) {
      self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn square(size: usize) -> Option<InputShape> {
    Some(InputShape {
      height: size,
      width: size,
      channels: 3,
    })
  }

  fn outputs() -> TensorMap {
    let group = catalog::layer_group(0).unwrap();
    let mut map = TensorMap::new();
    map.insert(
      group.boxes.to_string(),
      Tensor::new(vec![1, 4], vec![1.0, 1.0, 3.0, 3.0]),
    );
    map.insert(group.classes.to_string(), Tensor::new(vec![1, 2], vec![0.2, 0.9]));
    map
  }

  fn engine(counters: &Counters) -> FakeEngine {
    FakeEngine {
      counters: counters.clone(),
      input: square(4),
      outputs: outputs(),
      fail_execute: false,
    }
  }

  fn descriptor() -> ModelDescriptor {
    ModelDescriptor {
      display_name: "fake".to_string(),
      storage_path: "fake.dlc".into(),
      rect_format: RectFormat::Corner,
      output_group: 0,
    }
  }

  fn bright(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([120, 120, 120]))
  }

  #[test]
  fn not_ready_before_load() {
    let counters = Counters::default();
    let mut detector = Detector::new(engine(&counters));
    assert_eq!(detector.state(), ModelState::Unloaded);
    assert_eq!(detector.infer(&bright(4, 4), 0.5).unwrap(), Inference::NotReady);
    assert_eq!(counters.executed.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn load_then_infer_scales_to_source() {
    let counters = Counters::default();
    let mut detector = Detector::new(engine(&counters));
    detector
      .load_model_bytes(Runtime::Gpu, &descriptor(), b"net")
      .unwrap();
    assert_eq!(detector.state(), ModelState::Ready);
    assert_eq!(detector.input_size(), Some((4, 4)));
    assert_eq!(detector.runtime(), Some(Runtime::Gpu));

    let result = detector.infer(&bright(8, 16), 0.5).unwrap();
    let items = result.detections();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].label, "bicycle");
    assert_eq!(items[0].bounding_box.as_array(), [2.0, 4.0, 6.0, 12.0]);
  }

  #[test]
  fn reload_releases_previous_handle() {
    let counters = Counters::default();
    let mut detector = Detector::new(engine(&counters));
    for _ in 0..3 {
      detector
        .load_model_bytes(Runtime::Cpu, &descriptor(), b"net")
        .unwrap();
      assert_eq!(counters.live(), 1);
    }
    assert_eq!(counters.built.load(Ordering::SeqCst), 3);
    detector.dispose();
    assert_eq!(counters.live(), 0);
    assert_eq!(detector.state(), ModelState::Unloaded);
  }

  #[test]
  fn failed_load_leaves_unloaded() {
    let counters = Counters::default();
    let mut detector = Detector::new(engine(&counters));
    detector
      .load_model_bytes(Runtime::Cpu, &descriptor(), b"net")
      .unwrap();
    let err = detector
      .load_model_bytes(Runtime::Dsp, &descriptor(), b"net")
      .unwrap_err();
    assert!(matches!(err, LoadError::Engine(EngineError::Build { .. })));
    assert_eq!(detector.state(), ModelState::Unloaded);
    assert_eq!(counters.live(), 0);
    assert_eq!(detector.infer(&bright(4, 4), 0.5).unwrap(), Inference::NotReady);
  }

  #[test]
  fn missing_input_shape_fails_load_and_releases() {
    let counters = Counters::default();
    let mut fake = engine(&counters);
    fake.input = None;
    let mut detector = Detector::new(fake);
    let err = detector
      .load_model_bytes(Runtime::Cpu, &descriptor(), b"net")
      .unwrap_err();
    assert!(matches!(err, LoadError::MissingInputShape(_)));
    assert_eq!(counters.live(), 0);
  }

  #[test]
  fn malformed_input_shape_fails_load() {
    let counters = Counters::default();
    let mut fake = engine(&counters);
    fake.input = Some(InputShape {
      height: 4,
      width: 4,
      channels: 1,
    });
    let mut detector = Detector::new(fake);
    assert!(matches!(
      detector.load_model_bytes(Runtime::Cpu, &descriptor(), b"net"),
      Err(LoadError::InvalidInputShape { channels: 1, .. })
    ));
  }

  #[test]
  fn missing_group_is_config_error() {
    let counters = Counters::default();
    let mut detector = Detector::new(engine(&counters));
    let mut d = descriptor();
    d.output_group = 7;
    assert!(matches!(
      detector.load_model_bytes(Runtime::Cpu, &d, b"net"),
      Err(LoadError::Config(ConfigError::MissingLayerGroup(7)))
    ));
    assert_eq!(counters.built.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn missing_model_file_is_io_error() {
    let counters = Counters::default();
    let mut detector = Detector::new(engine(&counters));
    let mut d = descriptor();
    d.storage_path = "/nonexistent/qingyan/model.dlc".into();
    assert!(matches!(
      detector.load_model(Runtime::Cpu, &d),
      Err(LoadError::Io { .. })
    ));
    assert_eq!(detector.state(), ModelState::Unloaded);
  }

  #[test]
  fn degenerate_frame_skips_execution() {
    let counters = Counters::default();
    let mut detector = Detector::new(engine(&counters));
    detector
      .load_model_bytes(Runtime::Cpu, &descriptor(), b"net")
      .unwrap();
    let black = RgbImage::new(4, 4);
    assert_eq!(detector.infer(&black, 0.5).unwrap(), Inference::Degenerate);
    assert_eq!(counters.executed.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn execute_failure_is_transient() {
    let counters = Counters::default();
    let mut fake = engine(&counters);
    fake.fail_execute = true;
    let mut detector = Detector::new(fake);
    detector
      .load_model_bytes(Runtime::Cpu, &descriptor(), b"net")
      .unwrap();
    assert_eq!(detector.infer(&bright(4, 4), 0.5).unwrap(), Inference::Failed);
    assert_eq!(detector.infer(&bright(4, 4), 0.5).unwrap(), Inference::Failed);
    assert!(detector.is_ready());
  }

  #[test]
  fn malformed_output_fails_fast() {
    let counters = Counters::default();
    let mut fake = engine(&counters);
    let group = catalog::layer_group(0).unwrap();
    fake
      .outputs
      .insert(group.boxes.to_string(), Tensor::new(vec![1, 4], vec![1.0, 1.0]));
    let mut detector = Detector::new(fake);
    detector
      .load_model_bytes(Runtime::Cpu, &descriptor(), b"net")
      .unwrap();
    assert!(matches!(
      detector.infer(&bright(4, 4), 0.5),
      Err(DecodeError::Length { .. })
    ));
  }

  #[test]
  fn drop_releases_handle() {
    let counters = Counters::default();
    {
      let mut detector = Detector::new(engine(&counters));
      detector
        .load_model_bytes(Runtime::Cpu, &descriptor(), b"net")
        .unwrap();
      assert_eq!(counters.live(), 1);
    }
    assert_eq!(counters.live(), 0);
  }
}
