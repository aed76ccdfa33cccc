// 该文件是 Qingyan （清眼） 项目的一部分。
// src/pipeline.rs - 分析线程、帧交接与界面更新
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

//! 并发模型：
//! - 采集端通过 [`LatestFrameSlot`] 交出帧，只保留最新的一帧，旧帧直接归还；
//! - 单个分析线程串行执行 转换 → 归一化 → 推理 → 解码；
//! - 结果以“最新者胜出”的方式交给界面（[`UiSink`]）；
//! - 模型加载在独立线程上串行执行，与推理共用同一把检测器锁。
//!
//! 重新选择模型时不会取消正在进行的推理，该帧结果可能在新模型就绪后才送达界面。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use image::RgbImage;
use tracing::{debug, error, info, warn};

use crate::convert::{ConvertPath, FrameConverter};
use crate::detector::{Detector, Inference, LoadError};
use crate::engine::{Engine, Runtime};
use crate::frame::CameraFrame;
use crate::model::{DetectionResult, ModelDescriptor};
use crate::rate::{Clock, RateTracker};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| {
    warn!("锁已中毒, 继续使用内部数据");
    poisoned.into_inner()
  })
}

/// 只保留最新一帧的交接槽
///
/// 分析线程忙碌时新帧会替换尚未取走的旧帧，被替换的帧随即归还采集端。
#[derive(Default)]
pub struct LatestFrameSlot {
  state: Mutex<SlotState>,
  ready: Condvar,
}

#[derive(Default)]
struct SlotState {
  frame: Option<CameraFrame>,
  closed: bool,
  dropped: u64,
}

impl LatestFrameSlot {
  pub fn new() -> Self {
    Self::default()
  }

  /// 放入一帧；槽已关闭时帧被直接归还并返回 `false`
  pub fn push(&self, frame: CameraFrame) -> bool {
    let replaced = {
      let mut state = lock(&self.state);
      if state.closed {
        drop(state);
        drop(frame);
        return false;
      }
      let replaced = state.frame.replace(frame);
      if replaced.is_some() {
        state.dropped += 1;
      }
      replaced
    };
    self.ready.notify_one();
    if let Some(old) = replaced {
      debug!("分析线程忙碌, 丢弃第 {} 帧", old.index);
    }
    true
  }

  /// 阻塞等待下一帧；关闭后返回 `None`
  pub fn take(&self) -> Option<CameraFrame> {
    let mut state = lock(&self.state);
    loop {
      if state.closed {
        return None;
      }
      if let Some(frame) = state.frame.take() {
        return Some(frame);
      }
      state = self
        .ready
        .wait(state)
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
  }

  /// 关闭交接槽，未取走的帧被归还
  pub fn close(&self) {
    let pending = {
      let mut state = lock(&self.state);
      state.closed = true;
      state.frame.take()
    };
    self.ready.notify_all();
    drop(pending);
  }

  pub fn dropped(&self) -> u64 {
    lock(&self.state).dropped
  }
}

/// 最新值容器，后写入的值覆盖先前未读取的值
#[derive(Debug)]
pub struct LatestValue<T> {
  value: Mutex<Option<T>>,
}

impl<T> Default for LatestValue<T> {
  fn default() -> Self {
    Self {
      value: Mutex::new(None),
    }
  }
}

impl<T> LatestValue<T> {
  pub fn set(&self, value: T) {
    *lock(&self.value) = Some(value);
  }

  pub fn take(&self) -> Option<T> {
    lock(&self.value).take()
  }
}

impl<T: Clone> LatestValue<T> {
  pub fn get(&self) -> Option<T> {
    lock(&self.value).clone()
  }
}

/// 一帧推理完成后交给界面的数据
#[derive(Debug, Clone)]
pub struct FrameReport {
  pub frame_index: u64,
  pub detections: Vec<DetectionResult>,
  pub source_size: (u32, u32),
  pub mirrored: bool,
  pub fps: f32,
  pub preview: Option<Arc<RgbImage>>,
}

/// 模型加载状态通知
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
  Loading { model: String, runtime: Runtime },
  Ready { model: String, runtime: Runtime },
  Failed {
    model: String,
    runtime: Runtime,
    message: String,
  },
}

/// 界面侧接收端，调用发生在推理或加载线程上
pub trait UiSink: Send + Sync {
  fn publish(&self, report: FrameReport);
  fn status(&self, status: LoadStatus);
}

/// 只保存最新报告与最新状态的接收端，由界面线程轮询
#[derive(Debug, Default)]
pub struct LatestSink {
  pub report: LatestValue<FrameReport>,
  pub status: LatestValue<LoadStatus>,
  published: AtomicU64,
}

impl LatestSink {
  pub fn published(&self) -> u64 {
    self.published.load(Ordering::SeqCst)
  }
}

impl UiSink for LatestSink {
  fn publish(&self, report: FrameReport) {
    self.published.fetch_add(1, Ordering::SeqCst);
    self.report.set(report);
  }

  fn status(&self, status: LoadStatus) {
    self.status.set(status);
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerConfig {
  pub threshold: f32,
  pub convert: ConvertPath,
  /// 在报告中附带转换后的图像，供叠加层绘制到画面上
  pub keep_preview: bool,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      convert: ConvertPath::Direct,
      keep_preview: false,
    }
  }
}

/// 分析线程统计
#[derive(Debug, Default)]
pub struct WorkerStats {
  pub processed: AtomicU64,
  pub skipped: AtomicU64,
  pub failed: AtomicU64,
}

impl WorkerStats {
  pub fn processed(&self) -> u64 {
    self.processed.load(Ordering::SeqCst)
  }

  pub fn skipped(&self) -> u64 {
    self.skipped.load(Ordering::SeqCst)
  }

  pub fn failed(&self) -> u64 {
    self.failed.load(Ordering::SeqCst)
  }
}

/// 分析线程退出时的统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerSummary {
  pub processed: u64,
  pub skipped: u64,
  pub failed: u64,
  pub dropped: u64,
}

/// 单线程分析器
pub struct AnalysisWorker {
  slot: Arc<LatestFrameSlot>,
  stats: Arc<WorkerStats>,
  thread: Option<JoinHandle<()>>,
}

impl AnalysisWorker {
  pub fn spawn<E, C, S>(
    detector: Arc<Mutex<Detector<E>>>,
    tracker: RateTracker<C>,
    sink: Arc<S>,
    config: WorkerConfig,
  ) -> std::io::Result<Self>
  where
    E: Engine + 'static,
    C: Clock + 'static,
    S: UiSink + ?Sized + 'static,
  {
    let slot = Arc::new(LatestFrameSlot::new());
    let stats = Arc::new(WorkerStats::default());
    let mut analyzer = Analyzer {
      detector,
      converter: FrameConverter::new(config.convert),
      tracker,
      sink,
      stats: stats.clone(),
      config,
    };
    let frames = slot.clone();
    let thread = thread::Builder::new()
      .name("qingyan-analysis".to_string())
      .spawn(move || {
        info!("分析线程启动");
        while let Some(frame) = frames.take() {
          analyzer.analyze(frame);
        }
        info!("分析线程退出");
      })?;

    Ok(Self {
      slot,
      stats,
      thread: Some(thread),
    })
  }

  /// 提交一帧，旧的未处理帧会被丢弃
  pub fn submit(&self, frame: CameraFrame) -> bool {
    self.slot.push(frame)
  }

  pub fn stats(&self) -> &WorkerStats {
    &self.stats
  }

  pub fn dropped(&self) -> u64 {
    self.slot.dropped()
  }

  pub fn summary(&self) -> WorkerSummary {
    WorkerSummary {
      processed: self.stats.processed(),
      skipped: self.stats.skipped(),
      failed: self.stats.failed(),
      dropped: self.slot.dropped(),
    }
  }

  /// 停止分析线程并等待其退出
  pub fn shutdown(mut self) -> WorkerSummary {
    self.stop();
    self.summary()
  }

  fn stop(&mut self) {
    self.slot.close();
    if let Some(thread) = self.thread.take()
      && thread.join().is_err()
    {
      error!("分析线程异常退出");
    }
  }
}

impl Drop for AnalysisWorker {
  fn drop(&mut self) {
    self.stop();
  }
}

struct Analyzer<E: Engine, C, S: ?Sized> {
  detector: Arc<Mutex<Detector<E>>>,
  converter: FrameConverter,
  tracker: RateTracker<C>,
  sink: Arc<S>,
  stats: Arc<WorkerStats>,
  config: WorkerConfig,
}

impl<E: Engine, C: Clock, S: UiSink + ?Sized> Analyzer<E, C, S> {
  fn analyze(&mut self, frame: CameraFrame) {
    let frame_index = frame.index;
    let mirrored = frame.facing.mirrored();
    let converted = self.converter.convert(&frame);
    // 转换完成即归还采集端
    drop(frame);

    let image = match converted {
      Ok(image) => image,
      Err(e) => {
        warn!("第 {} 帧转换失败: {}", frame_index, e);
        self.stats.failed.fetch_add(1, Ordering::SeqCst);
        return;
      }
    };

    let inference = lock(&self.detector).infer(&image, self.config.threshold);
    let detections = match inference {
      Ok(Inference::Detections(detections)) => detections,
      Ok(Inference::NotReady) | Ok(Inference::Degenerate) => {
        self.stats.skipped.fetch_add(1, Ordering::SeqCst);
        return;
      }
      Ok(Inference::Failed) => {
        self.stats.failed.fetch_add(1, Ordering::SeqCst);
        return;
      }
      Err(e) => {
        error!("第 {} 帧输出数据错误: {}", frame_index, e);
        self.stats.failed.fetch_add(1, Ordering::SeqCst);
        return;
      }
    };

    let fps = self.tracker.record_event();
    self.stats.processed.fetch_add(1, Ordering::SeqCst);
    debug!(
      "第 {} 帧: {} 个物体, {:.1} FPS",
      frame_index,
      detections.len(),
      fps
    );

    let source_size = image.dimensions();
    let preview = self.config.keep_preview.then(|| Arc::new(image));
    self.sink.publish(FrameReport {
      frame_index,
      detections,
      source_size,
      mirrored,
      fps,
      preview,
    });
  }
}

struct LoadRequest {
  runtime: Runtime,
  descriptor: ModelDescriptor,
  model: Option<Vec<u8>>,
  reply: mpsc::Sender<Result<(), LoadError>>,
}

/// 一次加载请求的结果
pub struct LoadTicket {
  reply: mpsc::Receiver<Result<(), LoadError>>,
}

impl LoadTicket {
  /// 等待加载完成；加载线程已退出时返回 `None`
  pub fn wait(self) -> Option<Result<(), LoadError>> {
    self.reply.recv().ok()
  }
}

/// 后台模型加载器，请求按提交顺序串行执行
pub struct ModelLoader {
  requests: Option<mpsc::Sender<LoadRequest>>,
  thread: Option<JoinHandle<()>>,
}

impl ModelLoader {
  pub fn spawn<E, S>(detector: Arc<Mutex<Detector<E>>>, sink: Arc<S>) -> std::io::Result<Self>
  where
    E: Engine + 'static,
    S: UiSink + ?Sized + 'static,
  {
    let (tx, rx) = mpsc::channel::<LoadRequest>();
    let thread = thread::Builder::new()
      .name("qingyan-loader".to_string())
      .spawn(move || {
        for request in rx {
          let model = request.descriptor.display_name.clone();
          let runtime = request.runtime;
          sink.status(LoadStatus::Loading {
            model: model.clone(),
            runtime,
          });

          let result = {
            let mut detector = lock(&detector);
            match &request.model {
              Some(bytes) => detector.load_model_bytes(runtime, &request.descriptor, bytes),
              None => detector.load_model(runtime, &request.descriptor),
            }
          };

          match &result {
            Ok(()) => sink.status(LoadStatus::Ready { model, runtime }),
            Err(e) => sink.status(LoadStatus::Failed {
              model,
              runtime,
              message: e.to_string(),
            }),
          }
          let _ = request.reply.send(result);
        }
      })?;

    Ok(Self {
      requests: Some(tx),
      thread: Some(thread),
    })
  }

  /// 从描述中的存储路径加载模型
  pub fn load(&self, runtime: Runtime, descriptor: ModelDescriptor) -> LoadTicket {
    self.request(runtime, descriptor, None)
  }

  pub fn load_bytes(
    &self,
    runtime: Runtime,
    descriptor: ModelDescriptor,
    model: Vec<u8>,
  ) -> LoadTicket {
    self.request(runtime, descriptor, Some(model))
  }

  fn request(
    &self,
    runtime: Runtime,
    descriptor: ModelDescriptor,
    model: Option<Vec<u8>>,
  ) -> LoadTicket {
    let (reply, rx) = mpsc::channel();
    let request = LoadRequest {
      runtime,
      descriptor,
      model,
      reply,
    };
    if let Some(requests) = &self.requests
      && requests.send(request).is_err()
    {
      error!("加载线程已退出");
    }
    LoadTicket { reply: rx }
  }
}

impl Drop for ModelLoader {
  fn drop(&mut self) {
    self.requests.take();
    if let Some(thread) = self.thread.take()
      && thread.join().is_err()
    {
      error!("加载线程异常退出");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::PixelData;
  use std::sync::atomic::AtomicUsize;

  fn frame(index: u64, released: &Arc<AtomicUsize>) -> CameraFrame {
    let counter = released.clone();
    CameraFrame::new(index, PixelData::Rgb(RgbImage::new(2, 2))).on_release(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn slot_keeps_only_newest_frame() {
    let released = Arc::new(AtomicUsize::new(0));
    let slot = LatestFrameSlot::new();
    assert!(slot.push(frame(1, &released)));
    assert!(slot.push(frame(2, &released)));
    assert!(slot.push(frame(3, &released)));
    assert_eq!(released.load(Ordering::SeqCst), 2);
    assert_eq!(slot.dropped(), 2);

    let taken = slot.take().unwrap();
    assert_eq!(taken.index, 3);
    drop(taken);
    assert_eq!(released.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn closed_slot_releases_pending_and_rejects_new() {
    let released = Arc::new(AtomicUsize::new(0));
    let slot = LatestFrameSlot::new();
    slot.push(frame(1, &released));
    slot.close();
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(!slot.push(frame(2, &released)));
    assert_eq!(released.load(Ordering::SeqCst), 2);
    assert!(slot.take().is_none());
  }

  #[test]
  fn take_blocks_until_push() {
    let released = Arc::new(AtomicUsize::new(0));
    let slot = Arc::new(LatestFrameSlot::new());
    let consumer = {
      let slot = slot.clone();
      thread::spawn(move || slot.take().map(|f| f.index))
    };
    thread::sleep(std::time::Duration::from_millis(20));
    slot.push(frame(9, &released));
    assert_eq!(consumer.join().unwrap(), Some(9));
  }

  #[test]
  fn latest_value_last_write_wins() {
    let value = LatestValue::default();
    value.set(1);
    value.set(2);
    assert_eq!(value.get(), Some(2));
    assert_eq!(value.take(), Some(2));
    assert_eq!(value.take(), None);
  }
}
