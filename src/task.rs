// 该文件是 Qingyan （清眼） 项目的一部分。
// src/task.rs - 任务：输入 → 分析 → 输出
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

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::{thread, time::Duration, time::Instant};

use image::RgbImage;
use tracing::{info, warn};

use crate::convert::FrameConverter;
use crate::detector::{Detector, Inference};
use crate::engine::Engine;
use crate::frame::CameraFrame;
use crate::output::Render;
use crate::pipeline::{AnalysisWorker, FrameReport, LatestSink, WorkerConfig};
use crate::rate::{DEFAULT_WINDOW_MILLIS, RateTracker, SystemClock};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL: Duration = Duration::from_millis(5);

pub trait Task<I, D, O>: Sized {
  type Error;
  fn run_task(self, input: I, detector: D, output: O) -> Result<(), Self::Error>;
}

/// 取第一帧同步推理一次
#[derive(Debug, Default)]
pub struct OneShotTask {
  config: WorkerConfig,
}

impl OneShotTask {
  pub fn with_config(mut self, config: WorkerConfig) -> Self {
    self.config = config;
    self
  }
}

impl<E, RE, I, O> Task<I, Detector<E>, O> for OneShotTask
where
  E: Engine,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = CameraFrame>,
  O: Render<RgbImage, FrameReport, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, mut detector: Detector<E>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    let frame_index = frame.index;
    let mirrored = frame.facing.mirrored();
    let image = FrameConverter::new(self.config.convert).convert(&frame)?;
    drop(frame);
    info!("输入帧获取成功，开始推理...");

    let now = Instant::now();
    let detections = match detector.infer(&image, self.config.threshold)? {
      Inference::Detections(detections) => detections,
      Inference::Degenerate => {
        warn!("输入帧过暗，跳过推理");
        Vec::new()
      }
      Inference::NotReady => anyhow::bail!("模型未就绪"),
      Inference::Failed => anyhow::bail!("推理失败"),
    };
    let elapsed = now.elapsed();
    info!("推理完成，耗时: {:.2?}, 检测到 {} 个物体", elapsed, detections.len());
    for d in detections.iter() {
      info!(
        "{} {:.2} [{:.1}, {:.1}, {:.1}, {:.1}]",
        d.label,
        d.confidence,
        d.bounding_box.left,
        d.bounding_box.top,
        d.bounding_box.right,
        d.bounding_box.bottom
      );
    }

    let report = FrameReport {
      frame_index,
      detections,
      source_size: image.dimensions(),
      mirrored,
      fps: 0.0,
      preview: None,
    };
    output.render_result(&image, &report)?;
    info!("渲染完成");

    Ok(())
  }
}

/// 持续送帧给分析线程，主线程只渲染最新结果
#[derive(Debug)]
pub struct ContinuousTask {
  config: WorkerConfig,
  frame_number: Option<usize>,
  interval: Option<Duration>,
  window_millis: u64,
  stop: Arc<AtomicBool>,
}

impl Default for ContinuousTask {
  fn default() -> Self {
    Self {
      config: WorkerConfig::default(),
      frame_number: None,
      interval: None,
      window_millis: DEFAULT_WINDOW_MILLIS,
      stop: Arc::new(AtomicBool::new(false)),
    }
  }
}

impl ContinuousTask {
  pub fn with_config(mut self, config: WorkerConfig) -> Self {
    self.config = config;
    self
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 模拟采集节奏的送帧间隔
  pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
    self.interval = interval;
    self
  }

  pub fn with_window_millis(mut self, window_millis: u64) -> Self {
    self.window_millis = window_millis;
    self
  }

  pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = stop;
    self
  }

  fn stopped(&self) -> bool {
    self.stop.load(Ordering::SeqCst)
  }
}

fn render_latest<O, RE>(sink: &LatestSink, output: &O) -> Result<Option<f32>, RE>
where
  O: Render<RgbImage, FrameReport, Error = RE>,
{
  let Some(report) = sink.report.take() else {
    return Ok(None);
  };
  if let Some(preview) = &report.preview {
    output.render_result(preview, &report)?;
  }
  Ok(Some(report.fps))
}

impl<E, RE, I, O> Task<I, Arc<Mutex<Detector<E>>>, O> for ContinuousTask
where
  E: Engine + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = CameraFrame>,
  O: Render<RgbImage, FrameReport, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: I,
    detector: Arc<Mutex<Detector<E>>>,
    output: O,
  ) -> Result<(), Self::Error> {
    info!("开始任务...");
    let sink = Arc::new(LatestSink::default());
    let config = WorkerConfig {
      keep_preview: true,
      ..self.config
    };
    let tracker = RateTracker::new(SystemClock::default(), self.window_millis);
    let worker = AnalysisWorker::spawn(detector, tracker, sink.clone(), config)?;

    let released = Arc::new(AtomicU64::new(0));
    let mut submitted = 0u64;
    let mut fps = 0.0;
    for frame in input {
      if self.stopped() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      let counter = released.clone();
      worker.submit(frame.on_release(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
      }));
      submitted += 1;

      if let Some(latest) = render_latest(&sink, &output)? {
        fps = latest;
      }
      if self
        .frame_number
        .is_some_and(|n| submitted as usize >= n)
      {
        info!("达到指定帧数 {}, 退出任务循环", submitted);
        break;
      }
      if let Some(interval) = self.interval {
        thread::sleep(interval);
      }
    }

    // 等待已提交的帧全部归还
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while released.load(Ordering::SeqCst) < submitted && !self.stopped() {
      if Instant::now() >= deadline {
        warn!("等待分析线程超时");
        break;
      }
      if let Some(latest) = render_latest(&sink, &output)? {
        fps = latest;
      }
      thread::sleep(DRAIN_POLL);
    }

    let summary = worker.shutdown();
    if let Some(latest) = render_latest(&sink, &output)? {
      fps = latest;
    }

    info!(
      "任务完成: 提交 {} 帧, 处理 {} 帧, 跳过 {} 帧, 失败 {} 帧, 丢弃 {} 帧, {:.1} FPS",
      submitted, summary.processed, summary.skipped, summary.failed, summary.dropped, fps
    );
    Ok(())
  }
}
