// 该文件是 Qingyan （清眼） 项目的一部分。
// src/rate.rs - 帧率统计
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

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub const DEFAULT_WINDOW_MILLIS: u64 = 1000;

/// 毫秒时间源
pub trait Clock: Send {
  fn now_millis(&self) -> u64;
}

/// 以创建时刻为零点的单调时钟
#[derive(Debug, Clone)]
pub struct SystemClock {
  origin: Instant,
}

impl Default for SystemClock {
  fn default() -> Self {
    Self {
      origin: Instant::now(),
    }
  }
}

impl Clock for SystemClock {
  fn now_millis(&self) -> u64 {
    self.origin.elapsed().as_millis() as u64
  }
}

/// 手动推进的时钟，克隆之间共享同一时间
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
  now: Arc<AtomicU64>,
}

impl ManualClock {
  pub fn new(start: u64) -> Self {
    Self {
      now: Arc::new(AtomicU64::new(start)),
    }
  }

  pub fn set(&self, millis: u64) {
    self.now.store(millis, Ordering::SeqCst);
  }

  pub fn advance(&self, millis: u64) {
    self.now.fetch_add(millis, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_millis(&self) -> u64 {
    self.now.load(Ordering::SeqCst)
  }
}

/// 滑动窗口帧率统计
///
/// 窗口内保留的时间戳始终满足 `now - timestamp <= window_millis`，
/// 过期项在每次 [`RateTracker::record_event`] 时惰性淘汰。
pub struct RateTracker<C = SystemClock> {
  clock: C,
  window_millis: u64,
  timestamps: VecDeque<u64>,
  fps: f32,
}

impl Default for RateTracker<SystemClock> {
  fn default() -> Self {
    Self::new(SystemClock::default(), DEFAULT_WINDOW_MILLIS)
  }
}

impl<C: Clock> RateTracker<C> {
  pub fn new(clock: C, window_millis: u64) -> Self {
    Self {
      clock,
      window_millis: window_millis.max(1),
      timestamps: VecDeque::new(),
      fps: 0.0,
    }
  }

  /// 记录一帧处理完成事件，返回最新帧率
  pub fn record_event(&mut self) -> f32 {
    let now = self.clock.now_millis();
    self.record_at(now)
  }

  /// 以指定时间戳记录事件
  pub fn record_at(&mut self, now: u64) -> f32 {
    self.timestamps.push_back(now);
    while let Some(&oldest) = self.timestamps.front() {
      if now.saturating_sub(oldest) > self.window_millis {
        self.timestamps.pop_front();
      } else {
        break;
      }
    }
    self.fps = self.timestamps.len() as f32 * 1000.0 / self.window_millis as f32;
    self.fps
  }

  pub fn reset(&mut self) {
    self.timestamps.clear();
    self.fps = 0.0;
  }

  pub fn fps(&self) -> f32 {
    self.fps
  }

  pub fn window_millis(&self) -> u64 {
    self.window_millis
  }

  pub fn len(&self) -> usize {
    self.timestamps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.timestamps.is_empty()
  }
}
