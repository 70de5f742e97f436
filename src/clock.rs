// 该文件是 Huaying （画影） 项目的一部分。
// src/clock.rs - 时钟抽象
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

use std::{
  sync::{Mutex, PoisonError},
  thread,
  time::{Duration, Instant},
};

/// 单调时钟与阻塞等待
pub trait Clock: Send + Sync {
  fn now(&self) -> Instant;
  fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Instant {
    Instant::now()
  }

  fn sleep(&self, duration: Duration) {
    thread::sleep(duration);
  }
}

/// 手动推进的时钟，`sleep` 只推进内部偏移而不真正阻塞
#[derive(Debug)]
pub struct ManualClock {
  base: Instant,
  offset: Mutex<Duration>,
}

impl Default for ManualClock {
  fn default() -> Self {
    Self {
      base: Instant::now(),
      offset: Mutex::new(Duration::ZERO),
    }
  }
}

impl ManualClock {
  pub fn advance(&self, duration: Duration) {
    let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
    *offset += duration;
  }

  /// 自创建以来经过的（虚拟）时间
  pub fn elapsed(&self) -> Duration {
    *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Instant {
    self.base + self.elapsed()
  }

  fn sleep(&self, duration: Duration) {
    self.advance(duration);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn manual_clock_moves_only_when_told() {
    let clock = ManualClock::default();
    let start = clock.now();
    assert_eq!(clock.now(), start);

    clock.sleep(Duration::from_secs(3));
    clock.advance(Duration::from_millis(500));
    assert_eq!(clock.now() - start, Duration::from_millis(3500));
  }
}
