// 该文件是 Huaying （画影） 项目的一部分。
// src/sensor.rs - PIR 人体感应
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
  sync::{Arc, Mutex, PoisonError},
  time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct MailboxState {
  pending: bool,
  last_accepted: Option<Instant>,
}

/// 单槽位的运动信号邮箱
///
/// 中断回调只负责投递，拍摄循环读取并清空；两者共用同一把锁。
#[derive(Debug, Clone)]
pub struct MotionMailbox {
  state: Arc<Mutex<MailboxState>>,
  cooldown: Duration,
}

impl MotionMailbox {
  pub fn new(cooldown: Duration) -> Self {
    Self {
      state: Arc::new(Mutex::new(MailboxState::default())),
      cooldown,
    }
  }

  /// 投递一次上升沿；距上次被接受的上升沿不足冷却时间时忽略，返回是否被接受
  pub fn post(&self, now: Instant) -> bool {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(last) = state.last_accepted
      && now.saturating_duration_since(last) <= self.cooldown
    {
      return false;
    }
    state.last_accepted = Some(now);
    state.pending = true;
    true
  }

  /// 读取并清空待处理标志
  pub fn take(&self) -> bool {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::take(&mut state.pending)
  }

  pub fn is_pending(&self) -> bool {
    self.state.lock().unwrap_or_else(PoisonError::into_inner).pending
  }
}

#[cfg(feature = "gpio")]
pub use self::gpio_pir::{PirSensor, PirSensorError};

#[cfg(feature = "gpio")]
mod gpio_pir {
  use std::time::Instant;

  use rppal::gpio::{Event, Gpio, InputPin, Trigger};
  use thiserror::Error;
  use tracing::{debug, info};

  use super::MotionMailbox;
  use crate::config::PirConfig;

  #[derive(Error, Debug)]
  pub enum PirSensorError {
    #[error("GPIO 错误: {0}")]
    Gpio(#[from] rppal::gpio::Error),
  }

  /// 接在 GPIO 上的 PIR 传感器，上升沿触发
  pub struct PirSensor {
    pin: InputPin,
    mailbox: MotionMailbox,
  }

  impl PirSensor {
    pub fn open(
      config: &PirConfig,
      on_motion: Option<Box<dyn Fn() + Send + 'static>>,
    ) -> Result<Self, PirSensorError> {
      let mut pin = Gpio::new()?.get(config.pin)?.into_input_pulldown();
      let mailbox = MotionMailbox::new(config.cooldown);

      let sink = mailbox.clone();
      pin.set_async_interrupt(
        Trigger::RisingEdge,
        Some(config.bounce_time),
        move |_event: Event| {
          if sink.post(Instant::now()) {
            debug!("PIR 检测到运动");
            if let Some(callback) = &on_motion {
              callback();
            }
          }
        },
      )?;

      info!(
        "PIR 传感器已启动: GPIO{} (去抖 {:?}, 冷却 {:?})",
        config.pin, config.bounce_time, config.cooldown
      );
      Ok(Self { pin, mailbox })
    }

    pub fn mailbox(&self) -> MotionMailbox {
      self.mailbox.clone()
    }

    pub fn is_high(&self) -> bool {
      self.pin.is_high()
    }
  }

  impl Drop for PirSensor {
    fn drop(&mut self) {
      let _ = self.pin.clear_async_interrupt();
      info!("PIR 传感器已停止");
    }
  }
}
