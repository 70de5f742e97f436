// 该文件是 Huaying （画影） 项目的一部分。
// src/feedback.rs - 指示灯与倒计时反馈
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

//! 拍摄前的灯光提示。所有操作都是单向的，硬件错误只记录日志。

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::{clock::Clock, config::LedConfig};

const COUNTDOWN_BLINK: Duration = Duration::from_millis(200);
const FLASH_BLINK: Duration = Duration::from_millis(300);
const SIGNAL_STEPS: u32 = 3;
const SIGNAL_GAP: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum FeedbackError {
  #[cfg(feature = "gpio")]
  #[error("GPIO 错误: {0}")]
  Gpio(#[from] rppal::gpio::Error),
  #[error("当前构建未启用 GPIO 支持")]
  Unsupported,
}

pub trait Feedback: Send {
  fn on(&mut self);
  fn off(&mut self);
  fn blink(&mut self, times: u32, duration: Duration);

  /// 倒计时的一步，最后 3 秒闪烁，其余时间常亮
  fn countdown_step(&mut self, remaining: u32, _total: u32) {
    if remaining <= 3 {
      self.blink(1, COUNTDOWN_BLINK);
    } else {
      self.on();
    }
  }

  /// 倒计时结束、按下快门的瞬间
  fn shutter(&mut self) {
    self.off();
  }

  /// 没有倒计时时的简单提示
  fn flash(&mut self) {
    self.blink(2, FLASH_BLINK);
  }
}

/// 阻塞式倒计时，每秒一步，进入后不可取消
pub fn run_countdown(seconds: u32, feedback: &mut dyn Feedback, clock: &dyn Clock) {
  for remaining in (1..=seconds).rev() {
    info!("{} 秒后拍摄", remaining);
    feedback.countdown_step(remaining, seconds);
    clock.sleep(Duration::from_secs(1));
  }
  info!("拍摄!");
  feedback.shutter();
}

/// 不按整秒计时的 3→2→1 信号灯提示，RGB LED 在没有倒计时时使用
pub fn signal_countdown(feedback: &mut dyn Feedback, clock: &dyn Clock) {
  for remaining in (1..=SIGNAL_STEPS).rev() {
    feedback.countdown_step(remaining, SIGNAL_STEPS);
    clock.sleep(SIGNAL_GAP);
  }
  feedback.shutter();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackEvent {
  On,
  Off,
  Blink(u32, Duration),
}

/// 没有硬件时使用的指示灯，只记录日志与事件
#[derive(Debug, Default)]
pub struct MockFeedback {
  events: Vec<FeedbackEvent>,
}

const MOCK_EVENT_LIMIT: usize = 64;

impl MockFeedback {
  /// 最近的事件，最多保留 64 条
  pub fn events(&self) -> &[FeedbackEvent] {
    &self.events
  }

  fn record(&mut self, event: FeedbackEvent) {
    if self.events.len() == MOCK_EVENT_LIMIT {
      self.events.remove(0);
    }
    self.events.push(event);
  }
}

impl Feedback for MockFeedback {
  fn on(&mut self) {
    info!("[LED] 亮");
    self.record(FeedbackEvent::On);
  }

  fn off(&mut self) {
    info!("[LED] 灭");
    self.record(FeedbackEvent::Off);
  }

  fn blink(&mut self, times: u32, duration: Duration) {
    info!("[LED] 闪烁 {} 次 ({:?})", times, duration);
    self.record(FeedbackEvent::Blink(times, duration));
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
  pub const OFF: Rgb = Rgb(0, 0, 0);
  pub const WHITE: Rgb = Rgb(255, 255, 255);
  pub const RED: Rgb = Rgb(255, 0, 0);
  pub const YELLOW: Rgb = Rgb(255, 255, 0);
  pub const GREEN: Rgb = Rgb(0, 255, 0);
}

/// 信号灯顺序：3 秒倒计时为 红→黄→绿，2 秒为 黄→绿，其余全绿
pub fn countdown_color(remaining: u32, total: u32) -> Rgb {
  match (total, remaining) {
    (3, 3) => Rgb::RED,
    (2..=3, 2) => Rgb::YELLOW,
    _ => Rgb::GREEN,
  }
}

/// PWM 占空比，共阳极接法需要反转
pub fn duty_cycle(value: u8, common_anode: bool) -> f64 {
  let duty = value as f64 / 255.0;
  if common_anode { 1.0 - duty } else { duty }
}

#[cfg(feature = "gpio")]
pub use self::gpio_led::{GpioLed, RgbLed};

#[cfg(feature = "gpio")]
mod gpio_led {
  use std::{thread, time::Duration};

  use rppal::gpio::{Gpio, OutputPin};
  use tracing::{info, warn};

  use super::{Feedback, FeedbackError, Rgb, countdown_color, duty_cycle, signal_countdown};
  use crate::clock::SystemClock;

  const PWM_FREQUENCY: f64 = 1000.0;
  const COUNTDOWN_STEP_ON: Duration = Duration::from_millis(500);
  const SHUTTER_FLASH: Duration = Duration::from_millis(200);

  /// 单色 LED
  pub struct GpioLed {
    pin: OutputPin,
  }

  impl GpioLed {
    pub fn open(pin: u8) -> Result<Self, FeedbackError> {
      let pin = Gpio::new()?.get(pin)?.into_output_low();
      info!("LED 已初始化: GPIO{}", pin.pin());
      Ok(Self { pin })
    }
  }

  impl Feedback for GpioLed {
    fn on(&mut self) {
      self.pin.set_high();
    }

    fn off(&mut self) {
      self.pin.set_low();
    }

    fn blink(&mut self, times: u32, duration: Duration) {
      for _ in 0..times {
        self.pin.set_high();
        thread::sleep(duration);
        self.pin.set_low();
        thread::sleep(duration);
      }
    }
  }

  impl Drop for GpioLed {
    fn drop(&mut self) {
      self.pin.set_low();
    }
  }

  /// 软件 PWM 驱动的 RGB LED
  pub struct RgbLed {
    pins: [OutputPin; 3],
    common_anode: bool,
  }

  impl RgbLed {
    pub fn open(pins: [u8; 3], common_anode: bool) -> Result<Self, FeedbackError> {
      let gpio = Gpio::new()?;
      let [r, g, b] = pins;
      let mut led = Self {
        pins: [
          gpio.get(r)?.into_output(),
          gpio.get(g)?.into_output(),
          gpio.get(b)?.into_output(),
        ],
        common_anode,
      };
      led.set_color(Rgb::OFF);
      info!(
        "RGB LED 已初始化: R=GPIO{} G=GPIO{} B=GPIO{} (共阳极: {})",
        r, g, b, common_anode
      );
      Ok(led)
    }

    pub fn set_color(&mut self, color: Rgb) {
      let Rgb(r, g, b) = color;
      for (pin, value) in self.pins.iter_mut().zip([r, g, b]) {
        if let Err(e) = pin.set_pwm_frequency(PWM_FREQUENCY, duty_cycle(value, self.common_anode)) {
          warn!("设置 GPIO{} PWM 失败: {}", pin.pin(), e);
        }
      }
    }
  }

  impl Feedback for RgbLed {
    fn on(&mut self) {
      self.set_color(Rgb::WHITE);
    }

    fn off(&mut self) {
      self.set_color(Rgb::OFF);
    }

    fn blink(&mut self, times: u32, duration: Duration) {
      for i in 0..times {
        self.set_color(Rgb::WHITE);
        thread::sleep(duration);
        self.set_color(Rgb::OFF);
        if i + 1 < times {
          thread::sleep(duration);
        }
      }
    }

    fn countdown_step(&mut self, remaining: u32, total: u32) {
      self.set_color(countdown_color(remaining, total));
      thread::sleep(COUNTDOWN_STEP_ON);
      self.set_color(Rgb::OFF);
    }

    fn shutter(&mut self) {
      self.set_color(Rgb::WHITE);
      thread::sleep(SHUTTER_FLASH);
      self.set_color(Rgb::OFF);
    }

    fn flash(&mut self) {
      signal_countdown(self, &SystemClock);
    }
  }

  impl Drop for RgbLed {
    fn drop(&mut self) {
      for pin in self.pins.iter_mut() {
        let _ = pin.clear_pwm();
      }
    }
  }
}

/// 启动时根据配置选定的指示灯，硬件不可用时退化为日志
pub enum FeedbackWrapper {
  Mock(MockFeedback),
  #[cfg(feature = "gpio")]
  Gpio(GpioLed),
  #[cfg(feature = "gpio")]
  Rgb(RgbLed),
}

impl FeedbackWrapper {
  fn try_open(config: &LedConfig) -> Result<Self, FeedbackError> {
    match config {
      LedConfig::Off => Ok(FeedbackWrapper::Mock(MockFeedback::default())),
      #[cfg(feature = "gpio")]
      LedConfig::Single { pin } => Ok(FeedbackWrapper::Gpio(GpioLed::open(*pin)?)),
      #[cfg(feature = "gpio")]
      LedConfig::Rgb { pins, common_anode } => {
        Ok(FeedbackWrapper::Rgb(RgbLed::open(*pins, *common_anode)?))
      }
      #[cfg(not(feature = "gpio"))]
      _ => Err(FeedbackError::Unsupported),
    }
  }

  pub fn from_config(config: &LedConfig) -> Self {
    Self::try_open(config).unwrap_or_else(|e| {
      warn!("指示灯初始化失败, 使用模拟指示灯: {}", e);
      FeedbackWrapper::Mock(MockFeedback::default())
    })
  }

  fn inner(&mut self) -> &mut dyn Feedback {
    match self {
      FeedbackWrapper::Mock(led) => led,
      #[cfg(feature = "gpio")]
      FeedbackWrapper::Gpio(led) => led,
      #[cfg(feature = "gpio")]
      FeedbackWrapper::Rgb(led) => led,
    }
  }
}

impl Feedback for FeedbackWrapper {
  fn on(&mut self) {
    self.inner().on();
  }

  fn off(&mut self) {
    self.inner().off();
  }

  fn blink(&mut self, times: u32, duration: Duration) {
    self.inner().blink(times, duration);
  }

  fn countdown_step(&mut self, remaining: u32, total: u32) {
    self.inner().countdown_step(remaining, total);
  }

  fn shutter(&mut self) {
    self.inner().shutter();
  }

  fn flash(&mut self) {
    self.inner().flash();
  }
}
