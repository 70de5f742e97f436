// 该文件是 Huaying （画影） 项目的一部分。
// src/config.rs - 运行参数配置
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

//! 命令行与环境变量参数，以及由其派生的不可变配置。
//!
//! 参数组在可执行文件中通过 `#[command(flatten)]` 组合，启动时只转换一次，
//! 之后以值的形式传入各组件的构造函数。

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{ArgAction, Args, ValueEnum};
use url::Url;

fn seconds(value: f64) -> Duration {
  Duration::from_secs_f64(value.max(0.0))
}

/// 拍摄决策引擎配置
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
  /// 两次轮询之间的间隔
  pub capture_interval: Duration,
  /// 两次成功上传之间的最短间隔
  pub cooldown: Duration,
  /// 倒计时秒数，0 表示不倒计时
  pub countdown_seconds: u32,
  pub min_confidence: f32,
  /// 检测框面积占整帧的最小比例，低于该值时放大检测框
  pub min_bbox_area_ratio: f64,
  pub bbox_scale_up: f64,
  pub detection_enabled: bool,
  pub use_full_frame: bool,
  pub pir_required: bool,
  /// 裁剪后四周填充的像素数
  pub crop_padding: u32,
  pub crop_fill: [u8; 3],
  pub jpeg_quality: u8,
  /// 单次轮询出现意外错误后的等待时间
  pub error_backoff: Duration,
}

impl Default for CaptureConfig {
  fn default() -> Self {
    Self {
      capture_interval: Duration::from_secs(2),
      cooldown: Duration::from_secs(5),
      countdown_seconds: 3,
      min_confidence: 0.5,
      min_bbox_area_ratio: 0.15,
      bbox_scale_up: 1.5,
      detection_enabled: true,
      use_full_frame: false,
      pir_required: false,
      crop_padding: 10,
      crop_fill: [255, 255, 255],
      jpeg_quality: 90,
      error_backoff: Duration::from_secs(1),
    }
  }
}

#[derive(Args, Debug, Clone)]
pub struct CaptureArgs {
  /// 轮询间隔（秒）
  #[arg(long, env = "CAPTURE_INTERVAL", default_value_t = 2.0, value_name = "SECONDS")]
  pub capture_interval: f64,

  /// 连续拍摄冷却时间（秒）
  #[arg(long, env = "CAPTURE_COOLDOWN", default_value_t = 5.0, value_name = "SECONDS")]
  pub cooldown: f64,

  /// 拍摄前倒计时（秒），0 表示不倒计时
  #[arg(long, env = "CAPTURE_COUNTDOWN", default_value_t = 3, value_name = "SECONDS")]
  pub countdown: u32,

  /// 人体检测置信度阈值 (0.0 - 1.0)
  #[arg(long, env = "MIN_DETECTION_CONFIDENCE", default_value_t = 0.5, value_name = "THRESHOLD")]
  pub min_confidence: f32,

  /// 检测框面积占比阈值，低于该值时放大检测框
  #[arg(long, env = "MIN_BBOX_AREA_RATIO", default_value_t = 0.15, value_name = "RATIO")]
  pub min_bbox_area_ratio: f64,

  /// 检测框放大倍数
  #[arg(long, env = "BBOX_SCALE_UP", default_value_t = 1.5, value_name = "FACTOR")]
  pub bbox_scale_up: f64,

  /// 是否启用人体检测，关闭后每次轮询都上传整帧
  #[arg(long, env = "DETECTION_ENABLED", default_value_t = true, action = ArgAction::Set)]
  pub detection: bool,

  /// 上传整帧而不是裁剪检测区域
  #[arg(long, env = "USE_FULL_FRAME", default_value_t = false, action = ArgAction::Set)]
  pub use_full_frame: bool,

  /// 仅在 PIR 触发时才拍摄
  #[arg(long, env = "PIR_REQUIRED", default_value_t = false, action = ArgAction::Set)]
  pub pir_required: bool,

  /// JPEG 编码质量 (1 - 100)
  #[arg(long, env = "JPEG_QUALITY", default_value_t = 90, value_name = "QUALITY")]
  pub jpeg_quality: u8,
}

impl From<&CaptureArgs> for CaptureConfig {
  fn from(args: &CaptureArgs) -> Self {
    Self {
      capture_interval: seconds(args.capture_interval),
      cooldown: seconds(args.cooldown),
      countdown_seconds: args.countdown,
      min_confidence: args.min_confidence.clamp(0.0, 1.0),
      min_bbox_area_ratio: args.min_bbox_area_ratio.max(0.0),
      bbox_scale_up: args.bbox_scale_up.max(1.0),
      detection_enabled: args.detection,
      use_full_frame: args.use_full_frame,
      pir_required: args.pir_required,
      jpeg_quality: args.jpeg_quality.clamp(1, 100),
      ..CaptureConfig::default()
    }
  }
}

/// PIR 传感器配置
#[derive(Debug, Clone, PartialEq)]
pub struct PirConfig {
  pub enabled: bool,
  /// BCM 编号
  pub pin: u8,
  pub bounce_time: Duration,
  /// 两次被接受的上升沿之间的最短间隔
  pub cooldown: Duration,
}

impl Default for PirConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      pin: 4,
      bounce_time: Duration::from_millis(500),
      cooldown: Duration::from_secs(2),
    }
  }
}

#[derive(Args, Debug, Clone)]
pub struct PirArgs {
  /// 启用 PIR 人体感应
  #[arg(long = "pir", env = "PIR_ENABLED", default_value_t = false, action = ArgAction::Set)]
  pub enabled: bool,

  /// PIR 信号引脚（BCM 编号）
  #[arg(long, env = "PIR_PIN", default_value_t = 4, value_name = "PIN")]
  pub pir_pin: u8,

  /// 去抖时间（秒）
  #[arg(long, env = "PIR_DEBOUNCE", default_value_t = 0.5, value_name = "SECONDS")]
  pub pir_debounce: f64,

  /// 触发后冷却时间（秒）
  #[arg(long, env = "PIR_COOLDOWN", default_value_t = 2.0, value_name = "SECONDS")]
  pub pir_cooldown: f64,
}

impl From<&PirArgs> for PirConfig {
  fn from(args: &PirArgs) -> Self {
    Self {
      enabled: args.enabled,
      pin: args.pir_pin,
      bounce_time: seconds(args.pir_debounce),
      cooldown: seconds(args.pir_cooldown),
    }
  }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedKind {
  #[default]
  Off,
  Single,
  Rgb,
}

/// 指示灯配置
#[derive(Debug, Clone, PartialEq)]
pub enum LedConfig {
  Off,
  Single { pin: u8 },
  Rgb { pins: [u8; 3], common_anode: bool },
}

#[derive(Args, Debug, Clone)]
pub struct LedArgs {
  /// 指示灯类型
  #[arg(long, env = "LED_KIND", value_enum, default_value_t = LedKind::Off)]
  pub led: LedKind,

  /// 单色指示灯引脚（BCM 编号）
  #[arg(long, env = "LED_PIN", default_value_t = 18, value_name = "PIN")]
  pub led_pin: u8,

  /// RGB 指示灯引脚，顺序为 红,绿,蓝
  #[arg(long, env = "RGB_LED_PINS", value_delimiter = ',', default_values_t = [17u8, 27, 22])]
  pub rgb_pins: Vec<u8>,

  /// RGB 指示灯为共阳极
  #[arg(long, env = "RGB_COMMON_ANODE", default_value_t = false, action = ArgAction::Set)]
  pub rgb_common_anode: bool,
}

impl From<&LedArgs> for LedConfig {
  fn from(args: &LedArgs) -> Self {
    match args.led {
      LedKind::Off => LedConfig::Off,
      LedKind::Single => LedConfig::Single { pin: args.led_pin },
      LedKind::Rgb => {
        let pin = |i: usize, default: u8| args.rgb_pins.get(i).copied().unwrap_or(default);
        LedConfig::Rgb {
          pins: [pin(0, 17), pin(1, 27), pin(2, 22)],
          common_anode: args.rgb_common_anode,
        }
      }
    }
  }
}

/// 树莓派端实时预览配置
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
  pub enabled: bool,
  /// 设置后推送到远端中继，否则在本机提供 MJPEG 预览
  pub push_url: Option<Url>,
  pub secret: String,
  pub fps: u32,
  pub quality: u8,
  pub local_bind: SocketAddr,
  pub reconnect_delay: Duration,
}

impl StreamConfig {
  pub fn frame_interval(&self) -> Duration {
    Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
  }
}

#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
  /// 启用实时预览
  #[arg(long = "stream", env = "STREAM_ENABLED", default_value_t = false, action = ArgAction::Set)]
  pub enabled: bool,

  /// 推流地址，例如 ws://server:8000/stream/push
  #[arg(long, env = "STREAM_PUSH_URL", value_name = "URL")]
  pub stream_push_url: Option<Url>,

  /// 推流共享密钥
  #[arg(long, env = "STREAM_SECRET", default_value = "raspberry-pi-secret", hide_env_values = true)]
  pub stream_secret: String,

  /// 预览帧率
  #[arg(long, env = "STREAM_FPS", default_value_t = 10, value_name = "FPS")]
  pub stream_fps: u32,

  /// 预览 JPEG 质量
  #[arg(long, env = "STREAM_QUALITY", default_value_t = 70, value_name = "QUALITY")]
  pub stream_quality: u8,

  /// 本机预览监听地址
  #[arg(long, env = "STREAM_BIND", default_value = "0.0.0.0:8080", value_name = "ADDR")]
  pub stream_bind: SocketAddr,
}

impl From<&StreamArgs> for StreamConfig {
  fn from(args: &StreamArgs) -> Self {
    Self {
      enabled: args.enabled,
      push_url: args.stream_push_url.clone(),
      secret: args.stream_secret.clone(),
      fps: args.stream_fps.max(1),
      quality: args.stream_quality.clamp(1, 100),
      local_bind: args.stream_bind,
      reconnect_delay: Duration::from_secs(5),
    }
  }
}

/// 服务端中继配置
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
  pub secret: String,
  /// 保留的历史帧数量
  pub history: usize,
  /// 每个订阅者队列容量
  pub subscriber_capacity: usize,
  /// 信源断开后 MJPEG 输出等待新帧的时间
  pub idle_timeout: Duration,
}

impl Default for RelayConfig {
  fn default() -> Self {
    Self {
      secret: "raspberry-pi-secret".to_string(),
      history: 30,
      subscriber_capacity: 10,
      idle_timeout: Duration::from_secs(5),
    }
  }
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
  /// 监听地址
  #[arg(long, env = "SERVER_BIND", default_value = "0.0.0.0:8000", value_name = "ADDR")]
  pub bind: SocketAddr,

  /// 推流共享密钥
  #[arg(long, env = "STREAM_SECRET", default_value = "raspberry-pi-secret", hide_env_values = true)]
  pub secret: String,

  /// 上传图片存储目录
  #[arg(long, env = "STORAGE_DIR", default_value = "static", value_name = "DIR")]
  pub storage: PathBuf,

  /// 保留的历史帧数量
  #[arg(long, env = "STREAM_HISTORY", default_value_t = 30)]
  pub history: usize,

  /// 允许跨域访问的来源，逗号分隔；为空时允许所有来源
  #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
  pub allowed_origins: Vec<String>,
}

impl From<&ServerArgs> for RelayConfig {
  fn from(args: &ServerArgs) -> Self {
    Self {
      secret: args.secret.clone(),
      history: args.history.max(1),
      ..RelayConfig::default()
    }
  }
}
