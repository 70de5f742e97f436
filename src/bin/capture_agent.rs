// 该文件是 Huaying （画影） 项目的一部分。
// src/bin/capture_agent.rs - 树莓派拍摄程序
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

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use huaying::{
  FromUrl,
  config::{
    CaptureArgs, CaptureConfig, LedArgs, LedConfig, PirArgs, PirConfig, StreamArgs, StreamConfig,
  },
  feedback::FeedbackWrapper,
  input::{Camera, CameraSource},
  model::{DetectorWrapper, PersonDetector},
  output::OutputWrapper,
  sensor::MotionMailbox,
  stream::PreviewStreamer,
  task::{CaptureEngine, ContinuousTask},
};

/// 人体触发的自动拍摄程序
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 相机来源，例如 gst://libcamera 或 image:///tmp/test.jpg
  #[arg(long, env = "CAMERA_URL", default_value = "gst://libcamera", value_name = "SOURCE")]
  pub camera: Url,

  /// 首选检测器，例如 pose:///opt/huaying/movenet.onnx
  #[arg(long, env = "DETECTOR_URL", value_name = "MODEL")]
  pub detector: Option<Url>,

  /// 首选检测器不可用时使用的 HOG 检测器
  #[arg(
    long,
    env = "HOG_DETECTOR_URL",
    default_value = "hog:///opt/huaying/hog_people.json",
    value_name = "MODEL"
  )]
  pub fallback_detector: Url,

  /// 上传目标，例如 http://server:8000/upload 或 folder:///var/lib/huaying
  #[arg(
    long,
    env = "UPLOAD_URL",
    default_value = "http://localhost:8000/upload",
    value_name = "TARGET"
  )]
  pub upload: Url,

  /// 轮询次数上限，不指定时一直运行
  #[arg(long, value_name = "TICKS")]
  pub ticks: Option<usize>,

  #[command(flatten)]
  pub capture: CaptureArgs,

  #[command(flatten)]
  pub pir: PirArgs,

  #[command(flatten)]
  pub led: LedArgs,

  #[command(flatten)]
  pub stream: StreamArgs,
}

#[cfg(feature = "gpio")]
type MotionSensor = huaying::sensor::PirSensor;
#[cfg(not(feature = "gpio"))]
type MotionSensor = ();

#[cfg(feature = "gpio")]
fn open_motion_sensor(config: &PirConfig) -> Option<MotionSensor> {
  if !config.enabled {
    return None;
  }
  huaying::sensor::PirSensor::open(config, None)
    .inspect_err(|e| warn!("PIR 传感器初始化失败, 不使用 PIR: {}", e))
    .ok()
}

#[cfg(not(feature = "gpio"))]
fn open_motion_sensor(config: &PirConfig) -> Option<MotionSensor> {
  if config.enabled {
    warn!("当前构建未启用 GPIO 支持, 不使用 PIR");
  }
  None
}

#[cfg(feature = "gpio")]
fn motion_mailbox(sensor: &Option<MotionSensor>) -> Option<MotionMailbox> {
  sensor.as_ref().map(|sensor| sensor.mailbox())
}

#[cfg(not(feature = "gpio"))]
fn motion_mailbox(_sensor: &Option<MotionSensor>) -> Option<MotionMailbox> {
  None
}

fn main() -> Result<()> {
  huaying::init_tracing();

  let args = Args::parse();
  let capture = CaptureConfig::from(&args.capture);
  let pir = PirConfig::from(&args.pir);
  let led = LedConfig::from(&args.led);
  let stream = StreamConfig::from(&args.stream);

  info!("相机来源: {}", args.camera);
  info!("上传目标: {}", args.upload);
  info!(
    "拍摄配置: 间隔 {:?}, 冷却 {:?}, 倒计时 {} 秒, 检测 {}, PIR {}",
    capture.capture_interval,
    capture.cooldown,
    capture.countdown_seconds,
    capture.detection_enabled,
    pir.enabled
  );

  let uploader = OutputWrapper::from_url(&args.upload).context("无法创建上传目标")?;
  if uploader.check_health() {
    info!("上传目标可用");
  } else {
    warn!("上传目标暂不可用, 拍摄后仍会尝试上传");
  }

  let camera = Arc::new(Camera::open(&args.camera).context("无法打开相机")?);
  camera.start();

  let mut engine: CaptureEngine<Camera, DetectorWrapper, OutputWrapper> =
    CaptureEngine::new(camera.clone(), uploader, capture.clone())
      .with_feedback(FeedbackWrapper::from_config(&led));

  if capture.detection_enabled {
    let detector = DetectorWrapper::select(args.detector.as_ref(), &args.fallback_detector)
      .context("没有可用的人体检测器")?;
    engine = engine.with_detector(PersonDetector::new(detector, capture.min_confidence));
  } else {
    info!("人体检测已关闭, 按冷却时间拍摄整帧");
  }

  let sensor = open_motion_sensor(&pir);
  if let Some(mailbox) = motion_mailbox(&sensor) {
    engine = engine.with_motion(mailbox);
  }

  let preview_camera: Arc<dyn CameraSource> = camera.clone();
  let mut streamer = PreviewStreamer::start(preview_camera, &stream).context("无法启动实时预览")?;

  let result = ContinuousTask::default()
    .with_tick_limit(args.ticks)
    .run(&mut engine);

  if let Some(streamer) = streamer.as_mut() {
    streamer.stop();
  }
  #[cfg(feature = "gpio")]
  drop(sensor);
  camera.stop();
  info!("程序退出");

  result
}
