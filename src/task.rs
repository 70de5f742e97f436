// 该文件是 Huaying （画影） 项目的一部分。
// src/task.rs - 拍摄决策引擎与主循环
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

//! 每次轮询按 `PIR 门控 → 预览帧 → 检测 → 冷却 → 倒计时 → 最终帧 → 区域 → 编码 → 上传`
//! 的顺序推进，任一步失败都只结束本次轮询。

use std::{
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{
    Arc,
    mpsc::{self, Receiver, RecvTimeoutError},
  },
  thread,
  time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{debug, error, info, warn};

use crate::{
  clock::{Clock, SystemClock},
  config::CaptureConfig,
  feedback::{Feedback, MockFeedback, run_countdown},
  input::CameraSource,
  model::{Model, PersonDetector},
  output::{Uploader, encode_jpeg, generate_filename},
  region::select_region,
  sensor::MotionMailbox,
};

fn cooling_down(last_capture: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
  last_capture
    .map(|last| now.saturating_duration_since(last) < cooldown)
    .unwrap_or(false)
}

/// 单次轮询的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
  /// 要求 PIR 触发但没有触发
  PirGateClosed,
  NoFrame,
  NoPerson,
  CoolingDown,
  FinalFrameMissing,
  EncodeFailed,
  UploadFailed(String),
  Uploaded {
    image_id: Option<String>,
    filename: String,
  },
}

impl TickOutcome {
  pub fn is_uploaded(&self) -> bool {
    matches!(self, TickOutcome::Uploaded { .. })
  }
}

/// 拍摄决策引擎
///
/// 持有相机句柄、可选的检测器、上传目标和指示灯；`last_capture` 只在上传成功后前进。
pub struct CaptureEngine<C, M, U> {
  camera: Arc<C>,
  detector: Option<PersonDetector<M>>,
  uploader: U,
  feedback: Box<dyn Feedback>,
  clock: Arc<dyn Clock>,
  motion: Option<MotionMailbox>,
  config: CaptureConfig,
  last_capture: Option<Instant>,
}

impl<C, M, U> CaptureEngine<C, M, U>
where
  C: CameraSource,
  M: Model,
  U: Uploader,
{
  pub fn new(camera: Arc<C>, uploader: U, config: CaptureConfig) -> Self {
    Self {
      camera,
      detector: None,
      uploader,
      feedback: Box::new(MockFeedback::default()),
      clock: Arc::new(SystemClock),
      motion: None,
      config,
      last_capture: None,
    }
  }

  pub fn with_detector(mut self, detector: PersonDetector<M>) -> Self {
    self.detector = Some(detector);
    self
  }

  pub fn with_feedback(mut self, feedback: impl Feedback + 'static) -> Self {
    self.feedback = Box::new(feedback);
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// PIR 启用时传入其邮箱
  pub fn with_motion(mut self, mailbox: MotionMailbox) -> Self {
    self.motion = Some(mailbox);
    self
  }

  pub fn config(&self) -> &CaptureConfig {
    &self.config
  }

  pub fn last_capture(&self) -> Option<Instant> {
    self.last_capture
  }

  /// 执行一次轮询
  pub fn tick(&mut self) -> TickOutcome {
    let pir_triggered = self.motion.as_ref().map(MotionMailbox::take).unwrap_or(false);
    if pir_triggered {
      info!("PIR 传感器: 检测到运动");
    }
    if self.motion.is_some() && self.config.pir_required && !pir_triggered {
      return TickOutcome::PirGateClosed;
    }

    let Some(frame) = self.camera.capture() else {
      return TickOutcome::NoFrame;
    };

    let detection_active = self.config.detection_enabled && self.detector.is_some();
    let region = match self.detector.as_mut().filter(|_| detection_active) {
      Some(detector) => {
        let detections = detector.detect(&frame);
        let Some(best) = detections.first().copied() else {
          if pir_triggered {
            info!("PIR 已触发, 但 {} 未检测到人", detector.name());
          }
          return TickOutcome::NoPerson;
        };

        if cooling_down(self.last_capture, self.config.cooldown, self.clock.now()) {
          debug!("冷却中");
          return TickOutcome::CoolingDown;
        }

        info!(
          "检测到人 [{}{}] (置信度: {:.2})",
          if pir_triggered { "PIR+" } else { "" },
          detector.name(),
          best.confidence
        );

        if self.config.countdown_seconds > 0 {
          run_countdown(
            self.config.countdown_seconds,
            self.feedback.as_mut(),
            self.clock.as_ref(),
          );
        } else {
          self.feedback.flash();
        }

        let Some(final_frame) = self.camera.capture() else {
          warn!("最终帧拍摄失败");
          return TickOutcome::FinalFrameMissing;
        };
        select_region(&final_frame, Some(&best), &self.config)
      }
      None => {
        if cooling_down(self.last_capture, self.config.cooldown, self.clock.now()) {
          debug!("冷却中");
          return TickOutcome::CoolingDown;
        }
        frame.image().clone()
      }
    };

    let bytes = match encode_jpeg(&region, self.config.jpeg_quality) {
      Ok(bytes) => bytes,
      Err(e) => {
        error!("图像编码失败: {}", e);
        return TickOutcome::EncodeFailed;
      }
    };

    let filename = generate_filename();
    info!("上传中: {}", filename);
    let response = self.uploader.upload(&bytes, &filename);
    if !response.success {
      let reason = response.error.unwrap_or_default();
      warn!("上传失败: {}", reason);
      return TickOutcome::UploadFailed(reason);
    }

    let now = self.clock.now();
    self.last_capture = Some(self.last_capture.map_or(now, |last| last.max(now)));
    info!("上传成功! ID: {:?}", response.image_id);
    TickOutcome::Uploaded {
      image_id: response.image_id,
      filename,
    }
  }

  /// 意外错误后的短暂停顿
  fn back_off(&self) {
    self.clock.sleep(self.config.error_backoff);
  }

  pub fn shutdown(&mut self) {
    self.feedback.off();
  }
}

/// 固定周期轮询的主循环
#[derive(Default, Debug)]
pub struct ContinuousTask {
  tick_limit: Option<usize>,
}

impl ContinuousTask {
  pub fn with_tick_limit(mut self, tick_limit: Option<usize>) -> Self {
    self.tick_limit = tick_limit;
    self
  }

  /// 注册 Ctrl-C 处理并运行，直到收到中断信号
  pub fn run<C, M, U>(self, engine: &mut CaptureEngine<C, M, U>) -> anyhow::Result<()>
  where
    C: CameraSource,
    M: Model,
    U: Uploader,
  {
    let (tx, rx) = mpsc::channel();

    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
    .context("设置 Ctrl-C 处理器失败")?;

    self.run_until(engine, &rx);
    Ok(())
  }

  /// 运行主循环，`stop` 收到消息或发送端全部关闭时退出
  pub fn run_until<C, M, U>(self, engine: &mut CaptureEngine<C, M, U>, stop: &Receiver<()>)
  where
    C: CameraSource,
    M: Model,
    U: Uploader,
  {
    info!(
      "拍摄循环开始: 间隔 {:?}, 冷却 {:?}, 检测 {}",
      engine.config().capture_interval,
      engine.config().cooldown,
      engine.config().detection_enabled
    );

    let mut ticks = 0usize;
    loop {
      ticks += 1;
      match catch_unwind(AssertUnwindSafe(|| engine.tick())) {
        Ok(outcome) => debug!("第 {} 次轮询: {:?}", ticks, outcome),
        Err(_) => {
          error!("第 {} 次轮询发生意外错误", ticks);
          engine.back_off();
        }
      }

      if self.tick_limit.map(|n| ticks >= n).unwrap_or(false) {
        info!("达到指定轮询次数 {}, 退出", ticks);
        break;
      }

      match stop.recv_timeout(engine.config().capture_interval) {
        Err(RecvTimeoutError::Timeout) => continue,
        _ => {
          warn!("中断信号接收，退出拍摄循环");
          break;
        }
      }
    }

    engine.shutdown();
    info!("拍摄循环结束");
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::VecDeque,
    sync::{
      Mutex,
      atomic::{AtomicBool, AtomicUsize, Ordering},
    },
  };

  use image::RgbImage;

  use super::*;
  use crate::{clock::ManualClock, frame::Frame, model::BoundingBox, output::UploadResponse};

  struct FakeCamera {
    script: Mutex<VecDeque<Option<Frame>>>,
    fallback: Option<Frame>,
    captures: AtomicUsize,
    panic_once: AtomicBool,
  }

  impl FakeCamera {
    fn always(width: u32, height: u32) -> Self {
      Self::scripted(vec![], Some(Frame::new(RgbImage::new(width, height))))
    }

    fn scripted(script: Vec<Option<Frame>>, fallback: Option<Frame>) -> Self {
      Self {
        script: Mutex::new(script.into()),
        fallback,
        captures: AtomicUsize::new(0),
        panic_once: AtomicBool::new(false),
      }
    }

    fn captures(&self) -> usize {
      self.captures.load(Ordering::SeqCst)
    }
  }

  impl CameraSource for FakeCamera {
    fn capture(&self) -> Option<Frame> {
      if self.panic_once.swap(false, Ordering::SeqCst) {
        panic!("camera driver crashed");
      }
      self.captures.fetch_add(1, Ordering::SeqCst);
      let next = self.script.lock().unwrap().pop_front();
      next.unwrap_or_else(|| self.fallback.clone())
    }

    fn latest_frame(&self) -> Option<Frame> {
      self.fallback.clone()
    }
  }

  struct FakeModel(Vec<BoundingBox>);

  impl Model for FakeModel {
    type Error = String;

    fn name(&self) -> &'static str {
      "fake"
    }

    fn infer(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, String> {
      Ok(self.0.clone())
    }
  }

  #[derive(Clone, Default)]
  struct FakeUploader {
    failing: Arc<AtomicBool>,
    uploads: Arc<Mutex<Vec<Vec<u8>>>>,
  }

  impl Uploader for FakeUploader {
    fn upload(&self, bytes: &[u8], _filename: &str) -> UploadResponse {
      if self.failing.load(Ordering::SeqCst) {
        return UploadResponse::failure("server returned 500");
      }
      let mut uploads = self.uploads.lock().unwrap();
      uploads.push(bytes.to_vec());
      UploadResponse::ok(format!("img-{}", uploads.len()), "ok")
    }
  }

  impl FakeUploader {
    fn count(&self) -> usize {
      self.uploads.lock().unwrap().len()
    }
  }

  fn person(confidence: f32) -> BoundingBox {
    BoundingBox {
      x: 40,
      y: 20,
      width: 60,
      height: 100,
      confidence,
    }
  }

  fn full_frame_config() -> CaptureConfig {
    CaptureConfig {
      detection_enabled: false,
      use_full_frame: true,
      cooldown: Duration::from_secs(5),
      capture_interval: Duration::from_secs(2),
      ..CaptureConfig::default()
    }
  }

  type Engine = CaptureEngine<FakeCamera, FakeModel, FakeUploader>;

  fn engine(
    camera: FakeCamera,
    config: CaptureConfig,
    boxes: Option<Vec<BoundingBox>>,
  ) -> (Engine, Arc<FakeCamera>, FakeUploader, Arc<ManualClock>) {
    let camera = Arc::new(camera);
    let uploader = FakeUploader::default();
    let clock = Arc::new(ManualClock::default());
    let mut engine = CaptureEngine::new(camera.clone(), uploader.clone(), config)
      .with_clock(clock.clone());
    if let Some(boxes) = boxes {
      engine = engine.with_detector(PersonDetector::new(FakeModel(boxes), 0.5));
    }
    (engine, camera, uploader, clock)
  }

  #[test]
  fn pir_required_without_edge_never_touches_camera() {
    let config = CaptureConfig {
      pir_required: true,
      ..CaptureConfig::default()
    };
    let (engine, camera, uploader, _) = engine(FakeCamera::always(160, 120), config, Some(vec![person(0.9)]));
    let mut engine = engine.with_motion(MotionMailbox::new(Duration::from_secs(2)));

    assert_eq!(engine.tick(), TickOutcome::PirGateClosed);
    assert_eq!(camera.captures(), 0);
    assert_eq!(uploader.count(), 0);
    assert!(engine.last_capture().is_none());
  }

  #[test]
  fn pir_edge_without_person_is_consumed() {
    let config = CaptureConfig {
      pir_required: true,
      ..CaptureConfig::default()
    };
    let mailbox = MotionMailbox::new(Duration::from_secs(2));
    let (engine, _, uploader, _) = engine(FakeCamera::always(160, 120), config, Some(vec![]));
    let mut engine = engine.with_motion(mailbox.clone());

    assert!(mailbox.post(Instant::now()));
    assert_eq!(engine.tick(), TickOutcome::NoPerson);
    assert!(!mailbox.is_pending());
    assert_eq!(uploader.count(), 0);
    assert!(engine.last_capture().is_none());
  }

  #[test]
  fn missing_preview_frame_aborts_silently() {
    let (mut engine, _, uploader, _) = engine(
      FakeCamera::scripted(vec![], None),
      CaptureConfig::default(),
      Some(vec![person(0.9)]),
    );
    assert_eq!(engine.tick(), TickOutcome::NoFrame);
    assert_eq!(uploader.count(), 0);
  }

  #[test]
  fn full_frame_mode_respects_cooldown() {
    let (mut engine, _, uploader, clock) = engine(FakeCamera::always(160, 120), full_frame_config(), None);
    let interval = Duration::from_secs(2);

    assert!(engine.tick().is_uploaded());
    let first = engine.last_capture().unwrap();

    clock.advance(interval);
    assert_eq!(engine.tick(), TickOutcome::CoolingDown);
    clock.advance(interval);
    assert_eq!(engine.tick(), TickOutcome::CoolingDown);
    assert_eq!(engine.last_capture(), Some(first));

    clock.advance(interval);
    assert!(engine.tick().is_uploaded());
    let second = engine.last_capture().unwrap();
    assert!(second > first);
    assert!(second - first >= Duration::from_secs(5));
    assert_eq!(uploader.count(), 2);
  }

  #[test]
  fn failed_upload_does_not_start_cooldown() {
    let (mut engine, _, uploader, clock) = engine(FakeCamera::always(160, 120), full_frame_config(), None);
    uploader.failing.store(true, Ordering::SeqCst);

    assert_eq!(
      engine.tick(),
      TickOutcome::UploadFailed("server returned 500".to_string())
    );
    assert!(engine.last_capture().is_none());

    uploader.failing.store(false, Ordering::SeqCst);
    clock.advance(Duration::from_secs(2));
    assert!(engine.tick().is_uploaded());
  }

  #[test]
  fn detection_runs_countdown_and_uploads_padded_crop() {
    let (mut engine, camera, uploader, clock) = engine(
      FakeCamera::always(160, 120),
      CaptureConfig::default(),
      Some(vec![person(0.3), person(0.9)]),
    );

    let outcome = engine.tick();
    assert!(outcome.is_uploaded(), "{outcome:?}");
    assert_eq!(camera.captures(), 2);
    assert_eq!(clock.elapsed(), Duration::from_secs(3));

    let uploads = uploader.uploads.lock().unwrap();
    let image = image::load_from_memory(&uploads[0]).unwrap();
    // 60x100 占比 0.31，不放大，四周各加 10 像素
    assert_eq!((image.width(), image.height()), (80, 120));
  }

  #[test]
  fn cooldown_is_checked_after_detection() {
    let (mut engine, camera, _, clock) = engine(
      FakeCamera::always(160, 120),
      CaptureConfig {
        countdown_seconds: 0,
        ..CaptureConfig::default()
      },
      Some(vec![person(0.9)]),
    );
    assert!(engine.tick().is_uploaded());
    clock.advance(Duration::from_secs(1));
    assert_eq!(engine.tick(), TickOutcome::CoolingDown);
    // 第一次轮询拍摄两帧，第二次只拍预览帧
    assert_eq!(camera.captures(), 3);
  }

  #[test]
  fn final_frame_failure_uploads_nothing() {
    let camera = FakeCamera::scripted(
      vec![Some(Frame::new(RgbImage::new(160, 120))), None],
      None,
    );
    let (mut engine, _, uploader, _) = engine(camera, CaptureConfig::default(), Some(vec![person(0.9)]));

    assert_eq!(engine.tick(), TickOutcome::FinalFrameMissing);
    assert_eq!(uploader.count(), 0);
    assert!(engine.last_capture().is_none());
  }

  #[test]
  fn loop_survives_a_panicking_tick() {
    let camera = FakeCamera::always(32, 24);
    camera.panic_once.store(true, Ordering::SeqCst);
    let config = CaptureConfig {
      capture_interval: Duration::ZERO,
      cooldown: Duration::ZERO,
      ..full_frame_config()
    };
    let (mut engine, _, uploader, clock) = engine(camera, config, None);

    let (_tx, rx) = mpsc::channel();
    ContinuousTask::default()
      .with_tick_limit(Some(3))
      .run_until(&mut engine, &rx);

    assert_eq!(clock.elapsed(), Duration::from_secs(1));
    assert_eq!(uploader.count(), 2);
  }

  #[test]
  fn loop_stops_on_signal() {
    let config = CaptureConfig {
      capture_interval: Duration::from_secs(60),
      ..full_frame_config()
    };
    let (mut engine, _, uploader, _) = engine(FakeCamera::always(32, 24), config, None);

    let (tx, rx) = mpsc::channel();
    tx.send(()).unwrap();
    ContinuousTask::default().run_until(&mut engine, &rx);
    assert_eq!(uploader.count(), 1);
  }
}
