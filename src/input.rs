// 该文件是 Huaying （画影） 项目的一部分。
// src/input.rs - 相机输入
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

use std::sync::{
  Mutex, PoisonError,
  atomic::{AtomicBool, Ordering},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{FromUrl, frame::Frame};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

/// 逐帧读取的底层相机后端
pub trait FrameGrabber: Send {
  /// 读取一帧；超时或出错时返回 `None`，不会无限期阻塞
  fn grab(&mut self) -> Option<Frame>;

  /// 释放底层设备
  fn release(&mut self) {}
}

/// 拍摄决策引擎和预览推流共享的相机接口
pub trait CameraSource: Send + Sync {
  fn capture(&self) -> Option<Frame>;

  /// 最近一次成功拍摄的帧，不阻塞
  fn latest_frame(&self) -> Option<Frame>;
}

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("URI scheme 不匹配")]
  SchemeMismatch,
}

pub enum InputWrapper {
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInputPipelineBuilder::SCHEME {
        let input = GStreamerInputPipelineBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}

impl FrameGrabber for InputWrapper {
  fn grab(&mut self) -> Option<Frame> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.grab(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.grab(),
    }
  }

  fn release(&mut self) {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.release(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.release(),
    }
  }
}

/// 显式共享的相机句柄
///
/// 由启动流程创建并负责停止；拍摄引擎与预览推流线程通过 `Arc<Camera>` 共享。
/// 底层后端与最近帧缓存分别由各自的锁保护，读取缓存不会等待正在进行的拍摄。
pub struct Camera {
  grabber: Mutex<Box<dyn FrameGrabber>>,
  latest: Mutex<Option<Frame>>,
  running: AtomicBool,
}

impl Camera {
  pub fn new(grabber: impl FrameGrabber + 'static) -> Self {
    Self {
      grabber: Mutex::new(Box::new(grabber)),
      latest: Mutex::new(None),
      running: AtomicBool::new(false),
    }
  }

  /// 根据 URL 打开相机后端，例如 `gst://libcamera?width=1280&height=720`
  pub fn open(url: &url::Url) -> Result<Self, InputError> {
    let input = InputWrapper::from_url(url)?;
    info!("相机已打开: {}", url);
    Ok(Self::new(input))
  }

  pub fn start(&self) {
    if !self.running.swap(true, Ordering::SeqCst) {
      info!("相机开始采集");
    }
  }

  pub fn stop(&self) {
    if self.running.swap(false, Ordering::SeqCst) {
      self
        .grabber
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .release();
      info!("相机已停止");
    }
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }
}

impl CameraSource for Camera {
  fn capture(&self) -> Option<Frame> {
    if !self.is_running() {
      warn!("相机尚未启动");
      return None;
    }

    let frame = self
      .grabber
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .grab();

    match &frame {
      Some(frame) => {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame.clone());
      }
      None => debug!("未读取到相机帧"),
    }
    frame
  }

  fn latest_frame(&self) -> Option<Frame> {
    self
      .latest
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

impl Drop for Camera {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use std::collections::VecDeque;

  use image::RgbImage;

  use super::*;

  struct ScriptedGrabber(VecDeque<Option<Frame>>);

  impl FrameGrabber for ScriptedGrabber {
    fn grab(&mut self) -> Option<Frame> {
      self.0.pop_front().flatten()
    }
  }

  fn frame(width: u32) -> Frame {
    Frame::new(RgbImage::new(width, 4))
  }

  #[test]
  fn capture_requires_start() {
    let camera = Camera::new(ScriptedGrabber(VecDeque::from([Some(frame(2))])));
    assert!(camera.capture().is_none());

    camera.start();
    assert_eq!(camera.capture().map(|f| f.width()), Some(2));
  }

  #[test]
  fn failed_capture_keeps_previous_latest_frame() {
    let camera = Camera::new(ScriptedGrabber(VecDeque::from([
      Some(frame(2)),
      None,
      Some(frame(6)),
    ])));
    camera.start();
    assert!(camera.latest_frame().is_none());

    camera.capture();
    assert!(camera.capture().is_none());
    assert_eq!(camera.latest_frame().map(|f| f.width()), Some(2));

    camera.capture();
    assert_eq!(camera.latest_frame().map(|f| f.width()), Some(6));
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = url::Url::parse("rtsp://camera.local/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch)
    ));
  }
}
