// 该文件是 Huaying （画影） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 相机输入
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

//! # GStreamer 相机输入
//!
//! 支持的 URL：
//!
//! - `gst://libcamera?width=1280&height=720&fps=15` 树莓派 CSI 相机（libcamerasrc）
//! - `gst://camera/dev/video0?width=1280&height=720&fps=15&format=YUY2` V4L2 摄像头
//! - `gst://file/path/to/video.mp4` 视频文件，开发调试用
//!
//! 所有来源都可以附加 `rotate=90|180|270`。管道末端统一转换为 RGB，
//! appsink 只保留最新的两帧，旧帧直接丢弃。
//!
//! ## 系统依赖
//!
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev gstreamer1.0-libcamera
//! ```

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{ChannelOrder, Frame, FrameError},
  input::FrameGrabber,
};

const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_FPS: u32 = 15;
/// 单次拉取的最长等待时间
const PULL_TIMEOUT_SECONDS: u64 = 2;

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI scheme 不匹配")]
  SchemeMismatch,
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 操作失败: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("未找到 appsink 元素")]
  AppSinkNotFound,
  #[error("无法转换为 appsink")]
  AppSinkConversionFailed,
  #[error("无法从 caps 获取视频信息")]
  VideoInfoError,
  #[error("不支持的视频格式: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("帧数据错误: {0}")]
  FrameError(#[from] FrameError),
  #[error("状态切换失败: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GStreamerInputBuilderItem {
  FileSource(String),
  LibcameraSource {
    width: u32,
    height: u32,
    fps: u32,
  },
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    format: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  TargetFormat {
    format: String,
  },
  VideoFlip {
    method: u32,
  },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location={} ! decodebin", path)
      }
      GStreamerInputBuilderItem::LibcameraSource { width, height, fps } => format!(
        "libcamerasrc ! video/x-raw,width={},height={},framerate={}/1",
        width, height, fps
      ),
      GStreamerInputBuilderItem::CameraSource {
        camera,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode_str = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! video/x-raw,format={},width={},height={},framerate={}/1",
          camera, io_mode_str, format, width, height, fps
        )
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerInputBuilderItem::VideoFlip { method } => {
        format!("videoflip method={}", method)
      }
    }
  }
}

/// GStreamer 相机管道构建器
#[derive(Debug, Clone, Default)]
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
}

impl GStreamerInputPipelineBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn libcamera(mut self, width: u32, height: u32, fps: u32) -> Self {
    self
      .items
      .push(GStreamerInputBuilderItem::LibcameraSource { width, height, fps });
    self
  }

  pub fn camera(mut self, device: &str, width: u32, height: u32, fps: u32) -> Self {
    self.items.push(GStreamerInputBuilderItem::CameraSource {
      camera: device.to_string(),
      io_mode: None,
      format: "YUY2".to_string(),
      width,
      height,
      fps,
    });
    self
  }

  pub fn rotate(mut self, degrees: &str) -> Self {
    if let Some(flip) = Self::video_flip(degrees) {
      self.items.push(flip);
    }
    self
  }

  pub fn target_format(mut self, format: &str) -> Self {
    self.items.push(GStreamerInputBuilderItem::TargetFormat {
      format: format.to_string(),
    });
    self
  }

  fn video_flip(rotate: &str) -> Option<GStreamerInputBuilderItem> {
    let method = match rotate {
      "90" => 1,
      "180" => 2,
      "270" => 3,
      _ => return None,
    };
    Some(GStreamerInputBuilderItem::VideoFlip { method })
  }

  fn size(query: &HashMap<String, String>) -> (u32, u32, u32) {
    let get = |key: &str, default: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
    };
    (
      get("width", DEFAULT_WIDTH),
      get("height", DEFAULT_HEIGHT),
      get("fps", DEFAULT_FPS),
    )
  }

  /// 管道描述字符串，不含 appsink
  pub fn description(&self) -> String {
    self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ")
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = format!(
      "{} ! appsink max-buffers=2 drop=true sync=false name=sink",
      self.description()
    );

    info!("GStreamer 管道: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerInput {
      pipeline: Some(pipeline),
      appsink,
    })
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let (width, height, fps) = Self::size(&query);

    let mut builder = match url.host_str() {
      Some("libcamera") => Self::new().libcamera(width, height, fps),
      Some("camera") => {
        let mut builder = Self::new().camera(url.path(), width, height, fps);
        if let Some(GStreamerInputBuilderItem::CameraSource {
          io_mode, format, ..
        }) = builder.items.last_mut()
        {
          *io_mode = query.get("io-mode").and_then(|v| v.parse::<u32>().ok());
          if let Some(f) = query.get("format") {
            *format = f.clone();
          }
        }
        builder
      }
      Some("file") => Self {
        items: vec![GStreamerInputBuilderItem::FileSource(url.path().to_string())],
      },
      other => {
        error!("未知的 GStreamer 来源: {:?}", other);
        return Err(GStreamerInputError::SchemeMismatch);
      }
    };

    if let Some(rotate) = query.get("rotate") {
      builder = builder.rotate(rotate);
    }

    Ok(builder.target_format("RGB"))
  }
}

/// 运行中的 GStreamer 相机管道
pub struct GStreamerInput {
  pipeline: Option<gst::Pipeline>,
  appsink: gst_app::AppSink,
}

impl GStreamerInput {
  fn pull_sample(&self) -> Option<gst::Sample> {
    self.pipeline.as_ref()?;
    let sample = self
      .appsink
      .try_pull_sample(gst::ClockTime::from_seconds(PULL_TIMEOUT_SECONDS));
    if sample.is_none() {
      warn!("{} 秒内未收到相机帧", PULL_TIMEOUT_SECONDS);
    }
    sample
  }
}

impl FrameGrabber for GStreamerInput {
  fn grab(&mut self) -> Option<Frame> {
    let sample = self.pull_sample()?;
    convert_sample(sample)
      .map_err(|e| {
        error!("转换相机帧失败: {}", e);
        e
      })
      .ok()
  }

  fn release(&mut self) {
    if let Some(pipeline) = self.pipeline.take()
      && let Err(e) = pipeline.set_state(gst::State::Null)
    {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    self.release();
  }
}

fn convert_sample(sample: gst::Sample) -> Result<Frame, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("sample 中没有 buffer".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("sample 中没有 caps".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let order = match video_info.format() {
    gst_video::VideoFormat::Rgb => ChannelOrder::Rgb,
    gst_video::VideoFormat::Bgr => ChannelOrder::Bgr,
    other => return Err(GStreamerInputError::UnsupportedFormat(other)),
  };

  let map = buffer
    .map_readable()
    .map_err(|e| GStreamerInputError::PipelineError(format!("无法映射 buffer: {}", e)))?;
  let width = video_info.width();
  let height = video_info.height();
  let stride = video_info.stride()[0] as usize;
  let row = width as usize * 3;
  let data = map.as_slice();

  if stride == row {
    return Ok(Frame::from_raw(width, height, data, order)?);
  }

  // 行尾带对齐填充时逐行拷贝
  let mut packed = Vec::with_capacity(row * height as usize);
  for line in data.chunks(stride).take(height as usize) {
    packed.extend_from_slice(&line[..row.min(line.len())]);
  }
  Ok(Frame::from_raw(width, height, &packed, order)?)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn libcamera_url_builds_rgb_pipeline() {
    let url = Url::parse("gst://libcamera?width=640&height=480&fps=10&rotate=180").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    assert_eq!(
      builder.description(),
      "libcamerasrc ! video/x-raw,width=640,height=480,framerate=10/1 ! \
       videoflip method=2 ! videoconvert ! video/x-raw,format=RGB"
    );
  }

  #[test]
  fn v4l2_url_uses_device_path_and_defaults() {
    let url = Url::parse("gst://camera/dev/video0?format=NV12").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    assert_eq!(
      builder.description(),
      "v4l2src device=/dev/video0 ! video/x-raw,format=NV12,width=1280,height=720,framerate=15/1 ! \
       videoconvert ! video/x-raw,format=RGB"
    );
  }

  #[test]
  fn unknown_source_is_rejected() {
    let url = Url::parse("gst://rtsp/stream").unwrap();
    assert!(matches!(
      GStreamerInputPipelineBuilder::from_url(&url),
      Err(GStreamerInputError::SchemeMismatch)
    ));
  }
}
