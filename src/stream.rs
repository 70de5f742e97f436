// 该文件是 Huaying （画影） 项目的一部分。
// src/stream.rs - 实时预览与中继
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

use thiserror::Error;
use tracing::{debug, info};

use crate::{config::StreamConfig, input::CameraSource, output::encode_jpeg};

pub mod relay;
pub use self::relay::{RelayStatus, StreamFrame, StreamRelay, Subscription};

pub mod server;
pub use self::server::{AppState, router};

pub mod storage;
pub use self::storage::{StorageError, UploadStore};

mod pusher;
pub use self::pusher::{PusherError, StreamPusher, push_url_with_secret};

mod preview;
pub use self::preview::{LocalPreview, PreviewError};

/// 取相机最新帧（没有时现拍一帧）并编码为 JPEG
pub(crate) fn preview_jpeg(camera: &dyn CameraSource, quality: u8) -> Option<Vec<u8>> {
  let frame = camera.latest_frame().or_else(|| camera.capture())?;
  match encode_jpeg(frame.image(), quality) {
    Ok(jpeg) => Some(jpeg),
    Err(e) => {
      debug!("预览帧编码失败: {}", e);
      None
    }
  }
}

#[derive(Error, Debug)]
pub enum StreamError {
  #[error("推流错误: {0}")]
  PusherError(#[from] PusherError),
  #[error("本机预览错误: {0}")]
  PreviewError(#[from] PreviewError),
}

/// 树莓派端的预览输出：配置了推流地址时推到远端，否则在本机提供预览
pub enum PreviewStreamer {
  Push(StreamPusher),
  Local(LocalPreview),
}

impl PreviewStreamer {
  /// 未启用时返回 `None`
  pub fn start(
    camera: Arc<dyn CameraSource>,
    config: &StreamConfig,
  ) -> Result<Option<Self>, StreamError> {
    if !config.enabled {
      info!("实时预览未启用");
      return Ok(None);
    }
    let streamer = match config.push_url {
      Some(_) => PreviewStreamer::Push(StreamPusher::start(camera, config)?),
      None => PreviewStreamer::Local(LocalPreview::start(camera, config)?),
    };
    Ok(Some(streamer))
  }

  pub fn stop(&mut self) {
    match self {
      PreviewStreamer::Push(pusher) => pusher.stop(),
      PreviewStreamer::Local(preview) => preview.stop(),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use image::RgbImage;

  use super::*;
  use crate::frame::Frame;

  struct CountingCamera {
    latest: Option<Frame>,
  }

  impl CameraSource for CountingCamera {
    fn capture(&self) -> Option<Frame> {
      Some(Frame::new(RgbImage::new(8, 8)))
    }

    fn latest_frame(&self) -> Option<Frame> {
      self.latest.clone()
    }
  }

  #[test]
  fn preview_prefers_cached_frame() {
    let camera = CountingCamera {
      latest: Some(Frame::new(RgbImage::new(16, 4))),
    };
    let jpeg = preview_jpeg(&camera, 70).unwrap();
    let image = image::load_from_memory(&jpeg).unwrap();
    assert_eq!(image.width(), 16);

    let camera = CountingCamera { latest: None };
    let jpeg = preview_jpeg(&camera, 70).unwrap();
    assert_eq!(image::load_from_memory(&jpeg).unwrap().width(), 8);
  }

  #[test]
  fn disabled_stream_starts_nothing() {
    let config = StreamConfig {
      enabled: false,
      push_url: None,
      secret: String::new(),
      fps: 10,
      quality: 70,
      local_bind: "127.0.0.1:0".parse().unwrap(),
      reconnect_delay: Duration::from_secs(5),
    };
    let camera: Arc<dyn CameraSource> = Arc::new(CountingCamera { latest: None });
    assert!(PreviewStreamer::start(camera, &config).unwrap().is_none());
  }
}
