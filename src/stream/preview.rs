// 该文件是 Huaying （画影） 项目的一部分。
// src/stream/preview.rs - 树莓派本机 MJPEG 预览
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

//! 没有远端中继时，在本机起一个只读的预览服务。相机帧由独立线程编码后写入本地中继，
//! HTTP 服务运行在专用线程的 tokio 运行时里。

use std::{
  net::SocketAddr,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::{
  config::{RelayConfig, StreamConfig},
  input::CameraSource,
  stream::{
    preview_jpeg,
    relay::StreamRelay,
    server::{AppState, preview_routes},
  },
};

const LOCAL_SOURCE: &str = "local-camera";

#[derive(Error, Debug)]
pub enum PreviewError {
  #[error("预览服务 I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

pub struct LocalPreview {
  addr: SocketAddr,
  relay: StreamRelay,
  running: Arc<AtomicBool>,
  shutdown: Option<oneshot::Sender<()>>,
  feeder: Option<JoinHandle<()>>,
  server: Option<JoinHandle<()>>,
}

impl LocalPreview {
  pub fn start(camera: Arc<dyn CameraSource>, config: &StreamConfig) -> Result<Self, PreviewError> {
    let listener = std::net::TcpListener::bind(config.local_bind)?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let relay_config = RelayConfig::default();
    let relay = StreamRelay::new(&relay_config);
    relay.connect_source(LOCAL_SOURCE);

    let runtime = tokio::runtime::Builder::new_multi_thread()
      .worker_threads(2)
      .enable_all()
      .build()?;
    let state = AppState::new(relay.clone(), "", relay_config.idle_timeout);
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let server = thread::Builder::new()
      .name("stream-preview".to_string())
      .spawn(move || {
        runtime.block_on(async move {
          let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
              error!("预览服务监听失败: {}", e);
              return;
            }
          };
          let app = preview_routes().with_state(state);
          let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
          });
          if let Err(e) = serve.await {
            error!("预览服务异常退出: {}", e);
          }
        });
      })?;

    let running = Arc::new(AtomicBool::new(true));
    let feeder = {
      let relay = relay.clone();
      let running = running.clone();
      let interval = config.frame_interval();
      let quality = config.quality;
      thread::Builder::new()
        .name("stream-feeder".to_string())
        .spawn(move || {
          while running.load(Ordering::SeqCst) {
            if let Some(jpeg) = preview_jpeg(camera.as_ref(), quality) {
              relay.push_frame(jpeg);
            }
            thread::sleep(interval);
          }
        })?
    };

    info!("本机预览: http://{}/stream/live.mjpg", addr);
    Ok(Self {
      addr,
      relay,
      running,
      shutdown: Some(shutdown),
      feeder: Some(feeder),
      server: Some(server),
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.addr
  }

  pub fn relay(&self) -> &StreamRelay {
    &self.relay
  }

  pub fn stop(&mut self) {
    self.running.store(false, Ordering::SeqCst);
    if let Some(feeder) = self.feeder.take() {
      if feeder.join().is_err() {
        warn!("预览帧线程异常退出");
      }
    }
    self.relay.disconnect_source(LOCAL_SOURCE);

    if let Some(shutdown) = self.shutdown.take() {
      let _ = shutdown.send(());
    }
    if let Some(server) = self.server.take() {
      if server.join().is_err() {
        warn!("预览服务线程异常退出");
      }
      info!("本机预览已停止");
    }
  }
}

impl Drop for LocalPreview {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use image::RgbImage;

  use super::*;
  use crate::frame::Frame;

  struct StillCamera(Frame);

  impl CameraSource for StillCamera {
    fn capture(&self) -> Option<Frame> {
      Some(self.0.clone())
    }

    fn latest_frame(&self) -> Option<Frame> {
      Some(self.0.clone())
    }
  }

  #[test]
  fn serves_snapshot_and_status_from_camera() {
    let config = StreamConfig {
      enabled: true,
      push_url: None,
      secret: String::new(),
      fps: 20,
      quality: 70,
      local_bind: "127.0.0.1:0".parse().unwrap(),
      reconnect_delay: Duration::from_secs(5),
    };
    let camera = Arc::new(StillCamera(Frame::new(RgbImage::new(32, 24))));
    let mut preview = LocalPreview::start(camera, &config).unwrap();

    for _ in 0..50 {
      if preview.relay().latest_frame().is_some() {
        break;
      }
      thread::sleep(Duration::from_millis(20));
    }

    let base = format!("http://{}", preview.local_addr());
    let snapshot = reqwest::blocking::get(format!("{}/stream/snapshot.jpg", base)).unwrap();
    assert_eq!(snapshot.status(), reqwest::StatusCode::OK);
    let bytes = snapshot.bytes().unwrap();
    let image = image::load_from_memory(&bytes).unwrap();
    assert_eq!((image.width(), image.height()), (32, 24));

    let status: serde_json::Value = reqwest::blocking::get(format!("{}/stream/status", base))
      .unwrap()
      .json()
      .unwrap();
    assert_eq!(status["source_connected"], true);
    assert_eq!(status["source_id"], LOCAL_SOURCE);

    preview.stop();
    assert!(!preview.relay().is_source_connected());
  }
}
