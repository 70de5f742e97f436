// 该文件是 Huaying （画影） 项目的一部分。
// src/stream/pusher.rs - 树莓派端 WebSocket 推流
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
  io,
  net::TcpStream,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{info, warn};
use tungstenite::{HandshakeError, Message, WebSocket, stream::MaybeTlsStream};
use url::Url;

use crate::{config::StreamConfig, input::CameraSource, stream::preview_jpeg};

const STOP_POLL: Duration = Duration::from_millis(100);
/// TCP 连接与握手的超时，也用作写超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// 没有帧可发时隔这么久发一次 ping，避免中继按空闲断开
const KEEPALIVE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum PusherError {
  #[error("未配置推流地址")]
  MissingUrl,
  #[error("推流地址必须是 ws:// 或 wss://: {0}")]
  UnsupportedScheme(String),
  #[error("启动推流线程失败: {0}")]
  Spawn(#[from] std::io::Error),
}

/// 在推流地址上附加 `secret` 查询参数
pub fn push_url_with_secret(url: &Url, secret: &str) -> Url {
  let mut url = url.clone();
  url.query_pairs_mut().append_pair("secret", secret);
  url
}

/// 带超时地建立到中继的 WebSocket 连接，`ws://` 与 `wss://` 都走这里
fn open_socket(
  url: &Url,
  timeout: Duration,
) -> Result<WebSocket<MaybeTlsStream<TcpStream>>, tungstenite::Error> {
  let mut last_error = None;
  let mut stream = None;
  for addr in url.socket_addrs(|| None)? {
    match TcpStream::connect_timeout(&addr, timeout) {
      Ok(connected) => {
        stream = Some(connected);
        break;
      }
      Err(e) => last_error = Some(e),
    }
  }
  let stream = match stream {
    Some(stream) => stream,
    None => {
      return Err(
        last_error
          .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "中继地址无法解析"))
          .into(),
      );
    }
  };
  stream.set_read_timeout(Some(timeout))?;
  stream.set_write_timeout(Some(timeout))?;
  stream.set_nodelay(true)?;

  match tungstenite::client_tls(url.as_str(), stream) {
    Ok((socket, _)) => Ok(socket),
    Err(HandshakeError::Failure(e)) => Err(e),
    Err(HandshakeError::Interrupted(_)) => {
      Err(io::Error::new(io::ErrorKind::TimedOut, "握手超时").into())
    }
  }
}

/// 后台线程把相机最新帧以 JPEG 推送到中继，断线后等待一段时间重连
pub struct StreamPusher {
  running: Arc<AtomicBool>,
  connected: Arc<AtomicBool>,
  handle: Option<JoinHandle<()>>,
}

struct PushLoop {
  camera: Arc<dyn CameraSource>,
  url: Url,
  interval: Duration,
  quality: u8,
  reconnect_delay: Duration,
  running: Arc<AtomicBool>,
  connected: Arc<AtomicBool>,
}

impl StreamPusher {
  pub fn start(camera: Arc<dyn CameraSource>, config: &StreamConfig) -> Result<Self, PusherError> {
    let url = config.push_url.as_ref().ok_or(PusherError::MissingUrl)?;
    if !matches!(url.scheme(), "ws" | "wss") {
      return Err(PusherError::UnsupportedScheme(url.scheme().to_string()));
    }

    let running = Arc::new(AtomicBool::new(true));
    let connected = Arc::new(AtomicBool::new(false));
    let worker = PushLoop {
      camera,
      url: push_url_with_secret(url, &config.secret),
      interval: config.frame_interval(),
      quality: config.quality,
      reconnect_delay: config.reconnect_delay,
      running: running.clone(),
      connected: connected.clone(),
    };

    let handle = thread::Builder::new()
      .name("stream-pusher".to_string())
      .spawn(move || worker.run())?;
    info!("推流开始: {}", url);

    Ok(Self {
      running,
      connected,
      handle: Some(handle),
    })
  }

  pub fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  pub fn stop(&mut self) {
    self.running.store(false, Ordering::SeqCst);
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        warn!("推流线程异常退出");
      }
      info!("推流已停止");
    }
  }
}

impl Drop for StreamPusher {
  fn drop(&mut self) {
    self.stop();
  }
}

impl PushLoop {
  fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  /// 可被停止信号打断的等待
  fn pause(&self, duration: Duration) {
    let deadline = Instant::now() + duration;
    while self.is_running() {
      let now = Instant::now();
      if now >= deadline {
        break;
      }
      thread::sleep((deadline - now).min(STOP_POLL));
    }
  }

  fn run(self) {
    while self.is_running() {
      if let Err(e) = self.connect_and_push() {
        warn!("推流连接中断: {}", e);
      }
      self.connected.store(false, Ordering::SeqCst);

      if self.is_running() {
        info!("{:?} 后重连", self.reconnect_delay);
        self.pause(self.reconnect_delay);
      }
    }
  }

  fn connect_and_push(&self) -> Result<(), tungstenite::Error> {
    let mut socket = open_socket(&self.url, CONNECT_TIMEOUT)?;
    self.connected.store(true, Ordering::SeqCst);
    info!("已连接到中继");

    let mut last_sent = Instant::now();
    while self.is_running() {
      if let Some(jpeg) = preview_jpeg(self.camera.as_ref(), self.quality) {
        socket.send(Message::binary(jpeg))?;
        last_sent = Instant::now();
      } else if last_sent.elapsed() >= KEEPALIVE {
        socket.send(Message::Ping(Default::default()))?;
        last_sent = Instant::now();
      }
      self.pause(self.interval);
    }

    socket.close(None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::Frame;

  struct NoCamera;

  impl CameraSource for NoCamera {
    fn capture(&self) -> Option<Frame> {
      None
    }

    fn latest_frame(&self) -> Option<Frame> {
      None
    }
  }

  fn config(url: &str) -> StreamConfig {
    StreamConfig {
      enabled: true,
      push_url: Some(Url::parse(url).unwrap()),
      secret: "s3 cret".to_string(),
      fps: 10,
      quality: 70,
      local_bind: "127.0.0.1:0".parse().unwrap(),
      reconnect_delay: Duration::from_millis(50),
    }
  }

  #[test]
  fn secret_is_appended_as_query() {
    let url = Url::parse("ws://server:8000/stream/push").unwrap();
    assert_eq!(
      push_url_with_secret(&url, "s3 cret").as_str(),
      "ws://server:8000/stream/push?secret=s3+cret"
    );
  }

  #[test]
  fn http_push_url_is_rejected() {
    let result = StreamPusher::start(Arc::new(NoCamera), &config("http://server:8000/stream/push"));
    assert!(matches!(result, Err(PusherError::UnsupportedScheme(_))));
  }

  #[test]
  fn unreachable_relay_keeps_retrying_until_stopped() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
      .unwrap()
      .local_addr()
      .unwrap()
      .port();
    let mut pusher = StreamPusher::start(
      Arc::new(NoCamera),
      &config(&format!("ws://127.0.0.1:{}/stream/push", port)),
    )
    .unwrap();

    thread::sleep(Duration::from_millis(200));
    assert!(!pusher.is_connected());
    pusher.stop();
  }

  #[test]
  fn silent_relay_handshake_times_out() {
    // 监听但从不 accept，TCP 能连上，握手永远等不到响应
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = Url::parse(&format!(
      "ws://{}/stream/push",
      listener.local_addr().unwrap()
    ))
    .unwrap();

    let started = Instant::now();
    let result = open_socket(&url, Duration::from_millis(200));
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(3));
  }
}
