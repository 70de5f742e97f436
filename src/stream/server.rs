// 该文件是 Huaying （画影） 项目的一部分。
// src/stream/server.rs - 中继 HTTP 与 WebSocket 接口
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

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
  Json, Router,
  body::Body,
  extract::{
    DefaultBodyLimit, Multipart, Query, State,
    ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
  },
  http::{HeaderValue, StatusCode, header},
  response::{IntoResponse, Response},
  routing::{get, post},
};
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::stream::{
  relay::StreamRelay,
  storage::{StorageError, UploadStore},
};

const MJPEG_BOUNDARY: &str = "frame";
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

pub const CLOSE_INVALID_SECRET: u16 = 4001;
pub const CLOSE_SOURCE_BUSY: u16 = 4002;

/// 信源超过该时间没有任何消息（帧或 ping）即视为掉线
pub const SOURCE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum ApiError {
  #[error("{0}")]
  Unavailable(&'static str),
  #[error("{0}")]
  BadRequest(String),
  #[error("存储错误: {0}")]
  Storage(#[from] StorageError),
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = match &self {
      ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "detail": self.to_string() }))).into_response()
  }
}

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
  pub relay: StreamRelay,
  pub secret: Arc<str>,
  pub idle_timeout: Duration,
  pub source_timeout: Duration,
  pub storage: Option<UploadStore>,
}

impl AppState {
  pub fn new(relay: StreamRelay, secret: &str, idle_timeout: Duration) -> Self {
    Self {
      relay,
      secret: Arc::from(secret),
      idle_timeout,
      source_timeout: SOURCE_TIMEOUT,
      storage: None,
    }
  }

  pub fn with_source_timeout(mut self, source_timeout: Duration) -> Self {
    self.source_timeout = source_timeout;
    self
  }

  pub fn with_storage(mut self, storage: UploadStore) -> Self {
    self.storage = Some(storage);
    self
  }
}

/// 只读的预览接口：live、snapshot、status
pub fn preview_routes() -> Router<AppState> {
  Router::new()
    .route("/stream/live.mjpg", get(live_stream))
    .route("/stream/snapshot.jpg", get(snapshot))
    .route("/stream/status", get(status))
}

/// 服务端完整路由
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
  Router::new()
    .merge(preview_routes())
    .route("/stream/push", get(push_source))
    .route("/upload", post(upload))
    .route("/health", get(health))
    .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024))
    .layer(cors_layer(allowed_origins))
    .with_state(state)
}

/// 没有配置来源时允许任意来源
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
  let origins: Vec<HeaderValue> = allowed_origins
    .iter()
    .filter(|origin| !origin.is_empty() && origin.as_str() != "*")
    .filter_map(|origin| HeaderValue::from_str(origin).ok())
    .collect();

  let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
  if origins.is_empty() {
    layer.allow_origin(Any)
  } else {
    layer.allow_origin(AllowOrigin::list(origins))
  }
}

#[derive(Debug, Deserialize)]
pub struct PushQuery {
  secret: Option<String>,
}

async fn push_source(
  ws: WebSocketUpgrade,
  Query(query): Query<PushQuery>,
  State(state): State<AppState>,
) -> Response {
  let authorized = query.secret.as_deref() == Some(&*state.secret);
  ws.on_upgrade(move |socket| {
    handle_source(socket, authorized, state.relay, state.source_timeout)
  })
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
  let frame = CloseFrame {
    code,
    reason: reason.into(),
  };
  if let Err(e) = socket.send(Message::Close(Some(frame))).await {
    warn!(error = %e, "发送关闭帧失败");
  }
}

async fn handle_source(
  mut socket: WebSocket,
  authorized: bool,
  relay: StreamRelay,
  source_timeout: Duration,
) {
  if !authorized {
    warn!("推流密钥错误，拒绝连接");
    close_with(socket, CLOSE_INVALID_SECRET, "Invalid secret").await;
    return;
  }

  let source_id = format!("pi-{}", uuid::Uuid::new_v4().simple());
  if !relay.connect_source(&source_id) {
    close_with(socket, CLOSE_SOURCE_BUSY, "Another source already connected").await;
    return;
  }

  loop {
    // 半开连接收不到 FIN，只能靠读超时释放信源位
    let message = match tokio::time::timeout(source_timeout, socket.recv()).await {
      Ok(Some(message)) => message,
      Ok(None) => break,
      Err(_) => {
        warn!(source = %source_id, "信源 {:?} 内没有消息，断开连接", source_timeout);
        break;
      }
    };
    match message {
      Ok(Message::Binary(frame)) => {
        if !frame.is_empty() {
          relay.push_frame(frame);
        }
      }
      Ok(Message::Close(_)) => {
        info!(source = %source_id, "信源关闭连接");
        break;
      }
      Ok(_) => {}
      Err(e) => {
        warn!(source = %source_id, error = %e, "信源连接错误");
        break;
      }
    }
  }

  relay.disconnect_source(&source_id);
}

fn mjpeg_part(frame: &[u8]) -> Bytes {
  let header = format!(
    "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
    MJPEG_BOUNDARY,
    frame.len()
  );
  let mut part = Vec::with_capacity(header.len() + frame.len() + 2);
  part.extend_from_slice(header.as_bytes());
  part.extend_from_slice(frame);
  part.extend_from_slice(b"\r\n");
  Bytes::from(part)
}

/// 信源离开后超过空闲时间没有新帧即结束输出
async fn live_stream(State(state): State<AppState>) -> Result<Response, ApiError> {
  if !state.relay.is_source_connected() {
    return Err(ApiError::Unavailable("推流信源未连接"));
  }

  let relay = state.relay.clone();
  let idle = state.idle_timeout;
  let subscription = relay.subscribe();
  let stream = async_stream::stream! {
    loop {
      match subscription.recv_timeout(idle).await {
        Some(frame) => yield Ok::<Bytes, Infallible>(mjpeg_part(&frame)),
        None if relay.is_source_connected() => continue,
        None => break,
      }
    }
  };

  Ok(
    (
      [
        (
          header::CONTENT_TYPE,
          format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
        ),
        (
          header::CACHE_CONTROL,
          "no-cache, no-store, must-revalidate".to_string(),
        ),
        (header::PRAGMA, "no-cache".to_string()),
        (header::EXPIRES, "0".to_string()),
      ],
      Body::from_stream(stream),
    )
      .into_response(),
  )
}

async fn snapshot(State(state): State<AppState>) -> Result<Response, ApiError> {
  let frame = state
    .relay
    .latest_frame()
    .ok_or(ApiError::Unavailable("暂无可用的帧"))?;
  Ok(
    (
      [
        (header::CONTENT_TYPE, "image/jpeg"),
        (header::CACHE_CONTROL, "no-cache"),
      ],
      frame,
    )
      .into_response(),
  )
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
  Json(state.relay.status())
}

#[derive(Debug, Serialize)]
pub struct UploadReceipt {
  pub success: bool,
  pub image_id: String,
  pub message: String,
  pub filename: String,
  pub created_at: DateTime<Local>,
}

async fn upload(
  State(state): State<AppState>,
  mut multipart: Multipart,
) -> Result<Json<UploadReceipt>, ApiError> {
  let storage = state
    .storage
    .as_ref()
    .ok_or(ApiError::Unavailable("未配置上传存储"))?;

  while let Some(field) = multipart
    .next_field()
    .await
    .map_err(|e| ApiError::BadRequest(format!("表单解析失败: {}", e)))?
  {
    if field.name() != Some("file") {
      continue;
    }

    let is_image = field
      .content_type()
      .map(|mime| mime.starts_with("image/"))
      .unwrap_or(false);
    if !is_image {
      return Err(ApiError::BadRequest("只能上传图片文件".to_string()));
    }

    let filename = field.file_name().unwrap_or("unknown.jpg").to_string();
    let bytes = field
      .bytes()
      .await
      .map_err(|e| ApiError::BadRequest(format!("读取文件失败: {}", e)))?;
    if bytes.len() > MAX_UPLOAD_BYTES {
      return Err(ApiError::BadRequest("文件大小不能超过 10MB".to_string()));
    }

    let stored = storage.save(&bytes, &filename).await?;
    return Ok(Json(UploadReceipt {
      success: true,
      image_id: stored.image_id,
      message: "上传成功".to_string(),
      filename: stored.filename,
      created_at: stored.created_at,
    }));
  }

  Err(ApiError::BadRequest("缺少 file 字段".to_string()))
}

async fn health() -> impl IntoResponse {
  Json(json!({
    "status": "ok",
    "version": env!("CARGO_PKG_VERSION"),
    "timestamp": Local::now(),
  }))
}

#[cfg(test)]
mod tests {
  use axum::http::Request;
  use http_body_util::BodyExt;
  use tower::ServiceExt;

  use super::*;

  fn app(relay: &StreamRelay) -> Router {
    let state = AppState::new(relay.clone(), "secret", Duration::from_millis(50));
    router(state, &[])
  }

  async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
  }

  #[tokio::test]
  async fn idle_relay_reports_no_frame() {
    let relay = StreamRelay::default();

    let response = app(&relay)
      .oneshot(Request::get("/stream/snapshot.jpg").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = app(&relay)
      .oneshot(Request::get("/stream/status").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["source_connected"], false);
    assert!(status["frame_age_seconds"].is_null());
    assert_eq!(status["has_frame"], false);
  }

  #[tokio::test]
  async fn live_stream_requires_source() {
    let relay = StreamRelay::default();
    let response = app(&relay)
      .oneshot(Request::get("/stream/live.mjpg").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
  }

  #[tokio::test]
  async fn snapshot_returns_latest_jpeg() {
    let relay = StreamRelay::default();
    relay.connect_source("pi-test");
    relay.push_frame(Bytes::from_static(b"\xFF\xD8first"));
    relay.push_frame(Bytes::from_static(b"\xFF\xD8second"));

    let response = app(&relay)
      .oneshot(Request::get("/stream/snapshot.jpg").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"\xFF\xD8second");
  }

  #[tokio::test]
  async fn live_stream_ends_after_source_leaves() {
    let relay = StreamRelay::default();
    relay.connect_source("pi-test");

    let response = app(&relay)
      .oneshot(Request::get("/stream/live.mjpg").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
      response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("multipart/x-mixed-replace")
    );
    assert_eq!(relay.subscriber_count(), 1);

    relay.push_frame(Bytes::from_static(b"jpeg"));
    relay.disconnect_source("pi-test");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let expected = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\njpeg\r\n";
    assert_eq!(&body[..], &expected[..]);
    assert_eq!(relay.subscriber_count(), 0);
  }

  async fn serve(state: AppState) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, router(state, &[])).await.ok();
    });
    addr
  }

  /// 同步客户端连上推流接口，读到关闭帧或连接断开为止
  fn push_client(url: String, first_frame: Option<&'static [u8]>) -> Option<u16> {
    let (mut socket, _) = tungstenite::connect(url).ok()?;
    if let tungstenite::stream::MaybeTlsStream::Plain(stream) = socket.get_ref() {
      stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    }
    if let Some(frame) = first_frame {
      socket.send(tungstenite::Message::binary(frame)).ok()?;
    }
    loop {
      match socket.read() {
        Ok(tungstenite::Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
        Ok(_) => continue,
        Err(_) => return None,
      }
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn push_rejects_wrong_secret_and_second_source() {
    let relay = StreamRelay::default();
    let addr = serve(AppState::new(relay.clone(), "secret", Duration::from_millis(50))).await;

    let url = format!("ws://{}/stream/push?secret=wrong", addr);
    let code = tokio::task::spawn_blocking(move || push_client(url, None))
      .await
      .unwrap();
    assert_eq!(code, Some(CLOSE_INVALID_SECRET));
    assert!(!relay.is_source_connected());

    assert!(relay.connect_source("held"));
    let url = format!("ws://{}/stream/push?secret=secret", addr);
    let code = tokio::task::spawn_blocking(move || push_client(url, None))
      .await
      .unwrap();
    assert_eq!(code, Some(CLOSE_SOURCE_BUSY));
    assert_eq!(relay.source_id().as_deref(), Some("held"));
    assert!(relay.latest_frame().is_none());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn silent_source_releases_the_slot() {
    let relay = StreamRelay::default();
    let state = AppState::new(relay.clone(), "secret", Duration::from_millis(50))
      .with_source_timeout(Duration::from_millis(200));
    let addr = serve(state).await;

    let url = format!("ws://{}/stream/push?secret=secret", addr);
    let started = std::time::Instant::now();
    let code = tokio::task::spawn_blocking(move || push_client(url, Some(&b"\xFF\xD8jpeg"[..])))
      .await
      .unwrap();

    assert_eq!(code, None);
    assert!(started.elapsed() >= Duration::from_millis(200));
    let history = relay.history();
    assert_eq!(history.len(), 1);
    assert_eq!(&history[0].bytes[..], b"\xFF\xD8jpeg");
    assert!(!relay.is_source_connected());

    // 信源位已释放，新的推流可以接入
    assert!(relay.connect_source("pi-next"));
  }

  #[tokio::test]
  async fn health_is_ok() {
    let relay = StreamRelay::default();
    let response = app(&relay)
      .oneshot(Request::get("/health").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
  }

  fn multipart_request(content_type: &str) -> Request<Body> {
    let body = format!(
      "--XBOUNDARY\r\nContent-Disposition: form-data; name=\"file\"; filename=\"capture.jpg\"\r\nContent-Type: {}\r\n\r\nJPEGDATA\r\n--XBOUNDARY--\r\n",
      content_type
    );
    Request::post("/upload")
      .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
      .body(Body::from(body))
      .unwrap()
  }

  #[tokio::test]
  async fn upload_stores_image() {
    let root = std::env::temp_dir().join(format!("huaying-server-{}", uuid::Uuid::new_v4()));
    let storage = UploadStore::open(&root).await.unwrap();
    let relay = StreamRelay::default();
    let state = AppState::new(relay, "secret", Duration::from_secs(5)).with_storage(storage.clone());

    let response = router(state.clone(), &[])
      .oneshot(multipart_request("image/jpeg"))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let receipt = body_json(response).await;
    assert_eq!(receipt["success"], true);
    let image_id = receipt["image_id"].as_str().unwrap();
    let metadata = storage.metadata(image_id).await.unwrap().unwrap();
    assert_eq!(metadata.file_size, 8);

    let response = router(state, &[])
      .oneshot(multipart_request("text/plain"))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    tokio::fs::remove_dir_all(root).await.ok();
  }
}
