// 该文件是 Huaying （画影） 项目的一部分。
// src/stream/relay.rs - 单信源多订阅者帧中继
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

//! 同一时刻只允许一个信源写入；每个订阅者拥有独立的有界队列，满时丢弃最旧的帧，
//! 推送永远不会因为慢速订阅者而阻塞。

use std::{
  collections::{HashMap, VecDeque},
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::{Duration, Instant},
};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;

#[derive(Debug, Clone)]
pub struct StreamFrame {
  pub bytes: Bytes,
  pub timestamp: Instant,
}

/// `GET /stream/status` 的响应体
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayStatus {
  pub source_connected: bool,
  pub source_id: Option<String>,
  pub client_count: usize,
  pub frame_age_seconds: Option<f64>,
  pub has_frame: bool,
}

/// 单个订阅者的丢旧队列
#[derive(Debug)]
struct SubscriberQueue {
  frames: Mutex<VecDeque<Bytes>>,
  notify: Notify,
  capacity: usize,
}

impl SubscriberQueue {
  fn new(capacity: usize) -> Self {
    Self {
      frames: Mutex::new(VecDeque::with_capacity(capacity)),
      notify: Notify::new(),
      capacity: capacity.max(1),
    }
  }

  fn offer(&self, frame: Bytes) {
    {
      let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
      if frames.len() >= self.capacity {
        frames.pop_front();
      }
      frames.push_back(frame);
    }
    self.notify.notify_one();
  }

  fn pop(&self) -> Option<Bytes> {
    self
      .frames
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .pop_front()
  }

  fn len(&self) -> usize {
    self.frames.lock().unwrap_or_else(PoisonError::into_inner).len()
  }
}

#[derive(Debug, Default)]
struct RelayState {
  source_id: Option<String>,
  latest: Option<StreamFrame>,
  history: VecDeque<StreamFrame>,
  subscribers: HashMap<u64, Arc<SubscriberQueue>>,
  next_subscriber: u64,
}

/// 帧中继句柄，克隆后共享同一份状态
#[derive(Debug, Clone)]
pub struct StreamRelay {
  state: Arc<Mutex<RelayState>>,
  history_len: usize,
  subscriber_capacity: usize,
}

impl Default for StreamRelay {
  fn default() -> Self {
    Self::new(&RelayConfig::default())
  }
}

impl StreamRelay {
  pub fn new(config: &RelayConfig) -> Self {
    Self {
      state: Arc::new(Mutex::new(RelayState::default())),
      history_len: config.history.max(1),
      subscriber_capacity: config.subscriber_capacity.max(1),
    }
  }

  fn lock(&self) -> MutexGuard<'_, RelayState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 占用信源槽位，已有信源时失败
  pub fn connect_source(&self, source_id: &str) -> bool {
    let mut state = self.lock();
    if let Some(current) = &state.source_id {
      warn!(current = %current, rejected = %source_id, "已有信源连接");
      return false;
    }
    state.source_id = Some(source_id.to_string());
    info!(source = %source_id, "信源已连接");
    true
  }

  /// 只有 `source_id` 与当前信源一致时才释放槽位，并清除最新帧
  pub fn disconnect_source(&self, source_id: &str) {
    let mut state = self.lock();
    if state.source_id.as_deref() == Some(source_id) {
      state.source_id = None;
      state.latest = None;
      info!(source = %source_id, "信源已断开");
    } else {
      debug!(source = %source_id, "忽略过期的断开请求");
    }
  }

  pub fn is_source_connected(&self) -> bool {
    self.lock().source_id.is_some()
  }

  pub fn source_id(&self) -> Option<String> {
    self.lock().source_id.clone()
  }

  /// 更新最新帧、写入历史并分发给所有订阅者
  pub fn push_frame(&self, bytes: impl Into<Bytes>) {
    let frame = StreamFrame {
      bytes: bytes.into(),
      timestamp: Instant::now(),
    };

    let mut state = self.lock();
    if state.history.len() >= self.history_len {
      state.history.pop_front();
    }
    state.history.push_back(frame.clone());
    for queue in state.subscribers.values() {
      queue.offer(frame.bytes.clone());
    }
    state.latest = Some(frame);
  }

  pub fn latest_frame(&self) -> Option<Bytes> {
    self.lock().latest.as_ref().map(|frame| frame.bytes.clone())
  }

  /// 最近的若干帧，从旧到新
  pub fn history(&self) -> Vec<StreamFrame> {
    self.lock().history.iter().cloned().collect()
  }

  pub fn frame_age(&self) -> Option<Duration> {
    self.lock().latest.as_ref().map(|frame| frame.timestamp.elapsed())
  }

  pub fn subscribe(&self) -> Subscription {
    let queue = Arc::new(SubscriberQueue::new(self.subscriber_capacity));
    let mut state = self.lock();
    let id = state.next_subscriber;
    state.next_subscriber += 1;
    state.subscribers.insert(id, queue.clone());
    info!(subscriber = id, total = state.subscribers.len(), "订阅开始");

    Subscription {
      id,
      queue,
      relay: self.clone(),
    }
  }

  /// 重复调用或对未知订阅者调用都不会出错
  pub fn unsubscribe(&self, id: u64) {
    let mut state = self.lock();
    if state.subscribers.remove(&id).is_some() {
      info!(subscriber = id, total = state.subscribers.len(), "订阅结束");
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.lock().subscribers.len()
  }

  pub fn status(&self) -> RelayStatus {
    let state = self.lock();
    RelayStatus {
      source_connected: state.source_id.is_some(),
      source_id: state.source_id.clone(),
      client_count: state.subscribers.len(),
      frame_age_seconds: state
        .latest
        .as_ref()
        .map(|frame| frame.timestamp.elapsed().as_secs_f64()),
      has_frame: state.latest.is_some(),
    }
  }
}

/// 订阅句柄，释放时自动退订
#[derive(Debug)]
pub struct Subscription {
  id: u64,
  queue: Arc<SubscriberQueue>,
  relay: StreamRelay,
}

impl Subscription {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn try_recv(&self) -> Option<Bytes> {
    self.queue.pop()
  }

  pub fn pending(&self) -> usize {
    self.queue.len()
  }

  pub async fn recv(&self) -> Bytes {
    loop {
      let notified = self.queue.notify.notified();
      if let Some(frame) = self.queue.pop() {
        return frame;
      }
      notified.await;
    }
  }

  /// 在 `timeout` 内等待下一帧
  pub async fn recv_timeout(&self, timeout: Duration) -> Option<Bytes> {
    tokio::time::timeout(timeout, self.recv()).await.ok()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.relay.unsubscribe(self.id);
  }
}
