// 该文件是 Huaying （画影） 项目的一部分。
// src/bin/stream_server.rs - 中继服务程序
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

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use huaying::{
  config::{RelayConfig, ServerArgs},
  stream::{AppState, StreamRelay, UploadStore, router},
};

/// 接收树莓派推流与照片上传，向浏览器转发 MJPEG
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub server: ServerArgs,
}

async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("收到中断信号，准备退出..."),
    Err(e) => warn!("监听中断信号失败: {}", e),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  huaying::init_tracing();

  let args = Args::parse();
  let config = RelayConfig::from(&args.server);
  info!("监听地址: {}", args.server.bind);
  info!("存储目录: {}", args.server.storage.display());
  info!("历史帧数量: {}", config.history);

  let storage = UploadStore::open(&args.server.storage)
    .await
    .context("无法创建存储目录")?;
  let relay = StreamRelay::new(&config);
  let state = AppState::new(relay, &config.secret, config.idle_timeout).with_storage(storage);
  let app = router(state, &args.server.allowed_origins);

  let listener = tokio::net::TcpListener::bind(args.server.bind)
    .await
    .with_context(|| format!("无法监听 {}", args.server.bind))?;
  info!("中继服务已启动");

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("中继服务异常退出")?;

  info!("中继服务已停止");
  Ok(())
}
