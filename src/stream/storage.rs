// 该文件是 Huaying （画影） 项目的一部分。
// src/stream/storage.rs - 服务端上传图片存储
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

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StorageError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("元数据序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// `metadata/<image_id>.json` 的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
  pub image_id: String,
  pub original_filename: String,
  pub stored_filename: String,
  pub upload_time: DateTime<Local>,
  pub file_size: usize,
}

/// 存储结果
#[derive(Debug, Clone)]
pub struct StoredImage {
  pub image_id: String,
  pub filename: String,
  pub path: PathBuf,
  pub created_at: DateTime<Local>,
}

/// `<root>/uploads` 存放图片，`<root>/metadata` 存放元数据
#[derive(Debug, Clone)]
pub struct UploadStore {
  uploads: PathBuf,
  metadata: PathBuf,
}

impl UploadStore {
  pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
    let root = root.as_ref();
    let store = Self {
      uploads: root.join("uploads"),
      metadata: root.join("metadata"),
    };
    tokio::fs::create_dir_all(&store.uploads).await?;
    tokio::fs::create_dir_all(&store.metadata).await?;
    info!("上传存储目录: {}", root.display());
    Ok(store)
  }

  /// 形如 `20260101_120000_1a2b3c4d`
  fn generate_id(now: DateTime<Local>) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &id[..8])
  }

  pub async fn save(&self, bytes: &[u8], original_filename: &str) -> Result<StoredImage, StorageError> {
    let now = Local::now();
    let image_id = Self::generate_id(now);
    let extension = Path::new(original_filename)
      .extension()
      .and_then(|ext| ext.to_str())
      .unwrap_or("jpg");
    let filename = format!("{}.{}", image_id, extension);

    let path = self.uploads.join(&filename);
    tokio::fs::write(&path, bytes).await?;

    let metadata = ImageMetadata {
      image_id: image_id.clone(),
      original_filename: original_filename.to_string(),
      stored_filename: filename.clone(),
      upload_time: now,
      file_size: bytes.len(),
    };
    tokio::fs::write(
      self.metadata.join(format!("{}.json", image_id)),
      serde_json::to_vec_pretty(&metadata)?,
    )
    .await?;

    info!("已保存上传图片 {} ({} 字节)", filename, bytes.len());
    Ok(StoredImage {
      image_id,
      filename,
      path,
      created_at: now,
    })
  }

  pub async fn metadata(&self, image_id: &str) -> Result<Option<ImageMetadata>, StorageError> {
    let path = self.metadata.join(format!("{}.json", image_id));
    match tokio::fs::read(&path).await {
      Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }
}
