// 该文件是 Huaying （画影） 项目的一部分。
// src/output/directory_record.rs - 离线目录记录
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

//! 没有服务端时把照片按日期写入本地目录：
//! `<root>/YYYY/MM/DD/<filename>` 以及同名的 `.json` 元数据。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{UploadResponse, Uploader},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("元数据序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("文件名无效: {0}")]
  InvalidFilename(String),
}

#[derive(Debug, Serialize)]
struct CaptureRecord<'a> {
  image_id: &'a str,
  filename: &'a str,
  size: usize,
  created_at: DateTime<Utc>,
}

pub struct DirectoryRecordOutput {
  directory: PathBuf,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }
    Ok(Self::new(uri.path()))
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl AsRef<Path>) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
    }
  }

  fn day_directory(&self, now: DateTime<Utc>) -> PathBuf {
    self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()))
  }

  /// 根目录可创建即视为可用
  pub fn check_health(&self) -> bool {
    std::fs::create_dir_all(&self.directory).is_ok()
  }

  /// 写入照片与元数据，返回照片路径
  pub fn record(
    &self,
    image_id: &str,
    bytes: &[u8],
    filename: &str,
  ) -> Result<PathBuf, DirectoryRecordOutputError> {
    let name = Path::new(filename)
      .file_name()
      .ok_or_else(|| DirectoryRecordOutputError::InvalidFilename(filename.to_string()))?;

    let now = Utc::now();
    let directory = self.day_directory(now);
    std::fs::create_dir_all(&directory)?;

    let path = directory.join(name);
    std::fs::write(&path, bytes)?;

    let record = CaptureRecord {
      image_id,
      filename,
      size: bytes.len(),
      created_at: now,
    };
    std::fs::write(
      path.with_extension("json"),
      serde_json::to_vec_pretty(&record)?,
    )?;
    Ok(path)
  }
}

impl Uploader for DirectoryRecordOutput {
  fn upload(&self, bytes: &[u8], filename: &str) -> UploadResponse {
    let image_id = uuid::Uuid::new_v4().to_string();
    match self.record(&image_id, bytes, filename) {
      Ok(path) => {
        info!("照片已保存: {}", path.display());
        UploadResponse::ok(image_id, format!("已保存到 {}", path.display()))
      }
      Err(e) => {
        warn!("保存照片失败: {}", e);
        UploadResponse::failure(e.to_string())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_root() -> PathBuf {
    std::env::temp_dir().join(format!("huaying-record-{}", uuid::Uuid::new_v4()))
  }

  #[test]
  fn writes_image_and_sidecar_under_dated_directory() {
    let root = temp_root();
    let output = DirectoryRecordOutput::new(&root);

    let response = output.upload(b"jpeg-bytes", "capture_20260101_120000_abcd1234.jpg");
    assert!(response.success);
    let image_id = response.image_id.unwrap();

    let now = Utc::now();
    let day = root
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    let image = day.join("capture_20260101_120000_abcd1234.jpg");
    assert_eq!(std::fs::read(&image).unwrap(), b"jpeg-bytes");

    let sidecar: serde_json::Value =
      serde_json::from_slice(&std::fs::read(image.with_extension("json")).unwrap()).unwrap();
    assert_eq!(sidecar["image_id"], image_id.as_str());
    assert_eq!(sidecar["size"], 10);

    std::fs::remove_dir_all(root).ok();
  }

  #[test]
  fn path_components_in_filename_are_stripped() {
    let root = temp_root();
    let output = DirectoryRecordOutput::new(&root);
    let path = output.record("id", b"x", "../../escape.jpg").unwrap();
    assert!(path.starts_with(&root));
    std::fs::remove_dir_all(root).ok();
  }

  #[test]
  fn folder_url_sets_root() {
    let url = url::Url::parse("folder:///var/lib/huaying").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert_eq!(output.directory, PathBuf::from("/var/lib/huaying"));
  }
}
