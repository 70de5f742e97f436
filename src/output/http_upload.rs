// 该文件是 Huaying （画影） 项目的一部分。
// src/output/http_upload.rs - HTTP 照片上传
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

use std::time::Duration;

use reqwest::{
  blocking::{Client, multipart},
  header::{ACCEPT, HeaderMap, HeaderValue},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl,
  output::{UploadResponse, Uploader},
};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum UploadError {
  #[error("URI scheme 不匹配")]
  SchemeMismatch,
  #[error("HTTP 客户端错误: {0}")]
  Client(#[from] reqwest::Error),
  #[error("地址错误: {0}")]
  Url(#[from] url::ParseError),
}

/// 服务端 `POST /upload` 的响应
#[derive(Debug, Deserialize)]
struct ServerReply {
  image_id: Option<String>,
  message: Option<String>,
}

/// 以 multipart 表单上传照片，字段名为 `file`
pub struct HttpUploader {
  client: Client,
  upload_url: Url,
  health_url: Url,
}

impl FromUrl for HttpUploader {
  type Error = UploadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if !matches!(url.scheme(), "http" | "https") {
      return Err(UploadError::SchemeMismatch);
    }

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    let client = Client::builder()
      .default_headers(headers)
      .timeout(UPLOAD_TIMEOUT)
      .build()?;

    Ok(Self {
      client,
      upload_url: url.clone(),
      health_url: url.join("/health")?,
    })
  }
}

impl HttpUploader {
  pub fn upload_url(&self) -> &Url {
    &self.upload_url
  }

  /// `GET /health` 是否返回 2xx
  pub fn check_health(&self) -> bool {
    match self
      .client
      .get(self.health_url.clone())
      .timeout(HEALTH_TIMEOUT)
      .send()
    {
      Ok(response) => response.status().is_success(),
      Err(e) => {
        debug!("健康检查失败: {}", e);
        false
      }
    }
  }

  fn try_upload(&self, bytes: &[u8], filename: &str) -> Result<UploadResponse, String> {
    let part = multipart::Part::bytes(bytes.to_vec())
      .file_name(filename.to_string())
      .mime_str("image/jpeg")
      .map_err(|e| format!("网络错误: {}", e))?;
    let form = multipart::Form::new().part("file", part);

    let response = self
      .client
      .post(self.upload_url.clone())
      .multipart(form)
      .send()
      .map_err(|e| format!("网络错误: {}", e))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
      return Err(format!("服务器错误: {}", status.as_u16()));
    }

    let reply: ServerReply = response
      .json()
      .map_err(|e| format!("响应解析失败: {}", e))?;
    Ok(UploadResponse {
      success: true,
      image_id: reply.image_id,
      message: Some(reply.message.unwrap_or_else(|| "上传成功".to_string())),
      error: None,
    })
  }
}

impl Uploader for HttpUploader {
  fn upload(&self, bytes: &[u8], filename: &str) -> UploadResponse {
    info!("上传 {} ({} 字节) 到 {}", filename, bytes.len(), self.upload_url);
    self.try_upload(bytes, filename).unwrap_or_else(|e| {
      warn!("上传失败: {}", e);
      UploadResponse::failure(e)
    })
  }
}
