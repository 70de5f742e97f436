// 该文件是 Huaying （画影） 项目的一部分。
// src/output.rs - 照片编码与上传
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

use chrono::Local;
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

mod directory_record;
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

mod http_upload;
pub use self::http_upload::{HttpUploader, UploadError};

/// 上传结果；上传接口从不返回错误，失败信息放在 `error` 中
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
  pub success: bool,
  pub image_id: Option<String>,
  pub message: Option<String>,
  pub error: Option<String>,
}

impl UploadResponse {
  pub fn ok(image_id: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      success: true,
      image_id: Some(image_id.into()),
      message: Some(message.into()),
      error: None,
    }
  }

  pub fn failure(error: impl Into<String>) -> Self {
    Self {
      success: false,
      error: Some(error.into()),
      ..Self::default()
    }
  }
}

pub trait Uploader: Send {
  fn upload(&self, bytes: &[u8], filename: &str) -> UploadResponse;
}

#[derive(Error, Debug)]
pub enum EncodeError {
  #[error("JPEG 编码失败: {0}")]
  Jpeg(#[from] image::ImageError),
  #[error("图像为空")]
  EmptyImage,
}

/// 按固定质量编码为 JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
  if image.width() == 0 || image.height() == 0 {
    return Err(EncodeError::EmptyImage);
  }
  let mut buffer = Vec::new();
  JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
  Ok(buffer)
}

/// 形如 `capture_20260101_120000_1a2b3c4d.jpg` 的唯一文件名
pub fn generate_filename() -> String {
  let id = uuid::Uuid::new_v4().simple().to_string();
  format!(
    "capture_{}_{}.jpg",
    Local::now().format("%Y%m%d_%H%M%S"),
    &id[..8]
  )
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("HTTP 上传错误: {0}")]
  UploadError(#[from] UploadError),
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper {
  Http(HttpUploader),
  DirectoryRecord(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      "http" | "https" => Ok(OutputWrapper::Http(HttpUploader::from_url(url)?)),
      DirectoryRecordOutput::SCHEME => Ok(OutputWrapper::DirectoryRecord(
        DirectoryRecordOutput::from_url(url)?,
      )),
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl OutputWrapper {
  /// 检查上传目标是否可用
  pub fn check_health(&self) -> bool {
    match self {
      OutputWrapper::Http(output) => output.check_health(),
      OutputWrapper::DirectoryRecord(output) => output.check_health(),
    }
  }
}

impl Uploader for OutputWrapper {
  fn upload(&self, bytes: &[u8], filename: &str) -> UploadResponse {
    match self {
      OutputWrapper::Http(output) => output.upload(bytes, filename),
      OutputWrapper::DirectoryRecord(output) => output.upload(bytes, filename),
    }
  }
}
