// 该文件是 Huaying （画影） 项目的一部分。
// src/frame.rs - 相机帧定义
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

use chrono::{DateTime, Utc};
use image::RgbImage;
use thiserror::Error;

const RGB_CHANNELS: usize = 3;

/// 原始缓冲区的通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
  Rgb,
  Bgr,
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidShape { width: u32, height: u32 },
}

/// 一帧不可变的 RGB 图像（H × W × 3），附带采集时间
///
/// 像素数据由 `Arc` 共享，克隆只复制引用；帧一经创建不再修改。
#[derive(Debug, Clone)]
pub struct Frame {
  image: Arc<RgbImage>,
  captured_at: DateTime<Utc>,
}

impl Frame {
  pub fn new(image: RgbImage) -> Self {
    Self::with_timestamp(image, Utc::now())
  }

  pub fn with_timestamp(image: RgbImage, captured_at: DateTime<Utc>) -> Self {
    Self {
      image: Arc::new(image),
      captured_at,
    }
  }

  /// 从紧密排列的 HWC 缓冲区构造帧，BGR 数据会被转换为 RGB
  ///
  /// 缓冲区可以带有行尾填充以外的多余数据，只取前 `width * height * 3` 字节。
  pub fn from_raw(
    width: u32,
    height: u32,
    data: &[u8],
    order: ChannelOrder,
  ) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidShape { width, height });
    }

    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() < expected {
      return Err(FrameError::SizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    let mut buffer = data[..expected].to_vec();
    if order == ChannelOrder::Bgr {
      for pixel in buffer.chunks_exact_mut(RGB_CHANNELS) {
        pixel.swap(0, 2);
      }
    }

    let image = RgbImage::from_raw(width, height, buffer).ok_or(FrameError::SizeMismatch {
      expected,
      actual: data.len(),
    })?;
    Ok(Self::new(image))
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// 像素面积（宽 × 高）
  pub fn area(&self) -> u64 {
    self.width() as u64 * self.height() as u64
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  pub fn captured_at(&self) -> DateTime<Utc> {
    self.captured_at
  }
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    Frame::new(image)
  }
}

impl AsRef<[u8]> for Frame {
  fn as_ref(&self) -> &[u8] {
    self.image.as_raw()
  }
}
