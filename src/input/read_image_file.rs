// 该文件是 Huaying （画影） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

//! 开发用的静态图像相机：每次拍摄都返回同一张解码后的图片。

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, input::FrameGrabber};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI scheme 不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

pub struct ImageFileInput {
  image: Option<RgbImage>,
}

impl ImageFileInput {
  pub fn new(image: RgbImage) -> Self {
    Self { image: Some(image) }
  }
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme 不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let path = urlencoding::decode(url.path())
      .map(|p| p.into_owned())
      .unwrap_or_else(|_| url.path().to_string());
    let image = ImageReader::open(&path)?
      .with_guessed_format()?
      .decode()?
      .to_rgb8();

    Ok(Self::new(image))
  }
}

impl FrameGrabber for ImageFileInput {
  fn grab(&mut self) -> Option<Frame> {
    self.image.as_ref().map(|image| Frame::new(image.clone()))
  }

  fn release(&mut self) {
    self.image = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_grab_returns_the_same_picture() {
    let mut input = ImageFileInput::new(RgbImage::from_pixel(3, 2, image::Rgb([9, 8, 7])));
    let first = input.grab().unwrap();
    let second = input.grab().unwrap();
    assert_eq!(first.as_ref(), second.as_ref());
    assert_eq!((second.width(), second.height()), (3, 2));

    input.release();
    assert!(input.grab().is_none());
  }

  #[test]
  fn loads_image_from_file_url() {
    let path = std::env::temp_dir().join(format!("huaying-input-{}.png", uuid::Uuid::new_v4()));
    RgbImage::from_pixel(5, 4, image::Rgb([1, 2, 3]))
      .save(&path)
      .unwrap();

    let url = Url::from_file_path(&path).unwrap();
    let url = Url::parse(&url.as_str().replacen("file", "image", 1)).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    let frame = input.grab().unwrap();
    assert_eq!(frame.image().get_pixel(0, 0).0, [1, 2, 3]);

    std::fs::remove_file(path).ok();
  }

  #[test]
  fn wrong_scheme_is_rejected() {
    let url = Url::parse("file:///tmp/x.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(ImageFileInputError::SchemeMismatch)
    ));
  }
}
