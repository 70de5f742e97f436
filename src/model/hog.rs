// 该文件是 Huaying （画影） 项目的一部分。
// src/model/hog.rs - HOG + 线性 SVM 行人检测
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

//! 经典的 Dalal-Triggs 行人检测：64×128 窗口、8 像素单元、2×2 块、9 个方向，
//! 在图像金字塔上滑窗，线性 SVM 打分，NMS 后扩边。
//!
//! SVM 权重以 JSON 保存：`{"weights": [f32; 3780], "bias": f32}`，
//! URL 形如 `hog:///etc/huaying/people_svm.json?max_width=400`。

use std::path::PathBuf;

use image::{GrayImage, imageops};
use imageproc::hog::{HogOptions, hog};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, query_param,
  frame::Frame,
  model::{BoundingBox, Model, nms},
};

const WINDOW_WIDTH: u32 = 64;
const WINDOW_HEIGHT: u32 = 128;
const CELL_SIDE: usize = 8;
const BLOCK_SIDE: usize = 2;
const ORIENTATIONS: usize = 9;
const WINDOW_STRIDE: u32 = 8;
const PYRAMID_SCALE: f32 = 1.25;
const NMS_IOU: f32 = 0.45;
/// 每条边向外扩展的比例
const BOX_PADDING: f32 = 0.1;
/// 检测前将画面缩小到该宽度以内
const DEFAULT_MAX_WIDTH: u32 = 400;

#[derive(Error, Debug)]
pub enum HogModelError {
  #[error("URI scheme 不匹配")]
  SchemeMismatch,
  #[error("读取权重文件失败: {0}")]
  IoError(#[from] std::io::Error),
  #[error("解析权重文件失败: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("权重维度错误: 期望 {expected}, 实际 {actual}")]
  WeightLength { expected: usize, actual: usize },
  #[error("HOG 计算失败: {0}")]
  Descriptor(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SvmWeights {
  pub weights: Vec<f32>,
  #[serde(default)]
  pub bias: f32,
}

fn hog_options() -> HogOptions {
  HogOptions::new(ORIENTATIONS, false, CELL_SIDE, BLOCK_SIDE, 1)
}

/// 单个检测窗口的描述子长度
pub fn descriptor_len() -> usize {
  let cells_x = WINDOW_WIDTH as usize / CELL_SIDE;
  let cells_y = WINDOW_HEIGHT as usize / CELL_SIDE;
  let blocks = (cells_x - BLOCK_SIDE + 1) * (cells_y - BLOCK_SIDE + 1);
  blocks * BLOCK_SIDE * BLOCK_SIDE * ORIENTATIONS
}

fn logistic(score: f32) -> f32 {
  1.0 / (1.0 + (-score).exp())
}

pub struct HogModel {
  svm: SvmWeights,
  max_width: u32,
}

impl HogModel {
  pub fn new(svm: SvmWeights) -> Result<Self, HogModelError> {
    let expected = descriptor_len();
    if svm.weights.len() != expected {
      return Err(HogModelError::WeightLength {
        expected,
        actual: svm.weights.len(),
      });
    }
    Ok(Self {
      svm,
      max_width: DEFAULT_MAX_WIDTH,
    })
  }

  pub fn with_max_width(mut self, max_width: u32) -> Self {
    self.max_width = max_width.max(WINDOW_WIDTH);
    self
  }

  fn score(&self, window: &GrayImage) -> Result<f32, HogModelError> {
    let descriptor = hog(window, hog_options()).map_err(HogModelError::Descriptor)?;
    let dot: f32 = descriptor
      .iter()
      .zip(self.svm.weights.iter())
      .filter(|(d, _)| d.is_finite())
      .map(|(d, w)| d * w)
      .sum();
    Ok(dot + self.svm.bias)
  }

  /// 在灰度图上做多尺度滑窗，返回原图坐标下的候选框
  fn scan(&self, gray: &GrayImage) -> Result<Vec<BoundingBox>, HogModelError> {
    let (width, height) = gray.dimensions();
    let mut candidates = Vec::new();
    let mut scale = 1.0f32;

    loop {
      let w = (width as f32 / scale) as u32;
      let h = (height as f32 / scale) as u32;
      if w < WINDOW_WIDTH || h < WINDOW_HEIGHT {
        break;
      }

      let level = if scale == 1.0 {
        gray.clone()
      } else {
        imageops::resize(gray, w, h, imageops::FilterType::Triangle)
      };

      for y in (0..=h - WINDOW_HEIGHT).step_by(WINDOW_STRIDE as usize) {
        for x in (0..=w - WINDOW_WIDTH).step_by(WINDOW_STRIDE as usize) {
          let window = imageops::crop_imm(&level, x, y, WINDOW_WIDTH, WINDOW_HEIGHT).to_image();
          let score = self.score(&window)?;
          if score <= 0.0 {
            continue;
          }
          let bbox = BoundingBox::from_corners(
            x as f32 * scale,
            y as f32 * scale,
            (x + WINDOW_WIDTH) as f32 * scale,
            (y + WINDOW_HEIGHT) as f32 * scale,
            logistic(score),
            width,
            height,
          );
          candidates.extend(bbox);
        }
      }

      scale *= PYRAMID_SCALE;
    }

    Ok(candidates)
  }
}

/// 每条边按框尺寸的固定比例向外扩展，并裁剪到画面内
pub fn pad_box(bbox: &BoundingBox, ratio: f32, width: u32, height: u32) -> BoundingBox {
  let dx = bbox.width as f32 * ratio;
  let dy = bbox.height as f32 * ratio;
  BoundingBox::from_corners(
    bbox.x as f32 - dx,
    bbox.y as f32 - dy,
    bbox.x2() as f32 + dx,
    bbox.y2() as f32 + dy,
    bbox.confidence,
    width,
    height,
  )
  .unwrap_or(*bbox)
}

impl FromUrlWithScheme for HogModel {
  const SCHEME: &'static str = "hog";
}

impl FromUrl for HogModel {
  type Error = HogModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(HogModelError::SchemeMismatch);
    }

    let path = PathBuf::from(url.path());
    info!("加载 HOG SVM 权重: {}", path.display());
    let svm: SvmWeights = serde_json::from_slice(&std::fs::read(&path)?)?;
    let model = Self::new(svm)?;

    Ok(match query_param::<u32>(url, "max_width") {
      Some(max_width) => model.with_max_width(max_width),
      None => model,
    })
  }
}

impl Model for HogModel {
  type Error = HogModelError;

  fn name(&self) -> &'static str {
    "HOG"
  }

  fn infer(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, Self::Error> {
    let (width, height) = (frame.width(), frame.height());
    let mut gray = imageops::grayscale(frame.image());
    let mut factor = 1.0f32;
    if width > self.max_width {
      factor = width as f32 / self.max_width as f32;
      let h = (height as f32 / factor).round().max(1.0) as u32;
      gray = imageops::resize(&gray, self.max_width, h, imageops::FilterType::Triangle);
    }

    let boxes = nms(self.scan(&gray)?, NMS_IOU)
      .into_iter()
      .filter_map(|b| {
        BoundingBox::from_corners(
          b.x as f32 * factor,
          b.y as f32 * factor,
          b.x2() as f32 * factor,
          b.y2() as f32 * factor,
          b.confidence,
          width,
          height,
        )
      })
      .map(|b| pad_box(&b, BOX_PADDING, width, height))
      .collect::<Vec<_>>();

    debug!("HOG 候选框 {} 个", boxes.len());
    Ok(boxes)
  }
}

#[cfg(test)]
mod tests {
  use image::{Luma, RgbImage};

  use super::*;

  #[test]
  fn descriptor_length_matches_imageproc() {
    assert_eq!(descriptor_len(), 3780);
    let window = GrayImage::from_pixel(WINDOW_WIDTH, WINDOW_HEIGHT, Luma([128]));
    assert_eq!(hog(&window, hog_options()).unwrap().len(), 3780);
  }

  #[test]
  fn wrong_weight_length_is_rejected() {
    let err = HogModel::new(SvmWeights {
      weights: vec![0.0; 10],
      bias: 0.0,
    })
    .err()
    .unwrap();
    assert!(matches!(
      err,
      HogModelError::WeightLength {
        expected: 3780,
        actual: 10
      }
    ));
  }

  #[test]
  fn positive_bias_fires_on_every_window_and_nms_merges_them() {
    let mut model = HogModel::new(SvmWeights {
      weights: vec![0.0; 3780],
      bias: 2.0,
    })
    .unwrap();
    let frame = Frame::new(RgbImage::new(80, 140));
    let boxes = model.infer(&frame).unwrap();

    assert_eq!(boxes.len(), 1);
    let b = boxes[0];
    assert!((b.confidence - logistic(2.0)).abs() < 1e-6);
    assert!(b.x2() <= 80 && b.y2() <= 140);
    assert!(b.width > WINDOW_WIDTH);
  }

  #[test]
  fn negative_bias_finds_nobody() {
    let mut model = HogModel::new(SvmWeights {
      weights: vec![0.0; 3780],
      bias: -1.0,
    })
    .unwrap();
    assert!(model.infer(&Frame::new(RgbImage::new(64, 128))).unwrap().is_empty());
  }

  #[test]
  fn padding_is_clamped() {
    let b = BoundingBox {
      x: 2,
      y: 2,
      width: 50,
      height: 100,
      confidence: 0.8,
    };
    let padded = pad_box(&b, 0.1, 60, 200);
    assert_eq!((padded.x, padded.y), (0, 0));
    assert_eq!((padded.x2(), padded.y2()), (57, 112));
  }
}
