// 该文件是 Huaying （画影） 项目的一部分。
// src/model.rs - 人体检测模型
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

use std::fmt::Display;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{FromUrl, frame::Frame};

mod hog;
pub use self::hog::{HogModel, HogModelError};

#[cfg(feature = "pose_detector")]
mod pose;
#[cfg(feature = "pose_detector")]
pub use self::pose::{PoseModel, PoseModelError};

/// 检测框，坐标为像素，`(x, y)` 为左上角
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
  pub confidence: f32,
}

impl BoundingBox {
  pub fn x2(&self) -> u32 {
    self.x + self.width
  }

  pub fn y2(&self) -> u32 {
    self.y + self.height
  }

  pub fn area(&self) -> u64 {
    self.width as u64 * self.height as u64
  }

  /// 交并比
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let ix = self.x2().min(other.x2()).saturating_sub(self.x.max(other.x));
    let iy = self.y2().min(other.y2()).saturating_sub(self.y.max(other.y));
    let inter = ix as u64 * iy as u64;
    let union = self.area() + other.area() - inter;
    if union == 0 {
      0.0
    } else {
      inter as f32 / union as f32
    }
  }

  /// 由浮点角点构造，并裁剪到 `width × height` 的画面内
  pub fn from_corners(
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
    width: u32,
    height: u32,
  ) -> Option<Self> {
    let x1 = x1.max(0.0).min(width as f32) as u32;
    let y1 = y1.max(0.0).min(height as f32) as u32;
    let x2 = x2.max(0.0).min(width as f32) as u32;
    let y2 = y2.max(0.0).min(height as f32) as u32;
    if x2 <= x1 || y2 <= y1 {
      return None;
    }
    Some(Self {
      x: x1,
      y: y1,
      width: x2 - x1,
      height: y2 - y1,
      confidence,
    })
  }
}

/// 人体检测模型
pub trait Model {
  type Error: Display;

  fn name(&self) -> &'static str;

  /// 检测一帧中的人体，返回顺序不作保证
  fn infer(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, Self::Error>;
}

/// 非极大值抑制，输入按置信度降序排列后保留互不重叠的框
pub fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
  boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
  let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
  for candidate in boxes {
    if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
      kept.push(candidate);
    }
  }
  kept
}

/// 带置信度过滤的检测器，检测失败时记录日志并视为没有检测到人
pub struct PersonDetector<M> {
  model: M,
  min_confidence: f32,
}

impl<M: Model> PersonDetector<M> {
  pub fn new(model: M, min_confidence: f32) -> Self {
    Self {
      model,
      min_confidence,
    }
  }

  pub fn name(&self) -> &'static str {
    self.model.name()
  }

  /// 返回置信度不低于阈值的检测框，按置信度降序
  pub fn detect(&mut self, frame: &Frame) -> Vec<BoundingBox> {
    let mut boxes = match self.model.infer(frame) {
      Ok(boxes) => boxes,
      Err(e) => {
        error!("{} 检测失败: {}", self.model.name(), e);
        return Vec::new();
      }
    };
    boxes.retain(|b| b.confidence >= self.min_confidence);
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    if let Some(best) = boxes.first() {
      debug!(
        "{} 检测到 {} 人, 最高置信度 {:.2}",
        self.model.name(),
        boxes.len(),
        best.confidence
      );
    }
    boxes
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[cfg(feature = "pose_detector")]
  #[error("姿态模型错误: {0}")]
  PoseModelError(#[from] PoseModelError),
  #[error("HOG 模型错误: {0}")]
  HogModelError(#[from] HogModelError),
  #[error("URI scheme 不匹配")]
  SchemeMismatch,
}

/// 进程内唯一的检测器实现，启动时确定
pub enum DetectorWrapper {
  #[cfg(feature = "pose_detector")]
  Pose(PoseModel),
  Hog(HogModel),
}

impl FromUrl for DetectorWrapper {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    #[cfg(feature = "pose_detector")]
    {
      if url.scheme() == PoseModel::SCHEME {
        return Ok(DetectorWrapper::Pose(PoseModel::from_url(url)?));
      }
    }
    if url.scheme() == HogModel::SCHEME {
      return Ok(DetectorWrapper::Hog(HogModel::from_url(url)?));
    }
    Err(ModelError::SchemeMismatch)
  }
}

impl DetectorWrapper {
  /// 优先加载首选模型，失败时回退到备用模型
  pub fn select(preferred: Option<&Url>, fallback: &Url) -> Result<Self, ModelError> {
    if let Some(url) = preferred {
      match Self::from_url(url) {
        Ok(detector) => {
          info!("使用 {} 检测器", detector.name());
          return Ok(detector);
        }
        Err(e) => warn!("首选检测器初始化失败, 回退到 {}: {}", fallback, e),
      }
    }
    let detector = Self::from_url(fallback)?;
    info!("使用 {} 检测器", detector.name());
    Ok(detector)
  }
}

impl Model for DetectorWrapper {
  type Error = ModelError;

  fn name(&self) -> &'static str {
    match self {
      #[cfg(feature = "pose_detector")]
      DetectorWrapper::Pose(model) => model.name(),
      DetectorWrapper::Hog(model) => model.name(),
    }
  }

  fn infer(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, Self::Error> {
    match self {
      #[cfg(feature = "pose_detector")]
      DetectorWrapper::Pose(model) => Ok(model.infer(frame)?),
      DetectorWrapper::Hog(model) => Ok(model.infer(frame)?),
    }
  }
}
