// 该文件是 Huaying （画影） 项目的一部分。
// src/model/pose.rs - 单人姿态关键点模型
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

//! ONNX 单人姿态模型（MoveNet 布局）。
//!
//! 输入为 `[1, S, S, 3]` 的 int32 RGB 张量，输出为 `[1, 1, K, 3]`，
//! 每个关键点依次为归一化的 `(y, x, score)`。人体框由可见关键点的外接矩形得到，
//! 置信度取可见关键点的平均分数。

use image::imageops;
use ndarray::Array4;
use ort::{session::Session, value::TensorRef};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, query_param,
  frame::Frame,
  model::{BoundingBox, Model},
};

const DEFAULT_INPUT_SIZE: u32 = 192;
const VISIBILITY_THRESHOLD: f32 = 0.5;
const MIN_VISIBLE_LANDMARKS: usize = 5;
/// 外扩比例，相对整帧尺寸
const FRAME_PADDING: f32 = 0.1;

#[derive(Error, Debug)]
pub enum PoseModelError {
  #[error("URI scheme 不匹配")]
  SchemeMismatch,
  #[error("ONNX Runtime 错误: {0}")]
  Runtime(String),
  #[error("输出张量形状异常: {0:?}")]
  OutputShape(Vec<i64>),
  #[error("输入张量构造失败: {0}")]
  Shape(#[from] ndarray::ShapeError),
}

fn runtime<E: std::fmt::Display>(e: E) -> PoseModelError {
  PoseModelError::Runtime(e.to_string())
}

/// 像素坐标下的关键点
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
  pub x: f32,
  pub y: f32,
  pub visibility: f32,
}

/// 由可见关键点计算人体框；可见关键点不足时返回 `None`
pub fn landmarks_to_bbox(landmarks: &[Landmark], width: u32, height: u32) -> Option<BoundingBox> {
  let visible: Vec<&Landmark> = landmarks
    .iter()
    .filter(|l| l.visibility > VISIBILITY_THRESHOLD)
    .collect();
  if visible.len() < MIN_VISIBLE_LANDMARKS {
    return None;
  }

  let (mut min_x, mut min_y) = (f32::MAX, f32::MAX);
  let (mut max_x, mut max_y) = (f32::MIN, f32::MIN);
  for l in &visible {
    min_x = min_x.min(l.x);
    min_y = min_y.min(l.y);
    max_x = max_x.max(l.x);
    max_y = max_y.max(l.y);
  }

  let pad_x = width as f32 * FRAME_PADDING;
  let pad_y = height as f32 * FRAME_PADDING;
  let confidence = visible.iter().map(|l| l.visibility).sum::<f32>() / visible.len() as f32;

  BoundingBox::from_corners(
    min_x - pad_x,
    min_y - pad_y,
    max_x + pad_x,
    max_y + pad_y,
    confidence,
    width,
    height,
  )
}

pub struct PoseModel {
  session: Session,
  input_size: u32,
}

impl FromUrlWithScheme for PoseModel {
  const SCHEME: &'static str = "pose";
}

impl FromUrl for PoseModel {
  type Error = PoseModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(PoseModelError::SchemeMismatch);
    }

    let path = url.path();
    let input_size = query_param::<u32>(url, "size").unwrap_or(DEFAULT_INPUT_SIZE);
    info!("加载姿态模型: {} (输入 {}x{})", path, input_size, input_size);

    let session = Session::builder()
      .map_err(runtime)?
      .commit_from_file(path)
      .map_err(runtime)?;
    info!("姿态模型加载完成");

    Ok(Self {
      session,
      input_size,
    })
  }
}

impl Model for PoseModel {
  type Error = PoseModelError;

  fn name(&self) -> &'static str {
    "Pose"
  }

  fn infer(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, Self::Error> {
    let size = self.input_size;
    let resized = imageops::resize(frame.image(), size, size, imageops::FilterType::Triangle);
    let data: Vec<i32> = resized.as_raw().iter().map(|&v| v as i32).collect();
    let input = Array4::from_shape_vec((1, size as usize, size as usize, 3), data)?;

    let outputs = self
      .session
      .run(ort::inputs![TensorRef::from_array_view(&input).map_err(runtime)?])
      .map_err(runtime)?;
    let (shape, values) = outputs[0].try_extract_tensor::<f32>().map_err(runtime)?;

    let dims: Vec<i64> = shape.iter().copied().collect();
    if dims.last() != Some(&3) || values.len() % 3 != 0 {
      return Err(PoseModelError::OutputShape(dims));
    }

    let (width, height) = (frame.width() as f32, frame.height() as f32);
    let landmarks: Vec<Landmark> = values
      .chunks_exact(3)
      .map(|kp| Landmark {
        x: kp[1] * width,
        y: kp[0] * height,
        visibility: kp[2],
      })
      .collect();
    debug!("姿态模型输出 {} 个关键点", landmarks.len());

    Ok(
      landmarks_to_bbox(&landmarks, frame.width(), frame.height())
        .into_iter()
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn lm(x: f32, y: f32, visibility: f32) -> Landmark {
    Landmark { x, y, visibility }
  }

  #[test]
  fn too_few_visible_landmarks() {
    let landmarks = vec![
      lm(10.0, 10.0, 0.9),
      lm(20.0, 20.0, 0.9),
      lm(30.0, 30.0, 0.9),
      lm(40.0, 40.0, 0.9),
      lm(50.0, 50.0, 0.4),
      lm(60.0, 60.0, 0.5),
    ];
    assert!(landmarks_to_bbox(&landmarks, 200, 100).is_none());
  }

  #[test]
  fn bbox_covers_visible_landmarks_with_frame_padding() {
    let landmarks = vec![
      lm(50.0, 20.0, 0.8),
      lm(60.0, 30.0, 0.6),
      lm(70.0, 40.0, 1.0),
      lm(80.0, 50.0, 0.7),
      lm(90.0, 60.0, 0.9),
      lm(190.0, 95.0, 0.1),
    ];
    let b = landmarks_to_bbox(&landmarks, 200, 100).unwrap();
    assert_eq!((b.x, b.y), (30, 10));
    assert_eq!((b.x2(), b.y2()), (110, 70));
    assert!((b.confidence - 0.8).abs() < 1e-6);
  }

  #[test]
  fn bbox_is_clamped_at_frame_edges() {
    let landmarks: Vec<Landmark> = (0..5).map(|i| lm(i as f32, 99.0 - i as f32, 0.9)).collect();
    let b = landmarks_to_bbox(&landmarks, 100, 100).unwrap();
    assert_eq!((b.x, b.y), (0, 85));
    assert_eq!((b.x2(), b.y2()), (14, 100));
  }
}
