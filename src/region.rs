// 该文件是 Huaying （画影） 项目的一部分。
// src/region.rs - 拍摄区域选取
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

use image::{Rgb, RgbImage, imageops};
use tracing::debug;

use crate::{config::CaptureConfig, frame::Frame, model::BoundingBox};

/// 以检测框中心为基准放大 `scale` 倍，并裁剪到画面内
///
/// 原检测框位于画面内时，结果一定包含原检测框。
pub fn scale_bbox(bbox: &BoundingBox, scale: f64, width: u32, height: u32) -> BoundingBox {
  let scale = scale.max(1.0);
  let cx = bbox.x as f64 + bbox.width as f64 / 2.0;
  let cy = bbox.y as f64 + bbox.height as f64 / 2.0;
  let half_w = bbox.width as f64 * scale / 2.0;
  let half_h = bbox.height as f64 * scale / 2.0;

  BoundingBox::from_corners(
    (cx - half_w).floor() as f32,
    (cy - half_h).floor() as f32,
    (cx + half_w).ceil() as f32,
    (cy + half_h).ceil() as f32,
    bbox.confidence,
    width,
    height,
  )
  .unwrap_or(*bbox)
}

/// 检测框面积占整帧的比例
pub fn area_ratio(bbox: &BoundingBox, frame: &Frame) -> f64 {
  let area = frame.area();
  if area == 0 {
    return 0.0;
  }
  bbox.area() as f64 / area as f64
}

pub fn crop(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
  let (width, height) = image.dimensions();
  let x = bbox.x.min(width);
  let y = bbox.y.min(height);
  let w = bbox.width.min(width - x);
  let h = bbox.height.min(height - y);
  imageops::crop_imm(image, x, y, w, h).to_image()
}

/// 四周填充 `padding` 像素的纯色边框
pub fn pad(image: &RgbImage, padding: u32, fill: [u8; 3]) -> RgbImage {
  let (width, height) = image.dimensions();
  let mut padded = RgbImage::from_pixel(width + 2 * padding, height + 2 * padding, Rgb(fill));
  imageops::replace(&mut padded, image, padding as i64, padding as i64);
  padded
}

/// 根据配置从最终帧中选出要上传的区域
///
/// 使用整帧或没有检测框时返回整帧；否则取检测框（过小时先放大），裁剪后加边框。
pub fn select_region(
  frame: &Frame,
  detection: Option<&BoundingBox>,
  config: &CaptureConfig,
) -> RgbImage {
  let bbox = match detection {
    Some(bbox) if !config.use_full_frame => bbox,
    _ => return frame.image().clone(),
  };

  let ratio = area_ratio(bbox, frame);
  let bbox = if ratio < config.min_bbox_area_ratio {
    debug!("检测区域过小 ({:.3}), 放大 {} 倍", ratio, config.bbox_scale_up);
    scale_bbox(bbox, config.bbox_scale_up, frame.width(), frame.height())
  } else {
    *bbox
  };

  pad(
    &crop(frame.image(), &bbox),
    config.crop_padding,
    config.crop_fill,
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn bbox(x: u32, y: u32, width: u32, height: u32) -> BoundingBox {
    BoundingBox {
      x,
      y,
      width,
      height,
      confidence: 0.9,
    }
  }

  #[test]
  fn scaled_box_grows_and_stays_inside_frame() {
    let (w, h) = (640, 480);
    let cases = [
      bbox(300, 200, 40, 80),
      bbox(0, 0, 50, 50),
      bbox(600, 400, 40, 80),
      bbox(10, 300, 200, 179),
      bbox(0, 0, 640, 480),
    ];
    for original in cases {
      for scale in [1.0, 1.3, 1.5, 3.0] {
        let scaled = scale_bbox(&original, scale, w, h);
        assert!(scaled.area() >= original.area(), "{original:?} x{scale}");
        assert!(scaled.x2() <= w && scaled.y2() <= h, "{scaled:?}");
        assert!(scaled.x <= original.x && scaled.y <= original.y);
        assert!(scaled.x2() >= original.x2() && scaled.y2() >= original.y2());
      }
    }
  }

  #[test]
  fn centered_box_scales_symmetrically() {
    let scaled = scale_bbox(&bbox(100, 100, 100, 100), 1.5, 1000, 1000);
    assert_eq!((scaled.x, scaled.y, scaled.width, scaled.height), (75, 75, 150, 150));
  }

  #[test]
  fn padding_surrounds_crop_with_fill() {
    let image = RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]));
    let padded = pad(&image, 10, [255, 255, 255]);
    assert_eq!(padded.dimensions(), (24, 23));
    assert_eq!(padded.get_pixel(0, 0).0, [255, 255, 255]);
    assert_eq!(padded.get_pixel(10, 10).0, [10, 20, 30]);
    assert_eq!(padded.get_pixel(13, 12).0, [10, 20, 30]);
    assert_eq!(padded.get_pixel(14, 12).0, [255, 255, 255]);
  }

  #[test]
  fn full_frame_ignores_detection() {
    let frame = Frame::new(RgbImage::new(64, 48));
    let config = CaptureConfig {
      use_full_frame: true,
      ..CaptureConfig::default()
    };
    let region = select_region(&frame, Some(&bbox(0, 0, 8, 8)), &config);
    assert_eq!(region.dimensions(), (64, 48));
  }

  #[test]
  fn small_detection_is_enlarged_before_crop() {
    let frame = Frame::new(RgbImage::new(100, 100));
    let config = CaptureConfig::default();

    // 20x20 占比 0.04 < 0.15，放大 1.5 倍为 30x30，再加 10 像素边框
    let region = select_region(&frame, Some(&bbox(40, 40, 20, 20)), &config);
    assert_eq!(region.dimensions(), (50, 50));

    // 50x50 占比 0.25，不放大
    let region = select_region(&frame, Some(&bbox(10, 10, 50, 50)), &config);
    assert_eq!(region.dimensions(), (70, 70));
  }
}
