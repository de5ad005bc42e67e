// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/annotate.rs - 检测结果标注图
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

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detection::{Detection, PartClass};

const PALETTE_SIZE: usize = 24;

/// 在原图上绘制检测框
pub struct Annotator {
  colors: Vec<Rgb<u8>>,
}

impl Default for Annotator {
  fn default() -> Self {
    Self::new()
  }
}

impl Annotator {
  pub fn new() -> Self {
    let colors = (0..PALETTE_SIZE)
      .map(|i| {
        let hue = (i as f32 / PALETTE_SIZE as f32) * 360.0;
        hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();
    Self { colors }
  }

  /// 同一类别总是得到同一种颜色
  pub fn color_of(&self, class: &PartClass) -> Rgb<u8> {
    // FNV-1a
    let hash = class
      .as_str()
      .bytes()
      .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
      });
    self.colors[(hash % self.colors.len() as u64) as usize]
  }

  pub fn annotate(&self, image: &DynamicImage, detections: &[Detection]) -> DynamicImage {
    let mut canvas = image.to_rgb8();
    self.draw_detections(&mut canvas, detections);
    DynamicImage::ImageRgb8(canvas)
  }

  pub fn draw_detections(&self, image: &mut RgbImage, detections: &[Detection]) {
    let (img_w, img_h) = (image.width() as f32, image.height() as f32);

    for detection in detections {
      let color = self.color_of(&detection.class_name);
      let bbox = detection.bbox;

      let x1 = bbox.x1.clamp(0.0, img_w);
      let y1 = bbox.y1.clamp(0.0, img_h);
      let width = (bbox.x2.min(img_w) - x1).max(0.0) as u32;
      let height = (bbox.y2.min(img_h) - y1).max(0.0) as u32;
      if width == 0 || height == 0 {
        continue;
      }

      let (x, y) = (x1 as i32, y1 as i32);
      draw_hollow_rect_mut(image, Rect::at(x, y).of_size(width, height), color);

      // 第二层边框，加粗
      if width > 2 && height > 2 {
        let inner = Rect::at(x + 1, y + 1).of_size(width - 2, height - 2);
        draw_hollow_rect_mut(image, inner, color);
      }

      let center = detection.center_point;
      draw_cross_mut(image, color, center.x as i32, center.y as i32);
    }
  }
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = match h {
    h if h < 60.0 => (c, x, 0.0),
    h if h < 120.0 => (x, c, 0.0),
    h if h < 180.0 => (0.0, c, x),
    h if h < 240.0 => (0.0, x, c),
    h if h < 300.0 => (x, 0.0, c),
    _ => (c, 0.0, x),
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}
