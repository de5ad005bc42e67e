// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/detection.rs - 检测结果模型
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

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
  #[error("部件类别名称不能为空")]
  EmptyClassName,
}

/// 部件类别名称
///
/// 类别词表由外部检测模型决定（rim、headlight-left、front-bumper 等），
/// 因此这里只保证名称非空，不做枚举限制。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartClass(String);

impl PartClass {
  pub fn new(name: impl AsRef<str>) -> Result<Self, DetectionError> {
    let name = name.as_ref().trim();
    if name.is_empty() {
      return Err(DetectionError::EmptyClassName);
    }
    Ok(PartClass(name.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// 可用于文件名的类别标识，非 `[A-Za-z0-9-_]` 字符替换为 `_`
  pub fn slug(&self) -> String {
    self
      .0
      .chars()
      .map(|c| {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
          c
        } else {
          '_'
        }
      })
      .collect()
  }
}

impl TryFrom<String> for PartClass {
  type Error = DetectionError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    PartClass::new(value)
  }
}

impl From<PartClass> for String {
  fn from(value: PartClass) -> Self {
    value.0
  }
}

impl FromStr for PartClass {
  type Err = DetectionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    PartClass::new(s)
  }
}

impl fmt::Display for PartClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// 像素坐标下的轴对齐边界框，序列化为 `[x1, y1, x2, y2]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

impl BoundingBox {
  pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
    Self { x1, y1, x2, y2 }
  }

  pub fn width(&self) -> f32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> f32 {
    self.y2 - self.y1
  }

  pub fn area(&self) -> f32 {
    self.width().max(0.0) * self.height().max(0.0)
  }

  pub fn centroid(&self) -> Point {
    Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
  }

  pub fn is_degenerate(&self) -> bool {
    !(self.x1 < self.x2 && self.y1 < self.y2)
  }

  pub fn contains(&self, point: Point) -> bool {
    point.x >= self.x1 && point.x <= self.x2 && point.y >= self.y1 && point.y <= self.y2
  }

  /// 计算两个边界框的 IoU，并集为零时返回 0
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let x1 = self.x1.max(other.x1);
    let y1 = self.y1.max(other.y1);
    let x2 = self.x2.min(other.x2);
    let y2 = self.y2.min(other.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

impl From<[f32; 4]> for BoundingBox {
  fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
    BoundingBox { x1, y1, x2, y2 }
  }
}

impl From<BoundingBox> for [f32; 4] {
  fn from(bbox: BoundingBox) -> Self {
    [bbox.x1, bbox.y1, bbox.x2, bbox.y2]
  }
}

/// 像素坐标点，序列化为 `[x, y]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 2]", into = "[f32; 2]")]
pub struct Point {
  pub x: f32,
  pub y: f32,
}

impl Point {
  pub fn new(x: f32, y: f32) -> Self {
    Self { x, y }
  }
}

impl From<[f32; 2]> for Point {
  fn from([x, y]: [f32; 2]) -> Self {
    Point { x, y }
  }
}

impl From<Point> for [f32; 2] {
  fn from(point: Point) -> Self {
    [point.x, point.y]
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
  pub width: u32,
  pub height: u32,
}

impl ImageDimensions {
  pub fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  pub fn area(&self) -> u64 {
    self.width as u64 * self.height as u64
  }
}

/// 单个检测到的部件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub class_name: PartClass,
  pub confidence: f32,
  pub bbox: BoundingBox,
  pub center_point: Point,
}

impl Detection {
  /// 创建检测结果，中心点取边界框质心
  pub fn new(class_name: PartClass, confidence: f32, bbox: BoundingBox) -> Self {
    Self {
      class_name,
      confidence,
      center_point: bbox.centroid(),
      bbox,
    }
  }

  /// 使用检测器给出的中心点
  pub fn with_center(mut self, center_point: Point) -> Self {
    self.center_point = center_point;
    self
  }

  /// 边界框与中心点是否都落在图像范围内且边界框非退化
  ///
  /// 边界框允许贴合图像边缘（`x2 == width`），中心点必须严格位于
  /// `[0, width) × [0, height)` 内，并且落在边界框之中。
  pub fn fits_within(&self, dimensions: ImageDimensions) -> bool {
    let (w, h) = (dimensions.width as f32, dimensions.height as f32);
    let BoundingBox { x1, y1, x2, y2 } = self.bbox;
    let Point { x: cx, y: cy } = self.center_point;

    let valid_bbox = x1 >= 0.0 && y1 >= 0.0 && x2 <= w && y2 <= h && x1 < x2 && y1 < y2;
    let valid_center =
      cx >= 0.0 && cy >= 0.0 && cx < w && cy < h && self.bbox.contains(self.center_point);

    valid_bbox && valid_center
  }
}

/// 一张图像的检测结果及元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
  pub detections: Vec<Detection>,
  pub dimensions: ImageDimensions,
  pub model: String,
  pub detected_at: DateTime<Utc>,
}

impl DetectionSet {
  pub fn new(dimensions: ImageDimensions, model: impl Into<String>) -> Self {
    Self {
      detections: Vec::new(),
      dimensions,
      model: model.into(),
      detected_at: Utc::now(),
    }
  }

  pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
    self.detections = detections;
    self
  }

  pub fn len(&self) -> usize {
    self.detections.len()
  }

  pub fn is_empty(&self) -> bool {
    self.detections.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.detections.iter()
  }

  /// 所有检测结果都符合记录的图像尺寸
  pub fn is_consistent(&self) -> bool {
    self.detections.iter().all(|d| d.fits_within(self.dimensions))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn part_class_rejects_blank_names() {
    assert_eq!(PartClass::new("   "), Err(DetectionError::EmptyClassName));
    assert_eq!(PartClass::new(" rim ").unwrap().as_str(), "rim");
  }

  #[test]
  fn part_class_slug_is_filename_safe() {
    let class = PartClass::new("Headlight - -L-").unwrap();
    assert_eq!(class.slug(), "Headlight_-_-L-");
  }

  #[test]
  fn detection_derives_centroid() {
    let det = Detection::new(
      PartClass::new("rim").unwrap(),
      0.8,
      BoundingBox::new(10.0, 20.0, 30.0, 60.0),
    );
    assert_eq!(det.center_point, Point::new(20.0, 40.0));
    assert!(det.bbox.contains(det.center_point));
  }

  #[test]
  fn detection_serializes_as_arrays() {
    let det = Detection::new(
      PartClass::new("hood").unwrap(),
      0.5,
      BoundingBox::new(1.0, 2.0, 3.0, 4.0),
    );
    let value = serde_json::to_value(&det).unwrap();
    assert_eq!(value["class_name"], "hood");
    assert_eq!(value["bbox"], serde_json::json!([1.0, 2.0, 3.0, 4.0]));
    assert_eq!(value["center_point"], serde_json::json!([2.0, 3.0]));

    let back: Detection = serde_json::from_value(value).unwrap();
    assert_eq!(back, det);
  }

  #[test]
  fn empty_class_name_fails_to_decode() {
    let raw = r#"{"class_name":"","confidence":0.4,"bbox":[0,0,1,1],"center_point":[0.5,0.5]}"#;
    assert!(serde_json::from_str::<Detection>(raw).is_err());
  }

  #[test]
  fn fits_within_checks_box_and_center() {
    let dims = ImageDimensions::new(100, 50);
    let class = PartClass::new("spoiler").unwrap();

    let edge = Detection::new(class.clone(), 0.9, BoundingBox::new(0.0, 0.0, 100.0, 50.0));
    assert!(edge.fits_within(dims));

    let outside = Detection::new(class.clone(), 0.9, BoundingBox::new(0.0, 0.0, 101.0, 50.0));
    assert!(!outside.fits_within(dims));

    let degenerate = Detection::new(class.clone(), 0.9, BoundingBox::new(5.0, 5.0, 5.0, 10.0));
    assert!(!degenerate.fits_within(dims));

    let bad_center = Detection::new(class.clone(), 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0))
      .with_center(Point::new(100.0, 5.0));
    assert!(!bad_center.fits_within(dims));

    // 中心点在图像内但不在边界框内
    let stray_center = Detection::new(class, 0.9, BoundingBox::new(10.0, 10.0, 20.0, 20.0))
      .with_center(Point::new(90.0, 40.0));
    assert!(!stray_center.fits_within(dims));
  }
}
