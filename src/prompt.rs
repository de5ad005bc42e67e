// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/prompt.rs - 分割模型提示构建
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

use serde::{Deserialize, Serialize};

use crate::detection::{BoundingBox, Detection, PartClass, Point};

/// 点提示的标签，序列化为 1（前景）/ 0（背景）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PointLabel {
  Background,
  Foreground,
}

impl From<PointLabel> for u8 {
  fn from(label: PointLabel) -> Self {
    match label {
      PointLabel::Background => 0,
      PointLabel::Foreground => 1,
    }
  }
}

impl TryFrom<u8> for PointLabel {
  type Error = String;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(PointLabel::Background),
      1 => Ok(PointLabel::Foreground),
      other => Err(format!("未知的点提示标签: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SegmentPrompt {
  Point {
    #[serde(rename = "data")]
    point: Point,
    label: PointLabel,
  },
  Box {
    #[serde(rename = "data")]
    bbox: BoundingBox,
  },
}

/// 单个检测结果对应的提示集合：一个前景点提示加一个框提示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSet {
  pub detection_id: String,
  pub class_name: PartClass,
  pub confidence: f32,
  pub prompts: Vec<SegmentPrompt>,
}

pub fn detection_id(index: usize) -> String {
  format!("detection_{}", index)
}

/// 两种提示同时交给分割后端，由后端决定如何使用
pub fn build_prompts(index: usize, detection: &Detection) -> PromptSet {
  PromptSet {
    detection_id: detection_id(index),
    class_name: detection.class_name.clone(),
    confidence: detection.confidence,
    prompts: vec![
      SegmentPrompt::Point {
        point: detection.center_point,
        label: PointLabel::Foreground,
      },
      SegmentPrompt::Box {
        bbox: detection.bbox,
      },
    ],
  }
}

pub fn build_all(detections: &[Detection]) -> Vec<PromptSet> {
  detections
    .iter()
    .enumerate()
    .map(|(index, detection)| build_prompts(index, detection))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rim() -> Detection {
    Detection::new(
      PartClass::new("rim").unwrap(),
      0.75,
      BoundingBox::new(10.0, 20.0, 50.0, 80.0),
    )
    .with_center(Point::new(31.0, 52.0))
  }

  #[test]
  fn builds_point_then_box() {
    let set = build_prompts(3, &rim());
    assert_eq!(set.detection_id, "detection_3");
    assert_eq!(set.class_name.as_str(), "rim");
    assert_eq!(
      set.prompts,
      vec![
        SegmentPrompt::Point {
          point: Point::new(31.0, 52.0),
          label: PointLabel::Foreground,
        },
        SegmentPrompt::Box {
          bbox: BoundingBox::new(10.0, 20.0, 50.0, 80.0),
        },
      ]
    );
  }

  #[test]
  fn build_all_is_one_to_one() {
    let sets = build_all(&[rim(), rim(), rim()]);
    let ids: Vec<_> = sets.iter().map(|s| s.detection_id.as_str()).collect();
    assert_eq!(ids, ["detection_0", "detection_1", "detection_2"]);
    assert!(sets.iter().all(|s| s.prompts.len() == 2));
  }

  #[test]
  fn prompts_serialize_with_type_tag() {
    let value = serde_json::to_value(build_prompts(0, &rim()).prompts).unwrap();
    assert_eq!(
      value,
      serde_json::json!([
        { "type": "point", "data": [31.0, 52.0], "label": 1 },
        { "type": "box", "data": [10.0, 20.0, 50.0, 80.0] },
      ])
    );
  }
}
