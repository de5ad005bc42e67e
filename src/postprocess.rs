// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/postprocess.rs - 检测结果后处理
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
use tracing::debug;

use crate::detection::{Detection, DetectionSet, ImageDimensions};

const DEFAULT_MIN_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.5;

/// 置信度过滤，保留 `confidence >= min_confidence` 的检测结果
pub fn filter_by_confidence(detections: &[Detection], min_confidence: f32) -> Vec<Detection> {
  detections
    .iter()
    .filter(|d| d.confidence >= min_confidence)
    .cloned()
    .collect()
}

/// 边界校验，丢弃超出图像范围或退化的检测结果（不做修正）
pub fn validate_bounds(detections: &[Detection], dimensions: ImageDimensions) -> Vec<Detection> {
  detections
    .iter()
    .filter(|d| {
      let valid = d.fits_within(dimensions);
      if !valid {
        debug!(
          "丢弃越界检测: {} bbox={:?} center={:?}",
          d.class_name, d.bbox, d.center_point
        );
      }
      valid
    })
    .cloned()
    .collect()
}

/// 最小尺寸过滤，宽高都不小于 `min_part_size` 才保留
pub fn filter_by_size(detections: &[Detection], min_part_size: f32) -> Vec<Detection> {
  detections
    .iter()
    .filter(|d| d.bbox.width() >= min_part_size && d.bbox.height() >= min_part_size)
    .cloned()
    .collect()
}

/// 按类别的非极大值抑制
///
/// 按置信度降序稳定排序（同分保持输入顺序），依次保留；
/// 与已保留的同类检测 IoU 大于阈值的候选被抑制，不同类别之间互不抑制。
pub fn non_max_suppression(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
  let mut sorted = detections.to_vec();
  sorted.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut kept: Vec<Detection> = Vec::with_capacity(sorted.len());
  for det in sorted {
    let suppressed = kept
      .iter()
      .any(|k| k.class_name == det.class_name && k.bbox.iou(&det.bbox) > iou_threshold);
    if suppressed {
      debug!("NMS 抑制: {} ({:.3})", det.class_name, det.confidence);
    } else {
      kept.push(det);
    }
  }

  kept
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
  /// 最低置信度 (0.0 - 1.0)
  pub min_confidence: f32,
  /// NMS IoU 阈值 (0.0 - 1.0)
  pub iou_threshold: f32,
  pub enable_nms: bool,
  /// 最小部件尺寸（像素），0 表示不限制
  pub min_part_size: f32,
}

impl Default for PostProcessConfig {
  fn default() -> Self {
    Self {
      min_confidence: DEFAULT_MIN_CONFIDENCE,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      enable_nms: true,
      min_part_size: 0.0,
    }
  }
}

/// 各步骤之后剩余的检测数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessReport {
  pub raw: usize,
  pub after_confidence: usize,
  pub after_bounds: usize,
  pub after_size: usize,
  pub after_nms: usize,
}

pub struct PostProcessor {
  config: PostProcessConfig,
}

impl PostProcessor {
  pub fn new(config: PostProcessConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &PostProcessConfig {
    &self.config
  }

  /// 依次执行 置信度过滤 → 边界校验 → 尺寸过滤 → NMS
  pub fn process(&self, raw: DetectionSet) -> (DetectionSet, PostProcessReport) {
    let mut report = PostProcessReport {
      raw: raw.len(),
      ..Default::default()
    };

    let detections = filter_by_confidence(&raw.detections, self.config.min_confidence);
    report.after_confidence = detections.len();

    let detections = validate_bounds(&detections, raw.dimensions);
    report.after_bounds = detections.len();

    let detections = if self.config.min_part_size > 0.0 {
      filter_by_size(&detections, self.config.min_part_size)
    } else {
      detections
    };
    report.after_size = detections.len();

    let detections = if self.config.enable_nms {
      non_max_suppression(&detections, self.config.iou_threshold)
    } else {
      detections
    };
    report.after_nms = detections.len();

    debug!("后处理统计: {:?}", report);

    (raw.with_detections(detections), report)
  }
}

impl Default for PostProcessor {
  fn default() -> Self {
    Self::new(PostProcessConfig::default())
  }
}
