// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/manifest.rs - 运行结果清单
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

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::composite::AppliedReference;
use crate::detection::{Detection, ImageDimensions};
use crate::postprocess::PostProcessReport;
use crate::segment::SegmentedPart;
use crate::workspace::RunId;

#[derive(Error, Debug)]
pub enum ManifestError {
  #[error("无法读取清单 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("清单格式错误: {0}")]
  Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationSummary {
  pub attempted: usize,
  pub succeeded: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
  pub total_detections: usize,
  pub total_segments: usize,
  pub image_dimensions: ImageDimensions,
  pub processing_time_ms: u64,
  pub model: String,
  pub segmentation: SegmentationSummary,
  pub postprocess: PostProcessReport,
}

/// 一次成功运行的全部产物地址与检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
  pub run_id: RunId,
  pub detected_parts: Vec<Detection>,
  pub segmented_parts: Vec<SegmentedPart>,
  pub original_image_url: String,
  pub annotated_image_url: String,
  pub stitched_image_url: Option<String>,
  pub applied_references: Vec<AppliedReference>,
  pub warnings: Vec<String>,
  pub metadata: ManifestMetadata,
}

impl Manifest {
  pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
    Ok(serde_json::to_vec_pretty(self)?)
  }

  pub fn load(path: &Path) -> Result<Self, ManifestError> {
    let data = std::fs::read(path).map_err(|source| ManifestError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Ok(serde_json::from_slice(&data)?)
  }
}

/// 把 `/` 开头的产物地址解析为产物根目录下的路径
pub fn resolve_url(root: &Path, url: &str) -> PathBuf {
  url
    .trim_start_matches('/')
    .split('/')
    .filter(|part| !part.is_empty())
    .fold(root.to_path_buf(), |path, part| path.join(part))
}
