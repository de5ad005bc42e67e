// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/config.rs - 流水线配置
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
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::composite::CompositeConfig;
use crate::postprocess::PostProcessConfig;

/// 默认上传大小上限：20 MiB
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("配置文件格式错误: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
}

/// 各后端调用的超时（秒）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
  pub classify_secs: f64,
  pub detect_secs: f64,
  pub segment_secs: f64,
}

impl Default for TimeoutConfig {
  fn default() -> Self {
    Self {
      classify_secs: 30.0,
      detect_secs: 120.0,
      segment_secs: 120.0,
    }
  }
}

impl TimeoutConfig {
  pub fn classify(&self) -> Duration {
    Duration::from_secs_f64(self.classify_secs)
  }

  pub fn detect(&self) -> Duration {
    Duration::from_secs_f64(self.detect_secs)
  }

  pub fn segment(&self) -> Duration {
    Duration::from_secs_f64(self.segment_secs)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// 产物根目录
  pub artifact_root: PathBuf,
  pub max_upload_bytes: usize,
  /// 被视为“车”的分类标签，忽略大小写
  pub accepted_labels: Vec<String>,
  pub postprocess: PostProcessConfig,
  pub timeouts: TimeoutConfig,
  pub run_segmentation: bool,
  pub composite: CompositeConfig,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      artifact_root: PathBuf::from("public"),
      max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
      accepted_labels: vec!["car".to_string()],
      postprocess: PostProcessConfig::default(),
      timeouts: TimeoutConfig::default(),
      run_segmentation: true,
      composite: CompositeConfig::default(),
    }
  }
}

impl PipelineConfig {
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let data = std::fs::read(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let config: PipelineConfig = serde_json::from_slice(&data)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let timeouts = [
      ("classify_secs", self.timeouts.classify_secs),
      ("detect_secs", self.timeouts.detect_secs),
      ("segment_secs", self.timeouts.segment_secs),
    ];
    for (name, secs) in timeouts {
      if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::Invalid(format!("{} 必须为正数: {}", name, secs)));
      }
    }

    let post = &self.postprocess;
    if !(0.0..=1.0).contains(&post.min_confidence) {
      return Err(ConfigError::Invalid(format!(
        "min_confidence 超出 [0, 1]: {}",
        post.min_confidence
      )));
    }
    if !(0.0..=1.0).contains(&post.iou_threshold) {
      return Err(ConfigError::Invalid(format!(
        "iou_threshold 超出 [0, 1]: {}",
        post.iou_threshold
      )));
    }
    if self.max_upload_bytes == 0 {
      return Err(ConfigError::Invalid("max_upload_bytes 不能为 0".to_string()));
    }
    if self.accepted_labels.iter().all(|l| l.trim().is_empty()) {
      return Err(ConfigError::Invalid("accepted_labels 不能为空".to_string()));
    }
    Ok(())
  }

  /// 分类标签是否表示“车”：去掉首尾空白后与任一接受标签忽略大小写相等
  pub fn accepts_label(&self, label: &str) -> bool {
    let label = label.trim();
    self
      .accepted_labels
      .iter()
      .any(|accepted| accepted.trim().eq_ignore_ascii_case(label))
  }
}
