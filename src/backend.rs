// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/backend.rs - 外部推理后端接口
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
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use url::Url;

use crate::detection::DetectionSet;
use crate::prompt::PromptSet;
use crate::{FromUrl, FromUrlWithScheme};

mod fixed;
mod script;

pub use self::fixed::FixedLabelClassifier;
pub use self::script::ScriptBackend;

#[derive(Error, Debug)]
pub enum BackendError {
  #[error("后端进程无法启动: {0}")]
  Spawn(std::io::Error),
  #[error("后端调用超时: {0:?}")]
  Timeout(Duration),
  #[error("后端进程异常退出 (退出码 {code:?}): {stderr}")]
  Failed { code: Option<i32>, stderr: String },
  #[error("后端输出解析错误: {0}")]
  Decode(#[from] serde_json::Error),
  #[error("后端输出无效: {0}")]
  InvalidOutput(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("后端地址参数错误: {0}")]
  InvalidUrl(String),
}

impl BackendError {
  /// 机器可读的错误原因
  pub fn code(&self) -> &'static str {
    match self {
      BackendError::Spawn(_) => "backend_spawn",
      BackendError::Timeout(_) => "backend_timeout",
      BackendError::Failed { .. } => "backend_failed",
      BackendError::Decode(_) => "backend_decode",
      BackendError::InvalidOutput(_) => "backend_invalid_output",
      BackendError::Io(_) => "backend_io",
      BackendError::SchemeMismatch(_) | BackendError::InvalidUrl(_) => "backend_config",
    }
  }
}

/// 分类后端的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
  pub label: String,
}

/// 一次分割调用：原图、提示集合、期望的掩码输出位置
#[derive(Debug, Clone, Serialize)]
pub struct SegmentRequest {
  pub image_path: PathBuf,
  pub prompts: PromptSet,
  pub output_path: PathBuf,
}

/// 判断图像中是否有车
pub trait Classifier: Send + Sync {
  fn name(&self) -> &str;
  fn classify(&self, image: &[u8]) -> Result<Classification, BackendError>;
}

/// 部件检测，返回未经后处理的检测结果，必须带图像尺寸
pub trait Detector: Send + Sync {
  fn name(&self) -> &str;
  fn detect(&self, image_path: &Path) -> Result<DetectionSet, BackendError>;
}

/// 可提示分割，返回实际写出的掩码路径
pub trait Segmenter: Send + Sync {
  fn name(&self) -> &str;
  fn segment(&self, request: &SegmentRequest) -> Result<PathBuf, BackendError>;
}

/// 在独立线程中调用后端，超过 `timeout` 即返回 [`BackendError::Timeout`]
///
/// 超时后工作线程不会被强制结束，其结果被丢弃。
pub fn call_with_timeout<T, F>(timeout: Duration, f: F) -> Result<T, BackendError>
where
  T: Send + 'static,
  F: FnOnce() -> Result<T, BackendError> + Send + 'static,
{
  let (tx, rx) = mpsc::channel();
  thread::Builder::new()
    .name("gaizhuang-backend".to_string())
    .spawn(move || {
      let _ = tx.send(f());
    })
    .map_err(BackendError::Spawn)?;

  match rx.recv_timeout(timeout) {
    Ok(result) => result,
    Err(mpsc::RecvTimeoutError::Timeout) => {
      warn!("后端调用超过 {:?}，放弃等待", timeout);
      Err(BackendError::Timeout(timeout))
    }
    Err(mpsc::RecvTimeoutError::Disconnected) => {
      error!("后端调用线程异常终止");
      Err(BackendError::InvalidOutput("后端调用线程异常终止".to_string()))
    }
  }
}

pub fn classifier_from_url(url: &Url) -> Result<Arc<dyn Classifier>, BackendError> {
  match url.scheme() {
    ScriptBackend::SCHEME => Ok(Arc::new(ScriptBackend::from_url(url)?)),
    FixedLabelClassifier::SCHEME => Ok(Arc::new(FixedLabelClassifier::from_url(url)?)),
    other => Err(BackendError::SchemeMismatch(other.to_string())),
  }
}

pub fn detector_from_url(url: &Url) -> Result<Arc<dyn Detector>, BackendError> {
  match url.scheme() {
    ScriptBackend::SCHEME => Ok(Arc::new(ScriptBackend::from_url(url)?)),
    other => Err(BackendError::SchemeMismatch(other.to_string())),
  }
}

pub fn segmenter_from_url(url: &Url) -> Result<Arc<dyn Segmenter>, BackendError> {
  match url.scheme() {
    ScriptBackend::SCHEME => Ok(Arc::new(ScriptBackend::from_url(url)?)),
    other => Err(BackendError::SchemeMismatch(other.to_string())),
  }
}
