// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/workspace.rs - 单次运行的产物工作区
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
use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::Utc;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::detection::PartClass;

const TMP_DIR: &str = "tmp";
const UPLOADS_DIR: &str = "uploads";
const OUTPUTS_DIR: &str = "outputs";
const SEGMENTS_DIR: &str = "segments";
const STITCHING_DIR: &str = "stitching_results";

#[derive(Error, Debug)]
pub enum WorkspaceError {
  #[error("I/O 错误 ({path}): {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("图像编码错误: {0}")]
  Image(#[from] image::ImageError),
}

impl WorkspaceError {
  fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    WorkspaceError::Io {
      path: path.into(),
      source,
    }
  }
}

/// 运行标识：UTC 时间戳加随机后缀，用于隔离并发运行的产物
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
  pub fn generate() -> Self {
    let suffix = Uuid::new_v4().simple().to_string();
    RunId(format!(
      "{}-{}",
      Utc::now().format("%Y%m%d%H%M%S%3f"),
      &suffix[..8]
    ))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RunId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// 一个产物文件：磁盘路径和返回给调用方的相对地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
  pub path: PathBuf,
  pub url: String,
}

/// 先写入同目录下的 `.part` 文件再重命名，避免留下写了一半的文件
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WorkspaceError> {
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;
  }

  let file_name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  let partial = path.with_file_name(format!(".{}.part", file_name));

  std::fs::write(&partial, bytes).map_err(|e| WorkspaceError::io(&partial, e))?;
  if let Err(e) = std::fs::rename(&partial, path) {
    let _ = std::fs::remove_file(&partial);
    return Err(WorkspaceError::io(path, e));
  }
  Ok(())
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, WorkspaceError> {
  let mut buffer = Cursor::new(Vec::new());
  image.write_to(&mut buffer, ImageFormat::Png)?;
  Ok(buffer.into_inner())
}

pub fn write_png_atomic(path: &Path, image: &DynamicImage) -> Result<(), WorkspaceError> {
  write_atomic(path, &encode_png(image)?)
}

/// 单次流水线运行的产物工作区
///
/// 临时输入放在 `<root>/tmp/` 下的独立目录中，工作区被丢弃时删除；
/// 对外产物按运行标识命名，失败时可通过 [`ArtifactWorkspace::discard_published`] 撤回。
pub struct ArtifactWorkspace {
  root: PathBuf,
  run_id: RunId,
  temp: Option<TempDir>,
  temp_path: PathBuf,
  published: Vec<PathBuf>,
}

impl ArtifactWorkspace {
  pub fn create(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
    Self::with_run_id(root, RunId::generate())
  }

  pub fn with_run_id(root: impl Into<PathBuf>, run_id: RunId) -> Result<Self, WorkspaceError> {
    let root = root.into();
    let tmp_root = root.join(TMP_DIR);
    std::fs::create_dir_all(&tmp_root).map_err(|e| WorkspaceError::io(&tmp_root, e))?;

    let temp = tempfile::Builder::new()
      .prefix(&format!("run-{}-", run_id))
      .tempdir_in(&tmp_root)
      .map_err(|e| WorkspaceError::io(&tmp_root, e))?;
    let temp_path = temp.path().to_path_buf();
    debug!("创建运行工作区 {}: {}", run_id, temp_path.display());

    Ok(ArtifactWorkspace {
      root,
      run_id,
      temp: Some(temp),
      temp_path,
      published: Vec::new(),
    })
  }

  pub fn run_id(&self) -> &RunId {
    &self.run_id
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn temp_dir(&self) -> &Path {
    &self.temp_path
  }

  /// 写入临时输入文件，运行结束后随临时目录一起删除
  pub fn write_temp(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, WorkspaceError> {
    let path = self.temp_path.join(name);
    std::fs::write(&path, bytes).map_err(|e| WorkspaceError::io(&path, e))?;
    Ok(path)
  }

  fn allocate(&self, relative: String) -> Result<Artifact, WorkspaceError> {
    let path = relative
      .split('/')
      .fold(self.root.clone(), |path, part| path.join(part));
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;
    }
    Ok(Artifact {
      path,
      url: format!("/{}", relative),
    })
  }

  pub fn original_artifact(&self, extension: &str) -> Result<Artifact, WorkspaceError> {
    self.allocate(format!(
      "{}/original-{}.{}",
      UPLOADS_DIR, self.run_id, extension
    ))
  }

  pub fn annotated_artifact(&self) -> Result<Artifact, WorkspaceError> {
    self.allocate(format!("{}/annotated-{}.png", OUTPUTS_DIR, self.run_id))
  }

  pub fn mask_artifact(&self, index: usize, class: &PartClass) -> Result<Artifact, WorkspaceError> {
    self.allocate(format!(
      "{}/mask-{}-{}-{}.png",
      SEGMENTS_DIR,
      self.run_id,
      index,
      class.slug()
    ))
  }

  pub fn composite_artifact(&self) -> Result<Artifact, WorkspaceError> {
    self.allocate(format!("{}/{}/result.png", STITCHING_DIR, self.run_id))
  }

  pub fn manifest_artifact(&self) -> Result<Artifact, WorkspaceError> {
    self.allocate(format!("{}/manifest-{}.json", OUTPUTS_DIR, self.run_id))
  }

  pub fn publish_bytes(&mut self, artifact: &Artifact, bytes: &[u8]) -> Result<(), WorkspaceError> {
    write_atomic(&artifact.path, bytes)?;
    self.track(&artifact.path);
    Ok(())
  }

  pub fn publish_png(
    &mut self,
    artifact: &Artifact,
    image: &DynamicImage,
  ) -> Result<(), WorkspaceError> {
    write_png_atomic(&artifact.path, image)?;
    self.track(&artifact.path);
    Ok(())
  }

  /// 记录由外部后端写出的产物，失败时一并撤回
  pub fn track(&mut self, path: &Path) {
    self.published.push(path.to_path_buf());
  }

  pub fn published(&self) -> &[PathBuf] {
    &self.published
  }

  /// 删除本次运行已经发布的产物（尽力而为）
  pub fn discard_published(&mut self) {
    for path in self.published.drain(..) {
      if let Err(e) = std::fs::remove_file(&path)
        && e.kind() != std::io::ErrorKind::NotFound
      {
        warn!("撤回产物失败 {}: {}", path.display(), e);
      }
    }
    let stitching = self.root.join(STITCHING_DIR).join(self.run_id.as_str());
    let _ = std::fs::remove_dir(stitching);
  }

  fn cleanup(&mut self) {
    if let Some(temp) = self.temp.take() {
      let path = temp.path().to_path_buf();
      match temp.close() {
        Ok(()) => debug!("已清理临时目录: {}", path.display()),
        Err(e) => warn!("清理临时目录失败 {}: {}", path.display(), e),
      }
    }
  }

  /// 立即清理临时输入
  pub fn close(mut self) {
    self.cleanup();
  }
}

impl Drop for ArtifactWorkspace {
  fn drop(&mut self) {
    self.cleanup();
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;

  use super::*;

  #[test]
  fn run_ids_are_unique() {
    let ids: HashSet<RunId> = (0..200).map(|_| RunId::generate()).collect();
    assert_eq!(ids.len(), 200);
  }

  #[test]
  fn temp_dir_is_removed_on_drop() {
    let root = tempfile::TempDir::new().unwrap();
    let workspace = ArtifactWorkspace::create(root.path()).unwrap();
    let input = workspace.write_temp("input.png", b"data").unwrap();
    let temp = workspace.temp_dir().to_path_buf();
    assert!(input.exists());

    drop(workspace);
    assert!(!temp.exists());
    assert!(root.path().join(TMP_DIR).exists());
  }

  #[test]
  fn artifacts_are_namespaced_by_run() {
    let root = tempfile::TempDir::new().unwrap();
    let a = ArtifactWorkspace::create(root.path()).unwrap();
    let b = ArtifactWorkspace::create(root.path()).unwrap();
    let rim = PartClass::new("rim").unwrap();

    let mask_a = a.mask_artifact(0, &rim).unwrap();
    let mask_b = b.mask_artifact(0, &rim).unwrap();
    assert_ne!(mask_a.path, mask_b.path);
    assert_eq!(
      mask_a.url,
      format!("/segments/mask-{}-0-rim.png", a.run_id())
    );
    assert_ne!(a.composite_artifact().unwrap(), b.composite_artifact().unwrap());
  }

  #[test]
  fn discard_removes_published_files() {
    let root = tempfile::TempDir::new().unwrap();
    let mut workspace = ArtifactWorkspace::create(root.path()).unwrap();
    let artifact = workspace.manifest_artifact().unwrap();
    workspace.publish_bytes(&artifact, b"{}").unwrap();
    assert!(artifact.path.exists());

    workspace.discard_published();
    assert!(!artifact.path.exists());
    assert!(workspace.published().is_empty());
  }

  #[test]
  fn write_atomic_leaves_no_partial_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("nested").join("out.json");
    write_atomic(&path, b"[1,2,3]").unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"[1,2,3]");
    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
      .unwrap()
      .filter_map(Result::ok)
      .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
      .collect();
    assert!(leftovers.is_empty());
  }
}
