// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/segment.rs - 逐部件分割调度
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

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, SegmentRequest, Segmenter, call_with_timeout};
use crate::detection::{Detection, DetectionSet, PartClass};
use crate::prompt::build_prompts;
use crate::workspace::{ArtifactWorkspace, WorkspaceError};

/// 成功分割的部件：检测结果加掩码地址
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentedPart {
  #[serde(flatten)]
  pub detection: Detection,
  pub mask_url: String,
  pub detection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationFailure {
  pub detection_id: String,
  pub class_name: PartClass,
  pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentationOutcome {
  pub parts: Vec<SegmentedPart>,
  pub attempted: usize,
  pub succeeded: usize,
  pub failures: Vec<SegmentationFailure>,
}

/// 对每个检测结果调用分割后端，单个部件失败不影响其它部件
pub struct SegmentationOrchestrator {
  segmenter: Arc<dyn Segmenter>,
  timeout: Duration,
}

impl SegmentationOrchestrator {
  pub fn new(segmenter: Arc<dyn Segmenter>, timeout: Duration) -> Self {
    Self { segmenter, timeout }
  }

  /// 依次分割所有部件
  ///
  /// 只有分配掩码路径失败（产物目录不可写）才会返回错误，
  /// 后端错误、超时和缺失的掩码文件都只记入 `failures`。
  pub fn segment(
    &self,
    detections: &DetectionSet,
    image_path: &Path,
    workspace: &mut ArtifactWorkspace,
  ) -> Result<SegmentationOutcome, WorkspaceError> {
    let mut outcome = SegmentationOutcome::default();

    for (index, detection) in detections.iter().enumerate() {
      let prompts = build_prompts(index, detection);
      let detection_id = prompts.detection_id.clone();
      let artifact = workspace.mask_artifact(index, &detection.class_name)?;
      outcome.attempted += 1;

      // 后端先写到临时目录，超时后仍在运行的后端不会碰到产物目录
      let request = SegmentRequest {
        image_path: image_path.to_path_buf(),
        prompts,
        output_path: workspace.temp_dir().join(format!("mask-{}.png", index)),
      };

      debug!(
        "分割部件 {} ({}) 使用后端 {}",
        detection_id,
        detection.class_name,
        self.segmenter.name()
      );

      let segmenter = Arc::clone(&self.segmenter);
      let result = call_with_timeout(self.timeout, move || segmenter.segment(&request))
        .and_then(|mask_path| {
          if mask_path.is_file() {
            Ok(mask_path)
          } else {
            Err(BackendError::InvalidOutput(format!(
              "掩码文件不存在: {}",
              mask_path.display()
            )))
          }
        });

      match result {
        Ok(mask_path) => {
          if let Err(e) = std::fs::copy(&mask_path, &artifact.path) {
            warn!("部件 {} 的掩码无法复制到产物目录: {}", detection_id, e);
            outcome.failures.push(SegmentationFailure {
              detection_id,
              class_name: detection.class_name.clone(),
              reason: format!("artifact_io: {}", e),
            });
            continue;
          }
          workspace.track(&artifact.path);
          outcome.parts.push(SegmentedPart {
            detection: detection.clone(),
            mask_url: artifact.url,
            detection_id,
          });
          outcome.succeeded += 1;
        }
        Err(e) => {
          warn!(
            "部件 {} ({}) 分割失败，跳过: {}",
            detection_id, detection.class_name, e
          );
          outcome.failures.push(SegmentationFailure {
            detection_id,
            class_name: detection.class_name.clone(),
            reason: format!("{}: {}", e.code(), e),
          });
        }
      }
    }

    info!(
      "分割完成: 尝试 {} 个，成功 {} 个",
      outcome.attempted, outcome.succeeded
    );
    Ok(outcome)
  }
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;
  use std::sync::Mutex;

  use super::*;
  use crate::detection::{BoundingBox, ImageDimensions};

  /// 对列出的下标返回错误，其余写出一个空掩码
  struct FlakySegmenter {
    fail_on: Vec<usize>,
    seen: Mutex<Vec<String>>,
  }

  impl Segmenter for FlakySegmenter {
    fn name(&self) -> &str {
      "flaky"
    }

    fn segment(&self, request: &SegmentRequest) -> Result<PathBuf, BackendError> {
      let id = request.prompts.detection_id.clone();
      self.seen.lock().unwrap().push(id.clone());
      let index: usize = id.trim_start_matches("detection_").parse().unwrap();
      if self.fail_on.contains(&index) {
        return Err(BackendError::Failed {
          code: Some(1),
          stderr: "out of memory".to_string(),
        });
      }
      std::fs::write(&request.output_path, b"mask").unwrap();
      Ok(request.output_path.clone())
    }
  }

  struct LyingSegmenter;

  impl Segmenter for LyingSegmenter {
    fn name(&self) -> &str {
      "lying"
    }

    fn segment(&self, request: &SegmentRequest) -> Result<PathBuf, BackendError> {
      Ok(request.output_path.with_extension("missing"))
    }
  }

  /// 超时之后才写出掩码
  struct SlowSegmenter {
    delay: Duration,
  }

  impl Segmenter for SlowSegmenter {
    fn name(&self) -> &str {
      "slow"
    }

    fn segment(&self, request: &SegmentRequest) -> Result<PathBuf, BackendError> {
      std::thread::sleep(self.delay);
      std::fs::write(&request.output_path, b"late mask").map_err(BackendError::Io)?;
      Ok(request.output_path.clone())
    }
  }

  fn detections(n: usize) -> DetectionSet {
    let parts = (0..n)
      .map(|i| {
        let x = 10.0 * i as f32;
        Detection::new(
          PartClass::new("rim").unwrap(),
          0.9,
          BoundingBox::new(x, 0.0, x + 5.0, 5.0),
        )
      })
      .collect();
    DetectionSet::new(ImageDimensions::new(100, 100), "test").with_detections(parts)
  }

  #[test]
  fn partial_failures_are_skipped_in_order() {
    let root = tempfile::TempDir::new().unwrap();
    let mut workspace = ArtifactWorkspace::create(root.path()).unwrap();
    let segmenter = Arc::new(FlakySegmenter {
      fail_on: vec![1, 3],
      seen: Mutex::new(Vec::new()),
    });
    let orchestrator = SegmentationOrchestrator::new(segmenter.clone(), Duration::from_secs(5));

    let outcome = orchestrator
      .segment(&detections(5), Path::new("in.png"), &mut workspace)
      .unwrap();

    assert_eq!(outcome.attempted, 5);
    assert_eq!(outcome.succeeded, 3);
    let ids: Vec<_> = outcome.parts.iter().map(|p| p.detection_id.as_str()).collect();
    assert_eq!(ids, ["detection_0", "detection_2", "detection_4"]);
    assert_eq!(outcome.failures.len(), 2);
    assert!(outcome.failures[0].reason.starts_with("backend_failed"));
    assert_eq!(segmenter.seen.lock().unwrap().len(), 5);
    assert_eq!(workspace.published().len(), 3);
  }

  #[test]
  fn mask_urls_point_into_segments() {
    let root = tempfile::TempDir::new().unwrap();
    let mut workspace = ArtifactWorkspace::create(root.path()).unwrap();
    let segmenter = Arc::new(FlakySegmenter {
      fail_on: vec![],
      seen: Mutex::new(Vec::new()),
    });
    let orchestrator = SegmentationOrchestrator::new(segmenter, Duration::from_secs(5));

    let outcome = orchestrator
      .segment(&detections(1), Path::new("in.png"), &mut workspace)
      .unwrap();
    let part = &outcome.parts[0];
    assert_eq!(
      part.mask_url,
      format!("/segments/mask-{}-0-rim.png", workspace.run_id())
    );
    assert!(root.path().join(part.mask_url.trim_start_matches('/')).is_file());
  }

  #[test]
  fn missing_mask_counts_as_failure() {
    let root = tempfile::TempDir::new().unwrap();
    let mut workspace = ArtifactWorkspace::create(root.path()).unwrap();
    let orchestrator =
      SegmentationOrchestrator::new(Arc::new(LyingSegmenter), Duration::from_secs(5));

    let outcome = orchestrator
      .segment(&detections(2), Path::new("in.png"), &mut workspace)
      .unwrap();
    assert_eq!(outcome.attempted, 2);
    assert_eq!(outcome.succeeded, 0);
    assert!(outcome.parts.is_empty());
    assert!(
      outcome
        .failures
        .iter()
        .all(|f| f.reason.starts_with("backend_invalid_output"))
    );
  }

  #[test]
  fn late_masks_never_reach_the_artifact_tree() {
    let root = tempfile::TempDir::new().unwrap();
    let mut workspace = ArtifactWorkspace::create(root.path()).unwrap();
    let segmenter = Arc::new(SlowSegmenter {
      delay: Duration::from_millis(300),
    });
    let orchestrator = SegmentationOrchestrator::new(segmenter, Duration::from_millis(20));

    let outcome = orchestrator
      .segment(&detections(1), Path::new("in.png"), &mut workspace)
      .unwrap();
    assert_eq!(outcome.succeeded, 0);
    assert!(outcome.failures[0].reason.starts_with("backend_timeout"));
    assert!(workspace.published().is_empty());

    let run_id = workspace.run_id().clone();
    drop(workspace);
    std::thread::sleep(Duration::from_millis(600));

    let late_mask = root
      .path()
      .join("segments")
      .join(format!("mask-{}-0-rim.png", run_id));
    assert!(!late_mask.exists());
    let segments = std::fs::read_dir(root.path().join("segments")).unwrap().count();
    assert_eq!(segments, 0);
    let tmp = std::fs::read_dir(root.path().join("tmp")).unwrap().count();
    assert_eq!(tmp, 0);
  }

  #[test]
  fn segmented_part_flattens_detection() {
    let part = SegmentedPart {
      detection: detections(1).detections.remove(0),
      mask_url: "/segments/m.png".to_string(),
      detection_id: "detection_0".to_string(),
    };
    let value = serde_json::to_value(&part).unwrap();
    assert_eq!(value["class_name"], "rim");
    assert_eq!(value["bbox"], serde_json::json!([0.0, 0.0, 5.0, 5.0]));
    assert_eq!(value["detection_id"], "detection_0");
  }
}
