// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/pipeline.rs - 分类、检测、分割、合成流水线
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
use std::sync::Arc;
use std::time::Instant;

use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::annotate::Annotator;
use crate::backend::{BackendError, Classifier, Detector, Segmenter, call_with_timeout};
use crate::composite::{CompositeError, Compositor, ReferenceSelection};
use crate::config::PipelineConfig;
use crate::detection::{DetectionSet, ImageDimensions};
use crate::manifest::{Manifest, ManifestError, ManifestMetadata, SegmentationSummary};
use crate::postprocess::{PostProcessConfig, PostProcessor};
use crate::segment::{SegmentationOrchestrator, SegmentationOutcome};
use crate::workspace::{ArtifactWorkspace, RunId, WorkspaceError};

/// 可能失败的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  Received,
  Classifying,
  Detecting,
  PostProcessing,
  Segmenting,
  Compositing,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::Received => "received",
      Stage::Classifying => "classifying",
      Stage::Detecting => "detecting",
      Stage::PostProcessing => "post_processing",
      Stage::Segmenting => "segmenting",
      Stage::Compositing => "compositing",
    };
    f.write_str(name)
  }
}

/// 流水线状态，按顺序记录在运行历史中
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
  Received,
  Classifying,
  RejectedNotACar,
  Detecting,
  PostProcessing,
  Segmenting,
  Compositing,
  Done,
  Failed { stage: Stage, reason: String },
}

#[derive(Error, Debug)]
pub enum InputError {
  #[error("上传的图像为空")]
  Empty,
  #[error("上传的图像过大: {size} 字节，上限 {limit} 字节")]
  TooLarge { size: usize, limit: usize },
  #[error("无法解码图像: {0}")]
  NotImage(#[from] image::ImageError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("输入无效: {0}")]
  Input(#[from] InputError),
  #[error("{stage} 阶段后端调用失败: {source}")]
  Backend {
    stage: Stage,
    #[source]
    source: BackendError,
  },
  #[error("合成失败: {0}")]
  Composite(#[from] CompositeError),
  #[error("{stage} 阶段产物读写失败: {source}")]
  Artifact {
    stage: Stage,
    #[source]
    source: WorkspaceError,
  },
  #[error("{stage} 阶段清单写出失败: {source}")]
  Manifest {
    stage: Stage,
    #[source]
    source: ManifestError,
  },
}

fn workspace_reason(error: &WorkspaceError) -> &'static str {
  match error {
    WorkspaceError::Io { .. } => "artifact_io",
    WorkspaceError::Image(_) => "image_encode",
  }
}

impl PipelineError {
  pub fn stage(&self) -> Stage {
    match self {
      PipelineError::Input(_) => Stage::Received,
      PipelineError::Composite(_) => Stage::Compositing,
      PipelineError::Backend { stage, .. }
      | PipelineError::Artifact { stage, .. }
      | PipelineError::Manifest { stage, .. } => *stage,
    }
  }

  /// 机器可读的失败原因
  pub fn reason(&self) -> &'static str {
    match self {
      PipelineError::Input(InputError::Empty) => "input_empty",
      PipelineError::Input(InputError::TooLarge { .. }) => "input_too_large",
      PipelineError::Input(InputError::NotImage(_)) => "input_not_image",
      PipelineError::Backend { source, .. } => source.code(),
      PipelineError::Composite(CompositeError::InvalidRegion { .. }) => "compositing_precondition",
      PipelineError::Composite(CompositeError::Workspace(e)) => workspace_reason(e),
      PipelineError::Artifact { source, .. } => workspace_reason(source),
      PipelineError::Manifest { .. } => "artifact_io",
    }
  }

  fn backend(stage: Stage) -> impl FnOnce(BackendError) -> Self {
    move |source| PipelineError::Backend { stage, source }
  }

  fn artifact(stage: Stage) -> impl FnOnce(WorkspaceError) -> Self {
    move |source| PipelineError::Artifact { stage, source }
  }
}

/// 检查上传内容并解码
pub fn validate_input(
  bytes: &[u8],
  max_upload_bytes: usize,
) -> Result<(DynamicImage, ImageFormat), InputError> {
  if bytes.is_empty() {
    return Err(InputError::Empty);
  }
  if bytes.len() > max_upload_bytes {
    return Err(InputError::TooLarge {
      size: bytes.len(),
      limit: max_upload_bytes,
    });
  }
  let format = image::guess_format(bytes)?;
  let image = image::load_from_memory_with_format(bytes, format)?;
  Ok((image, format))
}

/// 一次运行的输入
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
  pub image: Vec<u8>,
  pub file_name: Option<String>,
  pub references: ReferenceSelection,
  /// 覆盖配置中的最低置信度
  pub min_confidence: Option<f32>,
  /// 覆盖配置中的分割开关
  pub run_segmentation: Option<bool>,
}

impl PipelineRequest {
  pub fn new(image: Vec<u8>) -> Self {
    Self {
      image,
      ..Default::default()
    }
  }

  pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
    self.file_name = Some(file_name.into());
    self
  }

  pub fn with_references(mut self, references: ReferenceSelection) -> Self {
    self.references = references;
    self
  }

  pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
    self.min_confidence = Some(min_confidence);
    self
  }

  pub fn with_segmentation(mut self, run_segmentation: bool) -> Self {
    self.run_segmentation = Some(run_segmentation);
    self
  }
}

/// 图像中没有车，未调用检测与分割
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
  pub run_id: RunId,
  pub label: String,
  pub detections: DetectionSet,
}

#[derive(Debug, Clone)]
pub enum PipelineOutcome {
  NotACar {
    rejection: Rejection,
    history: Vec<PipelineState>,
  },
  Completed {
    manifest: Box<Manifest>,
    history: Vec<PipelineState>,
  },
}

impl PipelineOutcome {
  pub fn history(&self) -> &[PipelineState] {
    match self {
      PipelineOutcome::NotACar { history, .. } | PipelineOutcome::Completed { history, .. } => {
        history
      }
    }
  }
}

/// 单次运行的进度记录
struct RunContext {
  history: Vec<PipelineState>,
  started: Instant,
}

impl RunContext {
  fn enter(&mut self, state: PipelineState) {
    info!("进入阶段: {:?}", state);
    self.history.push(state);
  }
}

/// 流水线：分类 → 检测 → 后处理 → 分割 → 合成
pub struct Pipeline {
  config: PipelineConfig,
  classifier: Arc<dyn Classifier>,
  detector: Arc<dyn Detector>,
  segmenter: Arc<dyn Segmenter>,
}

impl Pipeline {
  pub fn new(
    config: PipelineConfig,
    classifier: Arc<dyn Classifier>,
    detector: Arc<dyn Detector>,
    segmenter: Arc<dyn Segmenter>,
  ) -> Self {
    Self {
      config,
      classifier,
      detector,
      segmenter,
    }
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  /// 执行一次完整运行
  ///
  /// 失败时撤回本次运行已发布的产物；临时目录在任何情况下都会被清理。
  pub fn run(&self, request: PipelineRequest) -> Result<PipelineOutcome, PipelineError> {
    let mut context = RunContext {
      history: vec![PipelineState::Received],
      started: Instant::now(),
    };
    info!(
      "收到图像 {} ({} 字节)",
      request.file_name.as_deref().unwrap_or("<未命名>"),
      request.image.len()
    );

    let (image, format) = validate_input(&request.image, self.config.max_upload_bytes)
      .map_err(|e| {
        warn!("输入被拒绝: {}", e);
        PipelineError::from(e)
      })?;

    let mut workspace = ArtifactWorkspace::create(&self.config.artifact_root)
      .map_err(PipelineError::artifact(Stage::Received))?;

    match self.run_stages(&request, &image, format, &mut workspace, &mut context) {
      Ok(outcome) => Ok(outcome),
      Err(e) => {
        error!(
          "运行 {} 在 {} 阶段失败 ({}): {}",
          workspace.run_id(),
          e.stage(),
          e.reason(),
          e
        );
        context.history.push(PipelineState::Failed {
          stage: e.stage(),
          reason: e.reason().to_string(),
        });
        debug!("运行历史: {:?}", context.history);
        workspace.discard_published();
        Err(e)
      }
    }
  }

  fn run_stages(
    &self,
    request: &PipelineRequest,
    image: &DynamicImage,
    format: ImageFormat,
    workspace: &mut ArtifactWorkspace,
    context: &mut RunContext,
  ) -> Result<PipelineOutcome, PipelineError> {
    let dimensions = ImageDimensions::new(image.width(), image.height());
    let run_id = workspace.run_id().clone();

    context.enter(PipelineState::Classifying);
    let classifier = Arc::clone(&self.classifier);
    let bytes = request.image.clone();
    let classification = call_with_timeout(self.config.timeouts.classify(), move || {
      classifier.classify(&bytes)
    })
    .map_err(PipelineError::backend(Stage::Classifying))?;
    info!("分类结果: {}", classification.label);

    if !self.config.accepts_label(&classification.label) {
      context.enter(PipelineState::RejectedNotACar);
      return Ok(PipelineOutcome::NotACar {
        rejection: Rejection {
          run_id,
          label: classification.label,
          // 检测器没有运行，不记录模型名
          detections: DetectionSet::new(dimensions, String::new()),
        },
        history: std::mem::take(&mut context.history),
      });
    }

    context.enter(PipelineState::Detecting);
    let extension = format.extensions_str().first().copied().unwrap_or("img");
    let original = workspace
      .original_artifact(extension)
      .map_err(PipelineError::artifact(Stage::Detecting))?;
    workspace
      .publish_bytes(&original, &request.image)
      .map_err(PipelineError::artifact(Stage::Detecting))?;
    let input_path = workspace
      .write_temp(&format!("input.{}", extension), &request.image)
      .map_err(PipelineError::artifact(Stage::Detecting))?;

    let detector = Arc::clone(&self.detector);
    let detect_path = input_path.clone();
    let raw = call_with_timeout(self.config.timeouts.detect(), move || {
      detector.detect(&detect_path)
    })
    .map_err(PipelineError::backend(Stage::Detecting))?;
    if raw.dimensions != dimensions {
      return Err(PipelineError::backend(Stage::Detecting)(
        BackendError::InvalidOutput(format!(
          "检测器报告的图像尺寸 {}x{} 与实际 {}x{} 不一致",
          raw.dimensions.width, raw.dimensions.height, dimensions.width, dimensions.height
        )),
      ));
    }
    info!("检测到 {} 个候选部件 (模型 {})", raw.len(), raw.model);

    context.enter(PipelineState::PostProcessing);
    let postprocess = PostProcessConfig {
      min_confidence: request
        .min_confidence
        .unwrap_or(self.config.postprocess.min_confidence),
      ..self.config.postprocess.clone()
    };
    let (detections, report) = PostProcessor::new(postprocess).process(raw);
    debug_assert!(detections.is_consistent());
    info!("后处理后保留 {} 个部件", detections.len());

    let annotated = workspace
      .annotated_artifact()
      .map_err(PipelineError::artifact(Stage::PostProcessing))?;
    let annotated_image = Annotator::new().annotate(image, &detections.detections);
    workspace
      .publish_png(&annotated, &annotated_image)
      .map_err(PipelineError::artifact(Stage::PostProcessing))?;

    let run_segmentation = request
      .run_segmentation
      .unwrap_or(self.config.run_segmentation);
    let mut warnings = Vec::new();

    let segmentation = if run_segmentation {
      context.enter(PipelineState::Segmenting);
      let orchestrator =
        SegmentationOrchestrator::new(Arc::clone(&self.segmenter), self.config.timeouts.segment());
      let outcome = orchestrator
        .segment(&detections, &input_path, workspace)
        .map_err(PipelineError::artifact(Stage::Segmenting))?;
      warnings.extend(outcome.failures.iter().map(|failure| {
        format!(
          "{} ({}) 分割失败: {}",
          failure.detection_id, failure.class_name, failure.reason
        )
      }));
      outcome
    } else {
      info!("跳过分割");
      SegmentationOutcome::default()
    };

    let mut stitched_image_url = None;
    let mut applied_references = Vec::new();
    if run_segmentation && !request.references.is_empty() {
      context.enter(PipelineState::Compositing);
      let mut composite_config = self.config.composite.clone();
      if composite_config.mask_root.is_none() {
        composite_config.mask_root = Some(workspace.root().to_path_buf());
      }
      let artifact = workspace
        .composite_artifact()
        .map_err(PipelineError::artifact(Stage::Compositing))?;
      let result = Compositor::new(composite_config).composite_to_file(
        image,
        &segmentation.parts,
        &request.references,
        &artifact.path,
        &artifact.url,
      )?;
      workspace.track(&result.output_image_path);
      warnings.extend(result.warnings.iter().map(ToString::to_string));
      applied_references = result.applied_references;
      stitched_image_url = Some(result.output_image_url);
    }

    let manifest = Manifest {
      run_id,
      metadata: ManifestMetadata {
        total_detections: detections.len(),
        total_segments: segmentation.parts.len(),
        image_dimensions: dimensions,
        processing_time_ms: context.started.elapsed().as_millis() as u64,
        model: detections.model.clone(),
        segmentation: SegmentationSummary {
          attempted: segmentation.attempted,
          succeeded: segmentation.succeeded,
        },
        postprocess: report,
      },
      detected_parts: detections.detections,
      segmented_parts: segmentation.parts,
      original_image_url: original.url,
      annotated_image_url: annotated.url,
      stitched_image_url,
      applied_references,
      warnings,
    };

    let last_stage = if context.history.last() == Some(&PipelineState::Compositing) {
      Stage::Compositing
    } else if run_segmentation {
      Stage::Segmenting
    } else {
      Stage::PostProcessing
    };
    let manifest_artifact = workspace
      .manifest_artifact()
      .map_err(PipelineError::artifact(last_stage))?;
    let json = manifest.to_json().map_err(|source| PipelineError::Manifest {
      stage: last_stage,
      source,
    })?;
    workspace
      .publish_bytes(&manifest_artifact, &json)
      .map_err(PipelineError::artifact(last_stage))?;

    context.enter(PipelineState::Done);
    info!(
      "运行 {} 完成，耗时 {} ms",
      manifest.run_id, manifest.metadata.processing_time_ms
    );

    Ok(PipelineOutcome::Completed {
      manifest: Box::new(manifest),
      history: std::mem::take(&mut context.history),
    })
  }
}

#[cfg(test)]
mod tests {
  use image::{Rgb, RgbImage};

  use super::*;
  use crate::workspace::encode_png;

  fn png(width: u32, height: u32) -> Vec<u8> {
    encode_png(&DynamicImage::ImageRgb8(RgbImage::from_pixel(
      width,
      height,
      Rgb([1, 2, 3]),
    )))
    .unwrap()
  }

  #[test]
  fn empty_input_is_rejected() {
    assert!(matches!(validate_input(&[], 1024), Err(InputError::Empty)));
  }

  #[test]
  fn oversized_input_is_rejected() {
    let bytes = png(8, 8);
    assert!(matches!(
      validate_input(&bytes, bytes.len() - 1),
      Err(InputError::TooLarge { .. })
    ));
  }

  #[test]
  fn non_image_input_is_rejected() {
    let err = validate_input(b"definitely not an image", 1024).unwrap_err();
    assert_eq!(
      PipelineError::from(err).reason(),
      "input_not_image"
    );
  }

  #[test]
  fn valid_png_is_decoded() {
    let (image, format) = validate_input(&png(8, 6), 1 << 20).unwrap();
    assert_eq!((image.width(), image.height()), (8, 6));
    assert_eq!(format, ImageFormat::Png);
  }

  #[test]
  fn errors_report_stage_and_reason() {
    let err = PipelineError::Backend {
      stage: Stage::Detecting,
      source: BackendError::Timeout(std::time::Duration::from_secs(1)),
    };
    assert_eq!(err.stage(), Stage::Detecting);
    assert_eq!(err.reason(), "backend_timeout");

    let err = PipelineError::from(CompositeError::InvalidRegion {
      index: 0,
      class_name: crate::detection::PartClass::new("rim").unwrap(),
      reason: "empty".to_string(),
    });
    assert_eq!(err.stage(), Stage::Compositing);
    assert_eq!(err.reason(), "compositing_precondition");
    assert_eq!(PipelineError::from(InputError::Empty).stage(), Stage::Received);
  }

  #[test]
  fn failed_state_serializes_with_stage() {
    let state = PipelineState::Failed {
      stage: Stage::PostProcessing,
      reason: "artifact_io".to_string(),
    };
    assert_eq!(
      serde_json::to_value(state).unwrap(),
      serde_json::json!({ "state": "failed", "stage": "post_processing", "reason": "artifact_io" })
    );
  }
}
