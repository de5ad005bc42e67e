// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/main.rs - 项目主程序
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

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use gaizhuang::{
  Pipeline, PipelineOutcome, PipelineRequest,
  backend::{classifier_from_url, detector_from_url, segmenter_from_url},
  composite::{PartClassReference, ReferenceSelection, parse_reference},
  config::PipelineConfig,
};

/// 改装预览流水线：识别车辆部件并贴入参考部件图
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图像
  #[arg(long, value_name = "IMAGE")]
  pub input: PathBuf,
  /// 分类后端，如 script:///opt/models/car.py 或 label://car
  #[arg(long, value_name = "URL", default_value = "label://car")]
  pub classifier: Url,
  /// 检测后端
  #[arg(long, value_name = "URL")]
  pub detector: Url,
  /// 分割后端
  #[arg(long, value_name = "URL")]
  pub segmenter: Url,
  /// JSON 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// 产物根目录，覆盖配置文件
  #[arg(long, value_name = "DIR")]
  pub artifact_root: Option<PathBuf>,
  /// 最低置信度 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub min_confidence: Option<f32>,
  /// 只检测，不分割也不合成
  #[arg(long)]
  pub no_segmentation: bool,
  /// 参考部件图，格式 类别=路径，可重复
  #[arg(long = "reference", value_name = "CLASS=PATH", value_parser = parse_reference)]
  pub references: Vec<PartClassReference>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  let mut config = match &args.config {
    Some(path) => PipelineConfig::from_file(path)
      .with_context(|| format!("无法加载配置 {}", path.display()))?,
    None => PipelineConfig::default(),
  };
  if let Some(root) = &args.artifact_root {
    config.artifact_root = root.clone();
  }

  info!("输入图像: {}", args.input.display());
  info!("分类后端: {}", args.classifier);
  info!("检测后端: {}", args.detector);
  info!("分割后端: {}", args.segmenter);
  info!("产物目录: {}", config.artifact_root.display());

  let classifier = classifier_from_url(&args.classifier)?;
  let detector = detector_from_url(&args.detector)?;
  let segmenter = segmenter_from_url(&args.segmenter)?;

  let image = std::fs::read(&args.input)
    .with_context(|| format!("无法读取输入图像 {}", args.input.display()))?;
  let references: ReferenceSelection = args.references.into_iter().collect();

  let mut request = PipelineRequest::new(image).with_references(references);
  if let Some(name) = args.input.file_name() {
    request = request.with_file_name(name.to_string_lossy());
  }
  if let Some(threshold) = args.min_confidence {
    request = request.with_min_confidence(threshold);
  }
  if args.no_segmentation {
    request = request.with_segmentation(false);
  }

  let pipeline = Pipeline::new(config, classifier, detector, segmenter);
  match pipeline.run(request)? {
    PipelineOutcome::NotACar { rejection, .. } => {
      info!("图像中没有车辆 (分类结果: {})", rejection.label);
      println!("{}", serde_json::to_string_pretty(&rejection)?);
    }
    PipelineOutcome::Completed { manifest, .. } => {
      println!("{}", serde_json::to_string_pretty(&manifest)?);
    }
  }

  Ok(())
}
