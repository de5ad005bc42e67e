// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/bin/stitch.rs - 根据已有清单单独执行贴图合成
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

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gaizhuang::{
  composite::{
    BlendMode, CompositeConfig, Compositor, FitMode, PartClassReference, ReferenceSelection,
    parse_reference,
  },
  manifest::{Manifest, resolve_url},
};

/// 使用一次运行的清单，把参考部件图贴到原图上
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 运行清单 (outputs/manifest-<run>.json)
  #[arg(long, value_name = "FILE")]
  pub manifest: PathBuf,
  /// 产物根目录，清单中的地址相对于它解析
  #[arg(long, value_name = "DIR", default_value = "public")]
  pub artifact_root: PathBuf,
  /// 参考部件图，格式 类别=路径，可重复
  #[arg(long = "reference", value_name = "CLASS=PATH", value_parser = parse_reference, required = true)]
  pub references: Vec<PartClassReference>,
  /// 输出文件，默认写到 stitching_results/<会话>/result.png
  #[arg(long, value_name = "FILE")]
  pub output: Option<PathBuf>,
  /// 适配方式: fill, contain, adaptive
  #[arg(long, default_value = "fill")]
  pub fit: FitMode,
  /// 混合方式: replace, alpha_key
  #[arg(long, default_value = "alpha_key")]
  pub blend: BlendMode,
  /// 透明度羽化的高斯 sigma，0 表示不羽化
  #[arg(long, default_value = "0")]
  pub feather_sigma: f32,
  /// 只替换掩码覆盖的像素
  #[arg(long)]
  pub respect_masks: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  let manifest = Manifest::load(&args.manifest)
    .with_context(|| format!("无法加载清单 {}", args.manifest.display()))?;
  if manifest.segmented_parts.is_empty() {
    warn!("清单 {} 中没有已分割的部件", manifest.run_id);
  }

  let original_path = resolve_url(&args.artifact_root, &manifest.original_image_url);
  let original = image::open(&original_path)
    .with_context(|| format!("无法打开原图 {}", original_path.display()))?;

  let (output_path, output_url) = match &args.output {
    Some(path) => (path.clone(), path.display().to_string()),
    None => {
      let session = Uuid::new_v4().to_string();
      let url = format!("/stitching_results/{}/result.png", session);
      (resolve_url(&args.artifact_root, &url), url)
    }
  };
  if output_path.exists() {
    bail!("输出文件已存在: {}", output_path.display());
  }

  let selection: ReferenceSelection = args.references.into_iter().collect();
  info!(
    "合成运行 {}: {} 个部件，{} 个参考图",
    manifest.run_id,
    manifest.segmented_parts.len(),
    selection.len()
  );

  let compositor = Compositor::new(CompositeConfig {
    fit: args.fit,
    blend: args.blend,
    feather_sigma: args.feather_sigma,
    respect_masks: args.respect_masks,
    mask_root: Some(args.artifact_root.clone()),
    ..CompositeConfig::default()
  });
  let result = compositor.composite_to_file(
    &original,
    &manifest.segmented_parts,
    &selection,
    &output_path,
    &output_url,
  )?;

  for warning in &result.warnings {
    warn!("{}", warning);
  }
  println!("{}", serde_json::to_string_pretty(&result)?);

  Ok(())
}
