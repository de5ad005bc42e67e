// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/composite.rs - 参考部件贴图合成
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

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma, RgbaImage};
use imageproc::filter::gaussian_blur_f32;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detection::{BoundingBox, PartClass};
use crate::segment::SegmentedPart;
use crate::workspace::{WorkspaceError, write_png_atomic};

/// 掩码亮度低于该值的像素保留原图
const MASK_THRESHOLD: u8 = 128;

#[derive(Error, Debug)]
pub enum CompositeError {
  #[error("部件 {index} ({class_name}) 的区域无效: {reason}")]
  InvalidRegion {
    index: usize,
    class_name: PartClass,
    reason: String,
  },
  #[error("合成结果写出失败: {0}")]
  Workspace(#[from] WorkspaceError),
}

/// 不影响整体结果的问题，对应的替换被跳过或降级
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompositeWarning {
  ReferenceUnavailable {
    detection_id: String,
    class_name: PartClass,
    reference: PathBuf,
    reason: String,
  },
  MaskUnavailable {
    detection_id: String,
    mask_url: String,
    reason: String,
  },
}

impl fmt::Display for CompositeWarning {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CompositeWarning::ReferenceUnavailable {
        detection_id,
        class_name,
        reference,
        reason,
      } => write!(
        f,
        "{} ({}) 的参考图 {} 不可用: {}",
        detection_id,
        class_name,
        reference.display(),
        reason
      ),
      CompositeWarning::MaskUnavailable {
        detection_id,
        mask_url,
        reason,
      } => write!(f, "{} 的掩码 {} 被忽略: {}", detection_id, mask_url, reason),
    }
  }
}

/// 调用方选择的参考图：部件类别到图像路径
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceSelection(BTreeMap<PartClass, PathBuf>);

impl ReferenceSelection {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, class: PartClass, reference: impl Into<PathBuf>) -> Option<PathBuf> {
    self.0.insert(class, reference.into())
  }

  pub fn get(&self, class: &PartClass) -> Option<&Path> {
    self.0.get(class).map(PathBuf::as_path)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&PartClass, &Path)> {
    self.0.iter().map(|(class, path)| (class, path.as_path()))
  }
}

impl FromIterator<(PartClass, PathBuf)> for ReferenceSelection {
  fn from_iter<T: IntoIterator<Item = (PartClass, PathBuf)>>(iter: T) -> Self {
    ReferenceSelection(iter.into_iter().collect())
  }
}

/// 单个类别的参考图
pub type PartClassReference = (PartClass, PathBuf);

/// 解析命令行中的 `class=path` 形式
pub fn parse_reference(value: &str) -> Result<PartClassReference, String> {
  let (class, path) = value
    .split_once('=')
    .ok_or_else(|| format!("参考图格式应为 类别=路径: {}", value))?;
  let class = PartClass::new(class).map_err(|e| e.to_string())?;
  let path = path.trim();
  if path.is_empty() {
    return Err(format!("参考图路径为空: {}", value));
  }
  Ok((class, PathBuf::from(path)))
}

/// 参考图如何放进部件区域
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMode {
  /// 拉伸铺满区域
  #[default]
  Fill,
  /// 保持宽高比，居中，未覆盖的像素不变
  Contain,
  /// 按部件占整图的面积比例缩小后居中
  Adaptive,
}

impl FromStr for FitMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "fill" => Ok(FitMode::Fill),
      "contain" => Ok(FitMode::Contain),
      "adaptive" => Ok(FitMode::Adaptive),
      other => Err(format!("未知的适配方式: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
  Replace,
  /// 有透明通道时使用透明通道，否则把白色与浅灰背景抠掉
  #[default]
  AlphaKey,
}

impl FromStr for BlendMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "replace" => Ok(BlendMode::Replace),
      "alpha_key" => Ok(BlendMode::AlphaKey),
      other => Err(format!("未知的混合方式: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
  Nearest,
  #[default]
  Triangle,
  CatmullRom,
  Lanczos3,
}

impl From<ResizeFilter> for FilterType {
  fn from(filter: ResizeFilter) -> Self {
    match filter {
      ResizeFilter::Nearest => FilterType::Nearest,
      ResizeFilter::Triangle => FilterType::Triangle,
      ResizeFilter::CatmullRom => FilterType::CatmullRom,
      ResizeFilter::Lanczos3 => FilterType::Lanczos3,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeConfig {
  pub fit: FitMode,
  pub blend: BlendMode,
  /// 大于 0 时对透明度做高斯模糊，柔化边缘
  pub feather_sigma: f32,
  pub respect_masks: bool,
  /// `mask_url` 的根目录，通常是产物根目录
  pub mask_root: Option<PathBuf>,
  pub filter: ResizeFilter,
}

impl Default for CompositeConfig {
  fn default() -> Self {
    Self {
      fit: FitMode::Fill,
      blend: BlendMode::AlphaKey,
      feather_sigma: 0.0,
      respect_masks: false,
      mask_root: None,
      filter: ResizeFilter::Triangle,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedReference {
  pub detection_id: String,
  pub class_name: PartClass,
  pub reference: PathBuf,
}

/// 内存中的合成结果
#[derive(Debug, Clone)]
pub struct Composition {
  pub image: DynamicImage,
  pub applied_references: Vec<AppliedReference>,
  pub warnings: Vec<CompositeWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeResult {
  pub output_image_url: String,
  pub output_image_path: PathBuf,
  pub source_segmented_parts: Vec<SegmentedPart>,
  pub applied_references: Vec<AppliedReference>,
  pub warnings: Vec<CompositeWarning>,
  pub timestamp: DateTime<Utc>,
}

/// 整数像素区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRegion {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

impl PixelRegion {
  /// 外扩到整数像素并裁剪到图像内，宽或高为零视为无效
  pub fn from_bbox(bbox: &BoundingBox, width: u32, height: u32) -> Result<Self, String> {
    let BoundingBox { x1, y1, x2, y2 } = *bbox;
    if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
      return Err("坐标不是有限数".to_string());
    }

    let left = (x1.floor() as i64).max(0);
    let top = (y1.floor() as i64).max(0);
    let right = (x2.ceil() as i64).min(width as i64);
    let bottom = (y2.ceil() as i64).min(height as i64);

    if right <= left || bottom <= top {
      return Err(format!(
        "裁剪后区域为空: [{}, {}, {}, {}]",
        x1, y1, x2, y2
      ));
    }

    Ok(PixelRegion {
      x: left as u32,
      y: top as u32,
      width: (right - left) as u32,
      height: (bottom - top) as u32,
    })
  }

  fn area(&self) -> u64 {
    self.width as u64 * self.height as u64
  }
}

/// 按部件面积占比选择缩放系数：部件越大缩得越多，小部件再放大一半（不超过 1）
pub fn adaptive_scale(area_ratio: f64) -> f64 {
  let factor = if area_ratio > 0.1 {
    0.4
  } else if area_ratio > 0.05 {
    0.6
  } else {
    0.8
  };
  if area_ratio < 0.2 {
    (factor * 1.5f64).min(1.0)
  } else {
    factor
  }
}

/// 在区域中居中放置按比例缩放的参考图
fn centered(region: PixelRegion, ref_w: u32, ref_h: u32, extra_scale: f64) -> PixelRegion {
  let scale = (region.width as f64 / ref_w as f64).min(region.height as f64 / ref_h as f64)
    * extra_scale;
  let width = ((ref_w as f64 * scale).round() as u32).clamp(1, region.width);
  let height = ((ref_h as f64 * scale).round() as u32).clamp(1, region.height);
  PixelRegion {
    x: region.x + (region.width - width) / 2,
    y: region.y + (region.height - height) / 2,
    width,
    height,
  }
}

/// 以 OpenCV 的 HSV 约定（S、V 取 0..=255）判断是否为白色或浅灰背景
fn is_light_background(r: u8, g: u8, b: u8) -> bool {
  let max = r.max(g).max(b) as u32;
  let min = r.min(g).min(b) as u32;
  let saturation = if max == 0 { 0 } else { (max - min) * 255 / max };

  let white = max >= 200 && saturation <= 30;
  let light_gray = (180..=220).contains(&max) && saturation <= 20;
  white || light_gray
}

/// 打开参考图，空图视为不可用
fn load_reference(path: &Path) -> Result<DynamicImage, String> {
  let reference = image::open(path).map_err(|e| e.to_string())?;
  if reference.width() == 0 || reference.height() == 0 {
    return Err("参考图尺寸为 0".to_string());
  }
  Ok(reference)
}

pub struct Compositor {
  config: CompositeConfig,
}

impl Default for Compositor {
  fn default() -> Self {
    Self::new(CompositeConfig::default())
  }
}

impl Compositor {
  pub fn new(config: CompositeConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &CompositeConfig {
    &self.config
  }

  fn placement(&self, region: PixelRegion, ref_w: u32, ref_h: u32, image_area: u64) -> PixelRegion {
    match self.config.fit {
      FitMode::Fill => region,
      FitMode::Contain => centered(region, ref_w, ref_h, 1.0),
      FitMode::Adaptive => {
        let ratio = region.area() as f64 / image_area.max(1) as f64;
        centered(region, ref_w, ref_h, adaptive_scale(ratio))
      }
    }
  }

  fn alpha_of(&self, fitted: &RgbaImage, has_alpha: bool) -> GrayImage {
    let mut alpha = GrayImage::from_fn(fitted.width(), fitted.height(), |x, y| {
      let [r, g, b, a] = fitted.get_pixel(x, y).0;
      match self.config.blend {
        BlendMode::Replace => Luma([255]),
        BlendMode::AlphaKey if has_alpha => Luma([a]),
        BlendMode::AlphaKey if is_light_background(r, g, b) => Luma([0]),
        BlendMode::AlphaKey => Luma([255]),
      }
    });
    if self.config.feather_sigma > 0.0 {
      alpha = gaussian_blur_f32(&alpha, self.config.feather_sigma);
    }
    alpha
  }

  fn load_mask(&self, part: &SegmentedPart, width: u32, height: u32) -> Result<GrayImage, String> {
    let root = self
      .config
      .mask_root
      .as_deref()
      .ok_or_else(|| "未配置掩码根目录".to_string())?;
    let path = root.join(part.mask_url.trim_start_matches('/'));
    let mask = image::open(&path).map_err(|e| e.to_string())?.to_luma8();
    if mask.dimensions() != (width, height) {
      return Err(format!(
        "掩码尺寸 {}x{} 与原图 {}x{} 不一致",
        mask.width(),
        mask.height(),
        width,
        height
      ));
    }
    Ok(mask)
  }

  /// 把参考图依次贴到各部件区域
  ///
  /// 先检查全部部件的区域，任何一个无效都不会修改像素。
  /// 重叠区域以后出现的部件为准。
  pub fn composite(
    &self,
    original: &DynamicImage,
    parts: &[SegmentedPart],
    selection: &ReferenceSelection,
  ) -> Result<Composition, CompositeError> {
    let (img_w, img_h) = (original.width(), original.height());

    let regions = parts
      .iter()
      .enumerate()
      .map(|(index, part)| {
        PixelRegion::from_bbox(&part.detection.bbox, img_w, img_h).map_err(|reason| {
          CompositeError::InvalidRegion {
            index,
            class_name: part.detection.class_name.clone(),
            reason,
          }
        })
      })
      .collect::<Result<Vec<_>, _>>()?;

    let mut canvas = original.to_rgba8();
    let mut cache: HashMap<PartClass, Result<DynamicImage, String>> = HashMap::new();
    let mut applied_references = Vec::new();
    let mut warnings = Vec::new();

    for (part, region) in parts.iter().zip(regions) {
      let class = &part.detection.class_name;
      let Some(reference_path) = selection.get(class) else {
        continue;
      };

      let reference = match cache
        .entry(class.clone())
        .or_insert_with(|| load_reference(reference_path))
      {
        Ok(reference) => reference,
        Err(reason) => {
          warn!("参考图 {} 不可用: {}", reference_path.display(), reason);
          warnings.push(CompositeWarning::ReferenceUnavailable {
            detection_id: part.detection_id.clone(),
            class_name: class.clone(),
            reference: reference_path.to_path_buf(),
            reason: reason.clone(),
          });
          continue;
        }
      };

      let target = self.placement(
        region,
        reference.width(),
        reference.height(),
        img_w as u64 * img_h as u64,
      );
      let fitted = image::imageops::resize(
        &reference.to_rgba8(),
        target.width,
        target.height,
        self.config.filter.into(),
      );
      let alpha = self.alpha_of(&fitted, reference.color().has_alpha());

      let mask = if self.config.respect_masks {
        match self.load_mask(part, img_w, img_h) {
          Ok(mask) => Some(mask),
          Err(reason) => {
            warn!("部件 {} 的掩码被忽略: {}", part.detection_id, reason);
            warnings.push(CompositeWarning::MaskUnavailable {
              detection_id: part.detection_id.clone(),
              mask_url: part.mask_url.clone(),
              reason,
            });
            None
          }
        }
      } else {
        None
      };

      for (dx, dy, source) in fitted.enumerate_pixels() {
        let (x, y) = (target.x + dx, target.y + dy);
        if let Some(mask) = &mask
          && mask.get_pixel(x, y).0[0] < MASK_THRESHOLD
        {
          continue;
        }
        let a = alpha.get_pixel(dx, dy).0[0];
        if a == 0 {
          continue;
        }
        let pixel = canvas.get_pixel_mut(x, y);
        for c in 0..3 {
          pixel.0[c] = if a == u8::MAX {
            source.0[c]
          } else {
            let a = a as f32 / 255.0;
            (pixel.0[c] as f32 * (1.0 - a) + source.0[c] as f32 * a).round() as u8
          };
        }
      }

      debug!(
        "已贴入 {} ({}) 于 ({}, {}) {}x{}",
        part.detection_id, class, target.x, target.y, target.width, target.height
      );
      applied_references.push(AppliedReference {
        detection_id: part.detection_id.clone(),
        class_name: class.clone(),
        reference: reference_path.to_path_buf(),
      });
    }

    // 未替换任何部件时保留原图的像素格式与位深
    let image = if applied_references.is_empty() {
      original.clone()
    } else if original.color().has_alpha() {
      DynamicImage::ImageRgba8(canvas)
    } else {
      DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8())
    };

    Ok(Composition {
      image,
      applied_references,
      warnings,
    })
  }

  /// 合成并以 PNG 原子写出
  pub fn composite_to_file(
    &self,
    original: &DynamicImage,
    parts: &[SegmentedPart],
    selection: &ReferenceSelection,
    output_path: &Path,
    output_url: &str,
  ) -> Result<CompositeResult, CompositeError> {
    let composition = self.composite(original, parts, selection)?;
    write_png_atomic(output_path, &composition.image)?;
    info!(
      "合成完成: 替换 {} 个部件，{} 条警告，输出 {}",
      composition.applied_references.len(),
      composition.warnings.len(),
      output_path.display()
    );

    Ok(CompositeResult {
      output_image_url: output_url.to_string(),
      output_image_path: output_path.to_path_buf(),
      source_segmented_parts: parts.to_vec(),
      applied_references: composition.applied_references,
      warnings: composition.warnings,
      timestamp: Utc::now(),
    })
  }
}
