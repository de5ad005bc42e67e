use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gaizhuang::backend::{
  BackendError, Classification, Classifier, Detector, SegmentRequest, Segmenter,
};
use gaizhuang::config::PipelineConfig;
use gaizhuang::detection::{Detection, DetectionSet, ImageDimensions, PartClass};
use gaizhuang::workspace::encode_png;
use gaizhuang::Pipeline;
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};

pub const WIDTH: u32 = 800;
pub const HEIGHT: u32 = 600;

/// 800x600 灰色 PNG 图像的字节
pub fn car_image() -> Vec<u8> {
  let image = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([90, 90, 90]));
  encode_png(&DynamicImage::ImageRgb8(image)).expect("Failed to encode test image")
}

/// 在目录中写出纯色参考图
pub fn reference_image(dir: &Path, name: &str, color: Rgb<u8>) -> PathBuf {
  let path = dir.join(name);
  RgbImage::from_pixel(16, 16, color)
    .save(&path)
    .expect("Failed to save reference image");
  path
}

pub fn detection(class: &str, confidence: f32, bbox: [f32; 4]) -> Detection {
  Detection::new(PartClass::new(class).unwrap(), confidence, bbox.into())
}

/// 两个重叠的 rim（IoU 0.7）和一个低置信度的 headlight-left
pub fn overlapping_rims() -> Vec<Detection> {
  vec![
    detection("rim", 0.9, [100.0, 100.0, 200.0, 200.0]),
    detection("rim", 0.6, [100.0, 100.0, 200.0, 170.0]),
    detection("headlight-left", 0.05, [300.0, 300.0, 350.0, 340.0]),
  ]
}

/// 返回固定标签；可以先等待 `delay`，或者直接报错
pub struct FakeClassifier {
  pub label: String,
  pub delay: Duration,
  pub fail: bool,
  pub calls: AtomicUsize,
}

impl FakeClassifier {
  pub fn new(label: &str) -> Arc<Self> {
    Arc::new(Self {
      label: label.to_string(),
      delay: Duration::ZERO,
      fail: false,
      calls: AtomicUsize::new(0),
    })
  }

  pub fn slow(label: &str, delay: Duration) -> Arc<Self> {
    Arc::new(Self {
      label: label.to_string(),
      delay,
      fail: false,
      calls: AtomicUsize::new(0),
    })
  }

  pub fn failing() -> Arc<Self> {
    Arc::new(Self {
      label: String::new(),
      delay: Duration::ZERO,
      fail: true,
      calls: AtomicUsize::new(0),
    })
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Classifier for FakeClassifier {
  fn name(&self) -> &str {
    "fake-classifier"
  }

  fn classify(&self, _image: &[u8]) -> Result<Classification, BackendError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    std::thread::sleep(self.delay);
    if self.fail {
      return Err(BackendError::Failed {
        code: Some(1),
        stderr: "model weights not found".to_string(),
      });
    }
    Ok(Classification {
      label: self.label.clone(),
    })
  }
}

pub struct FakeDetector {
  pub detections: Vec<Detection>,
  pub fail: bool,
  pub calls: AtomicUsize,
}

impl FakeDetector {
  pub fn new(detections: Vec<Detection>) -> Arc<Self> {
    Arc::new(Self {
      detections,
      fail: false,
      calls: AtomicUsize::new(0),
    })
  }

  pub fn failing() -> Arc<Self> {
    Arc::new(Self {
      detections: Vec::new(),
      fail: true,
      calls: AtomicUsize::new(0),
    })
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Detector for FakeDetector {
  fn name(&self) -> &str {
    "fake-detector"
  }

  fn detect(&self, image_path: &Path) -> Result<DetectionSet, BackendError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    assert!(image_path.is_file(), "detector input must exist");
    if self.fail {
      return Err(BackendError::Failed {
        code: Some(2),
        stderr: "CUDA out of memory".to_string(),
      });
    }
    Ok(
      DetectionSet::new(ImageDimensions::new(WIDTH, HEIGHT), "fake-yolo")
        .with_detections(self.detections.clone()),
    )
  }
}

/// 写出整图白色掩码；`fail_classes` 中的类别返回错误
pub struct FakeSegmenter {
  pub fail_classes: Vec<String>,
  pub calls: AtomicUsize,
}

impl FakeSegmenter {
  pub fn new() -> Arc<Self> {
    Self::failing_on(&[])
  }

  pub fn failing_on(classes: &[&str]) -> Arc<Self> {
    Arc::new(Self {
      fail_classes: classes.iter().map(|c| c.to_string()).collect(),
      calls: AtomicUsize::new(0),
    })
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Segmenter for FakeSegmenter {
  fn name(&self) -> &str {
    "fake-segmenter"
  }

  fn segment(&self, request: &SegmentRequest) -> Result<PathBuf, BackendError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self
      .fail_classes
      .iter()
      .any(|c| c == request.prompts.class_name.as_str())
    {
      return Err(BackendError::InvalidOutput("no mask produced".to_string()));
    }
    GrayImage::from_pixel(WIDTH, HEIGHT, Luma([255]))
      .save(&request.output_path)
      .map_err(|e| BackendError::InvalidOutput(e.to_string()))?;
    Ok(request.output_path.clone())
  }
}

pub fn config_for(root: &Path) -> PipelineConfig {
  PipelineConfig {
    artifact_root: root.to_path_buf(),
    ..PipelineConfig::default()
  }
}

pub fn pipeline(
  root: &Path,
  classifier: Arc<FakeClassifier>,
  detector: Arc<FakeDetector>,
  segmenter: Arc<FakeSegmenter>,
) -> Pipeline {
  pipeline_with(config_for(root), classifier, detector, segmenter)
}

pub fn pipeline_with(
  config: PipelineConfig,
  classifier: Arc<FakeClassifier>,
  detector: Arc<FakeDetector>,
  segmenter: Arc<FakeSegmenter>,
) -> Pipeline {
  Pipeline::new(config, classifier, detector, segmenter)
}

/// 产物根目录下某个子目录中的文件数
pub fn entries(root: &Path, dir: &str) -> usize {
  std::fs::read_dir(root.join(dir))
    .map(|entries| entries.count())
    .unwrap_or(0)
}
