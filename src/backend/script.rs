// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/backend/script.rs - 子进程脚本后端
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

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  backend::{BackendError, Classification, Classifier, Detector, SegmentRequest, Segmenter},
  detection::{BoundingBox, Detection, DetectionSet, ImageDimensions, PartClass, Point},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const STDERR_TAIL_BYTES: usize = 4096;

/// 通过子进程调用外部脚本的后端
///
/// 地址格式 `script:///path/to/detector.py?interpreter=python3&timeout=30&name=yolo`。
/// 每次调用写出请求 JSON，执行 `<interpreter> <script> <request.json> <response.json>`，
/// 再按固定结构解析响应文件。
pub struct ScriptBackend {
  name: String,
  interpreter: Option<String>,
  script: PathBuf,
  timeout: Duration,
}

impl FromUrlWithScheme for ScriptBackend {
  const SCHEME: &'static str = "script";
}

impl FromUrl for ScriptBackend {
  type Error = BackendError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(BackendError::SchemeMismatch(format!(
        "期望方案 '{}', 实际方案 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let script = PathBuf::from(url.path());
    if script.as_os_str().is_empty() {
      return Err(BackendError::InvalidUrl(format!("缺少脚本路径: {}", url)));
    }

    let mut interpreter = None;
    let mut timeout = DEFAULT_TIMEOUT;
    let mut name = None;
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "interpreter" => interpreter = Some(v.to_string()),
        "timeout" => {
          let secs: f64 = v
            .parse()
            .map_err(|_| BackendError::InvalidUrl(format!("无效的超时时间: {}", v)))?;
          timeout = Duration::try_from_secs_f64(secs)
            .map_err(|_| BackendError::InvalidUrl(format!("无效的超时时间: {}", v)))?;
        }
        "name" => name = Some(v.to_string()),
        other => warn!("忽略未知的脚本后端参数: {}", other),
      }
    }

    let name = name.unwrap_or_else(|| {
      script
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| Self::SCHEME.to_string())
    });

    Ok(ScriptBackend {
      name,
      interpreter,
      script,
      timeout,
    })
  }
}

#[derive(Serialize)]
struct ImageRequest<'a> {
  kind: &'static str,
  image_path: &'a Path,
}

#[derive(Serialize)]
struct SegmentScriptRequest<'a> {
  kind: &'static str,
  #[serde(flatten)]
  request: &'a SegmentRequest,
}

#[derive(Deserialize)]
struct DetectResponse {
  detections: Vec<RawDetection>,
  metadata: DetectMetadata,
}

#[derive(Deserialize)]
struct RawDetection {
  class_name: PartClass,
  confidence: f32,
  bbox: BoundingBox,
  #[serde(default)]
  center_point: Option<Point>,
}

#[derive(Deserialize)]
struct DetectMetadata {
  image_dimensions: ImageDimensions,
  #[serde(default)]
  model: Option<String>,
}

#[derive(Deserialize)]
struct SegmentResponse {
  mask_path: PathBuf,
}

/// 解析检测脚本的响应，缺少中心点时取边界框质心
pub(crate) fn parse_detect_response(
  data: &[u8],
  default_model: &str,
) -> Result<DetectionSet, BackendError> {
  let response: DetectResponse = serde_json::from_slice(data)?;
  let model = response
    .metadata
    .model
    .unwrap_or_else(|| default_model.to_string());

  let detections = response
    .detections
    .into_iter()
    .map(|raw| {
      let detection = Detection::new(raw.class_name, raw.confidence, raw.bbox);
      match raw.center_point {
        Some(center) => detection.with_center(center),
        None => detection,
      }
    })
    .collect();

  Ok(DetectionSet::new(response.metadata.image_dimensions, model).with_detections(detections))
}

impl ScriptBackend {
  pub fn new(script: impl Into<PathBuf>) -> Self {
    let script = script.into();
    let name = script
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| Self::SCHEME.to_string());
    Self {
      name,
      interpreter: None,
      script,
      timeout: DEFAULT_TIMEOUT,
    }
  }

  pub fn interpreter(mut self, interpreter: impl Into<String>) -> Self {
    self.interpreter = Some(interpreter.into());
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  fn command(&self) -> Command {
    match &self.interpreter {
      Some(interpreter) => {
        let mut command = Command::new(interpreter);
        command.arg(&self.script);
        command
      }
      None => Command::new(&self.script),
    }
  }

  /// 在临时目录 `scratch` 中执行一次脚本调用并读取响应
  fn invoke<Req: Serialize>(&self, scratch: &Path, request: &Req) -> Result<Vec<u8>, BackendError> {
    let request_path = scratch.join("request.json");
    let response_path = scratch.join("response.json");
    let log_path = scratch.join("backend.log");

    std::fs::write(&request_path, serde_json::to_vec_pretty(request)?)?;

    let log = File::create(&log_path)?;
    let mut command = self.command();
    command
      .arg(&request_path)
      .arg(&response_path)
      .stdin(Stdio::null())
      .stdout(Stdio::from(log.try_clone()?))
      .stderr(Stdio::from(log));

    debug!("启动后端脚本 {}: {:?}", self.name, command);
    let started = Instant::now();
    let mut child = command.spawn().map_err(BackendError::Spawn)?;
    let status = wait_with_deadline(&mut child, self.timeout)?;
    debug!("后端脚本 {} 结束，耗时: {:.2?}", self.name, started.elapsed());

    if !status.success() {
      return Err(BackendError::Failed {
        code: status.code(),
        stderr: read_tail(&log_path),
      });
    }

    std::fs::read(&response_path).map_err(|e| {
      BackendError::InvalidOutput(format!(
        "未找到响应文件 {}: {}",
        response_path.display(),
        e
      ))
    })
  }

  fn scratch(&self) -> Result<tempfile::TempDir, BackendError> {
    Ok(
      tempfile::Builder::new()
        .prefix(&format!("gaizhuang-{}-", self.name))
        .tempdir()?,
    )
  }
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<ExitStatus, BackendError> {
  let deadline = Instant::now() + timeout;
  loop {
    if let Some(status) = child.try_wait()? {
      return Ok(status);
    }
    if Instant::now() >= deadline {
      warn!("后端进程 {} 超时，终止进程", child.id());
      let _ = child.kill();
      let _ = child.wait();
      return Err(BackendError::Timeout(timeout));
    }
    thread::sleep(POLL_INTERVAL);
  }
}

fn read_tail(path: &Path) -> String {
  match std::fs::read(path) {
    Ok(data) => {
      let start = data.len().saturating_sub(STDERR_TAIL_BYTES);
      String::from_utf8_lossy(&data[start..]).trim().to_string()
    }
    Err(e) => format!("<无法读取后端日志: {}>", e),
  }
}

impl Classifier for ScriptBackend {
  fn name(&self) -> &str {
    &self.name
  }

  fn classify(&self, image: &[u8]) -> Result<Classification, BackendError> {
    let scratch = self.scratch()?;
    let image_path = scratch.path().join("input.img");
    std::fs::write(&image_path, image)?;

    let response = self.invoke(
      scratch.path(),
      &ImageRequest {
        kind: "classify",
        image_path: &image_path,
      },
    )?;
    let classification: Classification = serde_json::from_slice(&response)?;
    info!("分类结果 ({}): {}", self.name, classification.label);
    Ok(classification)
  }
}

impl Detector for ScriptBackend {
  fn name(&self) -> &str {
    &self.name
  }

  fn detect(&self, image_path: &Path) -> Result<DetectionSet, BackendError> {
    let scratch = self.scratch()?;
    let response = self.invoke(
      scratch.path(),
      &ImageRequest {
        kind: "detect",
        image_path,
      },
    )?;
    parse_detect_response(&response, &self.name)
  }
}

impl Segmenter for ScriptBackend {
  fn name(&self) -> &str {
    &self.name
  }

  fn segment(&self, request: &SegmentRequest) -> Result<PathBuf, BackendError> {
    let scratch = self.scratch()?;
    let response = self.invoke(
      scratch.path(),
      &SegmentScriptRequest {
        kind: "segment",
        request,
      },
    )?;
    let response: SegmentResponse = serde_json::from_slice(&response)?;
    Ok(response.mask_path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_script_url() {
    let url =
      Url::parse("script:///opt/models/yolo_detector.py?interpreter=python3&timeout=2.5").unwrap();
    let backend = ScriptBackend::from_url(&url).unwrap();
    assert_eq!(backend.name, "yolo_detector");
    assert_eq!(backend.interpreter.as_deref(), Some("python3"));
    assert_eq!(backend.script, PathBuf::from("/opt/models/yolo_detector.py"));
    assert_eq!(backend.timeout, Duration::from_millis(2500));
  }

  #[test]
  fn rejects_bad_timeout() {
    let url = Url::parse("script:///opt/x.py?timeout=soon").unwrap();
    assert!(matches!(
      ScriptBackend::from_url(&url),
      Err(BackendError::InvalidUrl(_))
    ));
  }

  #[test]
  fn parses_detect_response() {
    let data = br#"{
      "detections": [
        {"class_name": "rim", "confidence": 0.91, "bbox": [10, 20, 30, 40], "center_point": [21, 31]},
        {"class_name": "hood", "confidence": 0.5, "bbox": [0, 0, 100, 50]}
      ],
      "metadata": {"image_dimensions": {"width": 640, "height": 480}, "detection_parameters": {}}
    }"#;
    let set = parse_detect_response(data, "yolo").unwrap();
    assert_eq!(set.dimensions, ImageDimensions::new(640, 480));
    assert_eq!(set.model, "yolo");
    assert_eq!(set.detections[0].center_point, Point::new(21.0, 31.0));
    assert_eq!(set.detections[1].center_point, Point::new(50.0, 25.0));
  }

  #[test]
  fn detect_response_requires_dimensions() {
    let data = br#"{"detections": [], "metadata": {}}"#;
    assert!(matches!(
      parse_detect_response(data, "yolo"),
      Err(BackendError::Decode(_))
    ));
  }

  #[test]
  fn detect_response_rejects_short_bbox() {
    let data = br#"{
      "detections": [{"class_name": "rim", "confidence": 0.9, "bbox": [1, 2, 3]}],
      "metadata": {"image_dimensions": {"width": 10, "height": 10}}
    }"#;
    assert!(parse_detect_response(data, "yolo").is_err());
  }

  #[cfg(unix)]
  #[test]
  fn missing_script_fails_to_spawn() {
    let backend = ScriptBackend::new("/nonexistent/gaizhuang-detector");
    let result = backend.detect(Path::new("/tmp/none.png"));
    assert!(matches!(result, Err(BackendError::Spawn(_))));
  }
}
