// 该文件是 Gaizhuang （改装） 项目的一部分。
// src/backend/fixed.rs - 固定标签分类器
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

use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  backend::{BackendError, Classification, Classifier},
};

/// 总是返回同一个标签的分类器，`label://car` 可用于跳过分类
pub struct FixedLabelClassifier {
  label: String,
}

impl FixedLabelClassifier {
  pub fn new(label: impl Into<String>) -> Self {
    Self {
      label: label.into(),
    }
  }
}

impl FromUrlWithScheme for FixedLabelClassifier {
  const SCHEME: &'static str = "label";
}

impl FromUrl for FixedLabelClassifier {
  type Error = BackendError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(BackendError::SchemeMismatch(format!(
        "期望方案 '{}', 实际方案 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let label = url
      .host_str()
      .filter(|h| !h.is_empty())
      .map(str::to_string)
      .unwrap_or_else(|| url.path().trim_matches('/').to_string());

    if label.is_empty() {
      return Err(BackendError::InvalidUrl(format!("缺少标签: {}", url)));
    }

    Ok(FixedLabelClassifier::new(label))
  }
}

impl Classifier for FixedLabelClassifier {
  fn name(&self) -> &str {
    Self::SCHEME
  }

  fn classify(&self, _image: &[u8]) -> Result<Classification, BackendError> {
    Ok(Classification {
      label: self.label.clone(),
    })
  }
}
