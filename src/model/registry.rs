// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/registry.rs - 模型注册表
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

//! 进程启动时一次性加载的模型集合。
//!
//! 选择器字符串映射到已加载的模型；未知或缺失的选择器回退到默认模型，
//! 请求不会因为选择器而失败。

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::model::{Model, ModelError};

#[derive(Error, Debug)]
pub enum RegistryError {
  #[error("no model registered")]
  Empty,
  #[error("default model '{0}' is not registered")]
  UnknownDefault(String),
  #[error("model '{0}' is registered twice")]
  Duplicate(String),
  #[error("invalid model specification '{0}', expected <key>=<url>")]
  InvalidSpec(String),
  #[error("invalid model URL '{url}': {source}")]
  InvalidUrl {
    url: String,
    source: url::ParseError,
  },
  #[error("unsupported model scheme '{0}'")]
  UnsupportedScheme(String),
  #[error("failed to load model '{key}': {source}")]
  Load {
    key: String,
    source: ModelError,
  },
}

/// 模型集合，加载后只读，可在线程间共享
pub struct ModelRegistry {
  models: BTreeMap<String, Arc<dyn Model>>,
  default_key: String,
}

impl std::fmt::Debug for ModelRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModelRegistry")
      .field("models", &self.models.keys().collect::<Vec<_>>())
      .field("default_key", &self.default_key)
      .finish()
  }
}

impl ModelRegistry {
  pub fn builder() -> ModelRegistryBuilder {
    ModelRegistryBuilder::default()
  }

  /// 按选择器取模型，未识别的选择器回退到默认模型
  pub fn resolve(&self, selector: Option<&str>) -> Arc<dyn Model> {
    let key = self.resolve_key(selector);
    debug!("选择器 {:?} -> 模型 {}", selector, key);
    // 构造时已保证默认键存在
    Arc::clone(&self.models[key])
  }

  /// 选择器最终对应的键
  pub fn resolve_key<'a>(&'a self, selector: Option<&str>) -> &'a str {
    match selector.map(str::trim) {
      Some(s) => match self.models.get_key_value(s) {
        Some((key, _)) => key.as_str(),
        None => self.default_key.as_str(),
      },
      None => self.default_key.as_str(),
    }
  }

  pub fn default_key(&self) -> &str {
    &self.default_key
  }

}

#[derive(Default)]
pub struct ModelRegistryBuilder {
  models: BTreeMap<String, Arc<dyn Model>>,
  default_key: Option<String>,
}

impl ModelRegistryBuilder {
  pub fn model(mut self, key: &str, model: Arc<dyn Model>) -> Result<Self, RegistryError> {
    if self.models.contains_key(key) {
      return Err(RegistryError::Duplicate(key.to_string()));
    }
    self.models.insert(key.to_string(), model);
    Ok(self)
  }

  /// 从 `<key>=<url>` 形式的描述加载模型
  pub fn model_spec(self, spec: &str) -> Result<Self, RegistryError> {
    let (key, url) = parse_model_spec(spec)?;
    let model = load_from_url(&key, &url)?;
    self.model(&key, model)
  }

  pub fn default_model(mut self, key: &str) -> Self {
    self.default_key = Some(key.to_string());
    self
  }

  pub fn build(self) -> Result<ModelRegistry, RegistryError> {
    if self.models.is_empty() {
      return Err(RegistryError::Empty);
    }

    // 未指定默认模型时使用键序中的第一个
    let default_key = match self.default_key {
      Some(key) => key,
      None => self
        .models
        .keys()
        .next()
        .cloned()
        .ok_or(RegistryError::Empty)?,
    };
    if !self.models.contains_key(&default_key) {
      return Err(RegistryError::UnknownDefault(default_key));
    }

    info!(
      "模型注册表就绪: {:?}, 默认模型: {}",
      self.models.keys().collect::<Vec<_>>(),
      default_key
    );

    Ok(ModelRegistry {
      models: self.models,
      default_key,
    })
  }
}

pub fn parse_model_spec(spec: &str) -> Result<(String, Url), RegistryError> {
  let (key, url) = spec
    .split_once('=')
    .ok_or_else(|| RegistryError::InvalidSpec(spec.to_string()))?;
  let key = key.trim();
  if key.is_empty() {
    return Err(RegistryError::InvalidSpec(spec.to_string()));
  }

  let url = Url::parse(url.trim()).map_err(|source| RegistryError::InvalidUrl {
    url: url.to_string(),
    source,
  })?;

  Ok((key.to_string(), url))
}

fn load_from_url(key: &str, url: &Url) -> Result<Arc<dyn Model>, RegistryError> {
  #[cfg(feature = "onnx")]
  {
    use crate::{FromUrl, FromUrlWithScheme, model::OnnxModelBuilder};

    if url.scheme() == OnnxModelBuilder::SCHEME {
      let model = OnnxModelBuilder::from_url(url)
        .and_then(|builder| builder.name(key).build())
        .map_err(|source| RegistryError::Load {
          key: key.to_string(),
          source,
        })?;
      return Ok(Arc::new(model));
    }
  }

  Err(RegistryError::UnsupportedScheme(url.scheme().to_string()))
}
