// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 模型
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

//! 基于 ONNX Runtime 的 YOLO 检测模型。
//!
//! 模型地址形如 `onnx:///models/modelv4.onnx?instances=2&size=640`：
//! - `instances`：会话数量，推理请求轮询分配，默认 1
//! - `size`：模型方形输入边长，默认 640

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{
  Mutex,
  atomic::{AtomicUsize, Ordering},
};

use image::imageops::{self, FilterType};
use ndarray::{Array4, Dimension};
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::TensorRef,
};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  model::{Model, ModelError, RawOutput},
};

const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_INSTANCES: usize = 1;

pub struct OnnxModelBuilder {
  path: PathBuf,
  name: Option<String>,
  instances: usize,
  input_size: u32,
}

impl FromUrl for OnnxModelBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let mut builder = OnnxModelBuilder::new(url.path());
    if let Some(v) = query.get("instances") {
      builder = builder.instances(parse_param("instances", v)?);
    }
    if let Some(v) = query.get("size") {
      builder = builder.input_size(parse_param("size", v)?);
    }

    Ok(builder)
  }
}

impl FromUrlWithScheme for OnnxModelBuilder {
  const SCHEME: &'static str = "onnx";
}

fn parse_param<T: std::str::FromStr + PartialOrd + Default>(
  name: &'static str,
  value: &str,
) -> Result<T, ModelError> {
  match value.parse::<T>() {
    Ok(v) if v > T::default() => Ok(v),
    _ => Err(ModelError::InvalidParameter {
      name,
      value: value.to_string(),
    }),
  }
}

impl OnnxModelBuilder {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      name: None,
      instances: DEFAULT_INSTANCES,
      input_size: DEFAULT_INPUT_SIZE,
    }
  }

  pub fn name(mut self, name: &str) -> Self {
    self.name = Some(name.to_string());
    self
  }

  pub fn instances(mut self, instances: usize) -> Self {
    self.instances = instances.max(1);
    self
  }

  pub fn input_size(mut self, size: u32) -> Self {
    self.input_size = size;
    self
  }

  pub fn build(self) -> Result<OnnxModel, ModelError> {
    let path_display = self.path.display().to_string();
    if !self.path.is_file() {
      return Err(ModelError::Load {
        path: path_display,
        reason: "file not found".to_string(),
      });
    }

    info!("加载模型文件: {}，会话数量: {}", path_display, self.instances);
    let sessions = (0..self.instances)
      .map(|_| {
        let session = Session::builder()?
          .with_optimization_level(GraphOptimizationLevel::Level3)?
          .commit_from_file(&self.path)?;
        Ok(Mutex::new(session))
      })
      .collect::<Result<Vec<_>, ort::Error>>()
      .map_err(|e| ModelError::Load {
        path: path_display.clone(),
        reason: e.to_string(),
      })?;

    // 输出名称在加载时确定，推理时不再查找
    let output_name = sessions
      .first()
      .and_then(|s| s.lock().ok())
      .and_then(|s| s.outputs.first().map(|o| o.name.clone()))
      .ok_or_else(|| ModelError::Load {
        path: path_display.clone(),
        reason: "model has no output".to_string(),
      })?;
    debug!("模型输出名称: {}", output_name);

    let name = self.name.unwrap_or_else(|| {
      self
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or(path_display)
    });
    info!("模型 {} 加载完成", name);

    Ok(OnnxModel {
      name,
      sessions,
      counter: AtomicUsize::new(0),
      input_size: self.input_size,
      output_name,
    })
  }
}

/// ONNX Runtime 会话池，多个请求轮询使用各自加锁的会话
pub struct OnnxModel {
  name: String,
  sessions: Vec<Mutex<Session>>,
  counter: AtomicUsize,
  input_size: u32,
  output_name: String,
}

impl OnnxModel {
  /// 缩放到模型输入尺寸并转换为 NCHW，像素值归一化到 [0, 1]
  fn preprocess(&self, frame: &Frame) -> Array4<f32> {
    let size = self.input_size;
    let resized = imageops::resize(&frame.to_rgb_image(), size, size, FilterType::Triangle);

    let mut input = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
      let (x, y) = (x as usize, y as usize);
      let [r, g, b] = pixel.0;
      input[[0, 0, y, x]] = r as f32 / 255.0;
      input[[0, 1, y, x]] = g as f32 / 255.0;
      input[[0, 2, y, x]] = b as f32 / 255.0;
    }
    input
  }
}

impl Model for OnnxModel {
  fn name(&self) -> &str {
    &self.name
  }

  fn infer(&self, frame: &Frame) -> Result<RawOutput, ModelError> {
    let input = self.preprocess(frame);

    let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
    let mut session = self.sessions[index]
      .lock()
      .map_err(|e| ModelError::Inference(format!("session mutex poisoned: {}", e)))?;
    debug!("模型 {} 使用会话 {}", self.name, index);

    let tensor = TensorRef::from_array_view(input.view())?;
    let outputs = session.run(ort::inputs![tensor])?;
    let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;

    Ok(RawOutput::Dense {
      data: data.to_vec(),
      shape: shape.to_ixdyn().slice().to_vec(),
      input_size: (self.input_size, self.input_size),
      frame_size: frame.dimensions(),
    })
  }
}
