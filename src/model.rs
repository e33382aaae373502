// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
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

use serde::Serialize;
use thiserror::Error;

use crate::frame::Frame;

/// 检测模型。
///
/// 实现必须可以在多个线程中同时调用 `infer`，调用方不会额外加锁。
pub trait Model: Send + Sync {
  fn name(&self) -> &str;
  fn infer(&self, frame: &Frame) -> Result<RawOutput, ModelError>;
}

/// 模型单帧的原始输出，由 [`Normalizer`] 统一转换为 [`Detection`]
#[derive(Debug, Clone)]
pub enum RawOutput {
  /// YOLOv8 风格的稠密输出，形状为 `[1, 4 + 类别数, 候选数]`，
  /// 坐标为模型输入空间中的中心点与宽高
  Dense {
    data: Vec<f32>,
    shape: Vec<usize>,
    input_size: (u32, u32),
    frame_size: (u32, u32),
  },
  /// 已解码的候选框，坐标已在帧像素空间
  Boxes(Vec<RawBox>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawBox {
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
  pub class_id: u32,
  pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，像素坐标
  pub class_id: u32,
  pub confidence: f32,
}

impl Detection {
  pub fn x1(&self) -> f32 {
    self.bbox[0]
  }

  pub fn y1(&self) -> f32 {
    self.bbox[1]
  }

  pub fn x2(&self) -> f32 {
    self.bbox[2]
  }

  pub fn y2(&self) -> f32 {
    self.bbox[3]
  }

  pub fn area(&self) -> f32 {
    (self.x2() - self.x1()).max(0.0) * (self.y2() - self.y1()).max(0.0)
  }

  /// 计算两个边界框的 IoU
  pub fn iou(&self, other: &Detection) -> f32 {
    let x1 = self.x1().max(other.x1());
    let y1 = self.y1().max(other.y1());
    let x2 = self.x2().min(other.x2());
    let y2 = self.y2().min(other.y2());

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassEntry {
  pub label: &'static str,
  pub color: [u8; 3], // RGB
}

/// 类别编号到 (标签, 颜色) 的静态映射
#[derive(Debug, Clone, Copy)]
pub struct ClassTable {
  entries: &'static [ClassEntry],
}

const DURIAN_CLASSES: [ClassEntry; 3] = [
  ClassEntry {
    label: "defective",
    color: [255, 157, 0], // 橙色
  },
  ClassEntry {
    label: "immature",
    color: [0, 200, 83], // 绿色
  },
  ClassEntry {
    label: "mature",
    color: [230, 25, 25], // 红色
  },
];

impl ClassTable {
  pub const fn new(entries: &'static [ClassEntry]) -> Self {
    Self { entries }
  }

  /// 榴莲成熟度类别表：0 defective, 1 immature, 2 mature
  pub const fn durian() -> Self {
    Self::new(&DURIAN_CLASSES)
  }

  pub fn get(&self, class_id: u32) -> Option<&ClassEntry> {
    self.entries.get(class_id as usize)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl Default for ClassTable {
  fn default() -> Self {
    Self::durian()
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("failed to load model {path}: {reason}")]
  Load { path: String, reason: String },
  #[error("inference failed: {0}")]
  Inference(String),
  #[error("unexpected model output shape {0:?}")]
  OutputShape(Vec<usize>),
  #[error("model output has {actual} values, shape {shape:?} needs {expected}")]
  OutputLength {
    shape: Vec<usize>,
    expected: usize,
    actual: usize,
  },
  #[error("URI scheme mismatch: expected '{expected}', found '{found}'")]
  SchemeMismatch {
    expected: &'static str,
    found: String,
  },
  #[error("invalid model parameter {name}: {value}")]
  InvalidParameter { name: &'static str, value: String },
  #[cfg(feature = "onnx")]
  #[error("ONNX Runtime error: {0}")]
  Ort(#[from] ort::Error),
}

pub mod normalize;
pub mod registry;

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxModel, OnnxModelBuilder};

pub use self::normalize::Normalizer;
pub use self::registry::{ModelRegistry, ModelRegistryBuilder, RegistryError};
