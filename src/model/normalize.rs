// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/normalize.rs - 模型输出统一化
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

use tracing::{debug, trace};

use crate::model::{Detection, ModelError, RawBox, RawOutput};

pub const DEFAULT_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_IOU: f32 = 0.7;
pub const DEFAULT_MAX_DETECTIONS: usize = 300;

/// 将任意模型的原始输出转换为统一的检测序列。
///
/// 阈值在构造时固定，调用处不再逐次传递。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
  confidence: f32,
  iou: Option<f32>,
  max_detections: usize,
}

impl Default for Normalizer {
  fn default() -> Self {
    Self {
      confidence: DEFAULT_CONFIDENCE,
      iou: Some(DEFAULT_IOU),
      max_detections: DEFAULT_MAX_DETECTIONS,
    }
  }
}

impl Normalizer {
  pub fn new(confidence: f32, iou: Option<f32>) -> Result<Self, ModelError> {
    check_unit("confidence", confidence)?;
    if let Some(iou) = iou {
      check_unit("iou", iou)?;
    }

    Ok(Self {
      confidence,
      iou,
      ..Self::default()
    })
  }

  pub fn confidence(&self) -> f32 {
    self.confidence
  }

  pub fn iou(&self) -> Option<f32> {
    self.iou
  }

  /// 单帧输出 -> 检测序列；没有目标时返回空序列而不是错误
  pub fn normalize(&self, raw: RawOutput) -> Result<Vec<Detection>, ModelError> {
    let (candidates, frame_size) = match raw {
      RawOutput::Dense {
        data,
        shape,
        input_size,
        frame_size,
      } => (
        self.decode_dense(&data, &shape, input_size, frame_size)?,
        Some(frame_size),
      ),
      RawOutput::Boxes(boxes) => (
        boxes
          .into_iter()
          .filter(|b| b.score >= self.confidence)
          .collect(),
        None,
      ),
    };

    let mut detections: Vec<Detection> = candidates
      .into_iter()
      .filter_map(|b| to_detection(b, frame_size))
      .collect();

    // 按置信度降序排序
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    if let Some(iou) = self.iou {
      detections = nms(detections, iou);
    }
    detections.truncate(self.max_detections);

    debug!("检测到 {} 个物体", detections.len());
    trace!("检测结果: {:?}", detections);
    Ok(detections)
  }

  fn decode_dense(
    &self,
    data: &[f32],
    shape: &[usize],
    input_size: (u32, u32),
    frame_size: (u32, u32),
  ) -> Result<Vec<RawBox>, ModelError> {
    // 支持 [1, 4 + nc, N] 与转置后的 [1, N, 4 + nc]
    let (attrs, anchors, transposed) = match shape {
      [1, a, b] if a <= b => (*a, *b, false),
      [1, a, b] => (*b, *a, true),
      _ => return Err(ModelError::OutputShape(shape.to_vec())),
    };
    if attrs <= 4 {
      return Err(ModelError::OutputShape(shape.to_vec()));
    }
    let expected = attrs * anchors;
    if data.len() != expected {
      return Err(ModelError::OutputLength {
        shape: shape.to_vec(),
        expected,
        actual: data.len(),
      });
    }

    let at = |attr: usize, anchor: usize| -> f32 {
      if transposed {
        data[anchor * attrs + attr]
      } else {
        data[attr * anchors + anchor]
      }
    };

    let scale_x = frame_size.0 as f32 / input_size.0.max(1) as f32;
    let scale_y = frame_size.1 as f32 / input_size.1.max(1) as f32;

    let mut boxes = Vec::new();
    for anchor in 0..anchors {
      // 找到最高类别分数
      let (class_id, score) = (4..attrs)
        .map(|attr| (attr - 4, at(attr, anchor)))
        .fold((0usize, f32::MIN), |best, cur| {
          if cur.1 > best.1 { cur } else { best }
        });

      if score < self.confidence {
        continue;
      }

      let cx = at(0, anchor) * scale_x;
      let cy = at(1, anchor) * scale_y;
      let w = at(2, anchor) * scale_x;
      let h = at(3, anchor) * scale_y;

      boxes.push(RawBox {
        bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
        class_id: class_id as u32,
        score,
      });
    }

    Ok(boxes)
  }
}

fn check_unit(name: &'static str, value: f32) -> Result<(), ModelError> {
  if (0.0..=1.0).contains(&value) {
    Ok(())
  } else {
    Err(ModelError::InvalidParameter {
      name,
      value: value.to_string(),
    })
  }
}

/// 排序坐标并裁剪到帧范围内，保证 x1 <= x2、y1 <= y2
fn to_detection(raw: RawBox, frame_size: Option<(u32, u32)>) -> Option<Detection> {
  if !raw.bbox.iter().all(|v| v.is_finite()) || !raw.score.is_finite() {
    return None;
  }

  let [a, b, c, d] = raw.bbox;
  let (mut x1, mut x2) = (a.min(c), a.max(c));
  let (mut y1, mut y2) = (b.min(d), b.max(d));

  if let Some((w, h)) = frame_size {
    let (w, h) = (w as f32, h as f32);
    x1 = x1.clamp(0.0, w);
    x2 = x2.clamp(0.0, w);
    y1 = y1.clamp(0.0, h);
    y2 = y2.clamp(0.0, h);
  }

  Some(Detection {
    bbox: [x1, y1, x2, y2],
    class_id: raw.class_id,
    confidence: raw.score,
  })
}

/// 按类别的非极大值抑制，输入需已按置信度降序排列
fn nms(detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
  let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());

  for det in detections {
    let suppressed = kept
      .iter()
      .any(|best| best.class_id == det.class_id && best.iou(&det) >= threshold);
    if !suppressed {
      kept.push(det);
    }
  }

  kept
}
