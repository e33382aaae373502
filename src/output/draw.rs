// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

//! 在帧上绘制检测框与类别标签。
//!
//! 按检测序列的顺序绘制，重叠时后面的框覆盖前面的框，不做额外的层级处理。

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use ab_glyph::{FontArc, PxScale};
use image::{ImageBuffer, Rgb};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  frame::{ChannelOrder, Frame},
  model::{ClassTable, Detection},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（无字体时估算）
const LABEL_TEXT_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const TEXT_COLOR: [u8; 3] = [255, 255, 255];
const UNKNOWN_CLASS_COLOR: [u8; 3] = [128, 128, 128];

/// 常见系统字体位置，按顺序尝试
const SYSTEM_FONTS: [&str; 6] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
  "/System/Library/Fonts/Supplemental/Arial.ttf",
  "C:\\Windows\\Fonts\\arial.ttf",
];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("cannot read font file {path}: {source}")]
  FontRead {
    path: String,
    source: std::io::Error,
  },
  #[error("invalid font file {0}")]
  InvalidFont(String),
}

fn load_font(path: &Path) -> Result<FontArc, DrawError> {
  let data = std::fs::read(path).map_err(|source| DrawError::FontRead {
    path: path.display().to_string(),
    source,
  })?;
  let font =
    FontArc::try_from_vec(data).map_err(|_| DrawError::InvalidFont(path.display().to_string()))?;
  debug!("加载字体: {}", path.display());
  Ok(font)
}

pub struct Annotator {
  classes: ClassTable,
  font: Option<FontArc>,
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_padding: i32,
  thickness: i32,
  warned_no_font: AtomicBool,
}

impl Default for Annotator {
  fn default() -> Self {
    Self::new(ClassTable::durian()).with_system_font()
  }
}

impl Annotator {
  /// 不带字体的绘制器，标签只绘制背景
  pub fn new(classes: ClassTable) -> Self {
    Self {
      classes,
      font: None,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_padding: LABEL_TEXT_PADDING,
      thickness: BOX_THICKNESS,
      warned_no_font: AtomicBool::new(false),
    }
  }

  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_font_file(self, path: &Path) -> Result<Self, DrawError> {
    Ok(self.with_font(load_font(path)?))
  }

  /// 尝试加载系统字体，找不到时保持无字体
  pub fn with_system_font(self) -> Self {
    for path in SYSTEM_FONTS.iter().map(Path::new).filter(|p| p.is_file()) {
      match load_font(path) {
        Ok(font) => return self.with_font(font),
        Err(e) => debug!("{}", e),
      }
    }
    self
  }

  /// 绘制全部检测结果。空序列原样返回输入帧。
  pub fn annotate(&self, frame: Frame, detections: &[Detection]) -> Frame {
    if detections.is_empty() {
      return frame;
    }

    if self.font.is_none() && !self.warned_no_font.swap(true, Ordering::Relaxed) {
      warn!("未加载字体，标签只绘制背景");
    }

    let (mut image, order) = frame.into_buffer();
    for detection in detections {
      let (label, color) = match self.classes.get(detection.class_id) {
        Some(entry) => (entry.label.to_string(), entry.color),
        None => {
          warn!("未知类别编号 {}", detection.class_id);
          (
            format!("class {}", detection.class_id),
            UNKNOWN_CLASS_COLOR,
          )
        }
      };
      let text = format!("{} {:.2}", label, detection.confidence);
      self.draw_bbox_with_label(&mut image, order, &detection.bbox, &text, color);
    }

    Frame::from_buffer(image, order)
  }

  // 在图像上绘制矩形边框和标签，bbox 为像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(
    &self,
    image: &mut ImageBuffer<Rgb<u8>, Vec<u8>>,
    order: ChannelOrder,
    bbox: &[f32; 4],
    text: &str,
    color: [u8; 3],
  ) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let color = Rgb(order.arrange(color));

    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 边框向内加粗
    for t in 0..self.thickness {
      let rect_w = x_max - x_min + 1 - 2 * t;
      let rect_h = y_max - y_min + 1 - 2 * t;
      if rect_w <= 0 || rect_h <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(rect_w as u32, rect_h as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let scale = PxScale::from(self.font_size);
    let text_width = match &self.font {
      Some(font) => text_size(scale, font, text).0 as i32 + 2 * self.label_text_padding,
      None => (text.len() as f32 * self.label_char_width) as i32,
    };
    let text_height = self.label_text_height;

    // 标签放在边框上方，空间不足时放在框内顶部
    let label_y = if y_min >= text_height {
      y_min - text_height
    } else {
      y_min
    };
    let label_width = text_width.min(w);
    let label_x = x_min.min(w - label_width).max(0);
    let label_height = text_height.min(h - label_y);

    if label_width <= 0 || label_height <= 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(label_width as u32, label_height as u32);
    draw_filled_rect_mut(image, rect, color);

    if let Some(font) = &self.font {
      draw_text_mut(
        image,
        Rgb(order.arrange(TEXT_COLOR)),
        label_x + self.label_text_padding,
        label_y + self.label_text_padding,
        scale,
        font,
        text,
      );
    }
  }
}
