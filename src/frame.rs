// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 带显式通道顺序的帧定义
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

use image::{ImageBuffer, RgbImage};
use thiserror::Error;

pub const CHANNELS: usize = 3;

/// 像素通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
  /// 图像编码使用的顺序
  Rgb,
  /// 绘制与视频编解码使用的顺序
  Bgr,
}

impl ChannelOrder {
  /// 将 RGB 颜色转换为该顺序下的像素值
  pub fn arrange(&self, rgb: [u8; 3]) -> [u8; 3] {
    match self {
      ChannelOrder::Rgb => rgb,
      ChannelOrder::Bgr => [rgb[2], rgb[1], rgb[0]],
    }
  }
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("frame buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("frame has zero width or height")]
  Empty,
}

/// 交错存储（HWC）的 8 位三通道帧。
///
/// 像素保存在 `RgbImage` 中，但字节顺序由 `order` 决定，不一定是 RGB。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  order: ChannelOrder,
  buffer: RgbImage,
}

impl Frame {
  pub fn from_raw(
    width: u32,
    height: u32,
    order: ChannelOrder,
    data: Vec<u8>,
  ) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::Empty);
    }
    let expected = Self::byte_len(width, height);
    let actual = data.len();
    let buffer = ImageBuffer::from_raw(width, height, data)
      .filter(|_| actual == expected)
      .ok_or(FrameError::SizeMismatch { expected, actual })?;

    Ok(Self { order, buffer })
  }

  /// 指定尺寸下一帧所占的字节数
  pub fn byte_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * CHANNELS
  }

  pub fn dimensions(&self) -> (u32, u32) {
    self.buffer.dimensions()
  }

  pub fn order(&self) -> ChannelOrder {
    self.order
  }

  pub fn as_bytes(&self) -> &[u8] {
    self.buffer.as_raw()
  }

  /// 读取 (x, y) 处的像素，并按 RGB 顺序返回
  pub fn pixel_rgb(&self, x: u32, y: u32) -> [u8; 3] {
    // 交换是对合的，同一个函数可以双向转换
    self.order.arrange(self.buffer.get_pixel(x, y).0)
  }

  /// 转换为指定的通道顺序
  pub fn into_order(mut self, order: ChannelOrder) -> Self {
    if self.order != order {
      for px in self.buffer.pixels_mut() {
        px.0.swap(0, 2);
      }
      self.order = order;
    }
    self
  }

  /// 以原始通道顺序将帧视为 `ImageBuffer`，供绘制使用。
  ///
  /// 缓冲区中的像素仍是帧自身的顺序，颜色需要先经过 [`ChannelOrder::arrange`]。
  pub fn into_buffer(self) -> (RgbImage, ChannelOrder) {
    (self.buffer, self.order)
  }

  pub fn from_buffer(buffer: RgbImage, order: ChannelOrder) -> Self {
    Self { order, buffer }
  }

  /// 转换为 RGB 图像，用于编码输出
  pub fn to_rgb_image(&self) -> RgbImage {
    self.clone().into_order(ChannelOrder::Rgb).buffer
  }
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    Frame::from_buffer(image, ChannelOrder::Rgb)
  }
}
