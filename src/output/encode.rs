// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/encode.rs - 图像编码为文本负载
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

use std::io::Cursor;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::ImageFormat;
use thiserror::Error;
use tracing::trace;

use crate::frame::Frame;

#[derive(Error, Debug)]
pub enum EncodeError {
  #[error("cannot encode PNG: {0}")]
  Png(#[from] image::ImageError),
}

/// 编码为 PNG，编码前转换为 RGB 顺序
pub fn encode_png(frame: &Frame) -> Result<Vec<u8>, EncodeError> {
  let image = frame.to_rgb_image();
  let mut bytes = Vec::new();
  image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
  trace!("PNG 编码完成: {} 字节", bytes.len());
  Ok(bytes)
}

/// PNG 的 base64 文本（标准字母表，带填充）
pub fn encode_png_base64(frame: &Frame) -> Result<String, EncodeError> {
  Ok(STANDARD.encode(encode_png(frame)?))
}
