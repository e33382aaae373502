// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/image.rs - 上传图像解码
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

use image::ImageReader;
use thiserror::Error;
use tracing::debug;

use crate::frame::{ChannelOrder, Frame};

#[derive(Error, Debug)]
pub enum ImageInputError {
  #[error("empty image data")]
  Empty,
  #[error("cannot read image: {0}")]
  Io(#[from] std::io::Error),
  #[error("cannot decode image: {0}")]
  Decode(#[from] image::ImageError),
  #[error("image has zero width or height")]
  ZeroSized,
}

/// 解码上传的图像字节，格式由内容推断，结果转换为 BGR 顺序
pub fn decode_image(bytes: &[u8]) -> Result<Frame, ImageInputError> {
  if bytes.is_empty() {
    return Err(ImageInputError::Empty);
  }

  let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
  debug!("上传图像格式: {:?}", reader.format());
  let image = reader.decode()?.into_rgb8();
  if image.width() == 0 || image.height() == 0 {
    return Err(ImageInputError::ZeroSized);
  }

  Ok(Frame::from(image).into_order(ChannelOrder::Bgr))
}
