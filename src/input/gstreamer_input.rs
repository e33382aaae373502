// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频输入
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

//! # GStreamer 视频输入模块
//!
//! 使用 `decodebin` 解码视频文件，经 `appsink` 逐帧取出 BGR 数据。
//! appsink 不丢帧，保证输出帧数与输入一致。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## Cargo 特性
//!
//! 启用 `gstreamer_video` 特性。

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::{
  frame::{ChannelOrder, Frame},
  input::video::{Fps, VideoError, VideoInfo, VideoSource},
};

const PULL_TIMEOUT_MS: u64 = 100;
const DEFAULT_FPS: Fps = Fps { num: 25, den: 1 };

fn gst_error(e: impl std::fmt::Display) -> VideoError {
  VideoError::GStreamer(e.to_string())
}

/// GStreamer 视频源
pub struct GStreamerSource {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  info: VideoInfo,
  // 打开时为读取视频信息而预先取出的第一帧
  pending: Option<gst::Sample>,
  released: bool,
}

impl GStreamerSource {
  pub fn open(path: &Path) -> Result<Self, VideoError> {
    gst::init().map_err(gst_error)?;

    let description = format!(
      "filesrc location=\"{}\" ! decodebin ! videoconvert ! video/x-raw,format=BGR ! appsink name=sink sync=false",
      path.display()
    );
    info!("GStreamer pipeline description: {}", description);

    let pipeline = gst::parse::launch(&description)
      .map_err(gst_error)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| VideoError::GStreamer("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or_else(|| VideoError::GStreamer("Failed to get appsink element".to_string()))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| VideoError::GStreamer("Failed to convert element to appsink".to_string()))?;
    appsink.set_drop(false);

    let mut source = GStreamerSource {
      pipeline,
      appsink,
      info: VideoInfo {
        width: 0,
        height: 0,
        fps: DEFAULT_FPS,
      },
      pending: None,
      released: false,
    };

    // 之后的任何错误都由 Drop 停止管道
    source
      .pipeline
      .set_state(gst::State::Playing)
      .map_err(|e| VideoError::Open(e.to_string()))?;

    let first = source.pull()?.ok_or(VideoError::NoVideoStream)?;
    source.info = sample_info(&first)?.0;
    source.pending = Some(first);

    info!(
      "打开视频: {}，{}x{} @ {} fps",
      path.display(),
      source.info.width,
      source.info.height,
      source.info.fps
    );
    Ok(source)
  }

  /// 取出下一帧；流结束返回 `None`，管道报错时返回错误
  fn pull(&self) -> Result<Option<gst::Sample>, VideoError> {
    loop {
      if let Some(sample) = self
        .appsink
        .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
      {
        return Ok(Some(sample));
      }
      if self.appsink.is_eos() {
        return Ok(None);
      }
      if let Some(err) = self.bus_error() {
        return Err(VideoError::Decode(err));
      }
    }
  }

  fn bus_error(&self) -> Option<String> {
    let bus = self.pipeline.bus()?;
    let msg = bus.timed_pop_filtered(gst::ClockTime::ZERO, &[gst::MessageType::Error])?;
    match msg.view() {
      gst::MessageView::Error(err) => Some(format!(
        "{} ({})",
        err.error(),
        err.debug().map(|d| d.to_string()).unwrap_or_default()
      )),
      _ => None,
    }
  }

  fn release(&mut self) {
    if self.released {
      return;
    }
    self.released = true;
    self.pending = None;
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl VideoSource for GStreamerSource {
  fn info(&self) -> VideoInfo {
    self.info
  }

  fn read_frame(&mut self) -> Result<Option<Frame>, VideoError> {
    if self.released {
      return Ok(None);
    }
    let sample = match self.pending.take() {
      Some(sample) => sample,
      None => match self.pull()? {
        Some(sample) => sample,
        None => {
          debug!("GStreamer 视频流结束");
          self.release();
          return Ok(None);
        }
      },
    };
    sample_to_frame(&sample).map(Some)
  }
}

impl Drop for GStreamerSource {
  fn drop(&mut self) {
    self.release();
  }
}

fn sample_info(sample: &gst::Sample) -> Result<(VideoInfo, gst_video::VideoInfo), VideoError> {
  let caps = sample
    .caps()
    .ok_or_else(|| VideoError::Metadata("No caps in sample".to_string()))?;
  let video_info = gst_video::VideoInfo::from_caps(caps)
    .map_err(|_| VideoError::Metadata("Failed to get video info from caps".to_string()))?;

  if video_info.format() != gst_video::VideoFormat::Bgr {
    return Err(VideoError::Metadata(format!(
      "Unsupported video format {:?}",
      video_info.format()
    )));
  }

  let rate = video_info.fps();
  let fps = u32::try_from(rate.numer())
    .ok()
    .zip(u32::try_from(rate.denom()).ok())
    .and_then(|(num, den)| Fps::new(num, den))
    .unwrap_or(DEFAULT_FPS);

  let info = VideoInfo {
    width: video_info.width(),
    height: video_info.height(),
    fps,
  };
  Ok((info, video_info))
}

fn sample_to_frame(sample: &gst::Sample) -> Result<Frame, VideoError> {
  let (info, video_info) = sample_info(sample)?;
  let buffer = sample
    .buffer()
    .ok_or_else(|| VideoError::Decode("No buffer in sample".to_string()))?;
  let map = buffer
    .map_readable()
    .map_err(|e| VideoError::Decode(format!("Failed to map buffer for reading: {}", e)))?;
  let data = map.as_slice();

  // 按行拷贝，去掉行尾对齐填充
  let row = info.width as usize * 3;
  let stride = video_info.stride()[0] as usize;
  let mut pixels = Vec::with_capacity(row * info.height as usize);
  for y in 0..info.height as usize {
    let start = y * stride;
    let line = data.get(start..start + row).ok_or_else(|| {
      VideoError::Decode(format!(
        "Buffer size mismatch: {} bytes for {}x{}",
        data.len(),
        info.width,
        info.height
      ))
    })?;
    pixels.extend_from_slice(line);
  }

  Ok(Frame::from_raw(
    info.width,
    info.height,
    ChannelOrder::Bgr,
    pixels,
  )?)
}
