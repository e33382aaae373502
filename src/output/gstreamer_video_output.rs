// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件输出
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

//! # GStreamer 视频文件输出模块
//!
//! 通过 `appsrc` 推送 BGR 帧，编码为 MP4 文件。
//!
//! - H.264: `x264enc ! h264parse ! mp4mux`
//! - MPEG-4: `avenc_mpeg4 ! mpeg4videoparse ! mp4mux`

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use tracing::{debug, info, warn};

use crate::{
  frame::{ChannelOrder, Frame},
  input::{VideoError, VideoInfo},
  output::{VideoCodec, VideoSink},
};

const EOS_TIMEOUT_SECS: u64 = 30;

fn gst_error(e: impl std::fmt::Display) -> VideoError {
  VideoError::GStreamer(e.to_string())
}

pub struct GStreamerSink {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  info: VideoInfo,
  frame_count: u64,
  released: bool,
}

impl GStreamerSink {
  pub fn create(path: &Path, info: VideoInfo, codec: VideoCodec) -> Result<Self, VideoError> {
    gst::init().map_err(gst_error)?;

    let encoder = match codec {
      VideoCodec::H264 => "video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse",
      VideoCodec::Mpeg4 => "video/x-raw,format=I420 ! avenc_mpeg4 ! mpeg4videoparse",
    };
    let description = format!(
      "appsrc name=src ! videoconvert ! {} ! mp4mux ! filesink location=\"{}\"",
      encoder,
      path.display()
    );
    info!("Creating video output pipeline: {}", description);

    let pipeline = gst::parse::launch(&description)
      .map_err(gst_error)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| VideoError::GStreamer("Failed to create pipeline".to_string()))?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or_else(|| VideoError::GStreamer("Failed to get appsrc element".to_string()))?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| VideoError::GStreamer("Failed to convert element to appsrc".to_string()))?;

    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "BGR")
      .field("width", info.width as i32)
      .field("height", info.height as i32)
      .field(
        "framerate",
        gst::Fraction::new(info.fps.num as i32, info.fps.den as i32),
      )
      .build();
    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);

    let sink = GStreamerSink {
      pipeline,
      appsrc,
      info,
      frame_count: 0,
      released: false,
    };
    sink
      .pipeline
      .set_state(gst::State::Playing)
      .map_err(|e| VideoError::Encode(e.to_string()))?;

    info!(
      "Video output initialized: {}x{} @ {} fps -> {}",
      info.width,
      info.height,
      info.fps,
      path.display()
    );
    Ok(sink)
  }

  fn timestamp(&self, frame: u64) -> gst::ClockTime {
    let nanos = frame * 1_000_000_000 * self.info.fps.den as u64 / self.info.fps.num as u64;
    gst::ClockTime::from_nseconds(nanos)
  }

  fn release(&mut self) {
    if self.released {
      return;
    }
    self.released = true;
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer video output pipeline: {}", e);
    }
  }
}

impl VideoSink for GStreamerSink {
  fn write_frame(&mut self, frame: &Frame) -> Result<(), VideoError> {
    let expected = (self.info.width, self.info.height);
    if frame.dimensions() != expected {
      return Err(VideoError::FrameSize {
        expected,
        actual: frame.dimensions(),
      });
    }
    if self.released {
      return Err(VideoError::Encode("video is already closed".to_string()));
    }

    let data = match frame.order() {
      ChannelOrder::Bgr => frame.as_bytes().to_vec(),
      ChannelOrder::Rgb => frame.clone().into_order(ChannelOrder::Bgr).as_bytes().to_vec(),
    };
    let mut buffer = gst::Buffer::from_mut_slice(data);
    {
      let pts = self.timestamp(self.frame_count);
      let duration = self.timestamp(self.frame_count + 1) - pts;
      let buffer_ref = buffer
        .get_mut()
        .ok_or_else(|| VideoError::GStreamer("Buffer is not writable".to_string()))?;
      buffer_ref.set_pts(pts);
      buffer_ref.set_duration(duration);
    }

    self
      .appsrc
      .push_buffer(buffer)
      .map_err(|e| VideoError::Encode(format!("Failed to push buffer: {:?}", e)))?;
    self.frame_count += 1;
    Ok(())
  }

  fn finish(mut self: Box<Self>) -> Result<(), VideoError> {
    // 发送 EOS 并等待 mp4mux 写完文件尾
    self
      .appsrc
      .end_of_stream()
      .map_err(|e| VideoError::Encode(format!("Failed to send EOS: {:?}", e)))?;

    let bus = self
      .pipeline
      .bus()
      .ok_or_else(|| VideoError::GStreamer("Pipeline has no bus".to_string()))?;
    let msg = bus.timed_pop_filtered(
      gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS),
      &[gst::MessageType::Eos, gst::MessageType::Error],
    );

    let result = match msg.as_ref().map(|m| m.view()) {
      Some(gst::MessageView::Eos(_)) => Ok(()),
      Some(gst::MessageView::Error(err)) => Err(VideoError::Encode(err.error().to_string())),
      _ => Err(VideoError::Encode(
        "timed out waiting for end of stream".to_string(),
      )),
    };
    self.release();

    debug!("Video output closed. Total frames written: {}", self.frame_count);
    result
  }

  fn frames_written(&self) -> u64 {
    self.frame_count
  }
}

impl Drop for GStreamerSink {
  fn drop(&mut self) {
    self.release();
  }
}
