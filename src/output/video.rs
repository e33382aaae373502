// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/video.rs - 视频文件输出
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

//! 视频文件输出模块
//!
//! 默认实现将 BGR24 原始帧通过管道写入 ffmpeg 子进程，由 ffmpeg 编码为 MP4。
//! 输出与源视频保持相同的分辨率与帧率。
//!
//! # 依赖
//!
//! 此模块需要系统安装 ffmpeg 命令行工具来编码视频。

use std::fmt;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::str::FromStr;

use tracing::{debug, info};

use crate::{
  frame::{ChannelOrder, Frame},
  input::video::{
    FfmpegSource, FfmpegTools, StderrTail, VideoError, VideoInfo, VideoSource, release_child,
  },
};

/// 编码中的视频文件。
///
/// `finish` 完成编码并关闭文件；未调用 `finish` 就销毁时直接中止编码，
/// 留下的文件由调用方清理。
pub trait VideoSink {
  fn write_frame(&mut self, frame: &Frame) -> Result<(), VideoError>;
  fn finish(self: Box<Self>) -> Result<(), VideoError>;
  fn frames_written(&self) -> u64;
}

/// 视频编解码后端：打开输入视频并创建输出视频
pub trait VideoBackend: Send + Sync {
  fn name(&self) -> &str;
  fn open(&self, path: &Path) -> Result<Box<dyn VideoSource>, VideoError>;
  fn create(&self, path: &Path, info: VideoInfo) -> Result<Box<dyn VideoSink>, VideoError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodec {
  /// H.264 (libx264)
  #[default]
  H264,
  /// MPEG-4 Part 2
  Mpeg4,
}

impl VideoCodec {
  fn ffmpeg_encoder(&self) -> &'static str {
    match self {
      VideoCodec::H264 => "libx264",
      VideoCodec::Mpeg4 => "mpeg4",
    }
  }
}

impl fmt::Display for VideoCodec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.ffmpeg_encoder())
  }
}

impl FromStr for VideoCodec {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "h264" | "libx264" | "avc1" => Ok(VideoCodec::H264),
      "mpeg4" | "mp4v" => Ok(VideoCodec::Mpeg4),
      other => Err(format!("unsupported video codec '{}'", other)),
    }
  }
}

/// 基于 ffmpeg/ffprobe 命令行的后端
#[derive(Debug, Clone, Default)]
pub struct FfmpegBackend {
  codec: VideoCodec,
  tools: FfmpegTools,
}

impl FfmpegBackend {
  pub fn new(codec: VideoCodec) -> Self {
    Self {
      codec,
      tools: FfmpegTools::default(),
    }
  }

  pub fn with_tools(mut self, tools: FfmpegTools) -> Self {
    self.tools = tools;
    self
  }
}

impl VideoBackend for FfmpegBackend {
  fn name(&self) -> &str {
    "ffmpeg"
  }

  fn open(&self, path: &Path) -> Result<Box<dyn VideoSource>, VideoError> {
    Ok(Box::new(FfmpegSource::open_with(&self.tools, path)?))
  }

  fn create(&self, path: &Path, info: VideoInfo) -> Result<Box<dyn VideoSink>, VideoError> {
    Ok(Box::new(FfmpegSink::create_with(
      &self.tools,
      path,
      info,
      self.codec,
    )?))
  }
}

pub struct FfmpegSink {
  info: VideoInfo,
  child: Option<Child>,
  stdin: Option<BufWriter<ChildStdin>>,
  stderr: StderrTail,
  frames_written: u64,
}

impl FfmpegSink {
  pub fn create(path: &Path, info: VideoInfo, codec: VideoCodec) -> Result<Self, VideoError> {
    Self::create_with(&FfmpegTools::default(), path, info, codec)
  }

  pub fn create_with(
    tools: &FfmpegTools,
    path: &Path,
    info: VideoInfo,
    codec: VideoCodec,
  ) -> Result<Self, VideoError> {
    // yuv420p 要求宽高为偶数，奇数尺寸时 H.264 改用 yuv444p 以保持原分辨率
    let even = info.width % 2 == 0 && info.height % 2 == 0;
    let pix_fmt = match (codec, even) {
      (VideoCodec::H264, false) => "yuv444p",
      _ => "yuv420p",
    };

    let mut command = Command::new(&tools.ffmpeg);
    command
      .args(["-v", "error", "-y"])
      .args(["-f", "rawvideo", "-pix_fmt", "bgr24"])
      .args(["-s", &format!("{}x{}", info.width, info.height)])
      .args(["-r", &info.fps.to_string()])
      .args(["-i", "-", "-an"])
      .args(["-c:v", codec.ffmpeg_encoder(), "-pix_fmt", pix_fmt]);
    match codec {
      VideoCodec::H264 => command.args(["-preset", "fast", "-crf", "23"]),
      VideoCodec::Mpeg4 => command.args(["-q:v", "5"]),
    };
    command
      .args(["-f", "mp4"])
      .arg(path)
      .stdin(Stdio::piped())
      .stdout(Stdio::null())
      .stderr(Stdio::piped());

    let mut child = command
      .spawn()
      .map_err(FfmpegTools::spawn_error(&tools.ffmpeg))?;
    let mut stderr = StderrTail::spawn(&mut child);
    let stdin = match child.stdin.take() {
      Some(stdin) => BufWriter::new(stdin),
      None => {
        release_child(&mut child);
        stderr.join();
        return Err(VideoError::Encode("ffmpeg stdin is not captured".to_string()));
      }
    };

    info!(
      "创建输出视频: {}，{}x{} @ {} fps，编码 {}",
      path.display(),
      info.width,
      info.height,
      info.fps,
      codec
    );

    Ok(Self {
      info,
      child: Some(child),
      stdin: Some(stdin),
      stderr,
      frames_written: 0,
    })
  }

  /// 编码器已退出时收集其错误输出
  fn encoder_error(&mut self, context: impl fmt::Display) -> VideoError {
    self.stdin = None;
    if let Some(mut child) = self.child.take() {
      release_child(&mut child);
    }
    VideoError::Encode(format!("{}: {}", context, self.stderr.join()))
  }
}

impl VideoSink for FfmpegSink {
  fn write_frame(&mut self, frame: &Frame) -> Result<(), VideoError> {
    let expected = (self.info.width, self.info.height);
    if frame.dimensions() != expected {
      return Err(VideoError::FrameSize {
        expected,
        actual: frame.dimensions(),
      });
    }

    let Some(stdin) = self.stdin.as_mut() else {
      return Err(VideoError::Encode("video is already closed".to_string()));
    };

    let result = match frame.order() {
      ChannelOrder::Bgr => stdin.write_all(frame.as_bytes()),
      ChannelOrder::Rgb => stdin.write_all(frame.clone().into_order(ChannelOrder::Bgr).as_bytes()),
    };
    if let Err(e) = result {
      return Err(self.encoder_error(e));
    }

    self.frames_written += 1;
    Ok(())
  }

  fn finish(mut self: Box<Self>) -> Result<(), VideoError> {
    // 关闭管道，ffmpeg 读到 EOF 后写出文件尾
    if let Some(mut stdin) = self.stdin.take() {
      if let Err(e) = stdin.flush() {
        return Err(self.encoder_error(e));
      }
    }

    let Some(mut child) = self.child.take() else {
      return Ok(());
    };
    let status = child.wait()?;
    let stderr = self.stderr.join();
    if !status.success() {
      return Err(VideoError::Encode(format!(
        "ffmpeg exited with {}: {}",
        status, stderr
      )));
    }

    debug!("视频编码完成，共 {} 帧", self.frames_written);
    Ok(())
  }

  fn frames_written(&self) -> u64 {
    self.frames_written
  }
}

impl Drop for FfmpegSink {
  fn drop(&mut self) {
    self.stdin = None;
    if let Some(mut child) = self.child.take() {
      release_child(&mut child);
    }
    self.stderr.join();
  }
}

#[cfg(feature = "gstreamer_video")]
pub use self::gstreamer::GStreamerBackend;

#[cfg(feature = "gstreamer_video")]
mod gstreamer {
  use std::path::Path;

  use super::{VideoBackend, VideoCodec, VideoSink};
  use crate::input::{GStreamerSource, VideoError, VideoInfo, VideoSource};
  use crate::output::gstreamer_video_output::GStreamerSink;

  /// 基于 GStreamer 的后端
  #[derive(Debug, Clone, Copy, Default)]
  pub struct GStreamerBackend {
    codec: VideoCodec,
  }

  impl GStreamerBackend {
    pub fn new(codec: VideoCodec) -> Self {
      Self { codec }
    }
  }

  impl VideoBackend for GStreamerBackend {
    fn name(&self) -> &str {
      "gstreamer"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn VideoSource>, VideoError> {
      Ok(Box::new(GStreamerSource::open(path)?))
    }

    fn create(&self, path: &Path, info: VideoInfo) -> Result<Box<dyn VideoSink>, VideoError> {
      Ok(Box::new(GStreamerSink::create(path, info, self.codec)?))
    }
  }
}
