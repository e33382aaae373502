// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/video.rs - 视频文件逐帧读取
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

//! 视频输入模块
//!
//! 默认实现调用 ffprobe 读取视频流信息，再由 ffmpeg 将视频解码为 BGR24
//! 原始帧，通过管道逐帧读取。
//!
//! # 依赖
//!
//! 此模块需要系统安装 ffmpeg 与 ffprobe 命令行工具。

use std::collections::HashMap;
use std::fmt;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frame::{ChannelOrder, Frame, FrameError};

const DEFAULT_FPS: Fps = Fps { num: 25, den: 1 };
/// 错误信息中保留的 ffmpeg 输出尾部长度
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Error, Debug)]
pub enum VideoError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("cannot run {program} (is it installed?): {source}")]
  Spawn {
    program: String,
    source: std::io::Error,
  },
  #[error("cannot open video: {0}")]
  Open(String),
  #[error("invalid video metadata: {0}")]
  Metadata(String),
  #[error("no video stream found")]
  NoVideoStream,
  #[error("video decoding failed: {0}")]
  Decode(String),
  #[error("video encoding failed: {0}")]
  Encode(String),
  #[error("frame is {actual:?}, video is {expected:?}")]
  FrameSize {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("invalid frame: {0}")]
  Frame(#[from] FrameError),
  #[cfg(feature = "gstreamer_video")]
  #[error("GStreamer error: {0}")]
  GStreamer(String),
}

/// ffmpeg 与 ffprobe 可执行文件的位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegTools {
  pub ffmpeg: PathBuf,
  pub ffprobe: PathBuf,
}

impl Default for FfmpegTools {
  fn default() -> Self {
    Self {
      ffmpeg: PathBuf::from("ffmpeg"),
      ffprobe: PathBuf::from("ffprobe"),
    }
  }
}

impl FfmpegTools {
  /// 使用 `dir` 下的 ffmpeg 与 ffprobe
  pub fn in_dir(dir: &Path) -> Self {
    Self {
      ffmpeg: dir.join("ffmpeg"),
      ffprobe: dir.join("ffprobe"),
    }
  }

  pub(crate) fn spawn_error(program: &Path) -> impl FnOnce(std::io::Error) -> VideoError {
    let program = program.display().to_string();
    move |source| VideoError::Spawn { program, source }
  }
}

/// 以分数表示的帧率，避免 29.97 之类的帧率在转换中失真
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fps {
  pub num: u32,
  pub den: u32,
}

impl Fps {
  pub fn new(num: u32, den: u32) -> Option<Self> {
    if num == 0 || den == 0 {
      None
    } else {
      Some(Self { num, den })
    }
  }

  /// 解析 `30000/1001` 或 `25` 形式的帧率
  pub fn parse(s: &str) -> Option<Self> {
    match s.trim().split_once('/') {
      Some((num, den)) => Self::new(num.trim().parse().ok()?, den.trim().parse().ok()?),
      None => Self::new(s.trim().parse().ok()?, 1),
    }
  }

  pub fn as_f64(&self) -> f64 {
    self.num as f64 / self.den as f64
  }
}

impl fmt::Display for Fps {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.num, self.den)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
  pub width: u32,
  pub height: u32,
  pub fps: Fps,
}

/// 已打开的视频源，按解码顺序逐帧读取。
///
/// 读到流末尾时返回 `Ok(None)`；源在销毁时释放底层句柄。
pub trait VideoSource {
  fn info(&self) -> VideoInfo;
  fn read_frame(&mut self) -> Result<Option<Frame>, VideoError>;
}

#[derive(Deserialize)]
struct ProbeOutput {
  #[serde(default)]
  streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
  width: Option<u32>,
  height: Option<u32>,
  avg_frame_rate: Option<String>,
  r_frame_rate: Option<String>,
  #[serde(default)]
  tags: HashMap<String, String>,
  #[serde(default)]
  side_data_list: Vec<ProbeSideData>,
}

#[derive(Deserialize)]
struct ProbeSideData {
  rotation: Option<f64>,
}

impl ProbeStream {
  /// 显示矩阵或旧式 `rotate` 标签给出的旋转角度
  fn rotation(&self) -> f64 {
    self
      .side_data_list
      .iter()
      .find_map(|side| side.rotation)
      .or_else(|| self.tags.get("rotate").and_then(|r| r.trim().parse().ok()))
      .unwrap_or(0.0)
  }
}

/// 解析 `ffprobe -of json` 的输出。
///
/// 解码时 ffmpeg 会按旋转信息自动旋转画面，旋转 ±90° 时交换宽高，
/// 与实际解码出的帧保持一致。
pub(crate) fn parse_probe(json: &[u8]) -> Result<VideoInfo, VideoError> {
  let probe: ProbeOutput =
    serde_json::from_slice(json).map_err(|e| VideoError::Metadata(e.to_string()))?;
  let stream = probe
    .streams
    .into_iter()
    .next()
    .ok_or(VideoError::NoVideoStream)?;

  let (mut width, mut height) = match (stream.width, stream.height) {
    (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
    (w, h) => {
      return Err(VideoError::Metadata(format!(
        "invalid frame size {:?}x{:?}",
        w, h
      )));
    }
  };

  let rotation = stream.rotation();
  let quarter_turns = (rotation / 90.0).round() as i64;
  if quarter_turns.rem_euclid(2) == 1 {
    debug!("视频旋转 {}°，交换宽高", rotation);
    std::mem::swap(&mut width, &mut height);
  }

  let fps = stream
    .avg_frame_rate
    .as_deref()
    .and_then(Fps::parse)
    .or_else(|| stream.r_frame_rate.as_deref().and_then(Fps::parse))
    .unwrap_or_else(|| {
      warn!("无法获取视频帧率，使用默认值 {}", DEFAULT_FPS);
      DEFAULT_FPS
    });

  Ok(VideoInfo { width, height, fps })
}

fn probe(tools: &FfmpegTools, path: &Path) -> Result<VideoInfo, VideoError> {
  let output = Command::new(&tools.ffprobe)
    .args(["-v", "error", "-select_streams", "v:0"])
    .args([
      "-show_entries",
      "stream=width,height,avg_frame_rate,r_frame_rate:stream_tags=rotate:stream_side_data=rotation",
    ])
    .args(["-of", "json"])
    .arg(path)
    .stdin(Stdio::null())
    .output()
    .map_err(FfmpegTools::spawn_error(&tools.ffprobe))?;

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    return Err(VideoError::Open(stderr.trim().to_string()));
  }

  parse_probe(&output.stdout)
}

/// 读满缓冲区，返回实际读取的字节数；只有流结束才会少于缓冲区长度
pub(crate) fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
  let mut filled = 0;
  while filled < buf.len() {
    match reader.read(&mut buf[filled..]) {
      Ok(0) => break,
      Ok(n) => filled += n,
      Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
      Err(e) => return Err(e),
    }
  }
  Ok(filled)
}

/// 在后台线程中持续读取子进程的 stderr，只保留最后一段输出。
///
/// 管道写满后 ffmpeg 会阻塞，进而阻塞帧数据的读写，所以必须一直读。
pub(crate) struct StderrTail {
  handle: Option<JoinHandle<String>>,
}

impl StderrTail {
  pub(crate) fn spawn(child: &mut Child) -> Self {
    let handle = child.stderr.take().and_then(|mut pipe| {
      thread::Builder::new()
        .name("ffmpeg-stderr".to_string())
        .spawn(move || {
          let mut tail = Vec::with_capacity(2 * STDERR_TAIL_BYTES);
          let mut chunk = [0u8; 8192];
          loop {
            match pipe.read(&mut chunk) {
              Ok(0) => break,
              Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > 2 * STDERR_TAIL_BYTES {
                  tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                }
              }
              Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
              Err(_) => break,
            }
          }
          let start = tail.len().saturating_sub(STDERR_TAIL_BYTES);
          String::from_utf8_lossy(&tail[start..]).trim().to_string()
        })
        .map_err(|e| warn!("无法启动 stderr 读取线程: {}", e))
        .ok()
    });
    Self { handle }
  }

  /// 等待管道关闭并返回输出尾部；子进程需已退出或被终止
  pub(crate) fn join(&mut self) -> String {
    self
      .handle
      .take()
      .and_then(|handle| handle.join().ok())
      .unwrap_or_default()
  }
}

/// 基于 ffmpeg 子进程的视频源
pub struct FfmpegSource {
  info: VideoInfo,
  child: Option<Child>,
  stdout: Option<BufReader<ChildStdout>>,
  stderr: StderrTail,
  frames_read: u64,
}

impl FfmpegSource {
  pub fn open(path: &Path) -> Result<Self, VideoError> {
    Self::open_with(&FfmpegTools::default(), path)
  }

  pub fn open_with(tools: &FfmpegTools, path: &Path) -> Result<Self, VideoError> {
    let info = probe(tools, path)?;
    info!(
      "打开视频: {}，{}x{} @ {} fps",
      path.display(),
      info.width,
      info.height,
      info.fps
    );

    let mut child = Command::new(&tools.ffmpeg)
      .args(["-v", "error", "-nostdin", "-i"])
      .arg(path)
      .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "bgr24", "-"])
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(FfmpegTools::spawn_error(&tools.ffmpeg))?;
    let mut stderr = StderrTail::spawn(&mut child);

    let stdout = match child.stdout.take() {
      Some(stdout) => BufReader::new(stdout),
      None => {
        release_child(&mut child);
        stderr.join();
        return Err(VideoError::Open("ffmpeg stdout is not captured".to_string()));
      }
    };

    Ok(Self {
      info,
      child: Some(child),
      stdout: Some(stdout),
      stderr,
      frames_read: 0,
    })
  }

  /// 流结束后回收子进程，并把解码器的异常退出转换为错误
  fn finish_child(&mut self) -> Result<(), VideoError> {
    self.stdout = None;
    let Some(mut child) = self.child.take() else {
      return Ok(());
    };

    let status = child.wait()?;
    let stderr = self.stderr.join();
    if status.success() {
      debug!("ffmpeg 解码结束，共 {} 帧", self.frames_read);
      return Ok(());
    }

    Err(VideoError::Decode(format!(
      "ffmpeg exited with {}: {}",
      status, stderr
    )))
  }
}

impl VideoSource for FfmpegSource {
  fn info(&self) -> VideoInfo {
    self.info
  }

  fn read_frame(&mut self) -> Result<Option<Frame>, VideoError> {
    let Some(stdout) = self.stdout.as_mut() else {
      return Ok(None);
    };

    let mut data = vec![0u8; Frame::byte_len(self.info.width, self.info.height)];
    let filled = read_full(stdout, &mut data)?;
    if filled == 0 {
      self.finish_child()?;
      return Ok(None);
    }
    if filled < data.len() {
      self.finish_child()?;
      return Err(VideoError::Decode(format!(
        "truncated frame {}: {} of {} bytes",
        self.frames_read,
        filled,
        data.len()
      )));
    }

    self.frames_read += 1;
    let frame = Frame::from_raw(self.info.width, self.info.height, ChannelOrder::Bgr, data)?;
    Ok(Some(frame))
  }
}

impl Drop for FfmpegSource {
  fn drop(&mut self) {
    self.stdout = None;
    if let Some(mut child) = self.child.take() {
      release_child(&mut child);
    }
    self.stderr.join();
  }
}

/// 终止并回收仍在运行的子进程
pub(crate) fn release_child(child: &mut Child) {
  match child.try_wait() {
    Ok(Some(_)) => {}
    _ => {
      if let Err(e) = child.kill() {
        warn!("终止 ffmpeg 进程失败: {}", e);
      }
      if let Err(e) = child.wait() {
        warn!("回收 ffmpeg 进程失败: {}", e);
      }
    }
  }
}
