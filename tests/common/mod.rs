// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/common/mod.rs - 测试用模型与视频后端
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

#![allow(dead_code)]

use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::{Engine, engine::general_purpose::STANDARD};
use image::{ImageFormat, Rgb, RgbImage};

use shanan_durian::{
  Payload, Pipeline, PipelineConfig,
  frame::{ChannelOrder, Frame},
  input::{Fps, VideoError, VideoInfo, VideoSource},
  model::{ClassTable, Model, ModelError, ModelRegistry, RawBox, RawOutput},
  output::{Annotator, VideoBackend, VideoSink},
};

pub const GRAY: u8 = 40;
pub const MATURE_RGB: [u8; 3] = [230, 25, 25];

/// 按调用次数返回候选框的模型，可以在第 n 次调用时失败
pub struct ScriptedModel {
  name: String,
  boxes: Vec<RawBox>,
  only_at: Option<usize>,
  fail_at: Option<usize>,
  calls: AtomicUsize,
}

impl ScriptedModel {
  pub fn new(name: &str, boxes: Vec<RawBox>) -> Self {
    Self {
      name: name.to_string(),
      boxes,
      only_at: None,
      fail_at: None,
      calls: AtomicUsize::new(0),
    }
  }

  pub fn empty(name: &str) -> Self {
    Self::new(name, vec![])
  }

  /// 只有第 `call` 次调用（从 0 开始）返回候选框，其余调用返回空
  pub fn only_at(mut self, call: usize) -> Self {
    self.only_at = Some(call);
    self
  }

  /// 第 `call` 次调用（从 0 开始）返回错误
  pub fn failing_at(mut self, call: usize) -> Self {
    self.fail_at = Some(call);
    self
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Model for ScriptedModel {
  fn name(&self) -> &str {
    &self.name
  }

  fn infer(&self, _frame: &Frame) -> Result<RawOutput, ModelError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst);
    if self.fail_at == Some(call) {
      return Err(ModelError::Inference(format!("scripted failure at call {}", call)));
    }
    match self.only_at {
      Some(only) if only != call => Ok(RawOutput::Boxes(vec![])),
      _ => Ok(RawOutput::Boxes(self.boxes.clone())),
    }
  }
}

pub fn raw_box(bbox: [f32; 4], class_id: u32, score: f32) -> RawBox {
  RawBox {
    bbox,
    class_id,
    score,
  }
}

pub fn single_model_registry(model: Arc<dyn Model>) -> Arc<ModelRegistry> {
  Arc::new(
    ModelRegistry::builder()
      .model("old", model)
      .expect("register model")
      .default_model("old")
      .build()
      .expect("build registry"),
  )
}

pub fn config(temp_dir: &Path) -> PipelineConfig {
  PipelineConfig {
    temp_dir: temp_dir.to_path_buf(),
    ..PipelineConfig::default()
  }
}

/// 不加载字体的流水线，标签只绘制背景，像素结果确定
pub fn pipeline(registry: Arc<ModelRegistry>, config: PipelineConfig) -> Pipeline {
  Pipeline::new(registry, config)
    .expect("build pipeline")
    .with_annotator(Annotator::new(ClassTable::durian()))
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
  let image = RgbImage::from_pixel(width, height, Rgb([GRAY, GRAY, GRAY]));
  let mut bytes = Vec::new();
  image
    .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
    .expect("encode png");
  bytes
}

pub fn decode_payload_image(payload: &Payload) -> RgbImage {
  let Payload::Image(data) = payload else {
    panic!("expected image payload, got {:?}", payload);
  };
  let bytes = STANDARD.decode(data).expect("valid base64");
  image::load_from_memory(&bytes)
    .expect("valid png")
    .to_rgb8()
}

pub fn gray_frame(width: u32, height: u32) -> Frame {
  filled_frame(width, height, GRAY)
}

pub fn filled_frame(width: u32, height: u32, value: u8) -> Frame {
  Frame::from_raw(
    width,
    height,
    ChannelOrder::Bgr,
    vec![value; Frame::byte_len(width, height)],
  )
  .expect("valid frame")
}

pub fn file_count(dir: &Path) -> usize {
  std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

// 原始视频格式: "RAWV" + width, height, fps_num, fps_den (u32 LE) + BGR 帧序列
const MAGIC: &[u8; 4] = b"RAWV";
const HEADER_LEN: usize = 20;

pub fn raw_video(info: VideoInfo, frames: &[Frame]) -> Vec<u8> {
  let mut bytes = header(info);
  for frame in frames {
    bytes.extend_from_slice(frame.clone().into_order(ChannelOrder::Bgr).as_bytes());
  }
  bytes
}

fn header(info: VideoInfo) -> Vec<u8> {
  let mut bytes = MAGIC.to_vec();
  for value in [info.width, info.height, info.fps.num, info.fps.den] {
    bytes.extend_from_slice(&value.to_le_bytes());
  }
  bytes
}

fn parse_header(bytes: &[u8]) -> Option<VideoInfo> {
  if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
    return None;
  }
  let field = |i: usize| {
    let start = 4 + i * 4;
    u32::from_le_bytes([
      bytes[start],
      bytes[start + 1],
      bytes[start + 2],
      bytes[start + 3],
    ])
  };
  Some(VideoInfo {
    width: field(0),
    height: field(1),
    fps: Fps::new(field(2), field(3))?,
  })
}

/// 读取 `RawBackend` 写出的视频
pub fn read_raw_video(path: &Path) -> (VideoInfo, Vec<Frame>) {
  let bytes = std::fs::read(path).expect("read output video");
  let info = parse_header(&bytes).expect("valid raw video header");
  let frame_len = Frame::byte_len(info.width, info.height);
  let body = &bytes[HEADER_LEN..];
  assert_eq!(body.len() % frame_len, 0, "output ends with a partial frame");
  let frames = body
    .chunks_exact(frame_len)
    .map(|chunk| {
      Frame::from_raw(info.width, info.height, ChannelOrder::Bgr, chunk.to_vec()).expect("frame")
    })
    .collect();
  (info, frames)
}

#[derive(Debug, Default)]
pub struct Counters {
  pub opened: AtomicUsize,
  pub sources_released: AtomicUsize,
  /// 释放视频源时输入文件仍然存在的次数
  pub released_before_input_removed: AtomicUsize,
  pub created: AtomicUsize,
  pub sinks_finished: AtomicUsize,
  pub sinks_released: AtomicUsize,
}

impl Counters {
  pub fn get(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
  }
}

/// 读写上面原始格式的视频后端，记录句柄的打开与释放次数
#[derive(Clone, Default)]
pub struct RawBackend {
  pub counters: Arc<Counters>,
  /// 输出只保留第一帧，其余帧被静默丢弃
  pub lossy: bool,
}

impl RawBackend {
  pub fn lossy() -> Self {
    Self {
      lossy: true,
      ..Self::default()
    }
  }
}

impl VideoBackend for RawBackend {
  fn name(&self) -> &str {
    "raw"
  }

  fn open(&self, path: &Path) -> Result<Box<dyn VideoSource>, VideoError> {
    let data = std::fs::read(path)?;
    let info =
      parse_header(&data).ok_or_else(|| VideoError::Open("not a raw video".to_string()))?;
    self.counters.opened.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(RawSource {
      path: path.to_path_buf(),
      info,
      data,
      pos: HEADER_LEN,
      counters: self.counters.clone(),
    }))
  }

  fn create(&self, path: &Path, info: VideoInfo) -> Result<Box<dyn VideoSink>, VideoError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&header(info))?;
    self.counters.created.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(RawSink {
      info,
      writer,
      lossy: self.lossy,
      frames: 0,
      counters: self.counters.clone(),
    }))
  }
}

struct RawSource {
  path: PathBuf,
  info: VideoInfo,
  data: Vec<u8>,
  pos: usize,
  counters: Arc<Counters>,
}

impl VideoSource for RawSource {
  fn info(&self) -> VideoInfo {
    self.info
  }

  fn read_frame(&mut self) -> Result<Option<Frame>, VideoError> {
    let frame_len = Frame::byte_len(self.info.width, self.info.height);
    let remaining = self.data.len() - self.pos;
    if remaining == 0 {
      return Ok(None);
    }
    if remaining < frame_len {
      return Err(VideoError::Decode("truncated frame".to_string()));
    }
    let chunk = self.data[self.pos..self.pos + frame_len].to_vec();
    self.pos += frame_len;
    let frame = Frame::from_raw(self.info.width, self.info.height, ChannelOrder::Bgr, chunk)?;
    Ok(Some(frame))
  }
}

impl Drop for RawSource {
  fn drop(&mut self) {
    self.counters.sources_released.fetch_add(1, Ordering::SeqCst);
    if self.path.exists() {
      self
        .counters
        .released_before_input_removed
        .fetch_add(1, Ordering::SeqCst);
    }
  }
}

struct RawSink {
  info: VideoInfo,
  writer: BufWriter<File>,
  lossy: bool,
  frames: u64,
  counters: Arc<Counters>,
}

impl VideoSink for RawSink {
  fn write_frame(&mut self, frame: &Frame) -> Result<(), VideoError> {
    let expected = (self.info.width, self.info.height);
    if frame.dimensions() != expected {
      return Err(VideoError::FrameSize {
        expected,
        actual: frame.dimensions(),
      });
    }
    if self.lossy && self.frames > 0 {
      return Ok(());
    }
    self
      .writer
      .write_all(frame.clone().into_order(ChannelOrder::Bgr).as_bytes())?;
    self.frames += 1;
    Ok(())
  }

  fn finish(mut self: Box<Self>) -> Result<(), VideoError> {
    self.writer.flush()?;
    self.counters.sinks_finished.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn frames_written(&self) -> u64 {
    self.frames
  }
}

impl Drop for RawSink {
  fn drop(&mut self) {
    self.counters.sinks_released.fetch_add(1, Ordering::SeqCst);
  }
}
