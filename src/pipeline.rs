// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 图像与视频检测流水线
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

//! 检测流水线。
//!
//! 每次调用在当前线程内同步完成，内部错误在边界处统一转换为
//! [`PipelineResult::Failure`]，不会向调用方传播。

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  frame::Frame,
  input::{FfmpegTools, ImageInputError, VideoError, decode_image},
  model::{Detection, Model, ModelError, ModelRegistry, Normalizer},
  output::{Annotator, EncodeError, FfmpegBackend, VideoBackend, VideoCodec, encode_png_base64},
};

pub mod artifact;

use self::artifact::{OutputArtifact, TempArtifact, output_file_name};

pub const STATUS_FOUND: &str = "Found object";
pub const STATUS_NO_OBJECT: &str = "No object";
pub const STATUS_VIDEO: &str = "Video processed";
pub const ERROR_PREFIX: &str = "Error during prediction";

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error(transparent)]
  Image(#[from] ImageInputError),
  #[error(transparent)]
  Model(#[from] ModelError),
  #[error(transparent)]
  Encode(#[from] EncodeError),
  #[error(transparent)]
  Video(#[from] VideoError),
  #[error("cannot store uploaded video: {0}")]
  TempInput(std::io::Error),
  #[error("cannot create output directory {path}: {source}")]
  OutputDir {
    path: String,
    source: std::io::Error,
  },
  #[error("video processing cancelled")]
  Cancelled,
}

/// 单次调用的结果，三种情况互斥
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineResult {
  Success {
    status: String,
    payload: Payload,
  },
  /// 没有检测到目标，不是错误
  NoObject {
    status: String,
    payload: Option<Payload>,
  },
  Failure {
    error: String,
  },
}

impl PipelineResult {
  fn failure(err: PipelineError) -> Self {
    let error = format!("{}: {}", ERROR_PREFIX, err);
    error!("{}", error);
    PipelineResult::Failure { error }
  }

  pub fn is_failure(&self) -> bool {
    matches!(self, PipelineResult::Failure { .. })
  }

  pub fn status(&self) -> Option<&str> {
    match self {
      PipelineResult::Success { status, .. } | PipelineResult::NoObject { status, .. } => {
        Some(status)
      }
      PipelineResult::Failure { .. } => None,
    }
  }

  pub fn payload(&self) -> Option<&Payload> {
    match self {
      PipelineResult::Success { payload, .. } => Some(payload),
      PipelineResult::NoObject { payload, .. } => payload.as_ref(),
      PipelineResult::Failure { .. } => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      PipelineResult::Failure { error } => Some(error),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
  /// base64 编码的 PNG
  Image(String),
  /// 输出目录中的视频文件名
  VideoFile(String),
  Detections(Vec<Detection>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
  /// 绘制检测结果并返回图像
  #[default]
  Annotate,
  /// 只返回检测序列，不绘制也不编码
  DetectOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
  #[default]
  Ffmpeg,
  #[cfg(feature = "gstreamer_video")]
  GStreamer,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub confidence: f32,
  pub iou: Option<f32>,
  pub mode: OutputMode,
  pub temp_dir: PathBuf,
  pub backend: BackendKind,
  pub codec: VideoCodec,
  pub ffmpeg: FfmpegTools,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    let normalizer = Normalizer::default();
    Self {
      confidence: normalizer.confidence(),
      iou: normalizer.iou(),
      mode: OutputMode::default(),
      temp_dir: std::env::temp_dir(),
      backend: BackendKind::default(),
      codec: VideoCodec::default(),
      ffmpeg: FfmpegTools::default(),
    }
  }
}

/// 视频循环的取消标志，在每帧开始前检查
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

#[derive(Debug, Default, Clone, Copy)]
struct VideoStats {
  frames: u64,
  detections: usize,
}

pub struct Pipeline {
  registry: Arc<ModelRegistry>,
  normalizer: Normalizer,
  annotator: Annotator,
  backend: Box<dyn VideoBackend>,
  mode: OutputMode,
  temp_dir: PathBuf,
}

impl Pipeline {
  pub fn new(registry: Arc<ModelRegistry>, config: PipelineConfig) -> Result<Self, ModelError> {
    let normalizer = Normalizer::new(config.confidence, config.iou)?;
    let backend: Box<dyn VideoBackend> = match config.backend {
      BackendKind::Ffmpeg => Box::new(FfmpegBackend::new(config.codec).with_tools(config.ffmpeg)),
      #[cfg(feature = "gstreamer_video")]
      BackendKind::GStreamer => Box::new(crate::output::GStreamerBackend::new(config.codec)),
    };
    info!(
      "流水线就绪: 置信度阈值 {}, IoU 阈值 {:?}, 模式 {:?}, 视频后端 {}",
      config.confidence,
      config.iou,
      config.mode,
      backend.name()
    );

    Ok(Self {
      registry,
      normalizer,
      annotator: Annotator::default(),
      backend,
      mode: config.mode,
      temp_dir: config.temp_dir,
    })
  }

  pub fn with_annotator(mut self, annotator: Annotator) -> Self {
    self.annotator = annotator;
    self
  }

  pub fn with_backend(mut self, backend: impl VideoBackend + 'static) -> Self {
    self.backend = Box::new(backend);
    self
  }

  fn detect(&self, model: &dyn Model, frame: &Frame) -> Result<Vec<Detection>, PipelineError> {
    let raw = model.infer(frame)?;
    Ok(self.normalizer.normalize(raw)?)
  }

  /// 检测上传的图像
  pub fn process_image(&self, bytes: &[u8], selector: Option<&str>) -> PipelineResult {
    match self.run_image(bytes, selector) {
      Ok(result) => result,
      Err(e) => PipelineResult::failure(e),
    }
  }

  fn run_image(&self, bytes: &[u8], selector: Option<&str>) -> Result<PipelineResult, PipelineError> {
    let frame = decode_image(bytes)?;
    let model = self.registry.resolve(selector);

    let now = Instant::now();
    let detections = self.detect(model.as_ref(), &frame)?;
    info!(
      "模型 {} 检测到 {} 个目标，耗时 {:.2?}",
      model.name(),
      detections.len(),
      now.elapsed()
    );

    let found = !detections.is_empty();

    let payload = match self.mode {
      OutputMode::DetectOnly if detections.is_empty() => None,
      OutputMode::DetectOnly => Some(Payload::Detections(detections)),
      // 没有目标时绘制是恒等变换，仍然返回可显示的图像
      OutputMode::Annotate => {
        let annotated = self.annotator.annotate(frame, &detections);
        Some(Payload::Image(encode_png_base64(&annotated)?))
      }
    };

    Ok(match payload {
      Some(payload) if found => PipelineResult::Success {
        status: STATUS_FOUND.to_string(),
        payload,
      },
      payload => PipelineResult::NoObject {
        status: STATUS_NO_OBJECT.to_string(),
        payload,
      },
    })
  }

  /// 检测上传的视频，标注后的视频写入 `output_dir`
  pub fn process_video(
    &self,
    upload: impl Read,
    selector: Option<&str>,
    output_dir: &Path,
  ) -> PipelineResult {
    self.process_video_cancellable(upload, selector, output_dir, &CancelToken::new())
  }

  pub fn process_video_cancellable(
    &self,
    upload: impl Read,
    selector: Option<&str>,
    output_dir: &Path,
    cancel: &CancelToken,
  ) -> PipelineResult {
    let now = Instant::now();
    match self.run_video(upload, selector, output_dir, cancel) {
      Ok((name, stats)) => {
        info!(
          "视频处理完成: {}，{} 帧，{} 个目标，耗时 {:.2?}",
          name,
          stats.frames,
          stats.detections,
          now.elapsed()
        );
        PipelineResult::Success {
          status: STATUS_VIDEO.to_string(),
          payload: Payload::VideoFile(name),
        }
      }
      Err(e) => PipelineResult::failure(e),
    }
  }

  // 局部变量按声明的逆序销毁：编解码句柄先于输出文件和临时输入被释放
  fn run_video(
    &self,
    upload: impl Read,
    selector: Option<&str>,
    output_dir: &Path,
    cancel: &CancelToken,
  ) -> Result<(String, VideoStats), PipelineError> {
    let temp = TempArtifact::persist(&self.temp_dir, upload).map_err(PipelineError::TempInput)?;
    let model = self.registry.resolve(selector);

    let mut source = self.backend.open(temp.path())?;
    let info = source.info();

    std::fs::create_dir_all(output_dir).map_err(|source| PipelineError::OutputDir {
      path: output_dir.display().to_string(),
      source,
    })?;
    let name = output_file_name();
    let output = OutputArtifact::new(output_dir.join(&name));
    let mut sink = self.backend.create(output.path(), info)?;

    let mut stats = VideoStats::default();
    loop {
      if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
      }
      let Some(frame) = source.read_frame()? else {
        break;
      };

      let detections = self.detect(model.as_ref(), &frame)?;
      debug!("第 {} 帧: {} 个目标", stats.frames, detections.len());
      stats.detections += detections.len();

      let annotated = self.annotator.annotate(frame, &detections);
      sink.write_frame(&annotated)?;
      stats.frames += 1;
    }

    drop(source);
    if sink.frames_written() != stats.frames {
      return Err(PipelineError::Video(VideoError::Encode(format!(
        "encoder accepted {} of {} frames",
        sink.frames_written(),
        stats.frames
      ))));
    }
    sink.finish()?;
    output.keep();
    Ok((name, stats))
  }
}
