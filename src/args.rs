// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};

use shanan_durian::{
  input::FfmpegTools,
  output::VideoCodec,
  pipeline::{BackendKind, OutputMode, PipelineConfig},
};

/// 榴莲成熟度检测：标注上传的图像或视频
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型描述，可重复，例如 new=onnx:///models/modelv4.onnx?instances=2
  #[arg(long = "model", value_name = "KEY=URL", required = true)]
  pub models: Vec<String>,

  /// 选择器无法识别时使用的模型
  #[arg(long, default_value = "old", value_name = "KEY")]
  pub default_model: String,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, global = true, default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,

  /// NMS IoU 阈值 (0.0 - 1.0)
  #[arg(long, global = true, default_value = "0.7", value_name = "THRESHOLD")]
  pub iou: f32,

  /// 关闭 NMS
  #[arg(long, global = true)]
  pub no_nms: bool,

  /// 标签字体文件（TTF/OTF），缺省时查找系统字体
  #[arg(long, global = true, value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 上传视频的临时目录
  #[arg(long, global = true, value_name = "DIR")]
  pub temp_dir: Option<PathBuf>,

  /// 输出视频编码: libx264 / mpeg4
  #[arg(long, global = true, default_value = "libx264", value_name = "CODEC")]
  pub codec: VideoCodec,

  /// ffmpeg 与 ffprobe 所在目录，缺省时从 PATH 查找
  #[arg(long, global = true, value_name = "DIR")]
  pub ffmpeg_dir: Option<PathBuf>,

  /// 视频后端: ffmpeg / gstreamer
  #[arg(long, global = true, default_value = "ffmpeg", value_name = "BACKEND")]
  pub backend: String,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 检测图像，输出 base64 PNG
  Image {
    /// 图像文件
    #[arg(long, value_name = "FILE")]
    input: PathBuf,
    /// 模型选择器
    #[arg(long)]
    selector: Option<String>,
    /// 只输出检测结果，不绘制
    #[arg(long)]
    detect_only: bool,
  },
  /// 检测视频，标注后的视频写入输出目录
  Video {
    /// 视频文件
    #[arg(long, value_name = "FILE")]
    input: PathBuf,
    /// 模型选择器
    #[arg(long)]
    selector: Option<String>,
    /// 输出目录
    #[arg(long, default_value = "outputs", value_name = "DIR")]
    output_dir: PathBuf,
  },
}

impl Args {
  pub fn pipeline_config(&self) -> Result<PipelineConfig> {
    let backend = match self.backend.as_str() {
      "ffmpeg" => BackendKind::Ffmpeg,
      #[cfg(feature = "gstreamer_video")]
      "gstreamer" => BackendKind::GStreamer,
      other => bail!("unsupported video backend '{}'", other),
    };
    let mode = match self.command {
      Command::Image {
        detect_only: true, ..
      } => OutputMode::DetectOnly,
      _ => OutputMode::Annotate,
    };

    let defaults = PipelineConfig::default();
    Ok(PipelineConfig {
      confidence: self.confidence,
      iou: (!self.no_nms).then_some(self.iou),
      mode,
      temp_dir: self.temp_dir.clone().unwrap_or(defaults.temp_dir),
      backend,
      codec: self.codec,
      ffmpeg: self
        .ffmpeg_dir
        .as_deref()
        .map(FfmpegTools::in_dir)
        .unwrap_or(defaults.ffmpeg),
    })
  }
}
