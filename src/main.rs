// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::fs::File;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use shanan_durian::{
  model::{ClassTable, ModelRegistry},
  output::Annotator,
  pipeline::{CancelToken, Pipeline},
};

use args::{Args, Command};

fn main() -> Result<()> {
  // 标准输出只留给 JSON 结果
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  info!("加载模型: {:?}", args.models);
  let mut builder = ModelRegistry::builder();
  for spec in &args.models {
    builder = builder.model_spec(spec)?;
  }
  let registry = Arc::new(builder.default_model(&args.default_model).build()?);

  let mut pipeline = Pipeline::new(registry, args.pipeline_config()?)?;
  if let Some(font) = &args.font {
    pipeline = pipeline.with_annotator(Annotator::new(ClassTable::durian()).with_font_file(font)?);
  }

  let result = match &args.command {
    Command::Image {
      input, selector, ..
    } => {
      let bytes =
        std::fs::read(input).with_context(|| format!("无法读取图像 {}", input.display()))?;
      pipeline.process_image(&bytes, selector.as_deref())
    }
    Command::Video {
      input,
      selector,
      output_dir,
    } => {
      let cancel = CancelToken::new();
      let handler = cancel.clone();
      ctrlc::set_handler(move || {
        warn!("收到中断信号，取消视频处理...");
        handler.cancel();
      })?;

      let upload = File::open(input).with_context(|| format!("无法打开视频 {}", input.display()))?;
      pipeline.process_video_cancellable(upload, selector.as_deref(), output_dir, &cancel)
    }
  };

  println!("{}", serde_json::to_string_pretty(&result)?);
  if result.is_failure() {
    std::process::exit(1);
  }
  Ok(())
}
