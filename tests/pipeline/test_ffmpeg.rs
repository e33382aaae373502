// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline/test_ffmpeg.rs - ffmpeg 视频后端测试
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

use std::fs::File;
use std::process::{Command, Stdio};
use std::sync::Arc;

use shanan_durian::{
  Payload,
  input::{FfmpegSource, Fps, VideoInfo, VideoSource},
  output::{FfmpegSink, VideoCodec, VideoSink},
};

use crate::common::{
  ScriptedModel, config, file_count, gray_frame, pipeline, raw_box, single_model_registry,
};

fn ffmpeg_available() -> bool {
  ["ffmpeg", "ffprobe"].iter().all(|program| {
    Command::new(program)
      .arg("-version")
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .is_ok_and(|s| s.success())
  })
}

#[test]
fn ffmpeg_round_trip_keeps_size_rate_and_overlay() {
  if !ffmpeg_available() {
    eprintln!("ffmpeg/ffprobe not found, skipping");
    return;
  }

  let work = tempfile::tempdir().expect("work dir");
  let uploads = tempfile::tempdir().expect("upload dir");
  let outputs = tempfile::tempdir().expect("output dir");

  let info = VideoInfo {
    width: 160,
    height: 120,
    fps: Fps::new(10, 1).expect("fps"),
  };
  let input = work.path().join("input.mp4");
  let mut sink: Box<dyn VideoSink> =
    Box::new(FfmpegSink::create(&input, info, VideoCodec::Mpeg4).expect("create input video"));
  for _ in 0..10 {
    sink
      .write_frame(&gray_frame(info.width, info.height))
      .expect("write input frame");
  }
  sink.finish().expect("finish input video");

  let model = ScriptedModel::new(
    "modelv1",
    vec![raw_box([40.0, 40.0, 100.0, 100.0], 2, 0.9)],
  );
  let mut cfg = config(uploads.path());
  cfg.codec = VideoCodec::Mpeg4;
  let pipeline = pipeline(single_model_registry(Arc::new(model)), cfg);

  let upload = File::open(&input).expect("open input video");
  let result = pipeline.process_video(upload, None, outputs.path());
  let Some(Payload::VideoFile(name)) = result.payload() else {
    panic!("video processing failed: {:?}", result);
  };
  assert_eq!(file_count(uploads.path()), 0);

  let mut source = FfmpegSource::open(&outputs.path().join(name)).expect("open output video");
  let out_info = source.info();
  assert_eq!((out_info.width, out_info.height), (160, 120));
  assert!((out_info.fps.as_f64() - 10.0).abs() < 0.01);

  let mut frames = 0;
  while let Some(frame) = source.read_frame().expect("decode output frame") {
    // 标签背景是大块纯色，有损编码后仍然接近红色
    let [r, g, b] = frame.pixel_rgb(60, 28);
    assert!(r > 150 && g < 90 && b < 90, "pixel is {:?}", [r, g, b]);
    frames += 1;
  }
  assert_eq!(frames, 10);
}
