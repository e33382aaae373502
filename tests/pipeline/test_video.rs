// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline/test_video.rs - 视频检测流水线测试
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

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use shanan_durian::{
  CancelToken, Payload, Pipeline, PipelineResult,
  frame::Frame,
  input::{Fps, VideoInfo},
  model::Model,
};

use crate::common::{
  Counters, GRAY, MATURE_RGB, RawBackend, ScriptedModel, config, file_count, filled_frame,
  gray_frame, pipeline, raw_box, raw_video, read_raw_video, single_model_registry,
};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;
const FRAMES: usize = 10;

struct Fixture {
  uploads: tempfile::TempDir,
  outputs: tempfile::TempDir,
  backend: RawBackend,
}

impl Fixture {
  fn new() -> Self {
    Self::with_backend(RawBackend::default())
  }

  fn with_backend(backend: RawBackend) -> Self {
    Self {
      uploads: tempfile::tempdir().expect("upload dir"),
      outputs: tempfile::tempdir().expect("output dir"),
      backend,
    }
  }

  fn pipeline(&self, model: Arc<dyn Model>) -> Pipeline {
    pipeline(single_model_registry(model), config(self.uploads.path()))
      .with_backend(self.backend.clone())
  }

  fn output_dir(&self) -> &Path {
    self.outputs.path()
  }

  fn counters(&self) -> &Counters {
    &self.backend.counters
  }

  fn assert_no_files_left(&self) {
    assert_eq!(file_count(self.uploads.path()), 0, "temporary input left behind");
    assert_eq!(file_count(self.output_dir()), 0, "partial output left behind");
  }

  fn assert_handles_released_once(&self) {
    let c = self.counters();
    assert_eq!(Counters::get(&c.sources_released), Counters::get(&c.opened));
    assert_eq!(Counters::get(&c.sinks_released), Counters::get(&c.created));
    // 视频源总是在删除临时输入之前释放
    assert_eq!(
      Counters::get(&c.released_before_input_removed),
      Counters::get(&c.sources_released)
    );
  }
}

fn info() -> VideoInfo {
  VideoInfo {
    width: WIDTH,
    height: HEIGHT,
    fps: Fps::new(30, 1).expect("fps"),
  }
}

fn upload(frames: usize) -> Vec<u8> {
  let frames: Vec<_> = (0..frames).map(|_| gray_frame(WIDTH, HEIGHT)).collect();
  raw_video(info(), &frames)
}

fn mature_model() -> Arc<dyn Model> {
  Arc::new(ScriptedModel::new(
    "modelv1",
    vec![raw_box([10.0, 10.0, 40.0, 40.0], 2, 0.9)],
  ))
}

fn output_path(result: &PipelineResult, dir: &Path) -> PathBuf {
  match result.payload() {
    Some(Payload::VideoFile(name)) => dir.join(name),
    other => panic!("expected video file payload, got {:?}", other),
  }
}

#[test]
fn every_frame_is_annotated_and_input_removed() {
  let fixture = Fixture::new();
  let pipeline = fixture.pipeline(mature_model());

  let result = pipeline.process_video(&upload(FRAMES)[..], None, fixture.output_dir());

  assert_eq!(result.status(), Some("Video processed"));
  let path = output_path(&result, fixture.output_dir());
  assert_eq!(path.extension().and_then(|e| e.to_str()), Some("mp4"));

  let (out_info, frames) = read_raw_video(&path);
  assert_eq!(out_info, info());
  assert_eq!(frames.len(), FRAMES);
  for frame in &frames {
    assert_eq!(frame.dimensions(), (WIDTH, HEIGHT));
    assert_eq!(frame.pixel_rgb(20, 10), MATURE_RGB);
    assert_eq!(frame.pixel_rgb(25, 38), [GRAY, GRAY, GRAY]);
    assert_eq!(frame.pixel_rgb(5, 45), [GRAY, GRAY, GRAY]);
  }

  assert_eq!(file_count(fixture.uploads.path()), 0);
  assert_eq!(file_count(fixture.output_dir()), 1);
  assert_eq!(Counters::get(&fixture.counters().sinks_finished), 1);
  fixture.assert_handles_released_once();
}

#[test]
fn frames_without_detections_pass_through() {
  let fixture = Fixture::new();
  let pipeline = fixture.pipeline(Arc::new(ScriptedModel::empty("modelv1")));

  let result = pipeline.process_video(&upload(3)[..], Some("new"), fixture.output_dir());

  let (_, frames) = read_raw_video(&output_path(&result, fixture.output_dir()));
  assert_eq!(frames.len(), 3);
  assert!(frames.iter().all(|f| *f == gray_frame(WIDTH, HEIGHT)));
}

#[test]
fn frames_keep_their_order_and_only_the_detected_one_is_drawn() {
  const DETECTED: usize = 6;

  let fixture = Fixture::new();
  let model = ScriptedModel::new(
    "modelv1",
    vec![raw_box([10.0, 10.0, 40.0, 40.0], 2, 0.9)],
  )
  .only_at(DETECTED);
  let pipeline = fixture.pipeline(Arc::new(model));

  let inputs: Vec<Frame> = (0..FRAMES)
    .map(|i| filled_frame(WIDTH, HEIGHT, 10 + 20 * i as u8))
    .collect();
  let result = pipeline.process_video(&raw_video(info(), &inputs)[..], None, fixture.output_dir());

  let (_, outputs) = read_raw_video(&output_path(&result, fixture.output_dir()));
  assert_eq!(outputs.len(), FRAMES);
  for (i, (output, input)) in outputs.iter().zip(&inputs).enumerate() {
    if i == DETECTED {
      assert_ne!(output, input);
      assert_eq!(output.pixel_rgb(20, 10), MATURE_RGB);
      assert_eq!(output.pixel_rgb(25, 38), input.pixel_rgb(25, 38));
    } else {
      assert_eq!(output, input, "frame {} changed", i);
    }
  }
}

#[test]
fn encoder_losing_frames_is_a_failure() {
  let fixture = Fixture::with_backend(RawBackend::lossy());
  let pipeline = fixture.pipeline(mature_model());

  let result = pipeline.process_video(&upload(3)[..], None, fixture.output_dir());

  assert!(
    result
      .error()
      .expect("failure")
      .contains("encoder accepted 1 of 3 frames")
  );
  fixture.assert_no_files_left();
  assert_eq!(Counters::get(&fixture.counters().sinks_finished), 0);
  fixture.assert_handles_released_once();
}

#[test]
fn model_failure_mid_video_cleans_up() {
  let fixture = Fixture::new();
  let model = Arc::new(ScriptedModel::new("modelv1", vec![]).failing_at(4));
  let pipeline = fixture.pipeline(model.clone());

  let result = pipeline.process_video(&upload(FRAMES)[..], None, fixture.output_dir());

  let error = result.error().expect("failure");
  assert!(error.starts_with("Error during prediction: "));
  assert!(error.contains("scripted failure at call 4"));
  // 失败后不再处理后续帧
  assert_eq!(model.calls(), 5);

  fixture.assert_no_files_left();
  assert_eq!(Counters::get(&fixture.counters().opened), 1);
  assert_eq!(Counters::get(&fixture.counters().created), 1);
  assert_eq!(Counters::get(&fixture.counters().sinks_finished), 0);
  fixture.assert_handles_released_once();
}

#[test]
fn unreadable_video_cleans_up() {
  let fixture = Fixture::new();
  let pipeline = fixture.pipeline(mature_model());

  let result = pipeline.process_video(&b"this is not a video"[..], None, fixture.output_dir());

  assert!(result.error().expect("failure").contains("not a raw video"));
  fixture.assert_no_files_left();
  assert_eq!(Counters::get(&fixture.counters().opened), 0);
  assert_eq!(Counters::get(&fixture.counters().created), 0);
}

#[test]
fn truncated_video_cleans_up() {
  let fixture = Fixture::new();
  let pipeline = fixture.pipeline(mature_model());

  let mut bytes = upload(2);
  bytes.truncate(bytes.len() - 10);
  let result = pipeline.process_video(&bytes[..], None, fixture.output_dir());

  assert!(result.error().expect("failure").contains("truncated frame"));
  fixture.assert_no_files_left();
  fixture.assert_handles_released_once();
}

#[test]
fn failed_upload_cleans_up() {
  struct Reset;
  impl Read for Reset {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
      Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
    }
  }

  let fixture = Fixture::new();
  let pipeline = fixture.pipeline(mature_model());

  let result = pipeline.process_video(Reset, None, fixture.output_dir());

  assert!(result.error().expect("failure").contains("connection reset"));
  fixture.assert_no_files_left();
  assert_eq!(Counters::get(&fixture.counters().opened), 0);
}

#[test]
fn cancelled_video_cleans_up() {
  let fixture = Fixture::new();
  let model = Arc::new(ScriptedModel::new("modelv1", vec![]));
  let pipeline = fixture.pipeline(model.clone());

  let cancel = CancelToken::new();
  cancel.cancel();
  let result =
    pipeline.process_video_cancellable(&upload(FRAMES)[..], None, fixture.output_dir(), &cancel);

  assert!(result.error().expect("failure").contains("cancelled"));
  assert_eq!(model.calls(), 0);
  fixture.assert_no_files_left();
  fixture.assert_handles_released_once();
}

#[test]
fn concurrent_videos_write_distinct_outputs() {
  let fixture = Fixture::new();
  let pipeline = fixture.pipeline(mature_model());
  let bytes = upload(4);

  let names: Vec<PathBuf> = std::thread::scope(|s| {
    let handles: Vec<_> = (0..3)
      .map(|_| s.spawn(|| pipeline.process_video(&bytes[..], None, fixture.output_dir())))
      .collect();
    handles
      .into_iter()
      .map(|h| output_path(&h.join().expect("worker panicked"), fixture.output_dir()))
      .collect()
  });

  assert_ne!(names[0], names[1]);
  assert_ne!(names[1], names[2]);
  assert_ne!(names[0], names[2]);
  for name in &names {
    assert_eq!(read_raw_video(name).1.len(), 4);
  }
  assert_eq!(file_count(fixture.uploads.path()), 0);
  assert_eq!(file_count(fixture.output_dir()), 3);
  fixture.assert_handles_released_once();
}
