// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline/artifact.rs - 临时文件与输出文件的生命周期
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

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TEMP_PREFIX: &str = "upload-";
const TEMP_EXTENSION: &str = "video";
const OUTPUT_EXTENSION: &str = "mp4";

/// 上传视频的临时副本，销毁时总是删除
#[derive(Debug)]
pub struct TempArtifact {
  path: PathBuf,
}

impl TempArtifact {
  /// 将上传内容写入 `dir` 下唯一命名的文件
  pub fn persist(dir: &Path, mut upload: impl Read) -> io::Result<Self> {
    fs::create_dir_all(dir)?;
    let path = dir.join(temp_file_name());

    // create_new 保证不会覆盖其他请求的文件
    let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    // 文件已存在，之后的任何错误都由 Drop 删除
    let artifact = TempArtifact { path };

    let mut writer = BufWriter::new(file);
    let bytes = io::copy(&mut upload, &mut writer)?;
    writer.flush()?;
    let file: File = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    debug!("上传内容已写入 {}: {} 字节", artifact.path.display(), bytes);
    Ok(artifact)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for TempArtifact {
  fn drop(&mut self) {
    remove_quietly(&self.path, "临时输入");
  }
}

/// 输出视频文件；只有调用 `keep` 之后才会保留，否则销毁时删除
#[derive(Debug)]
pub struct OutputArtifact {
  path: PathBuf,
  kept: bool,
}

impl OutputArtifact {
  pub fn new(path: PathBuf) -> Self {
    Self { path, kept: false }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// 确认输出完成，返回文件路径
  pub fn keep(mut self) -> PathBuf {
    self.kept = true;
    std::mem::take(&mut self.path)
  }
}

impl Drop for OutputArtifact {
  fn drop(&mut self) {
    if !self.kept {
      remove_quietly(&self.path, "未完成的输出");
    }
  }
}

fn remove_quietly(path: &Path, what: &str) {
  match fs::remove_file(path) {
    Ok(()) => info!("已删除{}: {}", what, path.display()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
    Err(e) => warn!("删除{}失败 {}: {}", what, path.display(), e),
  }
}

pub fn temp_file_name() -> String {
  format!(
    "{}{}.{}",
    TEMP_PREFIX,
    Uuid::new_v4().simple(),
    TEMP_EXTENSION
  )
}

/// `<UTC 时间>-<uuid>.mp4`
pub fn output_file_name() -> String {
  format!(
    "{}-{}.{}",
    Utc::now().format("%Y%m%dT%H%M%SZ"),
    Uuid::new_v4().simple(),
    OUTPUT_EXTENSION
  )
}
