//! Filesystem cache backend.
//!
//! Entries live at `<root>/<path>/<key>`. Writes go to a temporary file in the
//! destination directory and are renamed into place, so readers never observe
//! a partially written entry.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::backend::{BoxReader, CacheBackend, validate_location};
use super::types::CacheError;

#[derive(Debug, Clone)]
pub struct FsBackend {
  root: PathBuf,
}

impl FsBackend {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn entry_path(&self, path: &str, key: &str) -> Result<PathBuf, CacheError> {
    validate_location(path, key)?;
    let dir = if path.is_empty() {
      self.root.clone()
    } else {
      self.root.join(path)
    };
    Ok(dir.join(key))
  }
}

#[async_trait]
impl CacheBackend for FsBackend {
  async fn get(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<BoxReader, CacheError> {
    if ctx.is_cancelled() {
      return Err(CacheError::Cancelled);
    }
    let file_path = self.entry_path(path, key)?;

    match tokio::fs::File::open(&file_path).await {
      Ok(file) => Ok(Box::new(file)),
      Err(e) if e.kind() == ErrorKind::NotFound => Err(CacheError::NotFound {
        path: path.to_string(),
        key: key.to_string(),
      }),
      Err(e) => Err(CacheError::io(file_path, e)),
    }
  }

  async fn set(&self, ctx: &CancellationToken, path: &str, key: &str, mut reader: BoxReader) -> Result<(), CacheError> {
    if ctx.is_cancelled() {
      return Err(CacheError::Cancelled);
    }
    let file_path = self.entry_path(path, key)?;
    let dir = file_path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| self.root.clone());

    tokio::fs::create_dir_all(&dir)
      .await
      .map_err(|e| CacheError::io(&dir, e))?;

    let temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| CacheError::io(&dir, e))?;
    let (std_file, temp_path) = temp.into_parts();
    let mut file = tokio::fs::File::from_std(std_file);

    let copied = tokio::select! {
      biased;
      _ = ctx.cancelled() => return Err(CacheError::Cancelled),
      copied = tokio::io::copy(&mut reader, &mut file) => copied.map_err(CacheError::Stream)?,
    };

    file.flush().await.map_err(|e| CacheError::io(&file_path, e))?;
    file.sync_all().await.map_err(|e| CacheError::io(&file_path, e))?;
    drop(file);

    // Dropping `temp_path` on any error above removes the temporary file.
    temp_path
      .persist(&file_path)
      .map_err(|e| CacheError::io(&file_path, e.error))?;

    debug!(path = %path, key = %key, bytes = copied, "wrote cache entry");
    Ok(())
  }

  async fn delete(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<(), CacheError> {
    if ctx.is_cancelled() {
      return Err(CacheError::Cancelled);
    }
    let file_path = self.entry_path(path, key)?;
    match tokio::fs::remove_file(&file_path).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(CacheError::io(file_path, e)),
    }
  }

  async fn exists(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<bool, CacheError> {
    if ctx.is_cancelled() {
      return Err(CacheError::Cancelled);
    }
    let file_path = self.entry_path(path, key)?;
    tokio::fs::try_exists(&file_path)
      .await
      .map_err(|e| CacheError::io(file_path, e))
  }

  fn name(&self) -> &'static str {
    "local"
  }
}
