//! Single-file outputs, stored verbatim under the target's cache entry.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::TargetCache;
use crate::model::{OutputKind, OutputRef, Target};
use crate::status::TargetStatus;
use crate::util::hash::Hasher;
use crate::worker::{ProgressReader, ProgressTracker};

use super::{OutputError, OutputHandler, OutputRecord};

pub struct FileHandler {
  cache: Arc<TargetCache>,
  workspace_root: std::path::PathBuf,
  hasher: Hasher,
}

impl FileHandler {
  pub fn new(cache: Arc<TargetCache>, workspace_root: impl Into<std::path::PathBuf>, hasher: Hasher) -> Self {
    Self {
      cache,
      workspace_root: workspace_root.into(),
      hasher,
    }
  }
}

#[async_trait]
impl OutputHandler for FileHandler {
  fn kind(&self) -> OutputKind {
    OutputKind::File
  }

  async fn has(&self, ctx: &CancellationToken, target: &Target, output: &OutputRef) -> Result<bool, OutputError> {
    Ok(self.cache.has_output(ctx, target, output).await?)
  }

  async fn write(
    &self,
    ctx: &CancellationToken,
    target: &Target,
    output: &OutputRef,
    status: &TargetStatus,
  ) -> Result<OutputRecord, OutputError> {
    let path = target.resolve_path(&self.workspace_root, &output.identifier);
    let metadata = match tokio::fs::metadata(&path).await {
      Ok(m) if m.is_file() => m,
      _ => {
        return Err(OutputError::MissingOutput {
          label: target.label.clone(),
          output: output.clone(),
        });
      }
    };

    let hasher = self.hasher;
    let hash_path = path.clone();
    let digest = tokio::task::spawn_blocking(move || hasher.hash_file(&hash_path))
      .await
      .map_err(|e| OutputError::Join(e.to_string()))??;

    let file = tokio::fs::File::open(&path).await.map_err(|e| OutputError::io(&path, e))?;
    let tracker = ProgressTracker::new(Some(status.clone()), format!("caching {}", output.identifier), metadata.len());
    self
      .cache
      .set_output(ctx, target, output, Box::new(ProgressReader::new(file, tracker)))
      .await?;

    debug!(label = %target.label, output = %output, digest = %digest, "cached file output");
    Ok(OutputRecord {
      output: output.clone(),
      digest,
      executable: is_executable(&metadata),
    })
  }

  async fn load(
    &self,
    ctx: &CancellationToken,
    target: &Target,
    output: &OutputRef,
    record: Option<&OutputRecord>,
    status: &TargetStatus,
  ) -> Result<(), OutputError> {
    let path = target.resolve_path(&self.workspace_root, &output.identifier);
    let dir = path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| self.workspace_root.clone());
    tokio::fs::create_dir_all(&dir).await.map_err(|e| OutputError::io(&dir, e))?;

    status.set(format!("restoring {}", output.identifier));
    let mut reader = self.cache.get_output(ctx, target, output).await?;

    let temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| OutputError::io(&dir, e))?;
    let (std_file, temp_path) = temp.into_parts();
    let mut file = tokio::fs::File::from_std(std_file);
    tokio::io::copy(&mut reader, &mut file)
      .await
      .map_err(|e| OutputError::io(&path, e))?;
    file.flush().await.map_err(|e| OutputError::io(&path, e))?;
    drop(file);

    if record.is_some_and(|r| r.executable) {
      set_executable(&temp_path)?;
    }
    temp_path.persist(&path).map_err(|e| OutputError::io(&path, e.error))?;

    debug!(label = %target.label, output = %output, "restored file output");
    Ok(())
  }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
  false
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), OutputError> {
  use std::os::unix::fs::PermissionsExt;
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|e| OutputError::io(path, e))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), OutputError> {
  Ok(())
}
