//! Directory outputs, stored as streamed tarballs.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::archive::Archiver;
use crate::cache::TargetCache;
use crate::model::{OutputKind, OutputRef, Target};
use crate::status::TargetStatus;
use crate::util::hash::Hasher;

use super::{OutputError, OutputHandler, OutputRecord};

pub struct DirHandler {
  cache: Arc<TargetCache>,
  archiver: Arc<dyn Archiver>,
  workspace_root: PathBuf,
  hasher: Hasher,
}

impl DirHandler {
  pub fn new(
    cache: Arc<TargetCache>,
    archiver: Arc<dyn Archiver>,
    workspace_root: impl Into<PathBuf>,
    hasher: Hasher,
  ) -> Self {
    Self {
      cache,
      archiver,
      workspace_root: workspace_root.into(),
      hasher,
    }
  }
}

#[async_trait]
impl OutputHandler for DirHandler {
  fn kind(&self) -> OutputKind {
    OutputKind::Dir
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
    if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
      return Err(OutputError::MissingOutput {
        label: target.label.clone(),
        output: output.clone(),
      });
    }

    let hasher = self.hasher;
    let hash_path = path.clone();
    let digest = tokio::task::spawn_blocking(move || hasher.hash_directory(&hash_path))
      .await
      .map_err(|e| OutputError::Join(e.to_string()))??;

    status.set(format!("archiving {}", output.identifier));
    let (reader, packing) = self.archiver.pack(ctx, &path).into_parts();
    let (stored, packed) = tokio::join!(self.cache.set_output(ctx, target, output, reader), packing);

    // A failed pack also breaks the pipe, so report it first.
    let entries = packed.map_err(|e| OutputError::Join(e.to_string()))??;
    stored?;

    debug!(label = %target.label, output = %output, entries, digest = %digest, "cached directory output");
    Ok(OutputRecord {
      output: output.clone(),
      digest,
      executable: false,
    })
  }

  async fn load(
    &self,
    ctx: &CancellationToken,
    target: &Target,
    output: &OutputRef,
    _record: Option<&OutputRecord>,
    status: &TargetStatus,
  ) -> Result<(), OutputError> {
    let path = target.resolve_path(&self.workspace_root, &output.identifier);
    status.set(format!("extracting {}", output.identifier));

    let reader = self.cache.get_output(ctx, target, output).await?;
    let entries = self.archiver.unpack(ctx, reader, &path).await?;

    debug!(label = %target.label, output = %output, entries, "restored directory output");
    Ok(())
  }
}
