//! Output handlers.
//!
//! Every declared output kind has a handler that can tell whether the output
//! is cached, store it after a build, and restore it on a cache hit. The
//! `Registry` resolves handlers by kind once at construction and drives them
//! for all outputs of a target.

pub mod dir;
pub mod docker;
pub mod file;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveError;
use crate::cache::CacheError;
use crate::model::{OutputKind, OutputRef, Target, TargetLabel};
use crate::status::TargetStatus;
use crate::util::hash::{ContentHash, DirHashError};
use crate::worker::PoolError;

pub use dir::DirHandler;
pub use docker::{DockerCli, DockerClient, DockerError, DockerHandler, DockerSave};
pub use file::FileHandler;
pub use registry::Registry;

#[derive(Debug, Error)]
pub enum OutputError {
  #[error("{label} did not produce declared output {output}")]
  MissingOutput { label: TargetLabel, output: OutputRef },

  #[error("no handler registered for {0} outputs")]
  NoHandler(OutputKind),

  #[error("{0} is not a target")]
  NotATarget(TargetLabel),

  #[error("docker: {0}")]
  Docker(#[from] DockerError),

  #[error("cache: {0}")]
  Cache(#[from] CacheError),

  #[error("archive: {0}")]
  Archive(#[from] ArchiveError),

  #[error("hashing output: {0}")]
  Hash(#[from] DirHashError),

  #[error("invalid output metadata: {0}")]
  Metadata(#[from] serde_json::Error),

  #[error("output I/O error at {path}: {source}")]
  Io {
    path: std::path::PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("output worker: {0}")]
  Pool(#[from] PoolError),

  #[error("output task failed: {0}")]
  Join(String),
}

impl OutputError {
  pub(crate) fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
    OutputError::Io {
      path: path.into(),
      source,
    }
  }
}

/// What was stored for one output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
  pub output: OutputRef,
  pub digest: ContentHash,
  /// Files only: restore the executable bit.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub executable: bool,
}

/// Summary of a target's stored outputs, kept alongside its cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
  pub label: TargetLabel,
  pub change_hash: String,
  /// Order-independent digest over every output record.
  pub output_hash: String,
  pub outputs: Vec<OutputRecord>,
}

impl TargetResult {
  pub fn record(&self, output: &OutputRef) -> Option<&OutputRecord> {
    self.outputs.iter().find(|r| &r.output == output)
  }
}

#[async_trait]
pub trait OutputHandler: Send + Sync {
  fn kind(&self) -> OutputKind;

  /// Whether `output` can be restored from the cache.
  async fn has(&self, ctx: &CancellationToken, target: &Target, output: &OutputRef) -> Result<bool, OutputError>;

  /// Store `output` from the workspace into the cache.
  async fn write(
    &self,
    ctx: &CancellationToken,
    target: &Target,
    output: &OutputRef,
    status: &TargetStatus,
  ) -> Result<OutputRecord, OutputError>;

  /// Restore `output` from the cache into the workspace.
  async fn load(
    &self,
    ctx: &CancellationToken,
    target: &Target,
    output: &OutputRef,
    record: Option<&OutputRecord>,
    status: &TargetStatus,
  ) -> Result<(), OutputError>;
}
