//! Docker image outputs.
//!
//! In tarball mode the image is exported with `docker save`, streamed into the
//! CAS under its own digest, and re-imported with `docker load`. In registry
//! mode it is pushed to `<registry>/<workspace prefix>/<package>/<name>:<tag>`,
//! tagged with a digest of the change hash, and pulled back. Either way the target's cache entry for the output holds
//! a small JSON record (local tag, image id, mode, and the CAS digest or remote
//! reference). Loading is skipped when the daemon already has the same image.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{BoxReader, Cas, TargetCache, read_to_vec};
use crate::config::DockerMode;
use crate::model::{OutputKind, OutputRef, Target};
use crate::status::TargetStatus;
use crate::util::hash::{ContentHash, Hasher};

use super::{OutputError, OutputHandler, OutputRecord};

#[derive(Debug, Error)]
pub enum DockerError {
  #[error("failed to run docker {args}: {source}")]
  Spawn {
    args: String,
    #[source]
    source: std::io::Error,
  },

  #[error("docker {args} exited with {code:?}: {stderr}")]
  CommandFailed {
    args: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("image {0} not found in the local daemon")]
  ImageNotFound(String),

  #[error("registry mode requires a configured docker registry")]
  NoRegistry,

  #[error("{0} has no change hash to tag its image with")]
  NoChangeHash(String),

  #[error("docker operation cancelled")]
  Cancelled,
}

/// An image export in progress.
pub struct DockerSave {
  pub reader: BoxReader,
  pub done: JoinHandle<Result<(), DockerError>>,
}

/// The subset of the docker daemon API the engine needs.
#[async_trait]
pub trait DockerClient: Send + Sync {
  /// Local image id for `reference`, `None` if the daemon does not have it.
  async fn image_id(&self, ctx: &CancellationToken, reference: &str) -> Result<Option<String>, DockerError>;

  async fn save(&self, ctx: &CancellationToken, reference: &str) -> Result<DockerSave, DockerError>;

  async fn load(&self, ctx: &CancellationToken, reader: BoxReader) -> Result<(), DockerError>;

  async fn tag(&self, ctx: &CancellationToken, source: &str, target: &str) -> Result<(), DockerError>;

  async fn push(&self, ctx: &CancellationToken, reference: &str) -> Result<(), DockerError>;

  async fn pull(&self, ctx: &CancellationToken, reference: &str) -> Result<(), DockerError>;

  /// Whether the registry still serves `reference`.
  async fn remote_exists(&self, ctx: &CancellationToken, reference: &str) -> Result<bool, DockerError>;
}

/// `DockerClient` backed by the `docker` command line.
#[derive(Debug, Clone)]
pub struct DockerCli {
  binary: String,
}

impl Default for DockerCli {
  fn default() -> Self {
    Self {
      binary: "docker".to_string(),
    }
  }
}

impl DockerCli {
  pub fn new(binary: impl Into<String>) -> Self {
    Self { binary: binary.into() }
  }

  async fn exec(&self, ctx: &CancellationToken, args: &[&str]) -> Result<std::process::Output, DockerError> {
    debug!(args = ?args, "running docker");
    let output = Command::new(&self.binary)
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .output();

    tokio::select! {
      biased;
      _ = ctx.cancelled() => Err(DockerError::Cancelled),
      output = output => output.map_err(|source| DockerError::Spawn {
        args: args.join(" "),
        source,
      }),
    }
  }

  async fn exec_ok(&self, ctx: &CancellationToken, args: &[&str]) -> Result<String, DockerError> {
    let output = self.exec(ctx, args).await?;
    if !output.status.success() {
      return Err(DockerError::CommandFailed {
        args: args.join(" "),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
  }
}

#[async_trait]
impl DockerClient for DockerCli {
  async fn image_id(&self, ctx: &CancellationToken, reference: &str) -> Result<Option<String>, DockerError> {
    let output = self
      .exec(ctx, &["image", "inspect", "--format", "{{.Id}}", reference])
      .await?;
    if !output.status.success() {
      return Ok(None);
    }
    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!id.is_empty()).then_some(id))
  }

  async fn save(&self, ctx: &CancellationToken, reference: &str) -> Result<DockerSave, DockerError> {
    let args = format!("save {reference}");
    let mut child = Command::new(&self.binary)
      .args(["save", reference])
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| DockerError::Spawn {
        args: args.clone(),
        source,
      })?;

    let stdout = child.stdout.take().ok_or_else(|| DockerError::Spawn {
      args: args.clone(),
      source: std::io::Error::other("stdout not captured"),
    })?;

    let ctx = ctx.clone();
    let done = tokio::spawn(async move {
      // Dropping the child on cancellation kills it and ends the stream.
      let output = tokio::select! {
        biased;
        _ = ctx.cancelled() => return Err(DockerError::Cancelled),
        output = child.wait_with_output() => output,
      };
      let output = output.map_err(|source| DockerError::Spawn {
        args: args.clone(),
        source,
      })?;
      if output.status.success() {
        Ok(())
      } else {
        Err(DockerError::CommandFailed {
          args,
          code: output.status.code(),
          stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
      }
    });

    Ok(DockerSave {
      reader: Box::new(stdout),
      done,
    })
  }

  async fn load(&self, ctx: &CancellationToken, mut reader: BoxReader) -> Result<(), DockerError> {
    let args = "load".to_string();
    let mut child = Command::new(&self.binary)
      .args(["load", "--quiet"])
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| DockerError::Spawn {
        args: args.clone(),
        source,
      })?;

    let mut stdin = child.stdin.take().ok_or_else(|| DockerError::Spawn {
      args: args.clone(),
      source: std::io::Error::other("stdin not captured"),
    })?;

    let feed = async {
      tokio::io::copy(&mut reader, &mut stdin).await?;
      stdin.shutdown().await?;
      drop(stdin);
      Ok::<_, std::io::Error>(())
    };

    let output = tokio::select! {
      biased;
      _ = ctx.cancelled() => return Err(DockerError::Cancelled),
      result = async {
        let fed = feed.await;
        let output = child.wait_with_output().await;
        (fed, output)
      } => result,
    };

    let (fed, output) = output;
    let output = output.map_err(|source| DockerError::Spawn {
      args: args.clone(),
      source,
    })?;
    if !output.status.success() {
      return Err(DockerError::CommandFailed {
        args,
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    fed.map_err(|source| DockerError::Spawn { args, source })
  }

  async fn tag(&self, ctx: &CancellationToken, source: &str, target: &str) -> Result<(), DockerError> {
    self.exec_ok(ctx, &["tag", source, target]).await.map(|_| ())
  }

  async fn push(&self, ctx: &CancellationToken, reference: &str) -> Result<(), DockerError> {
    self.exec_ok(ctx, &["push", reference]).await.map(|_| ())
  }

  async fn pull(&self, ctx: &CancellationToken, reference: &str) -> Result<(), DockerError> {
    self.exec_ok(ctx, &["pull", reference]).await.map(|_| ())
  }

  async fn remote_exists(&self, ctx: &CancellationToken, reference: &str) -> Result<bool, DockerError> {
    let output = self.exec(ctx, &["manifest", "inspect", reference]).await?;
    Ok(output.status.success())
  }
}

/// Stored in the target cache entry of a docker output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerMetadata {
  pub tag: String,
  pub image_id: String,
  pub mode: DockerMode,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cas_digest: Option<ContentHash>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub remote_ref: Option<String>,
}

pub struct DockerHandler {
  client: Arc<dyn DockerClient>,
  cache: Arc<TargetCache>,
  cas: Arc<Cas>,
  mode: DockerMode,
  registry: Option<String>,
  workspace_prefix: String,
  hasher: Hasher,
}

impl DockerHandler {
  pub fn new(
    client: Arc<dyn DockerClient>,
    cache: Arc<TargetCache>,
    cas: Arc<Cas>,
    mode: DockerMode,
    registry: Option<String>,
    workspace_prefix: impl Into<String>,
    hasher: Hasher,
  ) -> Self {
    Self {
      client,
      cache,
      cas,
      mode,
      registry,
      workspace_prefix: workspace_prefix.into(),
      hasher,
    }
  }

  /// `<registry>/<workspace prefix>/<package>/<name>:<tag>`.
  ///
  /// The tag is a digest of the change hash: a full change hash can exceed
  /// the 128 characters docker allows in a tag.
  pub fn remote_reference(&self, target: &Target) -> Result<String, DockerError> {
    let registry = self.registry.as_deref().ok_or(DockerError::NoRegistry)?;
    let change_hash = target
      .change_hash()
      .ok_or_else(|| DockerError::NoChangeHash(target.label.to_string()))?;
    let tag = self.hasher.hash_str(change_hash);
    let mut repo = format!("{}/{}", registry.trim_end_matches('/'), self.workspace_prefix);
    if !target.label.package.is_empty() {
      repo.push('/');
      repo.push_str(&target.label.package);
    }
    repo.push('/');
    repo.push_str(&target.label.name);
    Ok(format!("{}:{}", repo.to_lowercase(), tag))
  }

  async fn read_metadata(
    &self,
    ctx: &CancellationToken,
    target: &Target,
    output: &OutputRef,
  ) -> Result<DockerMetadata, OutputError> {
    let bytes = read_to_vec(self.cache.get_output(ctx, target, output).await?).await?;
    Ok(serde_json::from_slice(&bytes)?)
  }
}

#[async_trait]
impl OutputHandler for DockerHandler {
  fn kind(&self) -> OutputKind {
    OutputKind::Docker
  }

  async fn has(&self, ctx: &CancellationToken, target: &Target, output: &OutputRef) -> Result<bool, OutputError> {
    if !self.cache.has_output(ctx, target, output).await? {
      return Ok(false);
    }
    let metadata = self.read_metadata(ctx, target, output).await?;
    match (&metadata.cas_digest, &metadata.remote_ref) {
      (Some(digest), _) => Ok(self.cas.exists(ctx, digest).await?),
      (None, Some(remote)) => Ok(self.client.remote_exists(ctx, remote).await?),
      (None, None) => Ok(false),
    }
  }

  async fn write(
    &self,
    ctx: &CancellationToken,
    target: &Target,
    output: &OutputRef,
    status: &TargetStatus,
  ) -> Result<OutputRecord, OutputError> {
    let tag = &output.identifier;
    let image_id = match self.client.image_id(ctx, tag).await? {
      Some(id) => id,
      None => {
        return Err(OutputError::MissingOutput {
          label: target.label.clone(),
          output: output.clone(),
        });
      }
    };

    let metadata = match self.mode {
      DockerMode::Tarball => {
        status.set(format!("exporting image {tag}"));
        let save = self.client.save(ctx, tag).await?;
        let (stored, saved) = tokio::join!(self.cas.put(ctx, save.reader), save.done);
        saved.map_err(|e| OutputError::Join(e.to_string()))??;
        DockerMetadata {
          tag: tag.clone(),
          image_id: image_id.clone(),
          mode: DockerMode::Tarball,
          cas_digest: Some(stored?),
          remote_ref: None,
        }
      }
      DockerMode::Registry => {
        let remote = self.remote_reference(target)?;
        status.set(format!("pushing {remote}"));
        self.client.tag(ctx, tag, &remote).await?;
        self.client.push(ctx, &remote).await?;
        DockerMetadata {
          tag: tag.clone(),
          image_id: image_id.clone(),
          mode: DockerMode::Registry,
          cas_digest: None,
          remote_ref: Some(remote),
        }
      }
    };

    let json = serde_json::to_vec(&metadata)?;
    self
      .cache
      .set_output(ctx, target, output, Box::new(std::io::Cursor::new(json)))
      .await?;

    info!(label = %target.label, tag = %tag, image = %image_id, "cached docker image");
    Ok(OutputRecord {
      output: output.clone(),
      digest: self.hasher.hash_str(&image_id),
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
    let metadata = self.read_metadata(ctx, target, output).await?;

    if self.client.image_id(ctx, &metadata.tag).await?.as_deref() == Some(metadata.image_id.as_str()) {
      debug!(label = %target.label, tag = %metadata.tag, "image already present, skipping load");
      return Ok(());
    }

    match (&metadata.cas_digest, &metadata.remote_ref) {
      (Some(digest), _) => {
        status.set(format!("loading image {}", metadata.tag));
        let reader = self.cas.get(ctx, digest).await?;
        self.client.load(ctx, reader).await?;
      }
      (None, Some(remote)) => {
        status.set(format!("pulling {remote}"));
        self.client.pull(ctx, remote).await?;
        self.client.tag(ctx, remote, &metadata.tag).await?;
      }
      (None, None) => return Err(DockerError::ImageNotFound(metadata.tag.clone()).into()),
    }

    debug!(label = %target.label, tag = %metadata.tag, "restored docker image");
    Ok(())
  }
}
