//! Local-first composition of two backends.
//!
//! Reads try the local backend first and fall back to the remote one,
//! backfilling local on the way. Writes tee the source stream into both
//! backends through two independent pipes, so each side consumes at its own
//! pace, and report errors from either side.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backend::{BoxReader, CacheBackend};
use super::types::CacheError;

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct RemoteWrapper {
  local: Arc<dyn CacheBackend>,
  remote: Arc<dyn CacheBackend>,
}

impl RemoteWrapper {
  pub fn new(local: Arc<dyn CacheBackend>, remote: Arc<dyn CacheBackend>) -> Self {
    Self { local, remote }
  }
}

#[async_trait]
impl CacheBackend for RemoteWrapper {
  async fn get(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<BoxReader, CacheError> {
    match self.local.get(ctx, path, key).await {
      Ok(reader) => return Ok(reader),
      Err(CacheError::Cancelled) => return Err(CacheError::Cancelled),
      Err(e) if !e.is_not_found() => warn!(path = %path, key = %key, error = %e, "local cache read failed"),
      Err(_) => {}
    }

    let reader = self.remote.get(ctx, path, key).await?;
    debug!(path = %path, key = %key, "remote cache hit, backfilling local");

    match self.local.set(ctx, path, key, reader).await {
      Ok(()) => self.local.get(ctx, path, key).await,
      Err(e) => {
        // The remote stream was consumed by the failed backfill.
        warn!(path = %path, key = %key, error = %e, "local backfill failed");
        self.remote.get(ctx, path, key).await
      }
    }
  }

  async fn set(&self, ctx: &CancellationToken, path: &str, key: &str, reader: BoxReader) -> Result<(), CacheError> {
    let (local_writer, local_reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (remote_writer, remote_reader) = tokio::io::duplex(PIPE_CAPACITY);

    // A failing source must not look like a clean end of stream to either side.
    let write_ctx = ctx.child_token();

    let (pumped, local, remote) = tokio::join!(
      tee(reader, local_writer, remote_writer, &write_ctx),
      self.local.set(&write_ctx, path, key, Box::new(local_reader)),
      self.remote.set(&write_ctx, path, key, Box::new(remote_reader)),
    );

    pumped?;
    CacheError::combine(local, remote)
  }

  async fn delete(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<(), CacheError> {
    let local = self.local.delete(ctx, path, key).await;
    let remote = self.remote.delete(ctx, path, key).await;
    CacheError::combine(local, remote)
  }

  async fn exists(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<bool, CacheError> {
    match self.local.exists(ctx, path, key).await {
      Ok(true) => return Ok(true),
      Ok(false) => {}
      Err(CacheError::Cancelled) => return Err(CacheError::Cancelled),
      Err(e) => warn!(path = %path, key = %key, error = %e, "local cache exists check failed"),
    }
    self.remote.exists(ctx, path, key).await
  }

  fn name(&self) -> &'static str {
    "remote-wrapper"
  }
}

/// Copy `source` into both pipes.
///
/// A side whose reader went away (its backend failed) is dropped and the other
/// keeps going. On a source error the writes are cancelled before the pipes
/// close.
async fn tee(
  mut source: BoxReader,
  local: DuplexStream,
  remote: DuplexStream,
  write_ctx: &CancellationToken,
) -> Result<(), CacheError> {
  let mut local = Some(local);
  let mut remote = Some(remote);
  let mut buf = vec![0u8; PIPE_CAPACITY];

  loop {
    let n = match source.read(&mut buf).await {
      Ok(n) => n,
      Err(e) => {
        write_ctx.cancel();
        return Err(CacheError::Stream(e));
      }
    };
    if n == 0 {
      break;
    }

    let chunk = &buf[..n];
    let (local_ok, remote_ok) = tokio::join!(write_side(&mut local, chunk), write_side(&mut remote, chunk));
    if !local_ok {
      local = None;
    }
    if !remote_ok {
      remote = None;
    }
    if local.is_none() && remote.is_none() {
      return Ok(());
    }
  }

  for writer in [local.as_mut(), remote.as_mut()].into_iter().flatten() {
    let _ = writer.shutdown().await;
  }
  Ok(())
}

async fn write_side(writer: &mut Option<DuplexStream>, chunk: &[u8]) -> bool {
  match writer {
    Some(w) => w.write_all(chunk).await.is_ok(),
    None => true,
  }
}
