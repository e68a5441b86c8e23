//! Content-addressable store.
//!
//! Blobs are keyed by the digest of their own bytes under the shared `cas`
//! path, independent of any target. Storing the same content twice is a no-op.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::consts::CAS_PATH;
use crate::util::hash::{ContentHash, Hasher};

use super::backend::{BoxReader, CacheBackend};
use super::types::CacheError;

const CHUNK_SIZE: usize = 64 * 1024;

pub struct Cas {
  backend: Arc<dyn CacheBackend>,
  hasher: Hasher,
}

impl Cas {
  pub fn new(backend: Arc<dyn CacheBackend>, hasher: Hasher) -> Self {
    Self { backend, hasher }
  }

  pub async fn exists(&self, ctx: &CancellationToken, digest: &ContentHash) -> Result<bool, CacheError> {
    self.backend.exists(ctx, CAS_PATH, &digest.0).await
  }

  pub async fn get(&self, ctx: &CancellationToken, digest: &ContentHash) -> Result<BoxReader, CacheError> {
    self.backend.get(ctx, CAS_PATH, &digest.0).await
  }

  /// Store a stream and return its digest.
  ///
  /// The stream is hashed while it is spooled to a temporary file, then the
  /// spool is uploaded under the digest unless that blob already exists.
  pub async fn put(&self, ctx: &CancellationToken, mut reader: BoxReader) -> Result<ContentHash, CacheError> {
    let spool = tempfile::tempfile().map_err(CacheError::Stream)?;
    let mut spool = tokio::fs::File::from_std(spool);
    let mut stream = self.hasher.stream();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size: u64 = 0;

    loop {
      if ctx.is_cancelled() {
        return Err(CacheError::Cancelled);
      }
      let n = reader.read(&mut buf).await.map_err(CacheError::Stream)?;
      if n == 0 {
        break;
      }
      stream.update(&buf[..n]);
      spool.write_all(&buf[..n]).await.map_err(CacheError::Stream)?;
      size += n as u64;
    }

    let digest = stream.finalize();
    if self.exists(ctx, &digest).await? {
      debug!(digest = %digest, "blob already in CAS");
      return Ok(digest);
    }

    spool.flush().await.map_err(CacheError::Stream)?;
    spool.seek(std::io::SeekFrom::Start(0)).await.map_err(CacheError::Stream)?;
    self.backend.set(ctx, CAS_PATH, &digest.0, Box::new(spool)).await?;

    debug!(digest = %digest, bytes = size, "stored blob in CAS");
    Ok(digest)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::backend::read_to_vec;
  use crate::cache::local::FsBackend;
  use tempfile::TempDir;

  #[tokio::test]
  async fn put_is_content_addressed_and_idempotent() {
    let tmp = TempDir::new().unwrap();
    let hasher = Hasher::default();
    let cas = Cas::new(Arc::new(FsBackend::new(tmp.path())), hasher);
    let ctx = CancellationToken::new();

    let first = cas.put(&ctx, Box::new(&b"layer bytes"[..])).await.unwrap();
    let second = cas.put(&ctx, Box::new(&b"layer bytes"[..])).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, hasher.hash_bytes(b"layer bytes"));
    assert_eq!(std::fs::read_dir(tmp.path().join(CAS_PATH)).unwrap().count(), 1);

    let data = read_to_vec(cas.get(&ctx, &first).await.unwrap()).await.unwrap();
    assert_eq!(data, b"layer bytes");
  }

  #[tokio::test]
  async fn missing_blob_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let cas = Cas::new(Arc::new(FsBackend::new(tmp.path())), Hasher::default());
    let ctx = CancellationToken::new();
    let digest = ContentHash("00".repeat(16));
    assert!(!cas.exists(&ctx, &digest).await.unwrap());
    assert!(cas.get(&ctx, &digest).await.err().unwrap().is_not_found());
  }
}
