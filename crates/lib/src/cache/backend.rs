use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::types::CacheError;

/// Streamed cache payload.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Blob storage keyed by `(path, key)`.
///
/// `path` groups related entries (a target's cache directory, the CAS) and
/// `key` names one entry inside it. Every operation observes `ctx` and
/// returns `CacheError::Cancelled` once it fires.
#[async_trait]
pub trait CacheBackend: Send + Sync {
  /// Open an entry for reading. Missing entries are `CacheError::NotFound`.
  async fn get(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<BoxReader, CacheError>;

  /// Store everything `reader` yields. The entry becomes visible only once
  /// the stream was fully written.
  async fn set(&self, ctx: &CancellationToken, path: &str, key: &str, reader: BoxReader) -> Result<(), CacheError>;

  /// Remove an entry. Removing a missing entry is not an error.
  async fn delete(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<(), CacheError>;

  async fn exists(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<bool, CacheError>;

  fn name(&self) -> &'static str;
}

pub fn empty_reader() -> BoxReader {
  Box::new(tokio::io::empty())
}

/// Drain a payload into memory.
pub async fn read_to_vec(mut reader: BoxReader) -> Result<Vec<u8>, CacheError> {
  let mut buf = Vec::new();
  reader.read_to_end(&mut buf).await.map_err(CacheError::Stream)?;
  Ok(buf)
}

/// Reject locations that could escape the backend root.
pub(crate) fn validate_location(path: &str, key: &str) -> Result<(), CacheError> {
  if key.is_empty() || key.contains('/') || key.contains('\\') || key == "." || key == ".." {
    return Err(CacheError::InvalidKey(key.to_string()));
  }
  if path.starts_with('/') || path.split('/').any(|segment| segment == "..") {
    return Err(CacheError::InvalidKey(path.to_string()));
  }
  Ok(())
}
