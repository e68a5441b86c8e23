//! Per-target view of the cache.
//!
//! A target's entries live under `package/name_cache_<change hash>`, one entry
//! per declared output keyed by a hash of the output identifier, plus the
//! `__grog_exists__` sentinel. The sentinel is written by `commit` once every
//! output is stored, so it is the marker of a complete write. A target counts
//! as a cache hit only when the sentinel and every output entry are present.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::consts::{CACHE_EXISTS_KEY, CACHE_PATH_INFIX};
use crate::model::{OutputRef, Target};
use crate::util::hash::Hasher;
use crate::util::keyed_mutex::{KeyedGuard, KeyedMutex};

use super::backend::{BoxReader, CacheBackend, read_to_vec};
use super::types::CacheError;

pub struct TargetCache {
  backend: Arc<dyn CacheBackend>,
  hasher: Hasher,
  locks: KeyedMutex<String>,
}

impl TargetCache {
  pub fn new(backend: Arc<dyn CacheBackend>, hasher: Hasher) -> Self {
    Self {
      backend,
      hasher,
      locks: KeyedMutex::new(),
    }
  }

  pub fn backend(&self) -> &Arc<dyn CacheBackend> {
    &self.backend
  }

  /// `package/name_cache_<change hash>`. Requires the change hash to be set.
  pub fn cache_path(&self, target: &Target) -> Result<String, CacheError> {
    let hash = target
      .change_hash()
      .ok_or_else(|| CacheError::InvalidKey(format!("{} has no change hash", target.label)))?;
    let dir = format!("{}{}{}", target.label.name, CACHE_PATH_INFIX, hash);
    if target.label.package.is_empty() {
      Ok(dir)
    } else {
      Ok(format!("{}/{}", target.label.package, dir))
    }
  }

  pub fn output_key(&self, output: &OutputRef) -> String {
    self.hasher.hash_str(&output.identifier).0
  }

  /// Serialize cache writes and loads of one target entry.
  pub async fn lock(&self, target: &Target) -> Result<KeyedGuard<String>, CacheError> {
    Ok(self.locks.lock(self.cache_path(target)?).await)
  }

  /// Whether every output and the sentinel are stored.
  pub async fn has_cache_hit(&self, ctx: &CancellationToken, target: &Target) -> Result<bool, CacheError> {
    let path = self.cache_path(target)?;

    if !self.backend.exists(ctx, &path, CACHE_EXISTS_KEY).await? {
      debug!(label = %target.label, path = %path, "no cache sentinel");
      return Ok(false);
    }

    for output in &target.outputs {
      if !self.backend.exists(ctx, &path, &self.output_key(output)).await? {
        warn!(label = %target.label, output = %output, "cache sentinel present but output missing");
        return Ok(false);
      }
    }
    Ok(true)
  }

  pub async fn get_output(
    &self,
    ctx: &CancellationToken,
    target: &Target,
    output: &OutputRef,
  ) -> Result<BoxReader, CacheError> {
    let path = self.cache_path(target)?;
    self.backend.get(ctx, &path, &self.output_key(output)).await
  }

  pub async fn set_output(
    &self,
    ctx: &CancellationToken,
    target: &Target,
    output: &OutputRef,
    reader: BoxReader,
  ) -> Result<(), CacheError> {
    let path = self.cache_path(target)?;
    self.backend.set(ctx, &path, &self.output_key(output), reader).await
  }

  pub async fn has_output(&self, ctx: &CancellationToken, target: &Target, output: &OutputRef) -> Result<bool, CacheError> {
    let path = self.cache_path(target)?;
    self.backend.exists(ctx, &path, &self.output_key(output)).await
  }

  /// Mark the target's entry complete. Call only after every output was set.
  ///
  /// `summary` is stored as the sentinel's content and returned by
  /// `read_commit` on later hits.
  pub async fn commit(&self, ctx: &CancellationToken, target: &Target, summary: &[u8]) -> Result<(), CacheError> {
    let path = self.cache_path(target)?;
    let reader: BoxReader = Box::new(std::io::Cursor::new(summary.to_vec()));
    self.backend.set(ctx, &path, CACHE_EXISTS_KEY, reader).await?;
    debug!(label = %target.label, path = %path, "committed cache entry");
    Ok(())
  }

  /// Content stored by `commit`.
  pub async fn read_commit(&self, ctx: &CancellationToken, target: &Target) -> Result<Vec<u8>, CacheError> {
    let path = self.cache_path(target)?;
    read_to_vec(self.backend.get(ctx, &path, CACHE_EXISTS_KEY).await?).await
  }

  /// Remove the sentinel and every output entry of the target.
  pub async fn clean(&self, ctx: &CancellationToken, target: &Target) -> Result<(), CacheError> {
    let path = self.cache_path(target)?;
    // Sentinel first, so a partial clean never leaves a hit behind.
    self.backend.delete(ctx, &path, CACHE_EXISTS_KEY).await?;
    for output in &target.outputs {
      self.backend.delete(ctx, &path, &self.output_key(output)).await?;
    }
    debug!(label = %target.label, path = %path, "cleaned cache entry");
    Ok(())
  }
}
