use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache entry not found: {path}/{key}")]
  NotFound { path: String, key: String },

  #[error("invalid cache location {0:?}")]
  InvalidKey(String),

  #[error("cache I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("cache stream error: {0}")]
  Stream(#[source] std::io::Error),

  #[error("remote cache request {method} {url} failed: {message}")]
  Http {
    method: &'static str,
    url: String,
    message: String,
  },

  #[error("local cache: {local}; remote cache: {remote}")]
  Combined {
    local: Box<CacheError>,
    remote: Box<CacheError>,
  },

  #[error("cache operation cancelled")]
  Cancelled,
}

impl CacheError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, CacheError::NotFound { .. })
  }

  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    CacheError::Io {
      path: path.into(),
      source,
    }
  }

  /// Merge the results of an operation run against two backends.
  pub(crate) fn combine(local: Result<(), CacheError>, remote: Result<(), CacheError>) -> Result<(), CacheError> {
    match (local, remote) {
      (Ok(()), Ok(())) => Ok(()),
      (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
      (Err(local), Err(remote)) => Err(CacheError::Combined {
        local: Box::new(local),
        remote: Box::new(remote),
      }),
    }
  }
}
