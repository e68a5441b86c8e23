//! Build cache.
//!
//! Storage is split in two layers. A `CacheBackend` stores opaque blobs under
//! `(path, key)` pairs: the local filesystem, an HTTP server, or a
//! local-first wrapper around both. On top of a backend, `TargetCache` maps a
//! target's outputs to entries under its change hash, and `Cas` stores blobs
//! keyed by their own content digest.

pub mod backend;
pub mod cas;
pub mod http;
pub mod local;
pub mod remote;
pub mod target_cache;
pub mod types;

use std::sync::Arc;

use crate::config::EngineConfig;

pub use backend::{BoxReader, CacheBackend, empty_reader, read_to_vec};
pub use cas::Cas;
pub use http::HttpBackend;
pub use local::FsBackend;
pub use remote::RemoteWrapper;
pub use target_cache::TargetCache;
pub use types::CacheError;

/// Backend for `config`: local filesystem, wrapped with the remote cache when
/// one is configured.
pub fn backend_from_config(config: &EngineConfig) -> Result<Arc<dyn CacheBackend>, CacheError> {
  let local: Arc<dyn CacheBackend> = Arc::new(FsBackend::new(config.workspace_cache_dir()));

  match &config.remote_cache {
    Some(remote) => {
      let http = HttpBackend::new(&remote.url, config.workspace_prefix())?;
      Ok(Arc::new(RemoteWrapper::new(local, Arc::new(http))))
    }
    None => Ok(local),
  }
}
