use std::path::PathBuf;

use crate::consts::APP_NAME;

fn env_path(var: &str) -> Option<PathBuf> {
  std::env::var_os(var).filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Per-user directory that holds application caches.
#[cfg(windows)]
fn user_cache_home() -> Option<PathBuf> {
  env_path("LOCALAPPDATA")
}

/// Per-user directory that holds application caches.
#[cfg(not(windows))]
fn user_cache_home() -> Option<PathBuf> {
  env_path("XDG_CACHE_HOME").or_else(|| env_path("HOME").map(|home| home.join(".cache")))
}

/// Root of the local build cache.
///
/// Resolution order: `GROG_CACHE_DIR`, the per-user cache home joined with
/// `grog`, then the system temp directory.
pub fn cache_dir() -> PathBuf {
  if let Some(dir) = env_path("GROG_CACHE_DIR") {
    return dir;
  }
  user_cache_home()
    .unwrap_or_else(std::env::temp_dir)
    .join(APP_NAME)
}
