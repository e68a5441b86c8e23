//! Engine configuration.
//!
//! `EngineConfig` is built once by the host and passed to every component that
//! needs it (graph execution, change hashing, cache, output registry). Nothing
//! in the engine reads configuration from global state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::WORKSPACE_PREFIX_LEN;
use crate::platform::paths::cache_dir;
use crate::util::hash::{HashAlgorithm, Hasher};

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid value for {var}: {message}")]
  InvalidEnv { var: &'static str, message: String },
}

/// Which outputs are restored from the cache on a hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadOutputsMode {
  /// Restore outputs of every cache hit.
  #[default]
  All,
  /// Restore outputs of a cache hit only when a dependent has to run.
  Minimal,
}

/// How docker image outputs are stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DockerMode {
  /// `docker save` tarballs in the content-addressable store.
  #[default]
  Tarball,
  /// Images pushed to and pulled from an OCI registry.
  Registry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
  pub enabled: bool,
  pub mode: DockerMode,
  /// Registry host and optional path, e.g. `registry.example.com/builds`.
  pub registry: Option<String>,
}

impl Default for DockerConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      mode: DockerMode::Tarball,
      registry: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCacheConfig {
  /// Base URL of an HTTP cache server.
  pub url: String,
}

/// Configuration for a build run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub workspace_root: PathBuf,
  pub cache_root: PathBuf,

  /// Maximum number of targets executing at once.
  pub num_workers: usize,

  /// Stop scheduling everything after the first failure.
  pub fail_fast: bool,

  pub enable_cache: bool,
  pub load_outputs: LoadOutputsMode,
  pub hash_algorithm: HashAlgorithm,

  /// Shell used for target commands. Defaults to `/bin/sh`.
  pub shell: Option<String>,

  /// Applied to targets that do not declare their own timeout.
  pub default_timeout_secs: Option<u64>,

  pub docker: DockerConfig,
  pub remote_cache: Option<RemoteCacheConfig>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      workspace_root: PathBuf::from("."),
      cache_root: cache_dir(),
      num_workers: num_cpus(),
      fail_fast: false,
      enable_cache: true,
      load_outputs: LoadOutputsMode::All,
      hash_algorithm: HashAlgorithm::default(),
      shell: None,
      default_timeout_secs: None,
      docker: DockerConfig::default(),
      remote_cache: None,
    }
  }
}

impl EngineConfig {
  pub fn new(workspace_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
    Self {
      workspace_root: workspace_root.into(),
      cache_root: cache_root.into(),
      ..Self::default()
    }
  }

  /// Defaults for `workspace_root`, overridden by `GROG_*` environment variables.
  pub fn from_env(workspace_root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
    let mut config = Self {
      workspace_root: workspace_root.into(),
      ..Self::default()
    };

    if let Ok(value) = std::env::var("GROG_NUM_WORKERS") {
      config.num_workers = value
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ConfigError::InvalidEnv {
          var: "GROG_NUM_WORKERS",
          message: format!("expected a positive integer, got '{value}'"),
        })?;
    }

    if let Ok(value) = std::env::var("GROG_FAIL_FAST") {
      config.fail_fast = parse_bool("GROG_FAIL_FAST", &value)?;
    }

    if let Ok(value) = std::env::var("GROG_ENABLE_CACHE") {
      config.enable_cache = parse_bool("GROG_ENABLE_CACHE", &value)?;
    }

    if let Ok(value) = std::env::var("GROG_HASH_ALGORITHM") {
      config.hash_algorithm = value.parse().map_err(|message| ConfigError::InvalidEnv {
        var: "GROG_HASH_ALGORITHM",
        message,
      })?;
    }

    if let Ok(url) = std::env::var("GROG_REMOTE_CACHE_URL")
      && !url.is_empty()
    {
      config.remote_cache = Some(RemoteCacheConfig { url });
    }

    Ok(config)
  }

  pub fn hasher(&self) -> Hasher {
    Hasher::new(self.hash_algorithm)
  }

  pub fn default_timeout(&self) -> Option<Duration> {
    self.default_timeout_secs.map(Duration::from_secs)
  }

  /// Short digest of the workspace root, used to keep caches of different
  /// checkouts apart.
  pub fn workspace_prefix(&self) -> String {
    let root = canonical_or_self(&self.workspace_root);
    let digest = self.hasher().hash_str(&root.to_string_lossy());
    digest.0[..WORKSPACE_PREFIX_LEN.min(digest.0.len())].to_string()
  }

  /// Directory holding this workspace's local cache.
  pub fn workspace_cache_dir(&self) -> PathBuf {
    self.cache_root.join(self.workspace_prefix())
  }
}

fn canonical_or_self(path: &Path) -> PathBuf {
  dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
  match value.to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" => Ok(false),
    _ => Err(ConfigError::InvalidEnv {
      var,
      message: format!("expected a boolean, got '{value}'"),
    }),
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
