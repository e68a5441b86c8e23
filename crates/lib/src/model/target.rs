//! Targets, aliases and their per-run execution state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::platform::Platform;

use super::label::TargetLabel;
use super::output::OutputRef;

/// Restricts a target to matching host platforms.
///
/// An empty list matches any value for that field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSelector {
  #[serde(default)]
  pub os: Vec<String>,
  #[serde(default)]
  pub arch: Vec<String>,
}

impl PlatformSelector {
  pub fn matches(&self, platform: &Platform) -> bool {
    let os_ok = self.os.is_empty() || self.os.iter().any(|os| platform.os.matches_name(os));
    let arch_ok = self.arch.is_empty() || self.arch.iter().any(|arch| platform.arch.matches_name(arch));
    os_ok && arch_ok
  }
}

/// Values filled in while a target is being executed.
///
/// Only the engine task assigned to a target writes these; everything else
/// reads them after that task has completed.
#[derive(Debug, Default)]
pub struct TargetState {
  change_hash: OnceLock<String>,
  has_cache_hit: AtomicBool,
  output_hash: Mutex<Option<String>>,
  outputs_loaded: AtomicBool,
}

/// A unit of build work.
#[derive(Debug)]
pub struct Target {
  pub label: TargetLabel,
  pub command: String,
  /// Package-relative input files, already glob-resolved.
  pub inputs: Vec<String>,
  pub outputs: Vec<OutputRef>,
  pub deps: Vec<TargetLabel>,
  /// Free-form tags. Never part of the change hash.
  pub tags: Vec<String>,
  pub platform: Option<PlatformSelector>,
  pub timeout: Option<Duration>,
  pub env: BTreeMap<String, String>,
  /// Extra cache-busting key/value pairs.
  pub fingerprint: BTreeMap<String, String>,
  /// When true the host platform is left out of the change hash, so the cache
  /// entry is shared across platforms.
  pub multiplatform_cache: bool,
  state: TargetState,
}

impl Target {
  pub fn new(label: TargetLabel, command: impl Into<String>) -> Self {
    Self {
      label,
      command: command.into(),
      inputs: Vec::new(),
      outputs: Vec::new(),
      deps: Vec::new(),
      tags: Vec::new(),
      platform: None,
      timeout: None,
      env: BTreeMap::new(),
      fingerprint: BTreeMap::new(),
      multiplatform_cache: false,
      state: TargetState::default(),
    }
  }

  /// Absolute path of the target's package directory.
  pub fn package_path(&self, workspace_root: &Path) -> PathBuf {
    if self.label.package.is_empty() {
      workspace_root.to_path_buf()
    } else {
      workspace_root.join(&self.label.package)
    }
  }

  /// Absolute path of a package-relative file.
  pub fn resolve_path(&self, workspace_root: &Path, relative: &str) -> PathBuf {
    self.package_path(workspace_root).join(relative)
  }

  pub fn matches_platform(&self, platform: &Platform) -> bool {
    self.platform.as_ref().is_none_or(|selector| selector.matches(platform))
  }

  pub fn change_hash(&self) -> Option<&str> {
    self.state.change_hash.get().map(String::as_str)
  }

  /// Record the change hash. Returns false if one was already set.
  pub fn set_change_hash(&self, hash: String) -> bool {
    self.state.change_hash.set(hash).is_ok()
  }

  pub fn has_cache_hit(&self) -> bool {
    self.state.has_cache_hit.load(Ordering::Acquire)
  }

  pub fn set_has_cache_hit(&self, hit: bool) {
    self.state.has_cache_hit.store(hit, Ordering::Release);
  }

  pub fn output_hash(&self) -> Option<String> {
    self.state.output_hash.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  pub fn set_output_hash(&self, hash: String) {
    *self.state.output_hash.lock().unwrap_or_else(|e| e.into_inner()) = Some(hash);
  }

  pub fn outputs_loaded(&self) -> bool {
    self.state.outputs_loaded.load(Ordering::Acquire)
  }

  pub fn set_outputs_loaded(&self, loaded: bool) {
    self.state.outputs_loaded.store(loaded, Ordering::Release);
  }
}

/// A named pointer to another target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
  pub label: TargetLabel,
  pub actual: TargetLabel,
}

/// A vertex of the build graph.
#[derive(Debug)]
pub enum BuildNode {
  Target(Target),
  Alias(Alias),
}

impl BuildNode {
  pub fn label(&self) -> &TargetLabel {
    match self {
      Self::Target(target) => &target.label,
      Self::Alias(alias) => &alias.label,
    }
  }

  /// Labels this node depends on.
  pub fn deps(&self) -> Vec<TargetLabel> {
    match self {
      Self::Target(target) => target.deps.clone(),
      Self::Alias(alias) => vec![alias.actual.clone()],
    }
  }

  pub fn as_target(&self) -> Option<&Target> {
    match self {
      Self::Target(target) => Some(target),
      Self::Alias(_) => None,
    }
  }
}

impl From<Target> for BuildNode {
  fn from(target: Target) -> Self {
    Self::Target(target)
  }
}

impl From<Alias> for BuildNode {
  fn from(alias: Alias) -> Self {
    Self::Alias(alias)
  }
}
