//! Test utilities for grog-lib.

use std::path::Path;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::model::{OutputRef, Target, TargetLabel};

/// Build a target with the given label, command and dependency labels.
pub fn make_target(label: &str, command: &str, deps: &[&str]) -> Target {
  let mut target = Target::new(TargetLabel::parse(label).unwrap(), command);
  target.deps = deps.iter().map(|d| TargetLabel::parse(d).unwrap()).collect();
  target
}

/// Build a target declaring file outputs.
pub fn make_target_with_outputs(label: &str, command: &str, outputs: &[&str]) -> Target {
  let mut target = make_target(label, command, &[]);
  target.outputs = outputs.iter().map(|o| OutputRef::parse(o).unwrap()).collect();
  target
}

/// Engine config rooted in a temporary workspace and cache.
pub fn test_config(root: &Path) -> Arc<EngineConfig> {
  let workspace = root.join("workspace");
  let cache = root.join("cache");
  std::fs::create_dir_all(&workspace).unwrap();
  std::fs::create_dir_all(&cache).unwrap();

  Arc::new(EngineConfig {
    num_workers: 4,
    ..EngineConfig::new(workspace, cache)
  })
}

/// Write a file relative to `root`, creating parent directories.
pub fn write_file(root: &Path, relative: &str, content: &str) {
  let path = root.join(relative);
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).unwrap();
  }
  std::fs::write(path, content).unwrap();
}
