//! Change hashes.
//!
//! A target's change hash captures everything that should invalidate its
//! cached outputs. It has two parts joined by `_`:
//!
//! - a definition hash over the serialized target definition (label, command,
//!   sorted inputs, outputs, dependency change hashes, fingerprint and the
//!   host platform unless the target shares its cache across platforms).
//!   Env overrides are left out; put them in the fingerprint to bust on them
//! - a content hash over the target's input files, present only when the
//!   target declares inputs
//!
//! Dependencies are hashed first, so a change anywhere upstream propagates to
//! every dependent.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::consts::CHANGE_HASH_SEPARATOR;
use crate::graph::Graph;
use crate::model::{BuildNode, Target, TargetLabel};
use crate::platform::Platform;
use crate::util::hash::{ContentHash, DirHashError, Hasher};
use crate::util::keyed_mutex::KeyedMutex;

#[derive(Debug, Error)]
pub enum ChangeHashError {
  #[error("target not found in graph: {0}")]
  UnknownTarget(TargetLabel),

  #[error("failed to hash input {path} of {label}: {source}")]
  Input {
    label: TargetLabel,
    path: String,
    #[source]
    source: DirHashError,
  },

  #[error("failed to serialize target definition: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("input hashing task failed: {0}")]
  Join(String),
}

#[derive(Serialize)]
struct DefinitionHashInput<'a> {
  label: String,
  command: &'a str,
  inputs: Vec<&'a str>,
  outputs: Vec<String>,
  dependencies: Vec<&'a str>,
  fingerprint: &'a BTreeMap<String, String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  platform: Option<String>,
}

/// Computes and records change hashes for the targets of one graph.
pub struct ChangeHashEngine {
  graph: Arc<Graph>,
  config: Arc<EngineConfig>,
  hasher: Hasher,
  platform: Platform,
  locks: KeyedMutex<TargetLabel>,
}

impl ChangeHashEngine {
  pub fn new(graph: Arc<Graph>, config: Arc<EngineConfig>) -> Self {
    Self::with_platform(graph, config, Platform::host())
  }

  pub fn with_platform(graph: Arc<Graph>, config: Arc<EngineConfig>, platform: Platform) -> Self {
    Self {
      graph,
      hasher: config.hasher(),
      config,
      platform,
      locks: KeyedMutex::new(),
    }
  }

  /// Definition hash of `target` given its dependencies' change hashes.
  ///
  /// Pure: list order never matters and fields like tags are ignored.
  pub fn get_target_change_hash(
    &self,
    target: &Target,
    dependency_hashes: &[String],
  ) -> Result<ContentHash, ChangeHashError> {
    let mut inputs: Vec<&str> = target.inputs.iter().map(String::as_str).collect();
    inputs.sort_unstable();
    inputs.dedup();

    let mut outputs: Vec<String> = target.outputs.iter().map(|o| o.to_string()).collect();
    outputs.sort_unstable();

    let mut dependencies: Vec<&str> = dependency_hashes.iter().map(String::as_str).collect();
    dependencies.sort_unstable();

    let platform = (!target.multiplatform_cache).then(|| self.platform.cache_key());

    let input = DefinitionHashInput {
      label: target.label.to_string(),
      command: &target.command,
      inputs,
      outputs,
      dependencies,
      fingerprint: &target.fingerprint,
      platform,
    };

    let serialized = serde_json::to_vec(&input)?;
    Ok(self.hasher.hash_bytes(&serialized))
  }

  /// Compute and store the change hash of `label`, hashing dependencies first.
  ///
  /// Concurrent calls for the same label serialize on a per-label lock, and a
  /// hash that is already set is never recomputed.
  pub fn set_target_change_hash<'a>(
    &'a self,
    label: &'a TargetLabel,
  ) -> BoxFuture<'a, Result<String, ChangeHashError>> {
    Box::pin(async move {
      let node = self
        .graph
        .get_vertex(label)
        .ok_or_else(|| ChangeHashError::UnknownTarget(label.clone()))?;

      let target = match node.as_ref() {
        BuildNode::Target(target) => target,
        BuildNode::Alias(alias) => return self.set_target_change_hash(&alias.actual).await,
      };

      let _guard = self.locks.lock(label.clone()).await;
      if let Some(hash) = target.change_hash() {
        return Ok(hash.to_string());
      }

      let mut dependency_hashes = Vec::with_capacity(target.deps.len());
      for dep in &target.deps {
        dependency_hashes.push(self.set_target_change_hash(dep).await?);
      }

      let definition = self.get_target_change_hash(target, &dependency_hashes)?;
      let hash = match self.hash_inputs(target).await? {
        Some(inputs) => format!("{}{}{}", definition, CHANGE_HASH_SEPARATOR, inputs),
        None => definition.0,
      };

      debug!(label = %label, hash = %hash, "computed change hash");
      target.set_change_hash(hash.clone());
      Ok(hash)
    })
  }

  /// The change hash of any vertex, following aliases to their target.
  pub fn change_hash_of(&self, label: &TargetLabel) -> Option<String> {
    let mut current = label.clone();
    // Alias chains are acyclic because the graph is.
    loop {
      match self.graph.get_vertex(&current)?.as_ref() {
        BuildNode::Target(target) => return target.change_hash().map(str::to_string),
        BuildNode::Alias(alias) => current = alias.actual.clone(),
      }
    }
  }

  async fn hash_inputs(&self, target: &Target) -> Result<Option<ContentHash>, ChangeHashError> {
    if target.inputs.is_empty() {
      return Ok(None);
    }

    let mut inputs = target.inputs.clone();
    inputs.sort_unstable();
    inputs.dedup();

    let package_dir = target.package_path(&self.config.workspace_root);
    let hasher = self.hasher;
    let label = target.label.clone();

    let digest = tokio::task::spawn_blocking(move || -> Result<ContentHash, ChangeHashError> {
      let mut entries = Vec::with_capacity(inputs.len());
      for input in inputs {
        let path = package_dir.join(&input);
        let metadata = match std::fs::metadata(&path) {
          Ok(m) => m,
          Err(_) => {
            warn!(label = %label, input = %input, "input does not exist, skipping");
            continue;
          }
        };

        let hash = if metadata.is_dir() {
          hasher.hash_directory(&path)
        } else {
          hasher.hash_file(&path)
        }
        .map_err(|source| ChangeHashError::Input {
          label: label.clone(),
          path: input.clone(),
          source,
        })?;
        entries.push(format!("{}:{}", input, hash));
      }
      Ok(hasher.hash_str(&entries.join("\n")))
    })
    .await
    .map_err(|e| ChangeHashError::Join(e.to_string()))??;

    Ok(Some(digest))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Alias, OutputRef};
  use crate::platform::{arch::Arch, os::Os};
  use crate::util::testutil::{make_target, test_config, write_file};
  use tempfile::TempDir;

  fn engine(root: &TempDir, nodes: Vec<BuildNode>) -> ChangeHashEngine {
    let graph = Arc::new(Graph::from_nodes(nodes).unwrap());
    ChangeHashEngine::with_platform(graph, test_config(root.path()), Platform::new(Arch::Amd64, Os::Linux))
  }

  fn base() -> Target {
    let mut target = make_target("//app:bin", "cc -o out main.c", &[]);
    target.inputs = vec!["main.c".into(), "util.c".into()];
    target.outputs = vec![OutputRef::file("out"), OutputRef::dir("gen")];
    target.fingerprint = BTreeMap::from([("cc".into(), "13".into())]);
    target
  }

  #[test]
  fn list_order_does_not_matter() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp, vec![]);

    let a = base();
    let mut b = base();
    b.inputs.reverse();
    b.outputs.reverse();

    let deps_a = vec!["h1".to_string(), "h2".to_string()];
    let deps_b = vec!["h2".to_string(), "h1".to_string()];

    assert_eq!(
      engine.get_target_change_hash(&a, &deps_a).unwrap(),
      engine.get_target_change_hash(&b, &deps_b).unwrap()
    );
  }

  #[test]
  fn every_relevant_field_changes_the_hash() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp, vec![]);
    let deps = vec!["h1".to_string()];
    let original = engine.get_target_change_hash(&base(), &deps).unwrap();

    let mutations: Vec<Box<dyn Fn(&mut Target)>> = vec![
      Box::new(|t: &mut Target| t.command.push_str(" -O2")),
      Box::new(|t: &mut Target| t.inputs.push("extra.c".into())),
      Box::new(|t: &mut Target| t.outputs.push(OutputRef::file("out2"))),
      Box::new(|t: &mut Target| {
        t.fingerprint.insert("cc".into(), "14".into());
      }),
      Box::new(|t: &mut Target| t.label = TargetLabel::new("app", "other")),
      Box::new(|t: &mut Target| t.multiplatform_cache = true),
    ];

    for mutate in mutations {
      let mut target = base();
      mutate(&mut target);
      assert_ne!(engine.get_target_change_hash(&target, &deps).unwrap(), original);
    }

    let other_deps = vec!["h9".to_string()];
    assert_ne!(engine.get_target_change_hash(&base(), &other_deps).unwrap(), original);
  }

  #[test]
  fn tags_and_timeout_are_ignored() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp, vec![]);
    let original = engine.get_target_change_hash(&base(), &[]).unwrap();

    let mut target = base();
    target.tags = vec!["no-cache".into()];
    target.timeout = Some(std::time::Duration::from_secs(3));
    assert_eq!(engine.get_target_change_hash(&target, &[]).unwrap(), original);
  }

  #[test]
  fn env_overrides_are_ignored() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp, vec![]);
    let original = engine.get_target_change_hash(&base(), &[]).unwrap();

    let mut target = base();
    target.env.insert("FOO".into(), "bar".into());
    assert_eq!(engine.get_target_change_hash(&target, &[]).unwrap(), original);

    target.fingerprint.insert("FOO".into(), "bar".into());
    assert_ne!(engine.get_target_change_hash(&target, &[]).unwrap(), original);
  }

  #[test]
  fn platform_is_excluded_for_multiplatform_cache() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let graph = Arc::new(Graph::new());
    let linux = ChangeHashEngine::with_platform(graph.clone(), config.clone(), Platform::new(Arch::Amd64, Os::Linux));
    let mac = ChangeHashEngine::with_platform(graph, config, Platform::new(Arch::Arm64, Os::Darwin));

    let mut target = base();
    assert_ne!(
      linux.get_target_change_hash(&target, &[]).unwrap(),
      mac.get_target_change_hash(&target, &[]).unwrap()
    );

    target.multiplatform_cache = true;
    assert_eq!(
      linux.get_target_change_hash(&target, &[]).unwrap(),
      mac.get_target_change_hash(&target, &[]).unwrap()
    );
  }

  #[tokio::test]
  async fn input_content_and_dependencies_propagate() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write_file(&config.workspace_root, "lib/a.txt", "one");

    let build = |content: &str| {
      write_file(&config.workspace_root, "lib/a.txt", content);
      let mut lib = make_target("//lib:lib", "true", &[]);
      lib.inputs = vec!["a.txt".into(), "missing.txt".into()];
      let app = make_target("//app:app", "true", &["//lib:lib"]);
      let graph = Arc::new(Graph::from_nodes(vec![BuildNode::Target(lib), BuildNode::Target(app)]).unwrap());
      ChangeHashEngine::new(graph, config.clone())
    };

    let first = build("one");
    let lib_one = first.set_target_change_hash(&TargetLabel::new("lib", "lib")).await.unwrap();
    let app_one = first.set_target_change_hash(&TargetLabel::new("app", "app")).await.unwrap();
    assert!(lib_one.contains(CHANGE_HASH_SEPARATOR));
    assert!(!app_one.contains(CHANGE_HASH_SEPARATOR));

    let second = build("two");
    let app_two = second.set_target_change_hash(&TargetLabel::new("app", "app")).await.unwrap();
    assert_ne!(app_one, app_two);
    // Dependency was hashed on the way.
    assert!(second.change_hash_of(&TargetLabel::new("lib", "lib")).is_some());
  }

  #[tokio::test]
  async fn set_is_idempotent_under_concurrency() {
    let tmp = TempDir::new().unwrap();
    let target = make_target("//p:t", "echo hi", &[]);
    let engine = Arc::new(engine(&tmp, vec![BuildNode::Target(target)]));
    let label = TargetLabel::new("p", "t");

    let mut handles = Vec::new();
    for _ in 0..8 {
      let engine = engine.clone();
      let label = label.clone();
      handles.push(tokio::spawn(async move { engine.set_target_change_hash(&label).await.unwrap() }));
    }
    let mut hashes = Vec::new();
    for handle in handles {
      hashes.push(handle.await.unwrap());
    }
    hashes.dedup();
    assert_eq!(hashes.len(), 1);
  }

  #[tokio::test]
  async fn alias_shares_actual_change_hash() {
    let tmp = TempDir::new().unwrap();
    let target = make_target("//p:real", "true", &[]);
    let alias = Alias {
      label: TargetLabel::new("p", "alias"),
      actual: TargetLabel::new("p", "real"),
    };
    let engine = engine(&tmp, vec![BuildNode::Target(target), BuildNode::Alias(alias)]);

    let via_alias = engine.set_target_change_hash(&TargetLabel::new("p", "alias")).await.unwrap();
    assert_eq!(engine.change_hash_of(&TargetLabel::new("p", "real")), Some(via_alias.clone()));
    assert_eq!(engine.change_hash_of(&TargetLabel::new("p", "alias")), Some(via_alias));
  }

  #[tokio::test]
  async fn unknown_target_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp, vec![]);
    let err = engine.set_target_change_hash(&TargetLabel::new("x", "y")).await.unwrap_err();
    assert!(matches!(err, ChangeHashError::UnknownTarget(_)));
  }
}
