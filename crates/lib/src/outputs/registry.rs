//! Drives the output handlers for whole targets.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::TarGzArchiver;
use crate::cache::{CacheBackend, Cas, TargetCache};
use crate::config::EngineConfig;
use crate::model::{BuildNode, OutputKind, Target};
use crate::status::{SharedStatusSink, TargetStatus};
use crate::util::hash::Hasher;
use crate::worker::WorkerPool;

use super::{DirHandler, DockerClient, DockerHandler, FileHandler, OutputError, OutputHandler, OutputRecord, TargetResult};

pub struct Registry {
  cache: Arc<TargetCache>,
  handlers: HashMap<OutputKind, Arc<dyn OutputHandler>>,
  pool: WorkerPool,
  hasher: Hasher,
}

impl Registry {
  /// Handlers for file and directory outputs, plus docker outputs when a
  /// client is given and docker support is enabled.
  pub fn new(
    config: &EngineConfig,
    backend: Arc<dyn CacheBackend>,
    docker: Option<Arc<dyn DockerClient>>,
    sink: SharedStatusSink,
  ) -> Self {
    let hasher = config.hasher();
    let cache = Arc::new(TargetCache::new(backend.clone(), hasher));
    let cas = Arc::new(Cas::new(backend, hasher));

    let mut handlers: HashMap<OutputKind, Arc<dyn OutputHandler>> = HashMap::new();
    handlers.insert(
      OutputKind::File,
      Arc::new(FileHandler::new(cache.clone(), &config.workspace_root, hasher)),
    );
    handlers.insert(
      OutputKind::Dir,
      Arc::new(DirHandler::new(
        cache.clone(),
        Arc::new(TarGzArchiver),
        &config.workspace_root,
        hasher,
      )),
    );
    if let Some(client) = docker
      && config.docker.enabled
    {
      handlers.insert(
        OutputKind::Docker,
        Arc::new(DockerHandler::new(
          client,
          cache.clone(),
          cas,
          config.docker.mode,
          config.docker.registry.clone(),
          config.workspace_prefix(),
          hasher,
        )),
      );
    }

    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);

    Self {
      cache,
      handlers,
      pool: WorkerPool::new(cpus, sink),
      hasher,
    }
  }

  pub fn cache(&self) -> &Arc<TargetCache> {
    &self.cache
  }

  fn handler(&self, kind: OutputKind) -> Result<Arc<dyn OutputHandler>, OutputError> {
    self.handlers.get(&kind).cloned().ok_or(OutputError::NoHandler(kind))
  }

  /// Whether the target's cache entry is complete and every output can be
  /// restored.
  pub async fn has_cache_hit(&self, ctx: &CancellationToken, target: &Target) -> Result<bool, OutputError> {
    if !self.cache.has_cache_hit(ctx, target).await? {
      return Ok(false);
    }
    for output in &target.outputs {
      if !self.handler(output.kind)?.has(ctx, target, output).await? {
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// Store every output of a freshly built target, then commit the entry.
  ///
  /// Outputs are written concurrently on the registry's CPU-sized pool. The
  /// sentinel is written only after all of them succeeded.
  pub async fn write_outputs(
    &self,
    ctx: &CancellationToken,
    node: &Arc<BuildNode>,
    status: &TargetStatus,
  ) -> Result<TargetResult, OutputError> {
    let target = node
      .as_target()
      .ok_or_else(|| OutputError::NotATarget(node.label().clone()))?;
    let _guard = self.cache.lock(target).await?;

    let writes = target.outputs.iter().enumerate().map(|(index, output)| {
      let handler = self.handler(output.kind);
      let node = node.clone();
      let ctx = ctx.clone();
      let status = status.clone();
      async move {
        let handler = handler?;
        self
          .pool
          .run(move |_| async move {
            let Some(target) = node.as_target() else {
              return Err(OutputError::NotATarget(node.label().clone()));
            };
            handler.write(&ctx, target, &target.outputs[index], &status).await
          })
          .await?
      }
    });

    let mut records = join_all(writes).await.into_iter().collect::<Result<Vec<_>, _>>()?;
    records.sort_by(|a, b| a.output.cmp(&b.output));

    let change_hash = target.change_hash().unwrap_or_default().to_string();
    let result = TargetResult {
      label: target.label.clone(),
      change_hash,
      output_hash: self.aggregate_hash(&records),
      outputs: records,
    };

    let summary = serde_json::to_vec(&result)?;
    self.cache.commit(ctx, target, &summary).await?;
    target.set_output_hash(result.output_hash.clone());

    info!(label = %target.label, outputs = result.outputs.len(), output_hash = %result.output_hash, "wrote outputs");
    Ok(result)
  }

  /// The summary committed with the target's cache entry.
  pub async fn load_result(&self, ctx: &CancellationToken, target: &Target) -> Result<TargetResult, OutputError> {
    let bytes = self.cache.read_commit(ctx, target).await?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  /// Restore every output of a cache hit into the workspace.
  pub async fn load_outputs(
    &self,
    ctx: &CancellationToken,
    target: &Target,
    result: &TargetResult,
    status: &TargetStatus,
  ) -> Result<(), OutputError> {
    let _guard = self.cache.lock(target).await?;
    if target.outputs_loaded() {
      return Ok(());
    }

    for output in &target.outputs {
      let handler = self.handler(output.kind)?;
      handler.load(ctx, target, output, result.record(output), status).await?;
    }

    target.set_output_hash(result.output_hash.clone());
    target.set_outputs_loaded(true);
    debug!(label = %target.label, outputs = target.outputs.len(), "loaded outputs");
    Ok(())
  }

  /// Digest over records sorted by output, independent of write order.
  fn aggregate_hash(&self, records: &[OutputRecord]) -> String {
    let mut lines: Vec<String> = records.iter().map(|r| format!("{}:{}", r.output, r.digest)).collect();
    lines.sort_unstable();
    self.hasher.hash_str(&lines.join("\n")).0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::FsBackend;
  use crate::model::TargetLabel;
  use crate::outputs::docker::fake::FakeDocker;
  use crate::status::TracingStatusSink;
  use crate::util::testutil::{make_target_with_outputs, test_config, write_file};
  use tempfile::TempDir;

  fn registry(config: &EngineConfig, docker: Option<Arc<dyn DockerClient>>) -> Registry {
    let backend = Arc::new(FsBackend::new(config.workspace_cache_dir()));
    Registry::new(config, backend, docker, Arc::new(TracingStatusSink))
  }

  fn status(label: &str) -> TargetStatus {
    TargetStatus::new(Arc::new(TracingStatusSink), TargetLabel::parse(label).unwrap())
  }

  #[tokio::test]
  async fn write_commit_and_load_all_outputs() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let registry = registry(&config, None);
    let ctx = CancellationToken::new();
    let ws = &config.workspace_root;

    write_file(ws, "app/bin/app", "binary");
    write_file(ws, "app/assets/logo.svg", "<svg/>");
    let target = make_target_with_outputs("//app:app", "true", &["bin/app", "dir::assets"]);
    target.set_change_hash("c1".to_string());
    let node = Arc::new(BuildNode::Target(target));
    let target = node.as_target().unwrap();

    assert!(!registry.has_cache_hit(&ctx, target).await.unwrap());
    let result = registry.write_outputs(&ctx, &node, &status("//app:app")).await.unwrap();
    assert_eq!(result.outputs.len(), 2);
    assert_eq!(target.output_hash(), Some(result.output_hash.clone()));
    assert!(registry.has_cache_hit(&ctx, target).await.unwrap());

    std::fs::remove_dir_all(ws.join("app")).unwrap();

    let fresh = make_target_with_outputs("//app:app", "true", &["bin/app", "dir::assets"]);
    fresh.set_change_hash("c1".to_string());
    let loaded = registry.load_result(&ctx, &fresh).await.unwrap();
    assert_eq!(loaded, result);
    registry.load_outputs(&ctx, &fresh, &loaded, &status("//app:app")).await.unwrap();

    assert_eq!(std::fs::read_to_string(ws.join("app/bin/app")).unwrap(), "binary");
    assert_eq!(std::fs::read_to_string(ws.join("app/assets/logo.svg")).unwrap(), "<svg/>");
    assert!(fresh.outputs_loaded());
    assert_eq!(fresh.output_hash(), Some(result.output_hash));
  }

  #[tokio::test]
  async fn aggregate_hash_ignores_declaration_order() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let registry = registry(&config, None);
    let ctx = CancellationToken::new();
    write_file(&config.workspace_root, "p/a.txt", "a");
    write_file(&config.workspace_root, "p/b.txt", "b");

    let forward = make_target_with_outputs("//p:x", "true", &["a.txt", "b.txt"]);
    forward.set_change_hash("h1".to_string());
    let backward = make_target_with_outputs("//p:x", "true", &["b.txt", "a.txt"]);
    backward.set_change_hash("h2".to_string());

    let first = registry
      .write_outputs(&ctx, &Arc::new(BuildNode::Target(forward)), &status("//p:x"))
      .await
      .unwrap();
    let second = registry
      .write_outputs(&ctx, &Arc::new(BuildNode::Target(backward)), &status("//p:x"))
      .await
      .unwrap();
    assert_eq!(first.output_hash, second.output_hash);
  }

  #[tokio::test]
  async fn missing_output_fails_and_leaves_no_hit() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let registry = registry(&config, None);
    let ctx = CancellationToken::new();
    write_file(&config.workspace_root, "p/present.txt", "x");

    let target = make_target_with_outputs("//p:t", "true", &["present.txt", "absent.txt"]);
    target.set_change_hash("h".to_string());
    let node = Arc::new(BuildNode::Target(target));

    let err = registry.write_outputs(&ctx, &node, &status("//p:t")).await.unwrap_err();
    assert!(matches!(err, OutputError::MissingOutput { .. }));
    assert!(!registry.has_cache_hit(&ctx, node.as_target().unwrap()).await.unwrap());
  }

  #[tokio::test]
  async fn docker_outputs_need_a_client() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let ctx = CancellationToken::new();
    let target = make_target_with_outputs("//p:img", "true", &["docker::img:dev"]);
    target.set_change_hash("h".to_string());
    let node = Arc::new(BuildNode::Target(target));

    let without = registry(&config, None);
    let err = without.write_outputs(&ctx, &node, &status("//p:img")).await.unwrap_err();
    assert!(matches!(err, OutputError::NoHandler(OutputKind::Docker)));

    let client: Arc<dyn DockerClient> = Arc::new(FakeDocker::with_image("img:dev", "sha256:1"));
    let with = registry(&config, Some(client));
    with.write_outputs(&ctx, &node, &status("//p:img")).await.unwrap();
    assert!(with.has_cache_hit(&ctx, node.as_target().unwrap()).await.unwrap());
  }
}
