//! Shared helpers for engine integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use grog_lib::cache::{BoxReader, CacheBackend, CacheError, FsBackend};
use grog_lib::config::EngineConfig;
use grog_lib::execute::{BuildReport, ExecuteError, Executor};
use grog_lib::graph::Graph;
use grog_lib::model::{BuildNode, OutputRef, Target, TargetLabel};
use grog_lib::status::{SharedStatusSink, TracingStatusSink};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Isolated workspace plus local cache directory.
pub struct TestWorkspace {
  pub temp: TempDir,
  pub config: EngineConfig,
}

impl TestWorkspace {
  pub fn new() -> Self {
    let temp = TempDir::new().expect("failed to create temp dir");
    let root = temp.path().join("workspace");
    let cache = temp.path().join("cache");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::create_dir_all(&cache).unwrap();

    let mut config = EngineConfig::new(root, cache);
    config.num_workers = 4;
    config.docker.enabled = false;
    Self { temp, config }
  }

  pub fn root(&self) -> &Path {
    &self.config.workspace_root
  }

  pub fn path(&self, relative: &str) -> PathBuf {
    self.root().join(relative)
  }

  pub fn write(&self, relative: &str, content: &str) {
    let path = self.path(relative);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
  }

  pub fn mkdir(&self, relative: &str) {
    std::fs::create_dir_all(self.path(relative)).unwrap();
  }

  pub fn read(&self, relative: &str) -> String {
    std::fs::read_to_string(self.path(relative)).unwrap_or_else(|e| panic!("failed to read {relative}: {e}"))
  }

  pub fn exists(&self, relative: &str) -> bool {
    self.path(relative).exists()
  }

  pub fn remove(&self, relative: &str) {
    let path = self.path(relative);
    if path.is_dir() {
      std::fs::remove_dir_all(path).unwrap();
    } else {
      std::fs::remove_file(path).unwrap();
    }
  }

  /// Local filesystem backend under this workspace's cache directory.
  pub fn local_backend(&self) -> Arc<dyn CacheBackend> {
    Arc::new(FsBackend::new(self.config.workspace_cache_dir()))
  }

  /// Build `nodes` once with the local backend.
  pub async fn build(&self, nodes: Vec<BuildNode>) -> Result<BuildReport, ExecuteError> {
    self.build_with(nodes, self.local_backend(), CancellationToken::new()).await
  }

  pub async fn build_with(
    &self,
    nodes: Vec<BuildNode>,
    backend: Arc<dyn CacheBackend>,
    ctx: CancellationToken,
  ) -> Result<BuildReport, ExecuteError> {
    let graph = Arc::new(Graph::from_nodes(nodes).expect("invalid test graph"));
    let sink: SharedStatusSink = Arc::new(TracingStatusSink);
    let executor = Arc::new(Executor::new(Arc::new(self.config.clone()), graph, backend, None, sink));
    executor.run(ctx).await
  }
}

pub fn label(s: &str) -> TargetLabel {
  TargetLabel::parse(s).unwrap()
}

/// A target with the given command and dependencies.
pub fn target(name: &str, command: &str, deps: &[&str]) -> Target {
  let mut target = Target::new(label(name), command);
  target.deps = deps.iter().map(|d| label(d)).collect();
  target
}

/// A target that declares inputs and outputs.
pub fn target_with_io(name: &str, command: &str, deps: &[&str], inputs: &[&str], outputs: &[&str]) -> Target {
  let mut target = target(name, command, deps);
  target.inputs = inputs.iter().map(|i| i.to_string()).collect();
  target.outputs = outputs.iter().map(|o| OutputRef::parse(o).unwrap()).collect();
  target
}

pub fn nodes(targets: impl IntoIterator<Item = Target>) -> Vec<BuildNode> {
  targets.into_iter().map(BuildNode::from).collect()
}

/// Delegates to `inner` and records how many `exists` calls overlap.
pub struct OverlapBackend {
  inner: Arc<dyn CacheBackend>,
  in_flight: AtomicUsize,
  pub peak: AtomicUsize,
}

impl OverlapBackend {
  pub fn new(inner: Arc<dyn CacheBackend>) -> Self {
    Self {
      inner,
      in_flight: AtomicUsize::new(0),
      peak: AtomicUsize::new(0),
    }
  }
}

#[async_trait]
impl CacheBackend for OverlapBackend {
  async fn get(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<BoxReader, CacheError> {
    self.inner.get(ctx, path, key).await
  }

  async fn set(&self, ctx: &CancellationToken, path: &str, key: &str, reader: BoxReader) -> Result<(), CacheError> {
    self.inner.set(ctx, path, key, reader).await
  }

  async fn delete(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<(), CacheError> {
    self.inner.delete(ctx, path, key).await
  }

  async fn exists(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<bool, CacheError> {
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let result = self.inner.exists(ctx, path, key).await;
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    result
  }

  fn name(&self) -> &'static str {
    "overlap"
  }
}
