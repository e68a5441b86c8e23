//! Per-target build logic, run once for every vertex of the walk.
//!
//! For a target this means: skip it on a foreign platform, compute its change
//! hash, try the cache when every dependency was itself a hit, and otherwise
//! run the command and store its outputs. The whole visit runs as one job on
//! the bounded worker pool, so hashing and cache I/O are capped as well.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheBackend;
use crate::change_hash::ChangeHashEngine;
use crate::config::{EngineConfig, LoadOutputsMode};
use crate::graph::{CacheResult, Graph, WalkOutcome, Walker};
use crate::model::{BuildNode, OutputKind, Target, TargetLabel};
use crate::outputs::{DockerClient, OutputError, Registry};
use crate::platform::Platform;
use crate::status::{SharedStatusSink, TargetStatus};
use crate::worker::WorkerPool;

use super::cmd::run_command;
use super::report::BuildReport;
use super::types::ExecuteError;

pub struct Executor {
  config: Arc<EngineConfig>,
  graph: Arc<Graph>,
  change_hashes: ChangeHashEngine,
  registry: Registry,
  pool: WorkerPool,
  sink: SharedStatusSink,
  platform: Platform,
}

impl Executor {
  /// Must be called from within a tokio runtime: the worker pools start
  /// immediately.
  pub fn new(
    config: Arc<EngineConfig>,
    graph: Arc<Graph>,
    backend: Arc<dyn CacheBackend>,
    docker: Option<Arc<dyn DockerClient>>,
    sink: SharedStatusSink,
  ) -> Self {
    Self::with_platform(config, graph, backend, docker, sink, Platform::host())
  }

  pub fn with_platform(
    config: Arc<EngineConfig>,
    graph: Arc<Graph>,
    backend: Arc<dyn CacheBackend>,
    docker: Option<Arc<dyn DockerClient>>,
    sink: SharedStatusSink,
    platform: Platform,
  ) -> Self {
    Self {
      change_hashes: ChangeHashEngine::with_platform(graph.clone(), config.clone(), platform),
      registry: Registry::new(&config, backend, docker, sink.clone()),
      pool: WorkerPool::new(config.num_workers, sink.clone()),
      config,
      graph,
      sink,
      platform,
    }
  }

  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  /// Build every vertex of the graph and summarise the result.
  pub async fn run(self: &Arc<Self>, ctx: CancellationToken) -> Result<BuildReport, ExecuteError> {
    let outcome = self.walk(ctx).await?;
    let report = BuildReport::from_outcome(&outcome);
    info!(
      successes = report.successes,
      cache_hits = report.cache_hits,
      failures = report.failures.len(),
      cancelled = report.cancelled.len(),
      "build finished"
    );
    Ok(report)
  }

  /// Build every vertex of the graph and return the per-vertex completions.
  pub async fn walk(self: &Arc<Self>, ctx: CancellationToken) -> Result<WalkOutcome<ExecuteError>, ExecuteError> {
    let walker = Walker::new(self.graph.clone(), self.config.fail_fast);
    let this = self.clone();
    let outcome = walker
      .walk(ctx, move |ctx, node, deps_cached| {
        let this = this.clone();
        async move {
          let worker = this.clone();
          this
            .pool
            .run(move |_| async move { worker.visit(ctx, node, deps_cached).await })
            .await?
        }
      })
      .await
      .map_err(|e| match e {
        crate::graph::WalkError::Cancelled => ExecuteError::Cancelled,
        other => ExecuteError::Walk(other),
      })?;
    Ok(outcome)
  }

  async fn visit(
    &self,
    ctx: CancellationToken,
    node: Arc<BuildNode>,
    deps_cached: bool,
  ) -> Result<CacheResult, ExecuteError> {
    if ctx.is_cancelled() {
      return Err(ExecuteError::Cancelled);
    }

    match node.as_ref() {
      BuildNode::Alias(alias) => {
        self.change_hashes.set_target_change_hash(&alias.label).await?;
        let hit = self.resolve_target(&alias.actual).is_some_and(Target::has_cache_hit);
        debug!(label = %alias.label, actual = %alias.actual, hit, "alias resolved");
        Ok(if hit { CacheResult::Hit } else { CacheResult::Miss })
      }
      BuildNode::Target(target) => self.visit_target(&ctx, &node, target, deps_cached).await,
    }
  }

  async fn visit_target(
    &self,
    ctx: &CancellationToken,
    node: &Arc<BuildNode>,
    target: &Target,
    deps_cached: bool,
  ) -> Result<CacheResult, ExecuteError> {
    let status = TargetStatus::new(self.sink.clone(), target.label.clone());

    if !target.matches_platform(&self.platform) {
      info!(label = %target.label, platform = %self.platform, "skipping target for this platform");
      status.set("skipped");
      return Ok(CacheResult::Skipped);
    }

    let change_hash = self.change_hashes.set_target_change_hash(&target.label).await?;
    debug!(label = %target.label, change_hash = %change_hash, deps_cached, "visiting target");

    if self.config.enable_cache && deps_cached && self.try_cache_hit(ctx, target, &status).await {
      target.set_has_cache_hit(true);
      info!(label = %target.label, "cache hit");
      status.set("cached");
      return Ok(CacheResult::Hit);
    }

    self.load_dependency_outputs(ctx, target, &status).await?;

    if !target.command.trim().is_empty() {
      status.set("running");
      run_command(ctx, &self.config, target, &self.platform).await?;
    }

    if self.config.enable_cache {
      status.set("caching outputs");
      self.registry.write_outputs(ctx, node, &status).await?;
    } else {
      self.verify_outputs(target).await?;
    }

    status.set("done");
    Ok(CacheResult::Miss)
  }

  /// Check the cache and, on a hit, restore outputs as configured.
  ///
  /// Cache errors are never fatal here: they downgrade the check to a miss.
  async fn try_cache_hit(&self, ctx: &CancellationToken, target: &Target, status: &TargetStatus) -> bool {
    match self.registry.has_cache_hit(ctx, target).await {
      Ok(true) => {}
      Ok(false) => return false,
      Err(e) => {
        warn!(label = %target.label, error = %e, "cache check failed, treating as miss");
        return false;
      }
    }

    let result = match self.registry.load_result(ctx, target).await {
      Ok(result) => result,
      Err(e) => {
        warn!(label = %target.label, error = %e, "unreadable cache entry, rebuilding");
        self.discard(ctx, target).await;
        return false;
      }
    };

    match self.config.load_outputs {
      LoadOutputsMode::All => {
        if let Err(e) = self.registry.load_outputs(ctx, target, &result, status).await {
          warn!(label = %target.label, error = %e, "failed to restore outputs, rebuilding");
          self.discard(ctx, target).await;
          return false;
        }
      }
      LoadOutputsMode::Minimal => target.set_output_hash(result.output_hash),
    }
    true
  }

  /// With minimal loading, cached dependencies may not be on disk yet.
  async fn load_dependency_outputs(
    &self,
    ctx: &CancellationToken,
    target: &Target,
    status: &TargetStatus,
  ) -> Result<(), ExecuteError> {
    if self.config.load_outputs != LoadOutputsMode::Minimal {
      return Ok(());
    }

    for dep in &target.deps {
      let Some(dependency) = self.resolve_target(dep) else {
        continue;
      };
      if !dependency.has_cache_hit() || dependency.outputs_loaded() {
        continue;
      }
      debug!(label = %target.label, dependency = %dependency.label, "loading dependency outputs");
      let result = self.registry.load_result(ctx, dependency).await?;
      self.registry.load_outputs(ctx, dependency, &result, status).await?;
    }
    Ok(())
  }

  async fn verify_outputs(&self, target: &Target) -> Result<(), ExecuteError> {
    for output in &target.outputs {
      let path = target.resolve_path(&self.config.workspace_root, &output.identifier);
      let present = match output.kind {
        OutputKind::File => tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()),
        OutputKind::Dir => tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()),
        // Images live in the daemon, not the workspace.
        OutputKind::Docker => true,
      };
      if !present {
        return Err(
          OutputError::MissingOutput {
            label: target.label.clone(),
            output: output.clone(),
          }
          .into(),
        );
      }
    }
    Ok(())
  }

  async fn discard(&self, ctx: &CancellationToken, target: &Target) {
    if let Err(e) = self.registry.cache().clean(ctx, target).await {
      warn!(label = %target.label, error = %e, "failed to clean cache entry");
    }
  }

  /// Follow aliases until a target is reached.
  fn resolve_target(&self, label: &TargetLabel) -> Option<&Target> {
    let mut current = label;
    loop {
      match self.graph.get_vertex(current)?.as_ref() {
        BuildNode::Target(target) => return Some(target),
        BuildNode::Alias(alias) => current = &alias.actual,
      }
    }
  }
}
