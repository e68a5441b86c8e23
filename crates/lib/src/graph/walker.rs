//! Concurrent dependency-ordered graph walker.
//!
//! Every vertex gets its own lightweight task that waits on two signals: a
//! one-shot `ready` sender, fired once all dependencies have completed
//! successfully, and a cancellation token. When the vertex is ready the task
//! runs the caller's callback and reports the result. Reporting happens under a
//! single mutex: the completion is recorded, and every direct dependent whose
//! dependencies are now all recorded is signalled ready.
//!
//! The callback is expected to do its real work through a bounded
//! `WorkerPool`, so the number of vertex tasks alive at once does not bound
//! how many commands execute at once.
//!
//! On failure, `fail_fast` cancels every vertex that has not started yet;
//! otherwise only the transitive dependents of the failed vertex are cancelled
//! and independent branches keep going. Vertices that already started are never
//! interrupted. `walk` joins every vertex task before returning, so once it
//! returns no callback is running and each vertex is either in the completion
//! map or in the cancelled set.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::{BuildNode, TargetLabel};

use super::Graph;
use super::types::WalkError;

/// How a completed vertex relates to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheResult {
  /// Outputs came from the cache, nothing ran.
  Hit,
  /// The vertex did real work (or failed trying).
  Miss,
  /// Nothing to do for this vertex on this host (platform mismatch).
  Skipped,
}

/// Terminal record of a vertex whose callback ran.
#[derive(Debug)]
pub struct Completion<E> {
  pub is_success: bool,
  pub error: Option<Arc<E>>,
  pub cache_result: CacheResult,
}

impl<E> Clone for Completion<E> {
  fn clone(&self) -> Self {
    Self {
      is_success: self.is_success,
      error: self.error.clone(),
      cache_result: self.cache_result,
    }
  }
}

impl<E> Completion<E> {
  pub fn success(cache_result: CacheResult) -> Self {
    Self {
      is_success: true,
      error: None,
      cache_result,
    }
  }

  pub fn failure(error: E) -> Self {
    Self {
      is_success: false,
      error: Some(Arc::new(error)),
      cache_result: CacheResult::Miss,
    }
  }
}

pub type CompletionMap<E> = HashMap<TargetLabel, Completion<E>>;

/// Result of a finished walk.
#[derive(Debug)]
pub struct WalkOutcome<E> {
  /// Vertices whose callback ran, keyed by label.
  pub completions: CompletionMap<E>,
  /// Vertices that never started because they were cancelled.
  pub cancelled: BTreeSet<TargetLabel>,
}

impl<E> WalkOutcome<E> {
  pub fn is_success(&self) -> bool {
    self.cancelled.is_empty() && self.completions.values().all(|c| c.is_success)
  }
}

struct VertexSignals {
  ready: Option<oneshot::Sender<bool>>,
  cancel: CancellationToken,
}

struct WalkState<E> {
  completions: CompletionMap<E>,
  cancelled: BTreeSet<TargetLabel>,
  vertices: HashMap<TargetLabel, VertexSignals>,
  panicked: Option<(TargetLabel, String)>,
}

/// Walks a graph in dependency order.
pub struct Walker {
  graph: Arc<Graph>,
  fail_fast: bool,
}

impl Walker {
  pub fn new(graph: Arc<Graph>, fail_fast: bool) -> Self {
    Self { graph, fail_fast }
  }

  /// Visit every vertex once, dependencies first.
  ///
  /// `callback` receives the caller's token, the vertex, and whether every
  /// direct dependency was a cache hit.
  ///
  /// # Errors
  ///
  /// `Cancelled` if `ctx` fired during the walk, `TaskPanicked` if a callback
  /// panicked. Per-vertex failures are not errors; they are reported in the
  /// returned `WalkOutcome`.
  pub async fn walk<F, Fut, E>(&self, ctx: CancellationToken, callback: F) -> Result<WalkOutcome<E>, WalkError>
  where
    F: Fn(CancellationToken, Arc<BuildNode>, bool) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CacheResult, E>> + Send + 'static,
    E: Send + Sync + std::fmt::Display + 'static,
  {
    info!(vertices = self.graph.len(), fail_fast = self.fail_fast, "starting graph walk");

    let walk_token = ctx.child_token();
    let callback = Arc::new(callback);
    let mut receivers = Vec::with_capacity(self.graph.len());
    let mut vertices = HashMap::with_capacity(self.graph.len());

    for node in self.graph.vertices() {
      let (ready_tx, ready_rx) = oneshot::channel();
      let cancel = walk_token.child_token();
      vertices.insert(
        node.label().clone(),
        VertexSignals {
          ready: Some(ready_tx),
          cancel: cancel.clone(),
        },
      );
      receivers.push((node.clone(), ready_rx, cancel));
    }

    let state = Arc::new(Mutex::new(WalkState {
      completions: HashMap::with_capacity(self.graph.len()),
      cancelled: BTreeSet::new(),
      vertices,
      panicked: None,
    }));

    let mut join_set = JoinSet::new();
    for (node, ready_rx, cancel) in receivers {
      let vertex = VertexTask {
        graph: self.graph.clone(),
        state: state.clone(),
        walk_token: walk_token.clone(),
        fail_fast: self.fail_fast,
      };
      let callback = callback.clone();
      let ctx = ctx.clone();
      join_set.spawn(async move { vertex.run(node, ready_rx, cancel, ctx, callback).await });
    }

    // Vertices without dependencies are ready immediately.
    {
      let mut state = lock(&state);
      for root in self.graph.roots() {
        if let Some(tx) = state.vertices.get_mut(&root).and_then(|v| v.ready.take()) {
          let _ = tx.send(true);
        }
      }
    }

    while let Some(joined) = join_set.join_next().await {
      if let Err(e) = joined {
        // Vertex tasks catch callback panics, so this is an internal failure.
        error!(error = %e, "vertex task failed");
        walk_token.cancel();
      }
    }

    let state = {
      let mut guard = lock(&state);
      WalkState {
        completions: std::mem::take(&mut guard.completions),
        cancelled: std::mem::take(&mut guard.cancelled),
        vertices: HashMap::new(),
        panicked: guard.panicked.take(),
      }
    };

    if let Some((label, message)) = state.panicked {
      return Err(WalkError::TaskPanicked { label, message });
    }

    if ctx.is_cancelled() {
      warn!("graph walk cancelled");
      return Err(WalkError::Cancelled);
    }

    info!(
      completed = state.completions.len(),
      cancelled = state.cancelled.len(),
      "graph walk complete"
    );

    Ok(WalkOutcome {
      completions: state.completions,
      cancelled: state.cancelled,
    })
  }
}

fn lock<E>(state: &Mutex<WalkState<E>>) -> std::sync::MutexGuard<'_, WalkState<E>> {
  state.lock().unwrap_or_else(|e| e.into_inner())
}

struct VertexTask<E> {
  graph: Arc<Graph>,
  state: Arc<Mutex<WalkState<E>>>,
  walk_token: CancellationToken,
  fail_fast: bool,
}

impl<E: Send + Sync + std::fmt::Display + 'static> VertexTask<E> {
  async fn run<F, Fut>(
    self,
    node: Arc<BuildNode>,
    ready_rx: oneshot::Receiver<bool>,
    cancel: CancellationToken,
    ctx: CancellationToken,
    callback: Arc<F>,
  ) where
    F: Fn(CancellationToken, Arc<BuildNode>, bool) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CacheResult, E>> + Send + 'static,
  {
    let label = node.label().clone();

    let deps_cached = tokio::select! {
      biased;
      _ = cancel.cancelled() => {
        debug!(label = %label, "vertex cancelled before start");
        lock(&self.state).cancelled.insert(label);
        return;
      }
      ready = ready_rx => match ready {
        Ok(deps_cached) => deps_cached,
        Err(_) => {
          lock(&self.state).cancelled.insert(label);
          return;
        }
      },
    };

    debug!(label = %label, deps_cached, "vertex ready");

    let outcome = AssertUnwindSafe(async { callback(ctx, node.clone(), deps_cached).await })
      .catch_unwind()
      .await;

    let completion = match outcome {
      Ok(Ok(cache_result)) => Completion::success(cache_result),
      Ok(Err(e)) => {
        debug!(label = %label, error = %e, "vertex failed");
        Completion::failure(e)
      }
      Err(panic) => {
        let message = panic_message(panic.as_ref());
        error!(label = %label, message = %message, "vertex callback panicked");
        let mut state = lock(&self.state);
        state.panicked.get_or_insert((label, message));
        self.walk_token.cancel();
        return;
      }
    };

    self.complete(label, completion);
  }

  /// Record a completion and signal or cancel dependents.
  fn complete(&self, label: TargetLabel, completion: Completion<E>) {
    let success = completion.is_success;
    let descendants = if success || self.fail_fast {
      BTreeSet::new()
    } else {
      self.graph.get_descendants(&label)
    };
    let dependents = self.graph.get_dependents(&label);

    let mut state = lock(&self.state);
    state.completions.insert(label.clone(), completion);

    if !success {
      if self.fail_fast {
        debug!(label = %label, "fail-fast: cancelling remaining vertices");
        self.walk_token.cancel();
      } else {
        for descendant in &descendants {
          if let Some(signals) = state.vertices.get(descendant) {
            signals.cancel.cancel();
          }
        }
      }
      return;
    }

    for dependent in dependents {
      let deps = self.graph.get_dependencies(&dependent);
      let all_done = deps
        .iter()
        .all(|dep| state.completions.get(dep).is_some_and(|c| c.is_success));
      if !all_done {
        continue;
      }

      let deps_cached = deps
        .iter()
        .all(|dep| state.completions.get(dep).is_some_and(|c| c.cache_result == CacheResult::Hit));
      if let Some(tx) = state.vertices.get_mut(&dependent).and_then(|v| v.ready.take()) {
        let _ = tx.send(deps_cached);
      }
    }
  }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
