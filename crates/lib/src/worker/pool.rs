//! Fixed-size worker pool.
//!
//! `N` workers pull boxed jobs off one shared queue. `run` submits a job and
//! waits for its own result on a one-shot channel, so callers see a plain
//! async call while the pool caps how many jobs run at the same time.
//!
//! The queue is buffered: up to `N` submitted jobs can wait in it while every
//! worker is busy. Further submitters wait in `run` until a slot frees up.
//! Buffering only affects queueing; the number of jobs executing at once is
//! still `N`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::model::TargetLabel;
use crate::status::{SharedStatusSink, StatusUpdate, TargetStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("worker pool is shut down")]
  Closed,

  #[error("task panicked on worker {worker}: {message}")]
  TaskPanicked { worker: usize, message: String },
}

/// Handed to every job so it can report what it is doing.
#[derive(Clone)]
pub struct WorkerContext {
  pub worker_id: usize,
  sink: SharedStatusSink,
}

impl WorkerContext {
  pub fn status(&self, status: impl Into<String>) {
    self.sink.update(StatusUpdate::new(None, status));
  }

  pub fn for_target(&self, label: TargetLabel) -> TargetStatus {
    TargetStatus::new(self.sink.clone(), label)
  }
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Job = Box<dyn FnOnce(WorkerContext) -> BoxFuture + Send>;

/// Runs submitted tasks on a fixed number of workers.
pub struct WorkerPool {
  tx: Option<mpsc::Sender<Job>>,
  workers: Vec<JoinHandle<()>>,
  size: usize,
}

impl WorkerPool {
  /// Start `size` workers (at least one) on the current runtime.
  pub fn new(size: usize, sink: SharedStatusSink) -> Self {
    let size = size.max(1);
    // Queue capacity, not concurrency: only `size` workers ever receive.
    let (tx, rx) = mpsc::channel::<Job>(size);
    let rx = Arc::new(Mutex::new(rx));

    let workers = (0..size)
      .map(|worker_id| {
        let rx = rx.clone();
        let ctx = WorkerContext {
          worker_id,
          sink: sink.clone(),
        };
        tokio::spawn(worker_loop(ctx, rx))
      })
      .collect();

    debug!(workers = size, "worker pool started");

    Self {
      tx: Some(tx),
      workers,
      size,
    }
  }

  pub fn size(&self) -> usize {
    self.size
  }

  /// Run `task` on the next free worker and wait for its result.
  ///
  /// # Errors
  ///
  /// `Closed` if the pool was shut down, `TaskPanicked` if the task panicked.
  /// The worker itself survives a panicking task.
  pub async fn run<T, F, Fut>(&self, task: F) -> Result<T, PoolError>
  where
    F: FnOnce(WorkerContext) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
  {
    let tx = self.tx.as_ref().ok_or(PoolError::Closed)?;
    let (result_tx, result_rx) = oneshot::channel::<Result<T, PoolError>>();

    let job: Job = Box::new(move |ctx: WorkerContext| {
      Box::pin(async move {
        let worker = ctx.worker_id;
        let result = AssertUnwindSafe(async move { task(ctx).await })
          .catch_unwind()
          .await
          .map_err(|panic| PoolError::TaskPanicked {
            worker,
            message: panic_message(panic.as_ref()),
          });
        // Caller may have stopped waiting.
        let _ = result_tx.send(result);
      })
    });

    tx.send(job).await.map_err(|_| PoolError::Closed)?;
    result_rx.await.map_err(|_| PoolError::Closed)?
  }

  /// Stop accepting jobs, let queued jobs finish and wait for every worker.
  pub async fn shutdown(mut self) {
    self.tx.take();
    for worker in std::mem::take(&mut self.workers) {
      if let Err(e) = worker.await {
        error!(error = %e, "worker exited abnormally");
      }
    }
    debug!("worker pool stopped");
  }
}

async fn worker_loop(ctx: WorkerContext, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
  loop {
    let job = {
      let mut rx = rx.lock().await;
      rx.recv().await
    };
    match job {
      Some(job) => job(ctx.clone()).await,
      None => break,
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
