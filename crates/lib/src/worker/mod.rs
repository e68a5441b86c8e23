//! Bounded execution layer.
//!
//! Graph walking spawns one cheap task per vertex; the expensive part of each
//! vertex runs through a `WorkerPool` so that only `num_workers` commands are
//! ever executing at once.

pub mod pool;
pub mod progress;

pub use pool::{PoolError, WorkerContext, WorkerPool};
pub use progress::{MIN_PROGRESS_STEP, ProgressReader, ProgressTracker};
