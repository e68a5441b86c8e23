//! Byte progress aggregation.
//!
//! A root tracker reports to a target's status line. Sub-trackers (one per
//! streamed transfer, for example) add their total to the parent when created
//! and push byte deltas up the parent chain. Reporting is throttled to roughly
//! one update per percent, with a minimum step so small transfers do not flood
//! the status sink.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::status::{Progress, TargetStatus};

/// Smallest byte step between two reported updates.
pub const MIN_PROGRESS_STEP: u64 = 64 * 1024;

struct TrackerState {
  current: u64,
  total: u64,
  last_reported: u64,
}

struct TrackerInner {
  message: String,
  state: Mutex<TrackerState>,
  parent: Option<Arc<TrackerInner>>,
  status: Option<TargetStatus>,
}

impl TrackerInner {
  fn add(&self, delta: u64) {
    let report = {
      let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
      state.current = state.current.saturating_add(delta);
      let step = (state.total / 100).max(MIN_PROGRESS_STEP);
      let finished = state.total > 0 && state.current >= state.total && state.last_reported < state.total;
      if finished || state.current - state.last_reported >= step {
        state.last_reported = state.current;
        Some(Progress {
          current: state.current,
          total: state.total,
        })
      } else {
        None
      }
    };

    if let (Some(progress), Some(status)) = (report, &self.status) {
      status.set_progress(self.message.clone(), progress);
    }
    if let Some(parent) = &self.parent {
      parent.add(delta);
    }
  }

  fn grow(&self, total: u64) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    state.total = state.total.saturating_add(total);
    drop(state);
    if let Some(parent) = &self.parent {
      parent.grow(total);
    }
  }
}

/// Tracks bytes processed against a known total.
#[derive(Clone)]
pub struct ProgressTracker {
  inner: Arc<TrackerInner>,
}

impl ProgressTracker {
  /// A root tracker that reports to `status`.
  pub fn new(status: Option<TargetStatus>, message: impl Into<String>, total: u64) -> Self {
    Self {
      inner: Arc::new(TrackerInner {
        message: message.into(),
        state: Mutex::new(TrackerState {
          current: 0,
          total,
          last_reported: 0,
        }),
        parent: None,
        status,
      }),
    }
  }

  /// A child tracker whose bytes also count towards this one.
  pub fn sub_tracker(&self, message: impl Into<String>, total: u64) -> Self {
    self.inner.grow(total);
    Self {
      inner: Arc::new(TrackerInner {
        message: message.into(),
        state: Mutex::new(TrackerState {
          current: 0,
          total,
          last_reported: 0,
        }),
        parent: Some(self.inner.clone()),
        status: None,
      }),
    }
  }

  pub fn add(&self, delta: u64) {
    if delta > 0 {
      self.inner.add(delta);
    }
  }

  pub fn progress(&self) -> Progress {
    let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
    Progress {
      current: state.current,
      total: state.total,
    }
  }
}

/// Counts bytes read through it into a tracker.
pub struct ProgressReader<R> {
  inner: R,
  tracker: ProgressTracker,
}

impl<R> ProgressReader<R> {
  pub fn new(inner: R, tracker: ProgressTracker) -> Self {
    Self { inner, tracker }
  }

  pub fn into_inner(self) -> R {
    self.inner
  }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
  fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    let before = buf.filled().len();
    let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
    if let Poll::Ready(Ok(())) = &poll {
      self.tracker.add((buf.filled().len() - before) as u64);
    }
    poll
  }
}
