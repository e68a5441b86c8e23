//! Status updates for UI layers.
//!
//! The engine never renders terminal output. It reports what each target is
//! doing to a `StatusSink`, and the host decides how to show it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::model::TargetLabel;

/// Byte-level progress of a running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
  pub current: u64,
  pub total: u64,
}

impl Progress {
  pub fn percent(&self) -> u64 {
    if self.total == 0 {
      return 100;
    }
    (self.current.min(self.total) * 100) / self.total
  }
}

/// A single status line for a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
  /// `None` for worker-level updates not tied to a target.
  pub label: Option<TargetLabel>,
  pub status: String,
  pub progress: Option<Progress>,
}

impl StatusUpdate {
  pub fn new(label: Option<TargetLabel>, status: impl Into<String>) -> Self {
    Self {
      label,
      status: status.into(),
      progress: None,
    }
  }

  pub fn with_progress(mut self, progress: Progress) -> Self {
    self.progress = Some(progress);
    self
  }
}

/// Receives status updates from the engine.
pub trait StatusSink: Send + Sync {
  fn update(&self, update: StatusUpdate);
}

pub type SharedStatusSink = Arc<dyn StatusSink>;

/// Logs every update at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
  fn update(&self, update: StatusUpdate) {
    let label = update.label.as_ref().map(|l| l.to_string()).unwrap_or_default();
    match update.progress {
      Some(p) => debug!(label = %label, status = %update.status, percent = p.percent(), "status"),
      None => debug!(label = %label, status = %update.status, "status"),
    }
  }
}

/// Forwards updates into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelStatusSink {
  tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl ChannelStatusSink {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl StatusSink for ChannelStatusSink {
  fn update(&self, update: StatusUpdate) {
    // Receiver gone means nobody is rendering; drop silently.
    let _ = self.tx.send(update);
  }
}

/// Status sink bound to one target.
#[derive(Clone)]
pub struct TargetStatus {
  sink: SharedStatusSink,
  label: TargetLabel,
}

impl TargetStatus {
  pub fn new(sink: SharedStatusSink, label: TargetLabel) -> Self {
    Self { sink, label }
  }

  pub fn label(&self) -> &TargetLabel {
    &self.label
  }

  pub fn sink(&self) -> SharedStatusSink {
    self.sink.clone()
  }

  pub fn set(&self, status: impl Into<String>) {
    self.sink.update(StatusUpdate::new(Some(self.label.clone()), status));
  }

  pub fn set_progress(&self, status: impl Into<String>, progress: Progress) {
    self
      .sink
      .update(StatusUpdate::new(Some(self.label.clone()), status).with_progress(progress));
  }
}
