//! Error types for graph construction and walking.

use thiserror::Error;

use crate::model::TargetLabel;

/// Configuration errors found while building the graph. Fatal: raised before
/// anything executes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  #[error("dependency cycle detected: {}", format_cycle(.0))]
  CycleDetected(Vec<TargetLabel>),

  #[error("duplicate target label: {0}")]
  DuplicateLabel(TargetLabel),

  #[error("target {0} cannot depend on itself")]
  SelfLoop(TargetLabel),

  #[error("unknown vertex: {0}")]
  UnknownVertex(TargetLabel),

  #[error("target {target} depends on unknown target {dependency}")]
  UnknownDependency {
    target: TargetLabel,
    dependency: TargetLabel,
  },
}

fn format_cycle(path: &[TargetLabel]) -> String {
  path.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
}

/// Errors that abort a walk as a whole.
#[derive(Debug, Error)]
pub enum WalkError {
  /// The caller's cancellation token fired.
  #[error("walk cancelled")]
  Cancelled,

  #[error("graph error: {0}")]
  Graph(#[from] GraphError),

  #[error("vertex task for {label} panicked: {message}")]
  TaskPanicked { label: TargetLabel, message: String },
}
