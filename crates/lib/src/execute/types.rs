use std::time::Duration;

use thiserror::Error;

use crate::change_hash::ChangeHashError;
use crate::graph::{GraphError, WalkError};
use crate::model::TargetLabel;
use crate::outputs::OutputError;
use crate::worker::PoolError;

#[derive(Debug, Error)]
pub enum ExecuteError {
  /// The command ran and exited unsuccessfully.
  #[error("{label} failed with exit code {exit_code:?}")]
  CommandFailed {
    label: TargetLabel,
    exit_code: Option<i32>,
    output: String,
  },

  #[error("{label} timed out after {timeout:?}")]
  Timeout {
    label: TargetLabel,
    timeout: Duration,
    output: String,
  },

  #[error("failed to start command for {label}: {source}")]
  Spawn {
    label: TargetLabel,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Outputs(#[from] OutputError),

  #[error(transparent)]
  ChangeHash(#[from] ChangeHashError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Walk(#[from] WalkError),

  #[error(transparent)]
  Pool(#[from] PoolError),

  #[error("build cancelled")]
  Cancelled,
}

impl ExecuteError {
  pub fn exit_code(&self) -> Option<i32> {
    match self {
      ExecuteError::CommandFailed { exit_code, .. } => *exit_code,
      _ => None,
    }
  }

  /// Captured combined stdout and stderr, if the command ran.
  pub fn output(&self) -> Option<&str> {
    match self {
      ExecuteError::CommandFailed { output, .. } | ExecuteError::Timeout { output, .. } => Some(output),
      _ => None,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, ExecuteError::Cancelled | ExecuteError::Walk(WalkError::Cancelled))
  }
}

/// What a successful command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
  pub output: String,
  pub duration: Duration,
}
