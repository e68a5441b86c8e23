//! Summary of a finished build.

use std::fmt;

use crate::graph::{CacheResult, WalkOutcome};
use crate::model::TargetLabel;

use super::types::ExecuteError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
  pub label: TargetLabel,
  pub exit_code: Option<i32>,
  /// Captured combined output of the failed command, if it ran.
  pub output: Option<String>,
  pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
  pub successes: usize,
  pub cache_hits: usize,
  /// Successful targets that actually ran their command.
  pub executed: usize,
  /// Targets skipped because they do not apply to this platform.
  pub skipped: usize,
  /// Sorted by label.
  pub failures: Vec<TargetFailure>,
  /// Sorted by label.
  pub cancelled: Vec<TargetLabel>,
}

impl BuildReport {
  pub fn from_outcome(outcome: &WalkOutcome<ExecuteError>) -> Self {
    let mut report = BuildReport {
      cancelled: outcome.cancelled.iter().cloned().collect(),
      ..Default::default()
    };

    for (label, completion) in &outcome.completions {
      if completion.is_success {
        report.successes += 1;
        match completion.cache_result {
          CacheResult::Hit => report.cache_hits += 1,
          CacheResult::Miss => report.executed += 1,
          CacheResult::Skipped => report.skipped += 1,
        }
        continue;
      }

      let (exit_code, output, message) = match completion.error.as_deref() {
        Some(e) => (e.exit_code(), e.output().map(str::to_string), e.to_string()),
        None => (None, None, "unknown failure".to_string()),
      };
      report.failures.push(TargetFailure {
        label: label.clone(),
        exit_code,
        output,
        message,
      });
    }

    report.failures.sort_by(|a, b| a.label.cmp(&b.label));
    report
  }

  pub fn is_success(&self) -> bool {
    self.failures.is_empty() && self.cancelled.is_empty()
  }
}

impl fmt::Display for BuildReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} succeeded ({} cached, {} executed, {} skipped), {} failed, {} cancelled",
      self.successes,
      self.cache_hits,
      self.executed,
      self.skipped,
      self.failures.len(),
      self.cancelled.len()
    )
  }
}
