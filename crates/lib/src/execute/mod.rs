//! Building a graph: per-target execution, command running and reporting.

pub mod cmd;
pub mod report;
pub mod target;
pub mod types;

pub use cmd::run_command;
pub use report::{BuildReport, TargetFailure};
pub use target::Executor;
pub use types::{CommandOutput, ExecuteError};
