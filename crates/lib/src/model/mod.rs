//! Build graph data model.
//!
//! - `TargetLabel`: unique `//package:name` identifier
//! - `Target`: a unit of build work plus its per-run execution state
//! - `Alias`: a named pointer to another target
//! - `OutputRef`: a typed output declaration (file, directory, docker image)

pub mod label;
pub mod output;
pub mod target;

pub use label::{LabelError, TargetLabel};
pub use output::{OutputKind, OutputParseError, OutputRef};
pub use target::{Alias, BuildNode, PlatformSelector, Target, TargetState};
