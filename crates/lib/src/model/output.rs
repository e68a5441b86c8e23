//! Typed output declarations.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of artifact an output refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
  File,
  Dir,
  Docker,
}

impl OutputKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::File => "file",
      Self::Dir => "dir",
      Self::Docker => "docker",
    }
  }
}

impl fmt::Display for OutputKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutputParseError {
  #[error("unknown output type '{kind}' in '{declaration}'")]
  UnknownKind { kind: String, declaration: String },

  #[error("output declaration has an empty identifier: '{0}'")]
  EmptyIdentifier(String),
}

/// A declared output: its kind plus an identifier.
///
/// For files and directories the identifier is a package-relative path, for
/// docker outputs it is the local image tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
  pub kind: OutputKind,
  pub identifier: String,
}

impl OutputRef {
  pub fn new(kind: OutputKind, identifier: impl Into<String>) -> Self {
    Self {
      kind,
      identifier: identifier.into(),
    }
  }

  pub fn file(path: impl Into<String>) -> Self {
    Self::new(OutputKind::File, path)
  }

  pub fn dir(path: impl Into<String>) -> Self {
    Self::new(OutputKind::Dir, path)
  }

  pub fn docker(tag: impl Into<String>) -> Self {
    Self::new(OutputKind::Docker, tag)
  }

  /// Parse `path`, `file::path`, `dir::path` or `docker::tag`.
  pub fn parse(declaration: &str) -> Result<Self, OutputParseError> {
    let (kind, identifier) = match declaration.split_once("::") {
      Some(("file", id)) => (OutputKind::File, id),
      Some(("dir", id)) => (OutputKind::Dir, id),
      Some(("docker", id)) => (OutputKind::Docker, id),
      Some((other, _)) => {
        return Err(OutputParseError::UnknownKind {
          kind: other.to_string(),
          declaration: declaration.to_string(),
        });
      }
      None => (OutputKind::File, declaration),
    };

    if identifier.is_empty() {
      return Err(OutputParseError::EmptyIdentifier(declaration.to_string()));
    }

    Ok(Self::new(kind, identifier))
  }
}

impl fmt::Display for OutputRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}::{}", self.kind, self.identifier)
  }
}
