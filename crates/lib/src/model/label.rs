//! Target labels.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
  #[error("label must start with '//' or ':': {0}")]
  MissingPrefix(String),

  #[error("label has an empty target name: {0}")]
  EmptyName(String),

  #[error("label contains more than one ':': {0}")]
  TooManyColons(String),
}

/// Unique identifier of a build node: a package path plus a name.
///
/// The package is stored without the leading `//`; the root package is the
/// empty string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetLabel {
  pub package: String,
  pub name: String,
}

impl TargetLabel {
  pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      package: package.into(),
      name: name.into(),
    }
  }

  /// Parse an absolute label.
  ///
  /// Accepts `//pkg/path:name` and the shorthand `//pkg/path`, which names the
  /// target after the last package segment.
  pub fn parse(s: &str) -> Result<Self, LabelError> {
    let Some(rest) = s.strip_prefix("//") else {
      return Err(LabelError::MissingPrefix(s.to_string()));
    };
    Self::split(s, rest)
  }

  /// Parse a label that may be relative (`:name`) to `current_package`.
  pub fn parse_relative(s: &str, current_package: &str) -> Result<Self, LabelError> {
    if let Some(name) = s.strip_prefix(':') {
      if name.is_empty() {
        return Err(LabelError::EmptyName(s.to_string()));
      }
      return Ok(Self::new(current_package, name));
    }
    Self::parse(s)
  }

  fn split(original: &str, rest: &str) -> Result<Self, LabelError> {
    let mut parts = rest.splitn(3, ':');
    let package = parts.next().unwrap_or_default().trim_end_matches('/');
    let name = parts.next();
    if parts.next().is_some() {
      return Err(LabelError::TooManyColons(original.to_string()));
    }

    let name = match name {
      Some(name) => name,
      None => package.rsplit('/').next().unwrap_or_default(),
    };
    if name.is_empty() {
      return Err(LabelError::EmptyName(original.to_string()));
    }

    Ok(Self::new(package, name))
  }
}

impl fmt::Display for TargetLabel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "//{}:{}", self.package, self.name)
  }
}

impl std::str::FromStr for TargetLabel {
  type Err = LabelError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}
