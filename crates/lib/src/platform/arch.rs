use std::fmt;

/// CPU architecture as it appears in platform selectors and cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
  Amd64,
  Arm64,
  /// Any other architecture, under its Rust target name.
  Other(&'static str),
}

impl Arch {
  pub fn current() -> Self {
    Self::from_rust_name(std::env::consts::ARCH)
  }

  fn from_rust_name(name: &'static str) -> Self {
    match name {
      "x86_64" => Self::Amd64,
      "aarch64" => Self::Arm64,
      other => Self::Other(other),
    }
  }

  /// Whether a selector value names this architecture. Both the Rust names
  /// and the Go-style names used in build files are accepted.
  pub fn matches_name(&self, name: &str) -> bool {
    match self {
      Self::Amd64 => matches!(name, "x86_64" | "amd64"),
      Self::Arm64 => matches!(name, "aarch64" | "arm64"),
      Self::Other(own) => *own == name,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Amd64 => "x86_64",
      Self::Arm64 => "aarch64",
      Self::Other(name) => name,
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
