use std::fmt;

/// Operating system as it appears in platform selectors and cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
  Linux,
  Darwin,
  Windows,
  /// Any other OS, under its Rust target name.
  Other(&'static str),
}

impl Os {
  pub fn current() -> Self {
    Self::from_rust_name(std::env::consts::OS)
  }

  fn from_rust_name(name: &'static str) -> Self {
    match name {
      "linux" => Self::Linux,
      "macos" => Self::Darwin,
      "windows" => Self::Windows,
      other => Self::Other(other),
    }
  }

  /// Whether a selector value names this OS. `macos` and `darwin` are
  /// interchangeable.
  pub fn matches_name(&self, name: &str) -> bool {
    match self {
      Self::Darwin => matches!(name, "darwin" | "macos"),
      _ => self.as_str() == name,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
      Self::Darwin => "darwin",
      Self::Windows => "windows",
      Self::Other(name) => name,
    }
  }
}

impl fmt::Display for Os {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
