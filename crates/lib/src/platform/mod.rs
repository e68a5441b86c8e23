//! The host platform as seen by targets, and where grog keeps its cache.

pub mod arch;
pub mod os;
pub mod paths;

use std::fmt;

use arch::Arch;
use os::Os;

/// OS and architecture pair, rendered as `os/arch` (e.g. `linux/x86_64`).
///
/// Targets select on it and platform-specific change hashes include it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
  pub os: Os,
  pub arch: Arch,
}

impl Platform {
  pub fn new(arch: Arch, os: Os) -> Self {
    Self { os, arch }
  }

  pub fn host() -> Self {
    Self::new(Arch::current(), Os::current())
  }

  pub fn cache_key(&self) -> String {
    format!("{}/{}", self.os, self.arch)
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.os, self.arch)
  }
}
