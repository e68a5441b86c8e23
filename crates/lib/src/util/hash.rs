//! Hashing utilities for change detection and content-addressed storage.
//!
//! This module provides:
//! - `HashAlgorithm`: the pluggable digest used everywhere a hash is needed
//! - `Hasher`: a configured hash function producing hex digests
//! - `StreamHasher`: incremental hashing for streamed content
//! - `Hasher::hash_directory()`: deterministic directory tree hashing
//! - `Hasher::hash_file()`: single file hashing

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Number of bytes kept from a blake3 digest in fast mode (128 bits).
const FAST_DIGEST_BYTES: usize = 16;

/// The digest function backing a `Hasher`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
  /// Fast 128-bit digest (truncated blake3). The default.
  #[default]
  Blake3,
  /// Full 256-bit SHA-256 digest for setups that want a standard cryptographic hash.
  Sha256,
}

impl HashAlgorithm {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Blake3 => "blake3",
      Self::Sha256 => "sha256",
    }
  }
}

impl std::str::FromStr for HashAlgorithm {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "blake3" | "fast" => Ok(Self::Blake3),
      "sha256" | "crypto" => Ok(Self::Sha256),
      other => Err(format!("unknown hash algorithm: {other}")),
    }
  }
}

impl std::fmt::Display for HashAlgorithm {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// A lowercase hexadecimal digest of some content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during file or directory hashing.
#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// A configured hash function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hasher {
  algorithm: HashAlgorithm,
}

impl Hasher {
  pub fn new(algorithm: HashAlgorithm) -> Self {
    Self { algorithm }
  }

  pub fn algorithm(&self) -> HashAlgorithm {
    self.algorithm
  }

  /// Start an incremental hash.
  pub fn stream(&self) -> StreamHasher {
    match self.algorithm {
      HashAlgorithm::Blake3 => StreamHasher::Blake3(Box::new(blake3::Hasher::new())),
      HashAlgorithm::Sha256 => StreamHasher::Sha256(Sha256::new()),
    }
  }

  /// Hash arbitrary bytes.
  pub fn hash_bytes(&self, data: &[u8]) -> ContentHash {
    let mut stream = self.stream();
    stream.update(data);
    stream.finalize()
  }

  pub fn hash_str(&self, data: &str) -> ContentHash {
    self.hash_bytes(data.as_bytes())
  }

  /// Hash a file's contents.
  pub fn hash_file(&self, path: &Path) -> Result<ContentHash, DirHashError> {
    let read_error = |e: std::io::Error| DirHashError::ReadFile {
      path: path.display().to_string(),
      message: e.to_string(),
    };
    let mut file = fs::File::open(path).map_err(read_error)?;
    let mut stream = self.stream();
    std::io::copy(&mut file, &mut stream).map_err(read_error)?;
    Ok(stream.finalize())
  }

  /// Digest of a directory tree as it would be restored from the cache.
  ///
  /// Each entry contributes one line keyed by its slash-separated relative
  /// path: file content plus executable bit, symlink target (not followed), or
  /// a bare marker for directories. Special files are ignored.
  pub fn hash_directory(&self, root: &Path) -> Result<ContentHash, DirHashError> {
    let mut lines = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
      let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
      let relative = relative_key(root, entry.path());
      let file_type = entry.file_type();

      let line = if file_type.is_symlink() {
        let target = fs::read_link(entry.path()).map_err(|e| DirHashError::ReadSymlink {
          path: entry.path().display().to_string(),
          message: e.to_string(),
        })?;
        format!("link {relative} -> {}", target.to_string_lossy())
      } else if file_type.is_dir() {
        format!("dir {relative}")
      } else if file_type.is_file() {
        let mode = if is_executable(entry.path()) { "x" } else { "-" };
        format!("file {relative} {mode} {}", self.hash_file(entry.path())?)
      } else {
        continue;
      };
      lines.push((relative, line));
    }

    lines.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut stream = self.stream();
    for (_, line) in &lines {
      stream.update(line.as_bytes());
      stream.update(b"\n");
    }
    Ok(stream.finalize())
  }
}

fn relative_key(root: &Path, path: &Path) -> String {
  let relative = path.strip_prefix(root).unwrap_or(path);
  relative
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
  false
}

/// Incremental hasher returned by `Hasher::stream`.
pub enum StreamHasher {
  Blake3(Box<blake3::Hasher>),
  Sha256(Sha256),
}

impl StreamHasher {
  pub fn update(&mut self, data: &[u8]) {
    match self {
      Self::Blake3(hasher) => {
        hasher.update(data);
      }
      Self::Sha256(hasher) => hasher.update(data),
    }
  }

  pub fn finalize(self) -> ContentHash {
    match self {
      Self::Blake3(hasher) => {
        let digest = hasher.finalize();
        ContentHash(hex::encode(&digest.as_bytes()[..FAST_DIGEST_BYTES]))
      }
      Self::Sha256(hasher) => ContentHash(hex::encode(hasher.finalize())),
    }
  }
}

impl std::io::Write for StreamHasher {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.update(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}
