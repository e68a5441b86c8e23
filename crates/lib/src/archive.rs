//! Directory archiving for the cache.
//!
//! Directories are stored as gzip-compressed tarballs. Packing streams the
//! archive through a pipe as it is produced, unpacking extracts straight from
//! the cache stream. Symlinks are stored as links, never followed, so relative
//! links (including ones pointing upwards with `../`) survive a round trip.
//! Extraction refuses any entry that would land outside the destination.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use crate::cache::BoxReader;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ArchiveError {
  #[error("archive I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("archive entry escapes destination: {0}")]
  PathTraversal(String),

  #[error("unsupported archive entry {path} ({kind})")]
  UnsupportedEntry { path: String, kind: String },

  #[error("archiving cancelled")]
  Cancelled,

  #[error("archive task failed: {0}")]
  Join(String),
}

impl ArchiveError {
  fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
    ArchiveError::Io {
      path: path.into(),
      source,
    }
  }
}

/// A pack in progress.
///
/// `reader` yields the archive bytes. `finish` reports whether the producer
/// completed: a stream that ended early because packing failed is only
/// distinguishable from a complete one through `finish`.
pub struct PackStream {
  pub reader: BoxReader,
  handle: JoinHandle<Result<u64, ArchiveError>>,
}

impl PackStream {
  /// Wait for the producer. Returns the number of archived entries.
  pub async fn finish(self) -> Result<u64, ArchiveError> {
    self.handle.await.map_err(|e| ArchiveError::Join(e.to_string()))?
  }

  pub fn into_parts(self) -> (BoxReader, JoinHandle<Result<u64, ArchiveError>>) {
    (self.reader, self.handle)
  }
}

#[async_trait]
pub trait Archiver: Send + Sync {
  /// Start packing `source`. Must be called from within a tokio runtime.
  fn pack(&self, ctx: &CancellationToken, source: &Path) -> PackStream;

  /// Extract an archive into `dest`, replacing anything already there.
  /// Returns the number of extracted entries.
  async fn unpack(&self, ctx: &CancellationToken, reader: BoxReader, dest: &Path) -> Result<u64, ArchiveError>;
}

/// Gzip-compressed tar.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarGzArchiver;

#[async_trait]
impl Archiver for TarGzArchiver {
  fn pack(&self, ctx: &CancellationToken, source: &Path) -> PackStream {
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let bridge = SyncIoBridge::new(writer);
    let source = source.to_path_buf();
    let ctx = ctx.clone();

    let handle = tokio::task::spawn_blocking(move || pack_dir(&source, bridge, &ctx));

    PackStream {
      reader: Box::new(reader),
      handle,
    }
  }

  async fn unpack(&self, ctx: &CancellationToken, reader: BoxReader, dest: &Path) -> Result<u64, ArchiveError> {
    let bridge = SyncIoBridge::new(reader);
    let dest = dest.to_path_buf();
    let ctx = ctx.clone();

    tokio::task::spawn_blocking(move || unpack_into(bridge, &dest, &ctx))
      .await
      .map_err(|e| ArchiveError::Join(e.to_string()))?
  }
}

fn pack_dir<W: Write>(source: &Path, writer: W, ctx: &CancellationToken) -> Result<u64, ArchiveError> {
  let encoder = GzEncoder::new(writer, Compression::default());
  let mut builder = tar::Builder::new(encoder);
  builder.follow_symlinks(false);
  let mut count = 0u64;

  for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
    if ctx.is_cancelled() {
      return Err(ArchiveError::Cancelled);
    }

    let entry = entry.map_err(|e| {
      let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source.to_path_buf());
      ArchiveError::io(path, io::Error::other(e.to_string()))
    })?;
    let path = entry.path();
    let relative = match path.strip_prefix(source) {
      Ok(rel) if !rel.as_os_str().is_empty() => rel,
      _ => continue,
    };

    let metadata = fs::symlink_metadata(path).map_err(|e| ArchiveError::io(path, e))?;
    let file_type = metadata.file_type();

    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    if file_type.is_symlink() {
      let link = fs::read_link(path).map_err(|e| ArchiveError::io(path, e))?;
      header.set_entry_type(tar::EntryType::Symlink);
      header.set_mode(0o777);
      header.set_size(0);
      builder
        .append_link(&mut header, relative, &link)
        .map_err(|e| ArchiveError::io(path, e))?;
    } else if file_type.is_dir() {
      header.set_entry_type(tar::EntryType::Directory);
      header.set_mode(file_mode(&metadata, 0o755));
      header.set_size(0);
      builder
        .append_data(&mut header, relative, io::empty())
        .map_err(|e| ArchiveError::io(path, e))?;
    } else if file_type.is_file() {
      header.set_entry_type(tar::EntryType::Regular);
      header.set_mode(file_mode(&metadata, 0o644));
      header.set_size(metadata.len());
      let file = fs::File::open(path).map_err(|e| ArchiveError::io(path, e))?;
      builder
        .append_data(&mut header, relative, file)
        .map_err(|e| ArchiveError::io(path, e))?;
    } else {
      debug!(path = %path.display(), "skipping special file");
      continue;
    }
    count += 1;
  }

  let encoder = builder.into_inner().map_err(|e| ArchiveError::io(source, e))?;
  let mut writer = encoder.finish().map_err(|e| ArchiveError::io(source, e))?;
  writer.flush().map_err(|e| ArchiveError::io(source, e))?;

  debug!(source = %source.display(), entries = count, "packed directory");
  Ok(count)
}

fn unpack_into<R: Read>(reader: R, dest: &Path, ctx: &CancellationToken) -> Result<u64, ArchiveError> {
  match fs::symlink_metadata(dest) {
    Ok(meta) if meta.is_dir() => fs::remove_dir_all(dest).map_err(|e| ArchiveError::io(dest, e))?,
    Ok(_) => fs::remove_file(dest).map_err(|e| ArchiveError::io(dest, e))?,
    Err(_) => {}
  }
  fs::create_dir_all(dest).map_err(|e| ArchiveError::io(dest, e))?;

  let mut archive = tar::Archive::new(GzDecoder::new(reader));
  archive.set_preserve_permissions(true);
  let mut count = 0u64;

  for entry in archive.entries().map_err(|e| ArchiveError::io(dest, e))? {
    if ctx.is_cancelled() {
      return Err(ArchiveError::Cancelled);
    }

    let mut entry = entry.map_err(|e| ArchiveError::io(dest, e))?;
    let entry_path = entry
      .path()
      .map_err(|e| ArchiveError::io(dest, e))?
      .into_owned();
    let name = entry_path.display().to_string();

    check_entry_path(&entry_path)?;

    match entry.header().entry_type() {
      tar::EntryType::Regular | tar::EntryType::Directory | tar::EntryType::Symlink => {}
      other => {
        return Err(ArchiveError::UnsupportedEntry {
          path: name,
          kind: format!("{other:?}"),
        });
      }
    }

    // unpack_in also refuses entries that would be written through a symlink
    // pointing outside `dest`.
    let unpacked = entry.unpack_in(dest).map_err(|e| ArchiveError::io(dest.join(&entry_path), e))?;
    if !unpacked {
      return Err(ArchiveError::PathTraversal(name));
    }
    count += 1;
  }

  debug!(dest = %dest.display(), entries = count, "unpacked archive");
  Ok(count)
}

fn check_entry_path(path: &Path) -> Result<(), ArchiveError> {
  let escapes = path
    .components()
    .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
  if escapes {
    return Err(ArchiveError::PathTraversal(path.display().to_string()));
  }
  Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata, _default: u32) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata, default: u32) -> u32 {
  default
}
