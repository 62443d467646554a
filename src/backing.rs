//! Backing files for speculative pages.
//!
//! One regular file per page name under `<root>/<heap id>/<name>`. Page names are unique across
//! the heap, and the heap id is fixed when the heap is created, so any task of the heap finds a
//! published page's file from its name alone, whatever episode published it. The content is the
//! raw image of the page, kept current through the shared mapping itself.

use std::{
  fs::{self, File, OpenOptions},
  os::unix::fs::OpenOptionsExt,
  path::{Path, PathBuf},
  sync::atomic::{AtomicU32, Ordering},
};

use crate::{NoomrError, Result, chain::PageName};

/// Heaps created so far by this process.
static HEAPS: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone)]
pub(crate) struct BackingStore {
  root: PathBuf,
  dir: PathBuf,
}

impl BackingStore {
  /// Store for a new heap: a directory of its own under `root`, named after the creating
  /// process and the number of heaps it created before.
  pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
    let root = root.into();
    let id = format!("{}.{}", std::process::id(), HEAPS.fetch_add(1, Ordering::Relaxed));
    let dir = root.join(id);
    Self { root, dir }
  }

  pub(crate) fn root(&self) -> &Path {
    &self.root
  }

  pub(crate) fn dir(&self) -> &Path {
    &self.dir
  }

  pub(crate) fn path(&self, name: PageName) -> PathBuf {
    self.dir.join(name.get().to_string())
  }

  /// Creates the file for `name`, dropping anything a previous run left there, and sizes it to
  /// exactly `len` zero bytes.
  pub(crate) fn create(&self, name: PageName, len: usize) -> Result<File> {
    fs::create_dir_all(&self.dir).map_err(|source| NoomrError::BackingFile {
      path: self.dir.clone(),
      source,
    })?;

    let path = self.path(name);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(true)
      .mode(0o660)
      .custom_flags(libc::O_SYNC)
      .open(&path)
      .map_err(|source| NoomrError::BackingFile {
        path: path.clone(),
        source,
      })?;
    file
      .set_len(len as u64)
      .map_err(|source| NoomrError::BackingFile { path, source })?;
    Ok(file)
  }

  /// Opens the existing file for `name`, returning it with its length.
  pub(crate) fn open(&self, name: PageName) -> Result<(File, usize)> {
    let path = self.path(name);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .open(&path)
      .map_err(|source| NoomrError::BackingFile {
        path: path.clone(),
        source,
      })?;
    let len = file
      .metadata()
      .map_err(|source| NoomrError::BackingFile { path, source })?
      .len();
    Ok((file, len as usize))
  }
}
