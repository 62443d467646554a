use std::{io, path::PathBuf};

use thiserror::Error;

/// Failures at the OS boundary. None of them is recoverable for a running heap: the allocator
/// cannot roll back a partially grown structure, so the infallible entry points abort on them.
#[derive(Debug, Error)]
pub enum NoomrError {
  #[error("unable to map {size} bytes: {source}")]
  Map {
    size: usize,
    #[source]
    source: io::Error,
  },
  #[error("unable to re-map published page {addr:#x} ({size} bytes): {source}")]
  Remap {
    addr: usize,
    size: usize,
    #[source]
    source: io::Error,
  },
  #[error("published page {addr:#x} is anonymous and not mapped in this task")]
  UnreachablePage { addr: usize },
  #[error("backing file {}: {source}", path.display())]
  BackingFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("segment exhausted: {requested} bytes requested at offset {offset}, {reserved} reserved")]
  SegmentExhausted {
    requested: usize,
    offset: usize,
    reserved: usize,
  },
  #[error("unable to extend segment at {addr:#x} by {len} bytes: {source}")]
  Grow {
    addr: usize,
    len: usize,
    #[source]
    source: io::Error,
  },
  #[error("page names exhausted")]
  NamesExhausted,
  #[error("request of {size} bytes cannot be sized")]
  TooLarge { size: usize },
  #[error("system page size {found} does not match {expected}")]
  PageSize { found: usize, expected: usize },
  #[error("invalid configuration: {0}")]
  Config(String),
}

pub type Result<T, E = NoomrError> = core::result::Result<T, E>;

/// Reports `err` and aborts the process.
#[cold]
#[inline(never)]
pub(crate) fn fatal(err: NoomrError) -> ! {
  log::error!("noomr: {err}");
  std::process::abort()
}
