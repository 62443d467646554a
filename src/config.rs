//! Runtime configuration of a [`SharedHeap`](crate::SharedHeap).

use std::{env, path::PathBuf};

use crate::{NoomrError, PAGE_SIZE, Result};

/// Default root of the backing files.
pub const DEFAULT_BACKING_ROOT: &str = "/tmp/bop";

/// Default size of the address range reserved for the data segment (1GB).
pub const DEFAULT_SEGMENT_BYTES: usize = 1 << 30;

/// Bytes of payload one growth aims to host.
pub const DEFAULT_BATCH_BYTES: usize = 1024;

/// Lower bound on the number of blocks one growth creates.
pub const DEFAULT_MIN_BATCH_BLOCKS: usize = 5;

const ENV_BACKING_ROOT: &str = "NOOMR_BACKING_ROOT";
const ENV_SEGMENT_BYTES: &str = "NOOMR_SEGMENT_BYTES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  /// Backing files live at `<backing_root>/<heap id>/<page name>`.
  pub backing_root: PathBuf,
  /// Reserved data segment size. Must be a non-zero multiple of [`PAGE_SIZE`].
  pub segment_bytes: usize,
  /// Payload bytes one growth aims to carve out. A growth of a class creates
  /// `batch_bytes / class size` blocks.
  pub batch_bytes: usize,
  /// Fewest blocks one growth creates, whatever the class size.
  pub min_batch_blocks: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      backing_root: PathBuf::from(DEFAULT_BACKING_ROOT),
      segment_bytes: DEFAULT_SEGMENT_BYTES,
      batch_bytes: DEFAULT_BATCH_BYTES,
      min_batch_blocks: DEFAULT_MIN_BATCH_BLOCKS,
    }
  }
}

impl Config {
  /// Defaults overridden by `NOOMR_BACKING_ROOT` and `NOOMR_SEGMENT_BYTES`.
  pub fn from_env() -> Result<Self> {
    let mut config = Self::default();
    if let Some(root) = env::var_os(ENV_BACKING_ROOT) {
      config.backing_root = PathBuf::from(root);
    }
    if let Ok(raw) = env::var(ENV_SEGMENT_BYTES) {
      config.segment_bytes = raw
        .trim()
        .parse()
        .map_err(|_| NoomrError::Config(format!("{ENV_SEGMENT_BYTES}={raw:?} is not a byte count")))?;
    }
    config.validate()?;
    Ok(config)
  }

  pub fn with_backing_root(mut self, root: impl Into<PathBuf>) -> Self {
    self.backing_root = root.into();
    self
  }

  pub fn with_segment_bytes(mut self, bytes: usize) -> Self {
    self.segment_bytes = bytes;
    self
  }

  pub fn with_batch_bytes(mut self, bytes: usize) -> Self {
    self.batch_bytes = bytes;
    self
  }

  pub fn with_min_batch_blocks(mut self, blocks: usize) -> Self {
    self.min_batch_blocks = blocks;
    self
  }

  pub fn validate(&self) -> Result<()> {
    if self.segment_bytes == 0 || self.segment_bytes % PAGE_SIZE != 0 {
      return Err(NoomrError::Config(format!(
        "segment_bytes {} must be a non-zero multiple of {PAGE_SIZE}",
        self.segment_bytes
      )));
    }
    if self.batch_bytes == 0 && self.min_batch_blocks == 0 {
      return Err(NoomrError::Config("growth batch would hold no blocks".into()));
    }
    if self.backing_root.as_os_str().is_empty() {
      return Err(NoomrError::Config("backing_root is empty".into()));
    }
    Ok(())
  }

  /// Number of blocks one growth of `block_size` creates.
  pub(crate) fn batch_blocks(&self, block_size: usize) -> usize {
    (self.batch_bytes / block_size).max(self.min_batch_blocks).max(1)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.backing_root, PathBuf::from("/tmp/bop"));
  }

  #[test]
  fn rejects_unaligned_segment() {
    let config = Config::default().with_segment_bytes(PAGE_SIZE + 1);
    assert!(matches!(config.validate(), Err(NoomrError::Config(_))));
    let config = Config::default().with_segment_bytes(0);
    assert!(config.validate().is_err());
  }

  #[test]
  fn batch_sizing() {
    let config = Config::default();
    assert_eq!(config.batch_blocks(16), 64);
    assert_eq!(config.batch_blocks(512), 5);
    assert_eq!(config.batch_blocks(4096), 5);

    let config = config.with_batch_bytes(8192).with_min_batch_blocks(1);
    assert_eq!(config.batch_blocks(16), 512);
    assert_eq!(config.batch_blocks(4096), 2);
    assert!(config.with_batch_bytes(0).with_min_batch_blocks(0).validate().is_err());
  }

  // The only test touching the process environment.
  #[test]
  fn environment_overrides_defaults() {
    unsafe {
      env::set_var(ENV_BACKING_ROOT, "/var/tmp/noomr-config-test");
      env::set_var(ENV_SEGMENT_BYTES, " 8388608 ");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.backing_root, PathBuf::from("/var/tmp/noomr-config-test"));
    assert_eq!(config.segment_bytes, 8 << 20);
    assert_eq!(config.batch_bytes, DEFAULT_BATCH_BYTES);

    unsafe { env::set_var(ENV_SEGMENT_BYTES, "lots") };
    assert!(matches!(Config::from_env(), Err(NoomrError::Config(_))));
    unsafe { env::set_var(ENV_SEGMENT_BYTES, "4097") };
    assert!(matches!(Config::from_env(), Err(NoomrError::Config(_))));

    unsafe {
      env::remove_var(ENV_BACKING_ROOT);
      env::remove_var(ENV_SEGMENT_BYTES);
    }
    assert_eq!(Config::from_env().unwrap(), Config::default());
  }
}
