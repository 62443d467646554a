//! Running statistics kept in the shared control block.
//!
//! Counting is compiled in with the `stats` feature. Without it the counters stay at zero.

use core::{
  fmt,
  sync::atomic::{AtomicU64, Ordering},
};

use crate::size_class::{NUM_CLASSES, class_to_size};

#[repr(C)]
pub(crate) struct Stats {
  mapped_bytes: AtomicU64,
  allocations: AtomicU64,
  frees: AtomicU64,
  grows: AtomicU64,
  huge_allocations: AtomicU64,
  header_pages: AtomicU64,
  per_class: [AtomicU64; NUM_CLASSES],
}

#[inline(always)]
fn bump(counter: &AtomicU64, by: u64) {
  if cfg!(feature = "stats") {
    counter.fetch_add(by, Ordering::Relaxed);
  }
}

impl Stats {
  pub(crate) const fn new() -> Self {
    Self {
      mapped_bytes: AtomicU64::new(0),
      allocations: AtomicU64::new(0),
      frees: AtomicU64::new(0),
      grows: AtomicU64::new(0),
      huge_allocations: AtomicU64::new(0),
      header_pages: AtomicU64::new(0),
      per_class: [const { AtomicU64::new(0) }; NUM_CLASSES],
    }
  }

  /// `class` is `None` for requests served by the large-block path.
  #[inline]
  pub(crate) fn record_allocation(&self, class: Option<usize>) {
    bump(&self.allocations, 1);
    if let Some(class) = class {
      bump(&self.per_class[class], 1);
    }
  }

  #[inline]
  pub(crate) fn record_free(&self) {
    bump(&self.frees, 1);
  }

  #[inline]
  pub(crate) fn record_grow(&self) {
    bump(&self.grows, 1);
  }

  #[inline]
  pub(crate) fn record_huge(&self) {
    bump(&self.huge_allocations, 1);
  }

  #[inline]
  pub(crate) fn record_header_page(&self) {
    bump(&self.header_pages, 1);
  }

  #[inline]
  pub(crate) fn record_mapped(&self, bytes: usize) {
    bump(&self.mapped_bytes, bytes as u64);
  }

  pub(crate) fn snapshot(&self) -> StatsSnapshot {
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
    StatsSnapshot {
      mapped_bytes: load(&self.mapped_bytes),
      allocations: load(&self.allocations),
      frees: load(&self.frees),
      grows: load(&self.grows),
      huge_allocations: load(&self.huge_allocations),
      header_pages: load(&self.header_pages),
      per_class: core::array::from_fn(|class| load(&self.per_class[class])),
    }
  }
}

/// Point-in-time copy of the heap statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
  /// Bytes requested from the OS for metadata pages and huge blocks.
  pub mapped_bytes: u64,
  pub allocations: u64,
  pub frees: u64,
  /// Data segment growths.
  pub grows: u64,
  pub huge_allocations: u64,
  pub header_pages: u64,
  pub per_class: [u64; NUM_CLASSES],
}

impl fmt::Display for StatsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "NOOMR stats")?;
    writeln!(f, "mapped bytes: {}", self.mapped_bytes)?;
    writeln!(f, "allocations: {}", self.allocations)?;
    writeln!(f, "frees: {}", self.frees)?;
    writeln!(f, "grows: {}", self.grows)?;
    writeln!(f, "huge allocations: {}", self.huge_allocations)?;
    write!(f, "header pages: {}", self.header_pages)?;
    for (class, count) in self.per_class.iter().enumerate().filter(|(_, count)| **count > 0) {
      write!(f, "\nclass {class} ({} bytes) allocations: {count}", class_to_size(class))?;
    }
    Ok(())
  }
}
