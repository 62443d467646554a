//! The speculation-mode oracle.
//!
//! Whether a task is currently speculating is decided outside the allocator. The allocator asks
//! before every mapping, growth and free-list selection.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait SpeculationMode {
  /// `true` while the task runs inside a speculative episode.
  fn speculating(&self) -> bool;
}

/// A task that never speculates.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl SpeculationMode for Sequential {
  #[inline]
  fn speculating(&self) -> bool {
    false
  }
}

/// Speculation state toggled by the embedding runtime.
#[derive(Debug, Default)]
pub struct SpeculationFlag {
  active: AtomicBool,
}

impl SpeculationFlag {
  pub const fn new() -> Self {
    Self {
      active: AtomicBool::new(false),
    }
  }

  pub fn set(&self, speculating: bool) {
    self.active.store(speculating, Ordering::Release);
  }
}

impl SpeculationMode for SpeculationFlag {
  #[inline]
  fn speculating(&self) -> bool {
    self.active.load(Ordering::Acquire)
  }
}

impl<M: SpeculationMode + ?Sized> SpeculationMode for &M {
  fn speculating(&self) -> bool {
    (**self).speculating()
  }
}

impl<M: SpeculationMode + ?Sized> SpeculationMode for Arc<M> {
  fn speculating(&self) -> bool {
    (**self).speculating()
  }
}
