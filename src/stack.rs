//! Lock-free free-list stacks of header records.
//!
//! Every header record carries two next-links, one per epoch. A stack is addressed by
//! (size class, epoch) and threads its nodes through that epoch's link only, so the same record
//! can sit in the committed free list and, independently, in the speculative one.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicU64, Ordering},
};

use crate::{ADDRESS_BITS, header::HeaderRecord, util::retry};

const PTR_MASK: u64 = (1 << ADDRESS_BITS) - 1;
const TAG_SHIFT: u32 = ADDRESS_BITS;

/// Which view of free-list membership an operation works on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Epoch {
  /// Tentative state of a running speculative episode.
  Speculative,
  /// Committed state.
  Sequential,
}

impl Epoch {
  #[inline]
  pub fn current(speculating: bool) -> Self {
    if speculating { Epoch::Speculative } else { Epoch::Sequential }
  }
}

/// Treiber stack whose top packs the node address (low 48 bits) with a version tag (high 16
/// bits). The tag changes on every push and pop, so a pop holding a stale top cannot succeed
/// after the node was popped and pushed back in between.
#[repr(transparent)]
pub(crate) struct EpochStack {
  top: AtomicU64,
}

#[inline]
fn unpack_node(packed: u64) -> *mut HeaderRecord {
  (packed & PTR_MASK) as *mut HeaderRecord
}

#[inline]
fn pack_next(node: *mut HeaderRecord, previous: u64) -> u64 {
  let addr = node as u64;
  debug_assert!(addr & !PTR_MASK == 0, "header {node:p} exceeds {ADDRESS_BITS} bits");
  let tag = (previous >> TAG_SHIFT).wrapping_add(1);
  addr | (tag << TAG_SHIFT)
}

impl EpochStack {
  pub(crate) const fn new() -> Self {
    Self {
      top: AtomicU64::new(0),
    }
  }

  /// # Safety
  /// `node` must be a header record in a mapped metadata page, not currently linked into any
  /// stack of `epoch`.
  pub(crate) unsafe fn push(&self, node: NonNull<HeaderRecord>, epoch: Epoch) {
    let link = unsafe { node.as_ref() }.link(epoch);
    retry(|| {
      let packed = self.top.load(Ordering::Relaxed);
      link.store(unpack_node(packed), Ordering::Relaxed);
      self
        .top
        .compare_exchange_weak(packed, pack_next(node.as_ptr(), packed), Ordering::Release, Ordering::Relaxed)
        .ok()
    });
  }

  /// Pops the top node, or `None` when the stack is observed empty.
  ///
  /// `reveal` runs after a top has been observed and before it is dereferenced. Tasks in other
  /// processes may push headers from metadata pages this task has not mapped yet; `reveal` is
  /// where the caller catches up on them.
  ///
  /// # Safety
  /// Every node reachable from this stack must be a header record in a metadata page that is
  /// mapped once `reveal` returns.
  pub(crate) unsafe fn pop<E>(
    &self,
    epoch: Epoch,
    mut reveal: impl FnMut() -> Result<(), E>,
  ) -> Result<Option<NonNull<HeaderRecord>>, E> {
    let mut failure = None;
    let popped = retry(|| {
      let packed = self.top.load(Ordering::Acquire);
      let Some(node) = NonNull::new(unpack_node(packed)) else {
        return Some(None);
      };
      if let Err(err) = reveal() {
        failure = Some(err);
        return Some(None);
      }
      let next = unsafe { node.as_ref() }.link(epoch).load(Ordering::Acquire);
      self
        .top
        .compare_exchange_weak(packed, pack_next(next, packed), Ordering::AcqRel, Ordering::Relaxed)
        .ok()
        .map(|_| Some(node))
    });
    match failure {
      Some(err) => Err(err),
      None => Ok(popped),
    }
  }

  #[cfg(test)]
  pub(crate) fn peek(&self) -> Option<NonNull<HeaderRecord>> {
    NonNull::new(unpack_node(self.top.load(Ordering::Acquire)))
  }

  /// Makes this stack's top a copy of `other`'s. Only valid at an epoch boundary, with no
  /// concurrent push or pop on either stack.
  pub(crate) fn mirror(&self, other: &EpochStack) {
    self.top.store(other.top.load(Ordering::Acquire), Ordering::Release);
  }
}
