//! Per-task handle and the allocation entry points.

use core::{cell::Cell, ptr::NonNull};

use crate::{
  Result,
  chain::PageName,
  error::fatal,
  header::{BlockPrefix, HeaderRecord},
  large::{HUGE_HEADER, HugeHeader},
  oracle::{Sequential, SpeculationMode},
  shared::{ControlBlock, SharedHeap},
  size_class::{self, MAX_SIZE},
  stack::Epoch,
};

/// One execution context allocating from a [`SharedHeap`].
///
/// Holds the task-local half of the allocator state: how much segment this task grew during
/// the current episode, how far into the segment it has made memory accessible, and how far
/// along the metadata chain it has caught up. A `Task` belongs to one thread.
pub struct Task<'h, M: SpeculationMode = Sequential> {
  heap: &'h SharedHeap,
  mode: M,
  /// Bytes grown while speculating since the last `begin_speculation`.
  pub(crate) my_growth: Cell<usize>,
  /// Segment offset up to which this task has made pages accessible. Page aligned.
  pub(crate) brk: Cell<usize>,
  /// Last metadata page this task has caught up to, 0 before the first.
  pub(crate) header_cursor: Cell<usize>,
  /// Same for the huge block chain.
  pub(crate) huge_cursor: Cell<usize>,
}

impl<'h, M: SpeculationMode> Task<'h, M> {
  pub(crate) fn new(heap: &'h SharedHeap, mode: M) -> Self {
    Self {
      heap,
      mode,
      my_growth: Cell::new(0),
      brk: Cell::new(0),
      header_cursor: Cell::new(0),
      huge_cursor: Cell::new(0),
    }
  }

  #[inline]
  pub fn heap(&self) -> &'h SharedHeap {
    self.heap
  }

  #[inline]
  pub fn mode(&self) -> &M {
    &self.mode
  }

  #[inline]
  pub fn speculating(&self) -> bool {
    self.mode.speculating()
  }

  /// Free-list epoch selected by the current speculation mode.
  #[inline]
  pub fn epoch(&self) -> Epoch {
    Epoch::current(self.speculating())
  }

  /// Bytes this task grew the segment by since its last `begin_speculation`.
  pub fn my_growth(&self) -> usize {
    self.my_growth.get()
  }

  #[inline]
  pub(crate) fn control(&self) -> &'h ControlBlock {
    self.heap.control()
  }

  /// Name for a page mapped now: a fresh one while speculating, anonymous otherwise.
  pub(crate) fn page_name(&self) -> Result<PageName> {
    if self.speculating() {
      self.control().next_name()
    } else {
      Ok(PageName::ANONYMOUS)
    }
  }

  /// Allocates `size` bytes, aborting the process if the OS refuses memory.
  pub fn allocate(&self, size: usize) -> NonNull<u8> {
    self.try_allocate(size).unwrap_or_else(|err| fatal(err))
  }

  /// Allocates `size` bytes. Sizes above [`MAX_SIZE`] get their own mapping, everything else
  /// a block of the matching size class.
  pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>> {
    let control = self.control();
    if size > MAX_SIZE {
      control.stats.record_allocation(None);
      return self.allocate_large(size);
    }

    let class = size_class::size_to_class(size_class::align(size));
    control.stats.record_allocation(Some(class));
    loop {
      let epoch = self.epoch();
      let popped = unsafe { control.stack(class, epoch).pop(epoch, || self.sync_headers().map(drop)) }?;
      match popped {
        Some(header) => return self.hand_out(header),
        None => self.grow(class)?,
      }
    }
  }

  /// Turns a header popped off a free list into the caller-visible payload.
  fn hand_out(&self, header: NonNull<HeaderRecord>) -> Result<NonNull<u8>> {
    let record = unsafe { header.as_ref() };
    let payload = record.payload();
    debug_assert!(!payload.is_null(), "hand_out: header {header:p} has no block");

    // The block may come from another task's growth: make it accessible here and point its
    // prefix at the header in this task's copy of the segment.
    let end = payload as usize + record.size() - self.control().segment_base;
    self.extend_segment(end)?;
    unsafe {
      BlockPrefix::stamp(payload, header.as_ptr());
      Ok(NonNull::new_unchecked(payload))
    }
  }

  /// Returns `payload` to the allocator: huge blocks are unmapped, small blocks pushed onto the
  /// free list of their class for the current epoch.
  ///
  /// # Safety
  /// `payload` must come from `allocate` on this heap and not have been released since.
  pub unsafe fn release(&self, payload: NonNull<u8>) {
    let control = self.control();
    control.stats.record_free();
    if !self.heap.contains(payload.as_ptr()) {
      unsafe { self.release_large(payload) };
      return;
    }

    let header = unsafe { BlockPrefix::header_of(payload.as_ptr()) };
    debug_assert!(!header.is_null(), "release: {payload:p} has no header");
    let Some(header) = NonNull::new(header) else {
      log::warn!("release: {payload:p} has no header, ignored");
      return;
    };
    let class = size_class::size_to_class(unsafe { header.as_ref() }.size());
    let epoch = self.epoch();
    unsafe { control.stack(class, epoch).push(header, epoch) };
  }

  /// Bytes usable at `payload`, at least what was requested.
  ///
  /// # Safety
  /// `payload` must be a live allocation from this heap.
  pub unsafe fn usable_size(&self, payload: NonNull<u8>) -> usize {
    if self.heap.contains(payload.as_ptr()) {
      let header = unsafe { BlockPrefix::header_of(payload.as_ptr()) };
      debug_assert!(!header.is_null());
      unsafe { header.as_ref() }.map_or(0, HeaderRecord::size)
    } else {
      unsafe { HugeHeader::of(payload) }.total_size() - HUGE_HEADER
    }
  }
}
