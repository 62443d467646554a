//! Growth of the data segment.
//!
//! The segment is one address range reserved when the heap is created and shared by all tasks.
//! A growth claims a disjoint piece of it with a compare-and-swap on the shared top, so tasks
//! never hand out the same bytes. Pages claimed by another task are made accessible here only when a block in them is
//! handed out.

use core::sync::atomic::Ordering;

use crate::{
  NoomrError, Result,
  header::BLOCK_PREFIX,
  oracle::SpeculationMode,
  os,
  size_class::class_to_size,
  task::Task,
  util::{page_align, retry},
};

impl<M: SpeculationMode> Task<'_, M> {
  /// Carves a batch of fresh blocks of `class` out of the segment and pushes them onto the free
  /// list of the current epoch.
  pub(crate) fn grow(&self, class: usize) -> Result<()> {
    let control = self.control();
    let size = class_to_size(class);
    let blocks = self.heap().config().batch_blocks(size);
    let region = (BLOCK_PREFIX + size) * blocks;

    let offset = self.reserve(region)?;
    if self.speculating() {
      control.spec_growth.fetch_add(region, Ordering::AcqRel);
      self.my_growth.set(self.my_growth.get() + region);
    }

    self.extend_segment(offset + region)?;
    control.stats.record_grow();
    log::trace!("grew class {class}: {blocks} blocks of {size} bytes at offset {offset}");

    let epoch = self.epoch();
    self.map_headers(
      control.segment_base + offset,
      size,
      blocks,
      control.stack(class, epoch),
      epoch,
    )
  }

  /// Claims `len` bytes at the top of the segment and returns their offset. The top only moves
  /// when the claim fits, so a failed growth leaves room for smaller ones.
  fn reserve(&self, len: usize) -> Result<usize> {
    let control = self.control();
    retry(|| {
      let offset = control.segment_top.load(Ordering::Acquire);
      let end = match offset.checked_add(len) {
        Some(end) if end <= control.segment_bytes => end,
        _ => {
          return Some(Err(NoomrError::SegmentExhausted {
            requested: len,
            offset,
            reserved: control.segment_bytes,
          }));
        }
      };
      control
        .segment_top
        .compare_exchange_weak(offset, end, Ordering::AcqRel, Ordering::Acquire)
        .ok()
        .map(|_| Ok(offset))
    })
  }

  /// Makes the segment accessible in this task up to offset `end`.
  pub(crate) fn extend_segment(&self, end: usize) -> Result<()> {
    let brk = self.brk.get();
    if end <= brk {
      return Ok(());
    }

    let new_brk = page_align(end);
    let addr = self.control().segment_base + brk;
    let len = new_brk - brk;
    unsafe { os::os_protect_rw(addr, len) }.map_err(|source| NoomrError::Grow { addr, len, source })?;
    self.brk.set(new_brk);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    Config, PAGE_SIZE, Sequential, SharedHeap, SpeculationFlag,
    size_class::{NUM_CLASSES, size_to_class},
    stack::Epoch,
  };

  fn heap(segment_bytes: usize) -> SharedHeap {
    SharedHeap::create(Config::default().with_segment_bytes(segment_bytes)).unwrap()
  }

  fn stack_len(heap: &SharedHeap, class: usize, epoch: Epoch) -> usize {
    let mut len = 0;
    let mut node = heap.control().stack(class, epoch).peek();
    while let Some(header) = node {
      len += 1;
      node = core::ptr::NonNull::new(unsafe { header.as_ref() }.link(epoch).load(Ordering::Relaxed));
    }
    len
  }

  #[test]
  fn growth_fills_the_free_list() {
    let heap = heap(16 << 20);
    let task = heap.task(Sequential);
    let class = size_to_class(64);
    task.grow(class).unwrap();

    let blocks = heap.config().batch_blocks(64);
    assert_eq!(blocks, 16);
    assert_eq!(stack_len(&heap, class, Epoch::Sequential), blocks);
    assert_eq!(stack_len(&heap, class, Epoch::Speculative), 0);
    assert_eq!(heap.segment_used(), blocks * (BLOCK_PREFIX + 64));
    assert_eq!(task.brk.get(), page_align(heap.segment_used()));
    assert_eq!(heap.spec_growth(), 0);
  }

  #[test]
  fn largest_class_gets_the_minimum_batch() {
    let heap = heap(16 << 20);
    let task = heap.task(Sequential);
    task.grow(NUM_CLASSES - 1).unwrap();
    assert_eq!(stack_len(&heap, NUM_CLASSES - 1, Epoch::Sequential), 5);
    assert_eq!(heap.segment_used(), 5 * (BLOCK_PREFIX + 4096));
  }

  #[test]
  fn speculative_growth_is_accounted() {
    let dir = tempfile::tempdir().unwrap();
    let heap = SharedHeap::create(
      Config::default()
        .with_backing_root(dir.path())
        .with_segment_bytes(16 << 20),
    )
    .unwrap();
    let flag = SpeculationFlag::new();
    flag.set(true);
    let task = heap.task(&flag);
    let class = size_to_class(256);
    task.grow(class).unwrap();

    let region = heap.segment_used();
    assert_eq!(heap.spec_growth(), region);
    assert_eq!(task.my_growth(), region);
    assert_eq!(stack_len(&heap, class, Epoch::Speculative), 5);
    assert_eq!(stack_len(&heap, class, Epoch::Sequential), 0);
  }

  #[test]
  fn exhausted_segment_is_reported() {
    let heap = heap(PAGE_SIZE);
    let task = heap.task(Sequential);
    let err = task.grow(NUM_CLASSES - 1).unwrap_err();
    assert!(matches!(err, NoomrError::SegmentExhausted { reserved, .. } if reserved == PAGE_SIZE));
    assert_eq!(heap.segment_used(), 0);
  }

  #[test]
  fn failed_growth_leaves_room_for_smaller_ones() {
    let heap = heap(4 * PAGE_SIZE);
    let task = heap.task(Sequential);

    let err = task.try_allocate(4096).unwrap_err();
    assert!(matches!(err, NoomrError::SegmentExhausted { .. }));
    assert!(heap.segment_used() <= heap.config().segment_bytes);
    assert_eq!(heap.segment_used(), 0);

    let block = task.try_allocate(16).unwrap();
    assert!(heap.contains(block.as_ptr()));
    assert!(heap.segment_used() <= heap.config().segment_bytes);
  }

  #[test]
  fn extending_is_monotonic() {
    let heap = heap(16 << 20);
    let task = heap.task(Sequential);
    task.extend_segment(10).unwrap();
    assert_eq!(task.brk.get(), PAGE_SIZE);
    task.extend_segment(5).unwrap();
    assert_eq!(task.brk.get(), PAGE_SIZE);
    task.extend_segment(3 * PAGE_SIZE + 1).unwrap();
    assert_eq!(task.brk.get(), 4 * PAGE_SIZE);

    let base = heap.control().segment_base as *mut u8;
    unsafe {
      base.add(4 * PAGE_SIZE - 1).write(1);
      assert_eq!(base.add(4 * PAGE_SIZE - 1).read(), 1);
    }
  }
}
