//! Header records, the metadata pages holding them, and the prefix linking a small block back to
//! its header.
//!
//! Small blocks live in the data segment as `[BlockPrefix][payload]`. Their metadata does not:
//! it lives in shared metadata pages, bump-allocated and never reclaimed, so every task can walk
//! and rewrite the free-list links of every block regardless of who grew it.

use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::{
  PAGE_SIZE, Result,
  chain::{ChainNode, PageKind},
  oracle::SpeculationMode,
  os::Sharing,
  size_class,
  stack::{Epoch, EpochStack},
  task::Task,
};

/// Per-block metadata: the class-canonical block size, the payload address and one free-list
/// link per epoch.
#[repr(C)]
pub(crate) struct HeaderRecord {
  size: AtomicUsize,
  block: AtomicPtr<u8>,
  spec_next: AtomicPtr<HeaderRecord>,
  seq_next: AtomicPtr<HeaderRecord>,
}

impl HeaderRecord {
  pub(crate) const fn new() -> Self {
    Self {
      size: AtomicUsize::new(0),
      block: AtomicPtr::new(null_mut()),
      spec_next: AtomicPtr::new(null_mut()),
      seq_next: AtomicPtr::new(null_mut()),
    }
  }

  #[inline]
  pub(crate) fn link(&self, epoch: Epoch) -> &AtomicPtr<HeaderRecord> {
    match epoch {
      Epoch::Speculative => &self.spec_next,
      Epoch::Sequential => &self.seq_next,
    }
  }

  #[inline]
  pub(crate) fn size(&self) -> usize {
    self.size.load(Ordering::Relaxed)
  }

  #[inline]
  pub(crate) fn payload(&self) -> *mut u8 {
    self.block.load(Ordering::Relaxed)
  }

  /// Binds a freshly claimed record to its block. Clearing the sequential link does not touch
  /// committed state: a record is only reachable from a free list after this.
  fn bind(&self, size: usize, payload: *mut u8) {
    self.size.store(size, Ordering::Relaxed);
    self.block.store(payload, Ordering::Relaxed);
    self.spec_next.store(null_mut(), Ordering::Relaxed);
    self.seq_next.store(null_mut(), Ordering::Relaxed);
  }

  /// Speculative link := sequential link.
  pub(crate) fn synch(&self) {
    self.spec_next.store(self.seq_next.load(Ordering::Relaxed), Ordering::Relaxed);
  }

  /// Sequential link := speculative link. The only place a sequential link is written during an
  /// episode.
  pub(crate) fn promote(&self) {
    self.seq_next.store(self.spec_next.load(Ordering::Relaxed), Ordering::Relaxed);
  }
}

pub(crate) const HEADERS_PER_PAGE: usize =
  (PAGE_SIZE - size_of::<ChainNode>() - size_of::<AtomicUsize>()) / size_of::<HeaderRecord>();

/// One OS page of header records. Starts with its chain node, so a page address is also the
/// address of its link to the next metadata page.
#[repr(C)]
pub(crate) struct HeaderPage {
  node: ChainNode,
  /// Bump index. Only ever incremented; values past capacity are failed claims.
  next_free: AtomicUsize,
  headers: [HeaderRecord; HEADERS_PER_PAGE],
}

const _: () = assert!(size_of::<HeaderPage>() <= PAGE_SIZE);
const _: () = assert!(core::mem::offset_of!(HeaderPage, node) == 0);
const _: () = assert!(HEADERS_PER_PAGE >= 64);

impl HeaderPage {
  /// # Safety
  /// `page` must be a mapped, published metadata page.
  #[inline]
  pub(crate) unsafe fn at<'a>(page: NonNull<u8>) -> &'a HeaderPage {
    unsafe { page.cast::<HeaderPage>().as_ref() }
  }

  #[inline]
  pub(crate) fn node(&self) -> &ChainNode {
    &self.node
  }

  #[inline]
  fn is_sealed(&self) -> bool {
    self.next_free.load(Ordering::Relaxed) >= HEADERS_PER_PAGE
  }

  /// Records claimed so far.
  pub(crate) fn claimed(&self) -> &[HeaderRecord] {
    let claimed = self.next_free.load(Ordering::Acquire).min(HEADERS_PER_PAGE);
    &self.headers[..claimed]
  }
}

/// Sits right before every small payload.
#[repr(C, align(16))]
pub(crate) struct BlockPrefix {
  header: *mut HeaderRecord,
}

pub(crate) const BLOCK_PREFIX: usize = size_of::<BlockPrefix>();

const _: () = assert!(BLOCK_PREFIX == size_class::MIN_ALIGN);

impl BlockPrefix {
  /// # Safety
  /// `payload` must be a small-block payload in accessible segment memory.
  #[inline]
  pub(crate) unsafe fn stamp(payload: *mut u8, header: *mut HeaderRecord) {
    unsafe {
      let prefix = payload.sub(BLOCK_PREFIX).cast::<BlockPrefix>();
      (*prefix).header = header;
    }
  }

  /// # Safety
  /// `payload` must be a small-block payload handed out by this task's heap.
  #[inline]
  pub(crate) unsafe fn header_of(payload: *mut u8) -> *mut HeaderRecord {
    unsafe { (*payload.sub(BLOCK_PREFIX).cast::<BlockPrefix>()).header }
  }
}

// =============================================================================
// Metadata Page Allocator
// =============================================================================

impl<M: SpeculationMode> Task<'_, M> {
  fn allocate_header_page(&self) -> Result<()> {
    let name = self.page_name()?;
    // Fresh mappings are zero-filled; the page is not cleared after publication because other
    // tasks may already be claiming slots in it.
    let page = self.allocate_page(PageKind::Header, name, PAGE_SIZE, Sharing::Shared)?;
    self.control().stats.record_header_page();
    log::trace!("header page {:p} published ({name})", page);
    Ok(())
  }

  /// Claims one unused header record from the last metadata page, appending a page when the
  /// chain is empty or the last page is sealed.
  fn claim_header(&self) -> Result<NonNull<HeaderRecord>> {
    loop {
      let tail = self.sync_headers()?;
      let page = match tail.page {
        Some(page) => unsafe { HeaderPage::at(page) },
        None => {
          self.allocate_header_page()?;
          continue;
        }
      };
      if page.is_sealed() {
        self.allocate_header_page()?;
        continue;
      }

      // The capacity check above races with other claimers; an index past the end is dropped.
      let index = page.next_free.fetch_add(1, Ordering::AcqRel);
      if let Some(header) = page.headers.get(index) {
        return Ok(NonNull::from(header));
      }
      log::debug!("header slot {index} of {:p} past capacity, retrying", page);
    }
  }

  /// Splits `count` blocks of `block_size` starting at `base`, gives each a header and pushes it
  /// onto `stack`.
  pub(crate) fn map_headers(
    &self,
    base: usize,
    block_size: usize,
    count: usize,
    stack: &EpochStack,
    epoch: Epoch,
  ) -> Result<()> {
    debug_assert!(block_size == size_class::align(block_size));
    let stride = BLOCK_PREFIX + block_size;
    for i in 0..count {
      let header = self.claim_header()?;
      let payload = (base + i * stride + BLOCK_PREFIX) as *mut u8;
      unsafe {
        header.as_ref().bind(block_size, payload);
        BlockPrefix::stamp(payload, header.as_ptr());
        stack.push(header, epoch);
      }
    }
    Ok(())
  }

  /// Visits every claimed header record of every metadata page.
  pub(crate) fn for_each_header(&self, mut f: impl FnMut(&HeaderRecord)) -> Result<()> {
    self.sync_headers()?;
    let mut node = &self.control().header_chain;
    while let Some(page) = node.next.load().page() {
      let page = unsafe { HeaderPage::at(page) };
      page.claimed().iter().for_each(&mut f);
      node = page.node();
    }
    Ok(())
  }
}
