//! Blocks above the largest size class, each in its own mapping.
//!
//! Outside speculation a huge block is a private anonymous mapping that nobody else needs to
//! know about. While speculating it is file-backed and published on the huge chain so the other
//! tasks of the heap can reach it. Released published blocks keep their first page, which
//! holds the chain link, and give the rest back.

use core::{
  mem::size_of,
  ptr::NonNull,
  sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use crate::{
  NoomrError, PAGE_SIZE, Result,
  chain::{ChainNode, PageKind, PageName},
  oracle::SpeculationMode,
  os::{self, Sharing},
  task::Task,
};

/// Sits at the start of every huge block's mapping. Every field after `node` may be read by
/// other tasks as soon as the block is published.
#[repr(C, align(16))]
pub(crate) struct HugeHeader {
  node: ChainNode,
  total: AtomicUsize,
  name: AtomicU32,
  released: AtomicBool,
}

pub(crate) const HUGE_HEADER: usize = size_of::<HugeHeader>();

const _: () = assert!(HUGE_HEADER == 32);
const _: () = assert!(HUGE_HEADER < PAGE_SIZE);

impl HugeHeader {
  /// # Safety
  /// `payload` must be a live huge block returned by `allocate_large`.
  #[inline]
  pub(crate) unsafe fn of<'a>(payload: NonNull<u8>) -> &'a HugeHeader {
    unsafe { payload.sub(HUGE_HEADER).cast::<HugeHeader>().as_ref() }
  }

  /// Bytes of the whole mapping, header included.
  #[inline]
  pub(crate) fn total_size(&self) -> usize {
    self.total.load(Ordering::Acquire)
  }

  #[inline]
  fn name(&self) -> PageName {
    PageName::new(self.name.load(Ordering::Acquire)).unwrap_or(PageName::ANONYMOUS)
  }

  #[inline]
  fn region(&self) -> *mut u8 {
    self as *const HugeHeader as *mut u8
  }
}

/// Gives back everything but the first page of a released huge block mapped at `page`.
///
/// # Safety
/// `page` must be a published huge block mapped in this task.
pub(crate) unsafe fn trim_if_released(page: NonNull<u8>) {
  let header = unsafe { page.cast::<HugeHeader>().as_ref() };
  let total = header.total_size();
  if header.released.load(Ordering::Acquire) && total > PAGE_SIZE {
    unsafe { os::os_munmap(page.as_ptr().add(PAGE_SIZE), total - PAGE_SIZE) };
    log::trace!("trimmed released huge block {:p} ({total} bytes)", page);
  }
}

impl<M: SpeculationMode> Task<'_, M> {
  /// Maps a block of its own for `size` bytes, rounded with its header to whole pages.
  pub fn allocate_large(&self, size: usize) -> Result<NonNull<u8>> {
    let total = size
      .checked_add(HUGE_HEADER)
      .and_then(|total| total.checked_next_multiple_of(PAGE_SIZE))
      .ok_or(NoomrError::TooLarge { size })?;

    let name = self.page_name()?;
    let stamp = |region: NonNull<u8>, _: usize| {
      let header = unsafe { region.cast::<HugeHeader>().as_ref() };
      header.total.store(total, Ordering::Relaxed);
      header.name.store(name.get(), Ordering::Relaxed);
    };
    let region = if name.is_anonymous() {
      let (region, _) = self.map_page(name, total, Sharing::Private)?;
      stamp(region, total);
      region
    } else {
      self.allocate_page_with(PageKind::Huge, name, total, Sharing::Shared, stamp)?
    };

    self.control().stats.record_huge();
    log::trace!("huge block {:p}: {size} bytes requested, {total} mapped ({name})", region);
    Ok(unsafe { region.add(HUGE_HEADER) })
  }

  /// Returns a huge block to the OS. A published block stays on the chain as a one-page
  /// tombstone.
  ///
  /// # Safety
  /// `payload` must be a live huge block returned by `allocate_large` on this heap.
  pub unsafe fn release_large(&self, payload: NonNull<u8>) {
    let header = unsafe { HugeHeader::of(payload) };
    let total = header.total_size();
    let name = header.name();
    if name.is_anonymous() {
      unsafe { os::os_munmap(header.region(), total) };
    } else {
      header.released.store(true, Ordering::Release);
      if total > PAGE_SIZE {
        unsafe { os::os_munmap(header.region().add(PAGE_SIZE), total - PAGE_SIZE) };
      }
    }
    log::trace!("released huge block {:p} ({total} bytes, {name})", header.region());
  }
}
