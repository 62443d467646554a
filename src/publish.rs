//! Publication of shared pages and the catch-up that makes them visible to other tasks.
//!
//! A page is published by a compare-and-swap on the empty link at the end of its chain, so the
//! chains only ever grow at the tail. Tasks that did not map a published page themselves (forked
//! tasks in other processes) find it unmapped while walking and re-map its backing file at the
//! published address.

use core::{cell::Cell, ptr::NonNull};

use crate::{
  NoomrError, PAGE_SIZE, Result,
  chain::{ChainLink, ChainNode, PageKind, PageName},
  large::trim_if_released,
  oracle::SpeculationMode,
  os::{self, Sharing},
  task::Task,
  util::page_align,
};

/// End of a chain as seen by one task: the last node and, unless the chain is empty, the page it
/// lives in.
pub(crate) struct Tail<'a> {
  pub(crate) node: &'a ChainNode,
  pub(crate) page: Option<NonNull<u8>>,
}

impl<'h, M: SpeculationMode> Task<'h, M> {
  /// Maps every metadata page published since the last catch-up and returns the chain's tail.
  pub(crate) fn sync_headers(&self) -> Result<Tail<'h>> {
    self.sync_chain(&self.control().header_chain, &self.header_cursor, |_| {})
  }

  /// Same for huge blocks. A released block re-mapped here is trimmed back to its first page.
  pub(crate) fn sync_huge(&self) -> Result<Tail<'h>> {
    self.sync_chain(&self.control().huge_chain, &self.huge_cursor, |page| unsafe {
      trim_if_released(page)
    })
  }

  fn sync_chain(
    &self,
    head: &'h ChainNode,
    cursor: &Cell<usize>,
    mut remapped: impl FnMut(NonNull<u8>),
  ) -> Result<Tail<'h>> {
    // The cursor page was mapped by this task, and the first page of a chained region is never
    // unmapped, so the walk can resume there.
    let mut tail = match NonNull::new(cursor.get() as *mut u8) {
      Some(page) => Tail {
        node: unsafe { ChainNode::at(page) },
        page: Some(page),
      },
      None => Tail { node: head, page: None },
    };

    loop {
      let link = tail.node.next.load();
      let Some(page) = link.page() else {
        return Ok(tail);
      };
      if !os::is_mapped(link.addr()) {
        self.map_published(link)?;
        remapped(page);
      }
      tail = Tail {
        node: unsafe { ChainNode::at(page) },
        page: Some(page),
      };
      cursor.set(link.addr());
    }
  }

  /// Maps the backing file of a page published by another task at its published address.
  fn map_published(&self, link: ChainLink) -> Result<()> {
    let addr = link.addr();
    if link.name().is_anonymous() {
      return Err(NoomrError::UnreachablePage { addr });
    }

    let (file, size) = self.heap().backing().open(link.name())?;
    unsafe { os::os_mmap_fixed(addr, size, &file) }.map_err(|source| NoomrError::Remap { addr, size, source })?;
    log::trace!("re-mapped published page {addr:#x} ({size} bytes, {})", link.name());
    Ok(())
  }

  /// Maps at least `min_size` bytes for a chained region, file-backed unless `name` is
  /// anonymous. The region is not published yet.
  pub(crate) fn map_page(&self, name: PageName, min_size: usize, sharing: Sharing) -> Result<(NonNull<u8>, usize)> {
    let size = page_align(min_size.max(PAGE_SIZE));
    let file = if name.is_anonymous() {
      None
    } else {
      Some(self.heap().backing().create(name, size)?)
    };
    let page = unsafe { os::os_mmap(size, sharing, file.as_ref()) }?;
    self.control().stats.record_mapped(size);
    Ok((page, size))
  }

  /// Maps a fresh region for `kind` and publishes it as the chain's new tail.
  pub(crate) fn allocate_page(
    &self,
    kind: PageKind,
    name: PageName,
    min_size: usize,
    sharing: Sharing,
  ) -> Result<NonNull<u8>> {
    self.allocate_page_with(kind, name, min_size, sharing, |_, _| {})
  }

  /// Like [`allocate_page`](Self::allocate_page), running `init` on the region before it is
  /// published. A task losing the publication race drops its region and starts over from the
  /// new tail.
  pub(crate) fn allocate_page_with(
    &self,
    kind: PageKind,
    name: PageName,
    min_size: usize,
    sharing: Sharing,
    init: impl Fn(NonNull<u8>, usize),
  ) -> Result<NonNull<u8>> {
    loop {
      let tail = match kind {
        PageKind::Header => self.sync_headers()?,
        PageKind::Huge => self.sync_huge()?,
      };
      let (page, size) = self.map_page(name, min_size, sharing)?;
      init(page, size);

      match tail.node.next.publish(ChainLink::new(page, name)) {
        Ok(()) => return Ok(page),
        Err(winner) => {
          log::debug!(
            "{kind:?} chain: {:p} lost the tail to {:#x} ({}), retrying",
            page,
            winner.addr(),
            winner.name()
          );
          unsafe { os::os_munmap(page.as_ptr(), size) };
        }
      }
    }
  }
}
