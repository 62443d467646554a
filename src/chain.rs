//! Page chains: append-only singly linked lists of mapped regions, one for metadata pages and
//! one for huge blocks.
//!
//! Each link holds the address of the next region together with the name of its backing file.
//! Both travel in one 64-bit word so a single compare-and-swap publishes them together.

use core::{
  fmt,
  ptr::NonNull,
  sync::atomic::{AtomicU64, Ordering},
};

use crate::{ADDRESS_BITS, PAGE_SIZE};

const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();
const PAGE_NUMBER_BITS: u32 = ADDRESS_BITS - PAGE_SHIFT;
const NAME_BITS: u32 = u64::BITS - PAGE_NUMBER_BITS;
const NAME_MASK: u64 = (1 << NAME_BITS) - 1;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(NAME_BITS == 28);

/// Which chain a page belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PageKind {
  Header,
  Huge,
}

/// Name of a page's backing file. Name 0 marks an anonymous page with no file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct PageName(u32);

impl PageName {
  pub(crate) const ANONYMOUS: PageName = PageName(0);
  pub(crate) const MAX: u32 = NAME_MASK as u32;

  pub(crate) const fn new(name: u32) -> Option<Self> {
    if name <= Self::MAX { Some(Self(name)) } else { None }
  }

  #[inline]
  pub(crate) const fn get(self) -> u32 {
    self.0
  }

  #[inline]
  pub(crate) const fn is_anonymous(self) -> bool {
    self.0 == 0
  }
}

impl fmt::Display for PageName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_anonymous() { f.write_str("anonymous") } else { write!(f, "#{}", self.0) }
  }
}

/// Value of a chain link: the next page, if any, and its name.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ChainLink {
  page: usize,
  name: PageName,
}

impl ChainLink {
  pub(crate) const EMPTY: ChainLink = ChainLink {
    page: 0,
    name: PageName::ANONYMOUS,
  };

  pub(crate) fn new(page: NonNull<u8>, name: PageName) -> Self {
    let page = page.as_ptr() as usize;
    debug_assert!(page % PAGE_SIZE == 0, "chain page {page:#x} is not page aligned");
    debug_assert!(page >> ADDRESS_BITS == 0, "chain page {page:#x} exceeds {ADDRESS_BITS} bits");
    Self { page, name }
  }

  #[inline]
  pub(crate) fn page(self) -> Option<NonNull<u8>> {
    NonNull::new(self.page as *mut u8)
  }

  #[inline]
  pub(crate) fn addr(self) -> usize {
    self.page
  }

  #[inline]
  pub(crate) fn name(self) -> PageName {
    self.name
  }

  #[inline]
  fn pack(self) -> u64 {
    ((self.page as u64 >> PAGE_SHIFT) << NAME_BITS) | self.name.0 as u64
  }

  #[inline]
  fn unpack(raw: u64) -> Self {
    Self {
      page: ((raw >> NAME_BITS) << PAGE_SHIFT) as usize,
      name: PageName((raw & NAME_MASK) as u32),
    }
  }
}

#[repr(transparent)]
pub(crate) struct AtomicChainLink(AtomicU64);

impl AtomicChainLink {
  pub(crate) const fn new() -> Self {
    Self(AtomicU64::new(0))
  }

  #[inline]
  pub(crate) fn load(&self) -> ChainLink {
    ChainLink::unpack(self.0.load(Ordering::Acquire))
  }

  /// Installs `link` if this link is still empty. Once set, a link never changes again.
  /// On failure returns the link that won.
  #[inline]
  pub(crate) fn publish(&self, link: ChainLink) -> Result<(), ChainLink> {
    self
      .0
      .compare_exchange(ChainLink::EMPTY.pack(), link.pack(), Ordering::AcqRel, Ordering::Acquire)
      .map(drop)
      .map_err(ChainLink::unpack)
  }
}

/// Leading field of every chained region (and of the chain heads in the control block), so a
/// walk can step from region to region without knowing what else they hold.
#[repr(C)]
pub(crate) struct ChainNode {
  pub(crate) next: AtomicChainLink,
}

impl ChainNode {
  pub(crate) const fn new() -> Self {
    Self {
      next: AtomicChainLink::new(),
    }
  }

  /// # Safety
  /// `page` must be a mapped chain region, which starts with a `ChainNode`.
  #[inline]
  pub(crate) unsafe fn at<'a>(page: NonNull<u8>) -> &'a ChainNode {
    unsafe { page.cast::<ChainNode>().as_ref() }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn page(addr: usize) -> NonNull<u8> {
    NonNull::new(addr as *mut u8).unwrap()
  }

  #[test]
  fn link_packs_page_and_name() {
    let name = PageName::new(PageName::MAX).unwrap();
    let link = ChainLink::new(page(0x7fff_ffff_f000), name);
    let back = ChainLink::unpack(link.pack());
    assert_eq!(back, link);
    assert_eq!(back.addr(), 0x7fff_ffff_f000);
    assert_eq!(back.name(), name);
  }

  #[test]
  fn empty_link_has_no_page() {
    assert!(ChainLink::EMPTY.page().is_none());
    assert_eq!(ChainLink::EMPTY.pack(), 0);
    assert!(PageName::new(PageName::MAX + 1).is_none());
  }

  #[test]
  fn publish_only_once() {
    let node = ChainNode::new();
    let first = ChainLink::new(page(0x1000), PageName::new(1).unwrap());
    let second = ChainLink::new(page(0x2000), PageName::ANONYMOUS);

    assert_eq!(node.next.publish(first), Ok(()));
    assert_eq!(node.next.publish(second), Err(first));
    assert_eq!(node.next.load(), first);
  }
}
