//! The shared control block and the handle through which tasks reach it.

use core::{
  mem::size_of,
  ptr::NonNull,
  sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};
use std::path::Path;

use crate::{
  NoomrError, PAGE_SIZE, Result,
  backing::BackingStore,
  chain::{ChainNode, PageName},
  config::Config,
  oracle::SpeculationMode,
  os::{self, Sharing},
  size_class::NUM_CLASSES,
  stack::{Epoch, EpochStack},
  stats::{Stats, StatsSnapshot},
  task::Task,
  util::page_align,
};

/// Cross-task anchor of the whole heap. Lives in a shared anonymous mapping created before any
/// task starts, so forked tasks see the same block at the same address.
#[repr(C)]
pub(crate) struct ControlBlock {
  pub(crate) seq_free: [EpochStack; NUM_CLASSES],
  pub(crate) spec_free: [EpochStack; NUM_CLASSES],
  /// Head of the metadata page chain.
  pub(crate) header_chain: ChainNode,
  /// Head of the huge block chain.
  pub(crate) huge_chain: ChainNode,
  pub(crate) segment_base: usize,
  pub(crate) segment_bytes: usize,
  /// Bytes of the segment handed out to growths, by every task.
  pub(crate) segment_top: AtomicUsize,
  /// Bytes of the segment handed out while speculating.
  pub(crate) spec_growth: AtomicUsize,
  next_name: AtomicU32,
  pub(crate) stats: Stats,
}

impl ControlBlock {
  fn new(segment_base: usize, segment_bytes: usize) -> Self {
    Self {
      seq_free: [const { EpochStack::new() }; NUM_CLASSES],
      spec_free: [const { EpochStack::new() }; NUM_CLASSES],
      header_chain: ChainNode::new(),
      huge_chain: ChainNode::new(),
      segment_base,
      segment_bytes,
      segment_top: AtomicUsize::new(0),
      spec_growth: AtomicUsize::new(0),
      next_name: AtomicU32::new(0),
      stats: Stats::new(),
    }
  }

  #[inline]
  pub(crate) fn stack(&self, class: usize, epoch: Epoch) -> &EpochStack {
    match epoch {
      Epoch::Speculative => &self.spec_free[class],
      Epoch::Sequential => &self.seq_free[class],
    }
  }

  /// Next unused page name. Names start at 1; 0 is reserved for anonymous pages.
  pub(crate) fn next_name(&self) -> Result<PageName> {
    let name = self.next_name.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
    PageName::new(name).ok_or(NoomrError::NamesExhausted)
  }
}

/// Process-wide handle on a heap shared by cooperating tasks.
///
/// Create it once, before the tasks that share it are started (threads, or processes forked
/// from this one), then hand each task its own [`Task`]. The control block and the segment are
/// never unmapped: tasks may hold blocks and links into them for as long as the process lives.
pub struct SharedHeap {
  control: NonNull<ControlBlock>,
  backing: BackingStore,
  config: Config,
}

// All shared state behind `control` is mutated through atomics only.
unsafe impl Send for SharedHeap {}
unsafe impl Sync for SharedHeap {}

impl SharedHeap {
  pub fn create(config: Config) -> Result<Self> {
    config.validate()?;
    let found = os::system_page_size();
    if found != PAGE_SIZE {
      return Err(NoomrError::PageSize {
        found,
        expected: PAGE_SIZE,
      });
    }

    let segment = os::os_reserve(config.segment_bytes)?;
    let control_size = page_align(size_of::<ControlBlock>());
    let control = unsafe { os::os_mmap(control_size, Sharing::Shared, None) }?.cast::<ControlBlock>();
    unsafe {
      control
        .as_ptr()
        .write(ControlBlock::new(segment.as_ptr() as usize, config.segment_bytes))
    };

    let backing = BackingStore::new(&config.backing_root);
    log::debug!(
      "shared heap: control block {:p}, segment {:p} ({} bytes), backing files in {}",
      control,
      segment,
      config.segment_bytes,
      backing.dir().display()
    );
    Ok(Self {
      control,
      backing,
      config,
    })
  }

  /// A new execution context on this heap, asking `mode` whether it is speculating.
  pub fn task<M: SpeculationMode>(&self, mode: M) -> Task<'_, M> {
    Task::new(self, mode)
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn backing_root(&self) -> &Path {
    self.backing.root()
  }

  /// Directory under the backing root holding this heap's page files.
  pub fn backing_dir(&self) -> &Path {
    self.backing.dir()
  }

  /// Whether `addr` falls in the part of the data segment grown so far. Anything else handed
  /// out by this heap is a huge block.
  pub fn contains(&self, addr: *const u8) -> bool {
    let control = self.control();
    let addr = addr as usize;
    addr >= control.segment_base && addr < control.segment_base + control.segment_top.load(Ordering::Acquire)
  }

  /// Bytes of the data segment grown while speculating, by all tasks.
  pub fn spec_growth(&self) -> usize {
    self.control().spec_growth.load(Ordering::Acquire)
  }

  /// Bytes of the data segment grown so far, by all tasks.
  pub fn segment_used(&self) -> usize {
    self.control().segment_top.load(Ordering::Acquire)
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.control().stats.snapshot()
  }

  pub fn report_stats(&self) {
    log::info!("{}", self.stats());
  }

  #[inline]
  pub(crate) fn control(&self) -> &ControlBlock {
    unsafe { self.control.as_ref() }
  }

  #[inline]
  pub(crate) fn backing(&self) -> &BackingStore {
    &self.backing
  }
}
