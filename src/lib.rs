//! NOOMR: a user-space allocator for tasks that run speculatively in parallel.
//!
//! Tasks share one [`SharedHeap`], created before they start (threads of this process, or
//! processes forked from it). Small requests are served from per-size-class lock-free free lists
//! whose nodes live in shared metadata pages. Every node carries two links: one for the
//! committed (sequential) view of the free lists and one for the tentative (speculative) view.
//! [`Task::begin_speculation`] snapshots the committed view, [`Task::end_speculation`] commits
//! the speculative one, and an episode that is never committed leaves the committed view as it
//! was.
//!
//! Whether a task is speculating is decided by the embedding runtime through
//! [`SpeculationMode`]. Pages mapped while speculating are backed by files under
//! [`Config::backing_root`] and published on shared chains, so other tasks of the heap can
//! map them at the same address.
//!
//! ```no_run
//! use noomr::{Config, Sequential, SharedHeap};
//!
//! let heap = SharedHeap::create(Config::default())?;
//! let task = heap.task(Sequential);
//! let block = task.allocate(100);
//! unsafe { task.release(block) };
//! # Ok::<(), noomr::NoomrError>(())
//! ```

#![allow(clippy::missing_safety_doc)]

mod backing;
mod chain;
pub mod config;
mod epoch;
mod error;
mod grow;
mod header;
mod large;
mod oracle;
mod os;
mod publish;
mod shared;
pub mod size_class;
mod stack;
mod stats;
mod task;
mod util;

pub use config::Config;
pub use error::{NoomrError, Result};
pub use oracle::{Sequential, SpeculationFlag, SpeculationMode};
pub use shared::SharedHeap;
pub use stack::Epoch;
pub use stats::StatsSnapshot;
pub use task::Task;

/// Size of the pages the allocator maps, publishes and names.
pub const PAGE_SIZE: usize = 4096;

/// Significant bits of a user-space address.
pub(crate) const ADDRESS_BITS: u32 = 48;
