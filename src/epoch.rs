//! Speculation epoch boundaries.
//!
//! Opening an episode copies the committed free lists into the speculative ones; committing
//! copies them back. Discarding an episode is doing nothing: committed links are only written
//! here, so the next `begin_speculation` starts again from the last commit.
//!
//! Both boundaries walk every header record and must run while no task of the heap allocates
//! or releases.

use core::sync::atomic::{Ordering, fence};

use crate::{
  Result,
  error::fatal,
  oracle::SpeculationMode,
  size_class::NUM_CLASSES,
  task::Task,
};

impl<M: SpeculationMode> Task<'_, M> {
  /// Starts a speculative episode from the committed state, aborting the process on failure.
  pub fn begin_speculation(&self) {
    self.try_begin_speculation().unwrap_or_else(|err| fatal(err))
  }

  pub fn try_begin_speculation(&self) -> Result<()> {
    let control = self.control();
    self.my_growth.set(0);
    for class in 0..NUM_CLASSES {
      control.spec_free[class].mirror(&control.seq_free[class]);
    }

    let mut records = 0usize;
    self.for_each_header(|header| {
      header.synch();
      records += 1;
    })?;
    fence(Ordering::SeqCst);
    log::debug!("speculation begins: {records} header records snapshotted");
    Ok(())
  }

  /// Commits the running speculative episode, aborting the process on failure.
  pub fn end_speculation(&self) {
    self.try_end_speculation().unwrap_or_else(|err| fatal(err))
  }

  pub fn try_end_speculation(&self) -> Result<()> {
    let control = self.control();
    for class in 0..NUM_CLASSES {
      control.seq_free[class].mirror(&control.spec_free[class]);
    }

    let mut records = 0usize;
    self.for_each_header(|header| {
      header.promote();
      records += 1;
    })?;
    fence(Ordering::SeqCst);
    log::debug!(
      "speculation committed: {records} header records, {} bytes grown by this task",
      self.my_growth.get()
    );
    Ok(())
  }
}
