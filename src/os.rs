use core::ptr::{NonNull, null_mut};
use std::{fs::File, io, os::fd::AsRawFd};

use crate::{NoomrError, PAGE_SIZE, Result};

/// Whether writes to a mapping are visible to other tasks mapping the same memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Sharing {
  Private,
  Shared,
}

impl Sharing {
  fn flag(self) -> libc::c_int {
    match self {
      Sharing::Private => libc::MAP_PRIVATE,
      Sharing::Shared => libc::MAP_SHARED,
    }
  }
}

/// Maps `size` fresh bytes wherever the kernel decides. Anonymous unless `file` is given.
pub(crate) unsafe fn os_mmap(size: usize, sharing: Sharing, file: Option<&File>) -> Result<NonNull<u8>> {
  let (flags, fd) = match file {
    Some(file) => (sharing.flag(), file.as_raw_fd()),
    None => (sharing.flag() | libc::MAP_ANONYMOUS, -1),
  };
  let ptr = unsafe { libc::mmap(null_mut(), size, libc::PROT_READ | libc::PROT_WRITE, flags, fd, 0) };

  if ptr == libc::MAP_FAILED {
    return Err(NoomrError::Map {
      size,
      source: io::Error::last_os_error(),
    });
  }
  NonNull::new(ptr.cast()).ok_or(NoomrError::Map {
    size,
    source: io::Error::from_raw_os_error(libc::ENOMEM),
  })
}

/// Maps `file` shared at exactly `addr`, replacing whatever was there.
pub(crate) unsafe fn os_mmap_fixed(addr: usize, size: usize, file: &File) -> io::Result<()> {
  debug_assert!(addr % PAGE_SIZE == 0);
  let ptr = unsafe {
    libc::mmap(
      addr as *mut libc::c_void,
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_SHARED | libc::MAP_FIXED,
      file.as_raw_fd(),
      0,
    )
  };
  if ptr == libc::MAP_FAILED {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

pub(crate) unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  debug_assert!(ptr as usize % PAGE_SIZE == 0);
  if unsafe { libc::munmap(ptr.cast(), size) } != 0 {
    log::warn!("munmap({ptr:p}, {size}) failed: {}", io::Error::last_os_error());
  }
}

/// Reserves `size` bytes of address space with no access rights. Made usable piecewise with
/// [`os_protect_rw`].
pub(crate) fn os_reserve(size: usize) -> Result<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_NONE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };
  if ptr == libc::MAP_FAILED {
    return Err(NoomrError::Map {
      size,
      source: io::Error::last_os_error(),
    });
  }
  NonNull::new(ptr.cast()).ok_or(NoomrError::Map {
    size,
    source: io::Error::from_raw_os_error(libc::ENOMEM),
  })
}

pub(crate) unsafe fn os_protect_rw(addr: usize, len: usize) -> io::Result<()> {
  debug_assert!(addr % PAGE_SIZE == 0 && len % PAGE_SIZE == 0);
  if unsafe { libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

/// Whether the page at `addr` is mapped in this process.
pub(crate) fn is_mapped(addr: usize) -> bool {
  debug_assert!(addr % PAGE_SIZE == 0, "is_mapped: {addr:#x} is not page aligned");
  let rc = unsafe { libc::msync(addr as *mut libc::c_void, 1, libc::MS_ASYNC) };
  !(rc == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::ENOMEM))
}

pub(crate) fn system_page_size() -> usize {
  unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
