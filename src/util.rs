use core::hint;

use crate::PAGE_SIZE;

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
pub(crate) const fn page_align(x: usize) -> usize {
  align_up(x, PAGE_SIZE)
}

/// Runs `attempt` until it yields a value.
///
/// Every compare-and-swap loop in the allocator goes through here. Lock-free, not wait-free:
/// a losing caller retries immediately and can in principle spin forever under contention.
#[inline]
pub(crate) fn retry<T>(mut attempt: impl FnMut() -> Option<T>) -> T {
  loop {
    if let Some(value) = attempt() {
      return value;
    }
    hint::spin_loop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn align_helpers() {
    assert_eq!(align_up(0, 16), 0);
    assert_eq!(align_up(1, 16), 16);
    assert_eq!(align_up(16, 16), 16);
    assert_eq!(page_align(4097), 2 * PAGE_SIZE);
  }

  #[test]
  fn retry_stops_on_first_value() {
    let mut calls = 0;
    let value = retry(|| {
      calls += 1;
      (calls == 3).then_some(calls * 10)
    });
    assert_eq!(value, 30);
    assert_eq!(calls, 3);
  }
}
