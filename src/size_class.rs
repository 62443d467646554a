//! Size classes for small allocations.
//!
//! Sizes up to 128 bytes use linear 16-byte steps; above that each doubling is split into four
//! geometric sub-classes. Requests larger than [`MAX_SIZE`] have no class and are served by the
//! large-block path.
//!
//! The progression is the usual general-purpose one, cut off at one page so that a whole growth
//! batch of the largest class stays small. Above 128 bytes neighbouring classes differ by about
//! a fifth, which bounds the internal waste of a block.

use crate::util::align_up;

/// Minimum unit the allocator tracks. Every class size and every payload is aligned to it.
pub const MIN_ALIGN: usize = 16;

/// Largest request served from a size class.
pub const MAX_SIZE: usize = 4096;

/// Number of linear size classes (16...128).
const CLASSES_LINEAR: usize = 8;
const CLASSES_LINEAR_STEP: usize = MIN_ALIGN;

/// Classes per doubling in geometric progression
const CLASSES_PER_DOUBLING: usize = 4;

/// Sub-class multipliers for geometric range (scaled by 16 for integer math).
/// Each represents a fraction of the doubling: 1.0, 1.19, 1.44, 1.69
const GEO_MULTIPLIERS: [usize; 4] = [16, 19, 23, 27];

const fn count_size_classes() -> usize {
  let mut class = 0;
  loop {
    if class_to_size(class) >= MAX_SIZE {
      return class + 1;
    }
    class += 1;
  }
}

/// Total number of size classes.
pub const NUM_CLASSES: usize = count_size_classes();

const _: () = assert!(class_to_size(0) == MIN_ALIGN);
const _: () = assert!(class_to_size(NUM_CLASSES - 1) == MAX_SIZE);
const _: () = assert!(MAX_SIZE % MIN_ALIGN == 0);

/// Rounds a requested size up to the minimum tracked unit.
#[inline(always)]
pub const fn align(size: usize) -> usize {
  align_up(size, MIN_ALIGN)
}

/// Convert class index to allocation size (inverse of `size_to_class`).
#[inline(always)]
pub const fn class_to_size(class: usize) -> usize {
  if class < CLASSES_LINEAR {
    (class + 1) * CLASSES_LINEAR_STEP
  } else {
    let geo_index = class - CLASSES_LINEAR + 1;
    let order = geo_index / CLASSES_PER_DOUBLING;
    let sub = geo_index % CLASSES_PER_DOUBLING;

    let base = 128 << order;
    let size = align_up((base * GEO_MULTIPLIERS[sub]) / 16, MIN_ALIGN);

    if size > MAX_SIZE { MAX_SIZE } else { size }
  }
}

/// Convert allocation size to class index (inverse of `class_to_size`).
///
/// Defined on `0..=MAX_SIZE`; larger sizes must be routed to the large-block path.
#[inline(always)]
pub fn size_to_class(size: usize) -> usize {
  debug_assert!(size <= MAX_SIZE, "size_to_class: {size} exceeds MAX_SIZE");
  if size == 0 {
    return 0;
  }

  // Linear range: ceil(size / 16) - 1
  if size <= 128 {
    return (size - 1) / CLASSES_LINEAR_STEP;
  }

  // Geometric range: find order via log2, then sub-class via thresholds
  let log2 = (usize::BITS as usize - 1) - size.leading_zeros() as usize;
  let order = log2.saturating_sub(7);
  let base = 128usize << order;

  let t0 = base;
  let t1 = align_up((base * 19) >> 4, MIN_ALIGN);
  let t2 = align_up((base * 23) >> 4, MIN_ALIGN);
  let t3 = align_up((base * 27) >> 4, MIN_ALIGN);

  let exceeded =
    (size > t0) as usize + (size > t1) as usize + (size > t2) as usize + (size > t3) as usize;

  // If exceeded == 4, bump to next order
  let order_bump = exceeded >> 2;
  let sub = exceeded & 3;

  let final_order = order + order_bump;
  let geo_index = final_order * CLASSES_PER_DOUBLING + sub;
  CLASSES_LINEAR + geo_index - 1
}
