//! Page geometry shared by the reservation layer and the allocator.
//!
//! ```text
//! super page (2 MiB) = 128 partition pages
//! partition page (16 KiB) = 4 system pages
//! system page (4 KiB)
//! ```
//!
//! The first and the last partition page of every super page are reserved for
//! metadata and guard use and never hold slots.

pub const SYSTEM_PAGE_SHIFT: usize = 12;
pub const SYSTEM_PAGE_SIZE: usize = 1 << SYSTEM_PAGE_SHIFT;
pub const SYSTEM_PAGE_OFFSET_MASK: usize = SYSTEM_PAGE_SIZE - 1;
pub const SYSTEM_PAGE_BASE_MASK: usize = !SYSTEM_PAGE_OFFSET_MASK;

/// Granularity of reservations handed out by the address space.
pub const PAGE_ALLOCATION_GRANULARITY: usize = SYSTEM_PAGE_SIZE;

pub const PARTITION_PAGE_SHIFT: usize = 14;
pub const PARTITION_PAGE_SIZE: usize = 1 << PARTITION_PAGE_SHIFT;
pub const PARTITION_PAGE_OFFSET_MASK: usize = PARTITION_PAGE_SIZE - 1;
pub const PARTITION_PAGE_BASE_MASK: usize = !PARTITION_PAGE_OFFSET_MASK;
pub const NUM_SYSTEM_PAGES_PER_PARTITION_PAGE: usize = PARTITION_PAGE_SIZE / SYSTEM_PAGE_SIZE;

/// Slot spans cover at most this many partition pages, unless the slot itself
/// is larger.
pub const MAX_PARTITION_PAGES_PER_SLOT_SPAN: usize = 4;
pub const MAX_SYSTEM_PAGES_PER_SLOT_SPAN: usize =
    MAX_PARTITION_PAGES_PER_SLOT_SPAN * NUM_SYSTEM_PAGES_PER_PARTITION_PAGE;

pub const SUPER_PAGE_SHIFT: usize = 21;
pub const SUPER_PAGE_SIZE: usize = 1 << SUPER_PAGE_SHIFT;
pub const SUPER_PAGE_OFFSET_MASK: usize = SUPER_PAGE_SIZE - 1;
pub const SUPER_PAGE_BASE_MASK: usize = !SUPER_PAGE_OFFSET_MASK;
pub const NUM_PARTITION_PAGES_PER_SUPER_PAGE: usize = SUPER_PAGE_SIZE / PARTITION_PAGE_SIZE;

const _: () = assert!(PARTITION_PAGE_SIZE % SYSTEM_PAGE_SIZE == 0);
const _: () = assert!(SUPER_PAGE_SIZE % PARTITION_PAGE_SIZE == 0);
const _: () = assert!(NUM_PARTITION_PAGES_PER_SUPER_PAGE <= u8::MAX as usize + 1);
const _: () = assert!(MAX_SYSTEM_PAGES_PER_SLOT_SPAN < (1 << 8));

/// Round `value` up to `alignment`, which must be a power of two.
///
/// Returns `None` on overflow.
#[inline]
#[must_use]
pub const fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
    let mask = alignment - 1;
    match value.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

/// Round `value` up to `alignment`, which must be a power of two.
///
/// The caller guarantees that the result does not overflow.
#[inline]
#[must_use]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Round `value` down to `alignment`, which must be a power of two.
#[inline]
#[must_use]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Base address of the super page containing `addr`.
#[inline]
#[must_use]
pub const fn super_page_base(addr: usize) -> usize {
    addr & SUPER_PAGE_BASE_MASK
}

/// Index of the partition page containing `addr` within its super page.
#[inline]
#[must_use]
pub const fn partition_page_index(addr: usize) -> usize {
    (addr & SUPER_PAGE_OFFSET_MASK) >> PARTITION_PAGE_SHIFT
}
