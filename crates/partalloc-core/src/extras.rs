//! Per-slot extras: the in-slot reference count and the integrity cookies.
//!
//! ```text
//! slot_start
//! | ref count (16) | cookie (16) | user bytes ... | cookie (16) |
//!                                ^ returned pointer
//! ```
//!
//! Either part is present only when its feature is enabled on the root.

use partalloc_pages::PageAllocator;

use crate::error::{AllocError, IntegrityError};

pub const COOKIE_SIZE: usize = 16;
pub const COOKIE_VALUE: [u8; COOKIE_SIZE] = [
    0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xD0, 0x0D, 0x13, 0x37, 0xF0, 0x05, 0xBA, 0x11, 0xAB, 0x1E,
];

/// Space reserved in front of the slot for the reference count; the count
/// itself is a 4-byte word at the slot start.
pub const REF_COUNT_SIZE: usize = 16;

/// Fill for freshly allocated slots in checked mode.
pub const UNINITIALIZED_BYTE: u8 = 0xAB;
/// Fill for freed slots in checked mode.
pub const FREED_BYTE: u8 = 0xCD;
/// Fill for slots freed while other references are still alive.
pub const QUARANTINED_BYTE: u8 = 0xEF;

/// Which extras a root places around every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtrasLayout {
    pub cookies: bool,
    pub ref_count: bool,
}

impl ExtrasLayout {
    #[must_use]
    pub const fn new(cookies: bool, ref_count: bool) -> Self {
        Self { cookies, ref_count }
    }

    /// Total bytes the extras add to a request.
    #[must_use]
    pub const fn size(self) -> usize {
        let mut size = 0;
        if self.cookies {
            size += 2 * COOKIE_SIZE;
        }
        if self.ref_count {
            size += REF_COUNT_SIZE;
        }
        size
    }

    /// Distance from the slot start to the user pointer.
    #[must_use]
    pub const fn offset(self) -> usize {
        let mut offset = 0;
        if self.cookies {
            offset += COOKIE_SIZE;
        }
        if self.ref_count {
            offset += REF_COUNT_SIZE;
        }
        offset
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.cookies && !self.ref_count
    }
}

/// Write both cookies around `usable` user bytes at `ptr`.
pub fn write_cookies(pages: &dyn PageAllocator, ptr: usize, usable: usize) -> Result<(), AllocError> {
    pages.write(ptr - COOKIE_SIZE, &COOKIE_VALUE)?;
    pages.write(ptr + usable, &COOKIE_VALUE)?;
    Ok(())
}

/// Verify both cookies around `usable` user bytes at `ptr`.
pub fn check_cookies(pages: &dyn PageAllocator, ptr: usize, usable: usize) -> Result<(), AllocError> {
    for addr in [ptr - COOKIE_SIZE, ptr + usable] {
        let mut found = [0u8; COOKIE_SIZE];
        pages.read(addr, &mut found)?;
        if found != COOKIE_VALUE {
            return Err(IntegrityError::CookieMismatch { ptr, addr }.into());
        }
    }
    Ok(())
}

/// In-slot reference count.
///
/// Bit 0 says whether the allocator still holds the slot (cleared by `free`);
/// the remaining bits count other references in steps of two.
pub struct RefCount;

impl RefCount {
    pub const ALIVE: u32 = 1;
    const STEP: u32 = 2;

    pub fn init(pages: &dyn PageAllocator, slot_start: usize) -> Result<(), AllocError> {
        pages.write_u32(slot_start, Self::ALIVE)?;
        Ok(())
    }

    /// Take one more reference.
    pub fn acquire(pages: &dyn PageAllocator, slot_start: usize, ptr: usize) -> Result<(), AllocError> {
        pages
            .update_u32(slot_start, &mut |count| count.checked_add(Self::STEP))?
            .map_err(|_| IntegrityError::SpanCorrupted {
                ptr,
                reason: "reference count overflow",
            })?;
        Ok(())
    }

    /// Drop one reference. Returns true when this was the last reference to a
    /// slot the allocator already gave up, so the free must complete now.
    pub fn release(pages: &dyn PageAllocator, slot_start: usize, ptr: usize) -> Result<bool, AllocError> {
        let previous = pages
            .update_u32(slot_start, &mut |count| {
                if count < Self::STEP {
                    None
                } else {
                    Some(count - Self::STEP)
                }
            })?
            .map_err(|_| IntegrityError::RefCountUnderflow { ptr })?;
        Ok(previous == Self::STEP)
    }

    /// Give up the allocator's reference. Returns true when no other reference
    /// is alive. A missing alive bit means the slot was already freed.
    pub fn release_from_allocator(
        pages: &dyn PageAllocator,
        slot_start: usize,
        ptr: usize,
    ) -> Result<bool, AllocError> {
        let previous = pages
            .update_u32(slot_start, &mut |count| {
                if count & Self::ALIVE == 0 {
                    None
                } else {
                    Some(count & !Self::ALIVE)
                }
            })?
            .map_err(|_| IntegrityError::DoubleFree { ptr })?;
        Ok(previous == Self::ALIVE)
    }

    pub fn has_one_ref(pages: &dyn PageAllocator, slot_start: usize) -> Result<bool, AllocError> {
        Ok(pages.read_u32(slot_start)? == Self::ALIVE)
    }
}
