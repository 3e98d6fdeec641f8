//! Intrusive free-list entries.
//!
//! A free slot stores the address of the next free slot in its first eight
//! bytes, byte-swapped. Null encodes to zero, and a real heap address never
//! encodes to one, so a stray dereference of an encoded entry faults instead
//! of landing in the heap.

use partalloc_pages::PageAllocator;

use crate::error::AllocError;

pub const ENTRY_SIZE: usize = std::mem::size_of::<u64>();

#[inline]
#[must_use]
pub const fn encode(next: usize) -> u64 {
    (next as u64).swap_bytes()
}

#[inline]
#[must_use]
pub const fn decode(encoded: u64) -> usize {
    encoded.swap_bytes() as usize
}

/// Read the raw next pointer stored in the free slot at `entry`.
pub fn read_next(pages: &dyn PageAllocator, entry: usize) -> Result<usize, AllocError> {
    Ok(decode(pages.read_u64(entry)?))
}

/// Link the free slot at `entry` to `next` (zero terminates the list).
pub fn write_next(pages: &dyn PageAllocator, entry: usize, next: usize) -> Result<(), AllocError> {
    pages.write_u64(entry, encode(next))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_zero_both_ways() {
        assert_eq!(encode(0), 0);
        assert_eq!(decode(0), 0);
    }

    #[test]
    fn encoded_address_is_not_the_address() {
        let addr = 0x0000_1234_5600_4010usize;
        let encoded = encode(addr);
        assert_ne!(encoded as usize, addr);
        assert_eq!(decode(encoded), addr);
        // The low byte of an encoded heap address is the address's top byte.
        assert_eq!(encoded & 0xff, 0);
    }
}
