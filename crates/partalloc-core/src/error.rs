//! Allocator error taxonomy.
//!
//! [`AllocError`] covers exhaustion and caller mistakes that the public
//! boundary turns into a null return or an out-of-memory crash.
//! [`IntegrityError`] covers metadata corruption; it always ends in the
//! root's corruption handler.

use partalloc_pages::PageError;
use thiserror::Error;

/// Evidence of heap corruption or of a pointer the root does not own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("cookie mismatch at {addr:#x} (slot pointer {ptr:#x})")]
    CookieMismatch { ptr: usize, addr: usize },
    #[error("pointer {ptr:#x} is not owned by this partition")]
    ForeignPointer { ptr: usize },
    #[error("pointer {ptr:#x} is owned by partition tag {found:#x}, expected {expected:#x}")]
    OwnerMismatch { ptr: usize, found: u64, expected: u64 },
    #[error("pointer {ptr:#x} is not at a slot boundary")]
    MisalignedSlot { ptr: usize },
    #[error("double free of {ptr:#x}")]
    DoubleFree { ptr: usize },
    #[error("free list of span at {span_base:#x} holds invalid entry {entry:#x}")]
    FreelistCorrupted { span_base: usize, entry: usize },
    #[error("reference count of {ptr:#x} underflowed")]
    RefCountUnderflow { ptr: usize },
    #[error("slot span metadata for {ptr:#x} is inconsistent: {reason}")]
    SpanCorrupted { ptr: usize, reason: &'static str },
}

/// Allocation failure before it is turned into null or a crash.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("request of {size} bytes overflows once slot extras are added")]
    SizeOverflow { size: usize },
    #[error("request of {size} bytes exceeds the direct-map limit of {limit} bytes")]
    ExcessiveSize { size: usize, limit: usize },
    #[error("alignment {alignment:#x} is not supported")]
    UnsupportedAlignment { alignment: usize },
    #[error("page allocator: {0}")]
    Pages(#[from] PageError),
    #[error("integrity violation: {0}")]
    Integrity(#[from] IntegrityError),
}

impl AllocError {
    /// The integrity violation carried by this error, if any.
    #[must_use]
    pub fn integrity(&self) -> Option<&IntegrityError> {
        match self {
            Self::Integrity(err) => Some(err),
            _ => None,
        }
    }
}
