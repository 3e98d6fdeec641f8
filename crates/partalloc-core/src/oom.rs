//! Non-returning failure handlers.

use std::alloc::Layout;

use crate::error::IntegrityError;

/// Called with the requested size when an allocation cannot be satisfied and
/// the caller did not ask for a null return.
pub type OomHandler = fn(usize) -> !;

/// Called when metadata corruption or a foreign pointer is detected.
pub type CorruptionHandler = fn(&IntegrityError) -> !;

/// Report through the process allocation-error hook, which aborts by default.
pub fn default_oom_handler(size: usize) -> ! {
    match Layout::from_size_align(size.max(1), 16) {
        Ok(layout) => std::alloc::handle_alloc_error(layout),
        Err(_) => {
            eprintln!("partalloc: out of memory allocating {size} bytes");
            std::process::abort()
        }
    }
}

pub fn default_corruption_handler(err: &IntegrityError) -> ! {
    eprintln!("partalloc: heap corruption detected: {err}");
    std::process::abort()
}
