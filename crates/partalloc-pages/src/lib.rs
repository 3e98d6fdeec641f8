//! # partalloc-pages
//!
//! Address-space reservation layer for the partition allocator.
//!
//! This crate provides:
//! - [`geometry`]: system / partition / super page sizes and alignment helpers
//! - [`PageAllocator`]: the reserve / commit / decommit / discard / release contract
//! - [`AddressSpace`]: a simulated virtual address space implementing it, with
//!   byte access over committed pages
//! - [`config`]: runtime check-mode and zero-on-free configuration
//! - [`metrics`]: relaxed counters for page operations

#![deny(unsafe_code)]

pub mod address_space;
pub mod config;
pub mod error;
pub mod geometry;
pub mod metrics;

pub use address_space::{AddressSpace, PageAllocator, PageState};
pub use config::{CheckMode, ZeroOnFree, check_mode, zero_on_free_policy};
pub use error::PageError;
pub use metrics::{PageMetrics, PageMetricsSnapshot};
