//! # partalloc-core
//!
//! Partition-isolated slab allocator.
//!
//! Each [`PartitionRoot`] serves allocations from its own super pages, so
//! memory of one partition is never reused by another. Requests are rounded
//! into one of the size-class buckets and carved from slot spans; requests
//! above the largest bucket are direct-mapped in their own reservation.
//!
//! This crate provides:
//! - [`size_class`]: the request-size to bucket mapping
//! - [`PartitionRoot`]: allocate / free / reallocate / purge / stats
//! - [`PartitionAllocator`]: an initialized root registered with the
//!   process-wide [`MemoryReclaimer`]
//! - optional per-slot extras: boundary cookies and a reference count that
//!   defers the free of referenced slots
//! - scan mode, in which frees go through a [`Quarantine`]
//! - a per-thread slot cache and allocation hooks

#![deny(unsafe_code)]

mod bucket;
pub mod counters;
pub mod direct_map;
pub mod error;
mod extent;
pub mod extras;
pub mod flags;
mod freelist;
pub mod hooks;
pub mod log;
pub mod oom;
pub mod options;
pub mod purge;
pub mod quarantine;
pub mod reclaimer;
mod root;
pub mod size_class;
mod slot_span;
pub mod stats;
mod thread_cache;

pub use counters::RootCountersSnapshot;
pub use direct_map::MAX_DIRECT_MAPPED;
pub use error::{AllocError, IntegrityError};
pub use extras::ExtrasLayout;
pub use flags::{AllocFlags, PurgeFlags};
pub use hooks::AllocationHooks;
pub use log::{LifecycleLevel, LifecycleRecord};
pub use options::{Alignment, PartitionOptions, RefCountOption, ScanOption, ThreadCacheOption};
pub use purge::PurgeReport;
pub use quarantine::{Quarantine, QuarantineQueue, QuarantinedSlot};
pub use reclaimer::MemoryReclaimer;
pub use root::{PartitionAllocator, PartitionRoot};
pub use size_class::{ALIGNMENT, MAX_BUCKETED, NUM_BUCKETS};
pub use stats::{BucketMemoryStats, CollectingStatsDumper, PartitionMemoryStats, StatsDumper};
pub use thread_cache::{MAGAZINE_CAPACITY, MAX_CACHED_SLOT_SIZE};

pub use partalloc_pages::{AddressSpace, CheckMode, PageAllocator, PageError, ZeroOnFree};
