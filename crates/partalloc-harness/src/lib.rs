//! Workload harness for the partalloc partition allocator.
//!
//! This crate provides:
//! - Workloads: seeded multi-threaded allocate / reallocate / free storms
//!   against a fresh partition root
//! - Reports: machine-readable JSON summaries of counters, stats and purges
//! - Structured logs: JSONL lines for harness events and root lifecycle records

#![forbid(unsafe_code)]

pub mod error;
pub mod structured_log;
pub mod workload;

pub use error::HarnessError;
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
pub use workload::{WorkloadConfig, WorkloadReport, run_workload};
