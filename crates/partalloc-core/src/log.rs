//! Structured lifecycle records.
//!
//! Each root keeps a bounded ring of records describing allocator decisions
//! (span creation, super-page reservations, direct maps, purges, failures).
//! Records below the root's configured level are not formatted at all.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::counters::RootCounters;

pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LifecycleLevel {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Structured lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this record.
    pub trace_id: String,
    pub level: LifecycleLevel,
    /// API symbol (`allocate`, `free`, `purge`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `span_created`, `direct_map`, ...).
    pub event: &'static str,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    /// Bucket index (the sentinel index for direct maps).
    pub bucket: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub details: String,
    /// Snapshot: committed bytes.
    pub committed_bytes: u64,
    /// Snapshot: super-page bytes.
    pub super_page_bytes: u64,
    /// Snapshot: direct-mapped bytes.
    pub direct_mapped_bytes: u64,
    /// Snapshot: thread-cache hit rate in permille.
    pub cache_hit_rate_permille: u16,
}

/// Bounded ring of lifecycle records.
#[derive(Debug)]
pub struct LifecycleLog {
    min_level: LifecycleLevel,
    capacity: usize,
    next_decision_id: AtomicU64,
    records: Mutex<VecDeque<LifecycleRecord>>,
}

impl LifecycleLog {
    #[must_use]
    pub fn new(min_level: LifecycleLevel, capacity: usize) -> Self {
        Self {
            min_level,
            capacity: capacity.max(1),
            next_decision_id: AtomicU64::new(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn enabled(&self, level: LifecycleLevel) -> bool {
        level >= self.min_level
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record(
        &self,
        counters: &RootCounters,
        level: LifecycleLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        bucket: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        if !self.enabled(level) {
            return;
        }
        let decision_id = self.next_decision_id.fetch_add(1, Ordering::Relaxed);
        let trace_id = format!("core::partition::{}::{:016x}", symbol, decision_id);
        let record = LifecycleRecord {
            decision_id,
            trace_id,
            level,
            symbol,
            event,
            ptr,
            size,
            bucket,
            outcome,
            details: details.into(),
            committed_bytes: counters.committed_bytes() as u64,
            super_page_bytes: counters.super_page_bytes() as u64,
            direct_mapped_bytes: counters.direct_mapped_bytes() as u64,
            cache_hit_rate_permille: counters.cache_hit_rate_permille(),
        };
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<LifecycleRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn drain(&self) -> Vec<LifecycleRecord> {
        self.records.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_below_level_are_skipped() {
        let log = LifecycleLog::new(LifecycleLevel::Info, 8);
        let counters = RootCounters::new();
        log.record(&counters, LifecycleLevel::Debug, "allocate", "alloc", None, Some(8), Some(0), "success", "");
        log.record(&counters, LifecycleLevel::Warn, "allocate", "alloc", None, Some(8), Some(0), "oom", "limit");
        let records = log.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "oom");
        assert!(records[0].trace_id.starts_with("core::partition::allocate::"));
    }

    #[test]
    fn ring_keeps_newest_records() {
        let log = LifecycleLog::new(LifecycleLevel::Trace, 3);
        let counters = RootCounters::new();
        for size in 0..5 {
            log.record(&counters, LifecycleLevel::Trace, "free", "free", None, Some(size), None, "success", "");
        }
        let sizes: Vec<_> = log.drain().into_iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![Some(2), Some(3), Some(4)]);
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn level_parsing() {
        assert_eq!(LifecycleLevel::from_str_loose("WARN"), Some(LifecycleLevel::Warn));
        assert_eq!(LifecycleLevel::from_str_loose("nope"), None);
        assert!(LifecycleLevel::Error > LifecycleLevel::Trace);
    }

    #[test]
    fn records_serialize_with_lowercase_level() {
        let log = LifecycleLog::new(LifecycleLevel::Trace, 2);
        let counters = RootCounters::new();
        log.record(&counters, LifecycleLevel::Info, "purge", "purge", None, None, None, "success", "x=1");
        let json = serde_json::to_string(&log.snapshot()[0]).unwrap();
        assert!(json.contains("\"level\":\"info\""));
        assert!(json.contains("\"details\":\"x=1\""));
    }
}
