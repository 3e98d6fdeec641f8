//! Atomic counters for page-level observability.
//!
//! All counters use relaxed ordering. They are diagnostic, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Page operation counters of one address space.
pub struct PageMetrics {
    /// Successful reservations.
    pub reservations: AtomicU64,
    /// Reservations that could not be satisfied.
    pub reservation_failures: AtomicU64,
    /// Released reservations.
    pub releases: AtomicU64,
    /// Commit calls.
    pub commits: AtomicU64,
    /// Decommit calls.
    pub decommits: AtomicU64,
    /// Discard calls.
    pub discards: AtomicU64,
    /// Bytes currently reserved.
    pub reserved_bytes: AtomicU64,
    /// Bytes currently committed.
    pub committed_bytes: AtomicU64,
    /// Pages that hold materialized (written) contents.
    pub resident_pages: AtomicU64,
}

impl PageMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reservations: AtomicU64::new(0),
            reservation_failures: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            decommits: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            reserved_bytes: AtomicU64::new(0),
            committed_bytes: AtomicU64::new(0),
            resident_pages: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` to a gauge.
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Subtract `n` from a gauge.
    pub fn sub(counter: &AtomicU64, n: usize) {
        counter.fetch_sub(n as u64, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> PageMetricsSnapshot {
        PageMetricsSnapshot {
            reservations: Self::get(&self.reservations),
            reservation_failures: Self::get(&self.reservation_failures),
            releases: Self::get(&self.releases),
            commits: Self::get(&self.commits),
            decommits: Self::get(&self.decommits),
            discards: Self::get(&self.discards),
            reserved_bytes: Self::get(&self.reserved_bytes),
            committed_bytes: Self::get(&self.committed_bytes),
            resident_pages: Self::get(&self.resident_pages),
        }
    }
}

impl Default for PageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of [`PageMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageMetricsSnapshot {
    pub reservations: u64,
    pub reservation_failures: u64,
    pub releases: u64,
    pub commits: u64,
    pub decommits: u64,
    pub discards: u64,
    pub reserved_bytes: u64,
    pub committed_bytes: u64,
    pub resident_pages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = PageMetrics::new();
        assert_eq!(m.snapshot(), PageMetricsSnapshot::default());
    }

    #[test]
    fn gauges_track_add_and_sub() {
        let m = PageMetrics::new();
        PageMetrics::inc(&m.commits);
        PageMetrics::add(&m.committed_bytes, 8192);
        PageMetrics::sub(&m.committed_bytes, 4096);
        let snap = m.snapshot();
        assert_eq!(snap.commits, 1);
        assert_eq!(snap.committed_bytes, 4096);
    }
}
