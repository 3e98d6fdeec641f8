//! Per-root counters.
//!
//! Byte totals are maintained under the root lock but read without it; event
//! counters are advisory. Everything uses relaxed ordering.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RootCounters {
    /// Bytes currently committed for slot spans and direct maps.
    pub total_size_of_committed_pages: AtomicU64,
    /// Bytes reserved as super pages.
    pub total_size_of_super_pages: AtomicU64,
    /// Bytes reserved for direct maps.
    pub total_size_of_direct_mapped_pages: AtomicU64,
    pub allocations: AtomicU64,
    pub frees: AtomicU64,
    pub slow_path_allocations: AtomicU64,
    pub direct_map_allocations: AtomicU64,
    pub thread_cache_hits: AtomicU64,
    pub thread_cache_misses: AtomicU64,
    pub quarantined: AtomicU64,
    pub deferred_frees: AtomicU64,
    pub purges: AtomicU64,
}

impl RootCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn sub(counter: &AtomicU64, n: usize) {
        counter.fetch_sub(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn increase_committed(&self, bytes: usize) {
        Self::add(&self.total_size_of_committed_pages, bytes);
        debug_assert!(
            self.committed_bytes() <= self.super_page_bytes() + self.direct_mapped_bytes(),
            "committed bytes exceed reserved bytes"
        );
    }

    pub(crate) fn decrease_committed(&self, bytes: usize) {
        Self::sub(&self.total_size_of_committed_pages, bytes);
    }

    pub(crate) fn increase_super_pages(&self, bytes: usize) {
        Self::add(&self.total_size_of_super_pages, bytes);
    }

    pub(crate) fn increase_direct_mapped(&self, bytes: usize) {
        Self::add(&self.total_size_of_direct_mapped_pages, bytes);
        Self::inc(&self.direct_map_allocations);
    }

    pub(crate) fn decrease_direct_mapped(&self, bytes: usize) {
        Self::sub(&self.total_size_of_direct_mapped_pages, bytes);
    }

    pub(crate) fn note_alloc(&self) {
        Self::inc(&self.allocations);
    }

    pub(crate) fn note_free(&self) {
        Self::inc(&self.frees);
    }

    pub(crate) fn note_slow_path(&self) {
        Self::inc(&self.slow_path_allocations);
    }

    pub(crate) fn note_cache(&self, hit: bool) {
        if hit {
            Self::inc(&self.thread_cache_hits);
        } else {
            Self::inc(&self.thread_cache_misses);
        }
    }

    pub(crate) fn note_quarantined(&self) {
        Self::inc(&self.quarantined);
    }

    pub(crate) fn note_deferred_free(&self) {
        Self::inc(&self.deferred_frees);
    }

    pub(crate) fn note_purge(&self) {
        Self::inc(&self.purges);
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        Self::get(&self.total_size_of_committed_pages) as usize
    }

    #[must_use]
    pub fn super_page_bytes(&self) -> usize {
        Self::get(&self.total_size_of_super_pages) as usize
    }

    #[must_use]
    pub fn direct_mapped_bytes(&self) -> usize {
        Self::get(&self.total_size_of_direct_mapped_pages) as usize
    }

    /// Thread-cache hit rate in permille.
    #[must_use]
    pub fn cache_hit_rate_permille(&self) -> u16 {
        let hits = Self::get(&self.thread_cache_hits);
        let total = hits + Self::get(&self.thread_cache_misses);
        if total == 0 {
            return 0;
        }
        (hits.saturating_mul(1000) / total) as u16
    }

    #[must_use]
    pub fn snapshot(&self) -> RootCountersSnapshot {
        RootCountersSnapshot {
            committed_bytes: Self::get(&self.total_size_of_committed_pages),
            super_page_bytes: Self::get(&self.total_size_of_super_pages),
            direct_mapped_bytes: Self::get(&self.total_size_of_direct_mapped_pages),
            allocations: Self::get(&self.allocations),
            frees: Self::get(&self.frees),
            slow_path_allocations: Self::get(&self.slow_path_allocations),
            direct_map_allocations: Self::get(&self.direct_map_allocations),
            thread_cache_hits: Self::get(&self.thread_cache_hits),
            thread_cache_misses: Self::get(&self.thread_cache_misses),
            quarantined: Self::get(&self.quarantined),
            deferred_frees: Self::get(&self.deferred_frees),
            purges: Self::get(&self.purges),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RootCountersSnapshot {
    pub committed_bytes: u64,
    pub super_page_bytes: u64,
    pub direct_mapped_bytes: u64,
    pub allocations: u64,
    pub frees: u64,
    pub slow_path_allocations: u64,
    pub direct_map_allocations: u64,
    pub thread_cache_hits: u64,
    pub thread_cache_misses: u64,
    pub quarantined: u64,
    pub deferred_frees: u64,
    pub purges: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_totals_track_increase_and_decrease() {
        let counters = RootCounters::new();
        counters.increase_super_pages(2 << 20);
        counters.increase_committed(16384);
        counters.increase_direct_mapped(4 << 20);
        counters.increase_committed(8192);
        counters.decrease_committed(16384);
        let snap = counters.snapshot();
        assert_eq!(snap.committed_bytes, 8192);
        assert_eq!(snap.super_page_bytes, 2 << 20);
        assert_eq!(snap.direct_mapped_bytes, 4 << 20);
        assert_eq!(snap.direct_map_allocations, 1);
    }

    #[test]
    fn hit_rate_permille() {
        let counters = RootCounters::new();
        assert_eq!(counters.cache_hit_rate_permille(), 0);
        counters.note_cache(true);
        counters.note_cache(true);
        counters.note_cache(true);
        counters.note_cache(false);
        assert_eq!(counters.cache_hit_rate_permille(), 750);
    }
}
