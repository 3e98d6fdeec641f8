//! Memory statistics reported by `dump_stats`.

use serde::Serialize;

/// Totals for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PartitionMemoryStats {
    /// Reserved bytes: super pages plus direct-map reservations.
    pub total_mmapped_bytes: usize,
    pub total_committed_bytes: usize,
    /// Committed bytes that hold provisioned slots.
    pub total_resident_bytes: usize,
    /// Bytes handed out to callers (slot sizes, or raw sizes where recorded).
    pub total_active_bytes: usize,
    /// Resident bytes of empty spans, released by a decommit purge.
    pub total_decommittable_bytes: usize,
    /// Resident bytes a discard purge would release.
    pub total_discardable_bytes: usize,
    pub num_super_pages: usize,
    pub num_direct_mapped_allocations: usize,
    pub has_thread_cache: bool,
}

/// Statistics of one bucket, or of one direct-mapped allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BucketMemoryStats {
    pub is_direct_map: bool,
    pub bucket_slot_size: usize,
    /// Bytes per slot span.
    pub allocated_slot_span_size: usize,
    pub active_bytes: usize,
    pub resident_bytes: usize,
    pub decommittable_bytes: usize,
    pub discardable_bytes: usize,
    pub num_full_slot_spans: usize,
    pub num_active_slot_spans: usize,
    pub num_empty_slot_spans: usize,
    pub num_decommitted_slot_spans: usize,
}

/// Sink for `dump_stats`.
pub trait StatsDumper {
    fn partition_dump_totals(&mut self, partition_name: &str, stats: &PartitionMemoryStats);

    fn partition_bucket_stats(&mut self, partition_name: &str, stats: &BucketMemoryStats);
}

/// Dumper that keeps everything it is given.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectingStatsDumper {
    pub partition_name: Option<String>,
    pub totals: Option<PartitionMemoryStats>,
    pub buckets: Vec<BucketMemoryStats>,
}

impl CollectingStatsDumper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket stats for one slot size, skipping direct maps.
    #[must_use]
    pub fn bucket(&self, slot_size: usize) -> Option<&BucketMemoryStats> {
        self.buckets
            .iter()
            .find(|b| !b.is_direct_map && b.bucket_slot_size == slot_size)
    }
}

impl StatsDumper for CollectingStatsDumper {
    fn partition_dump_totals(&mut self, partition_name: &str, stats: &PartitionMemoryStats) {
        self.partition_name = Some(partition_name.to_string());
        self.totals = Some(*stats);
    }

    fn partition_bucket_stats(&mut self, _partition_name: &str, stats: &BucketMemoryStats) {
        self.buckets.push(*stats);
    }
}
