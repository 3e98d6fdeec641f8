//! Buckets and the slow allocation path.
//!
//! A bucket owns every slot span of one size class. Spans move between three
//! singly linked lists (active, empty, decommitted); full spans are only
//! counted. The lists are swept lazily: a span that became empty or was
//! decommitted may still sit on the active list until the next sweep moves it.

use partalloc_pages::geometry::{
    MAX_SYSTEM_PAGES_PER_SLOT_SPAN, NUM_PARTITION_PAGES_PER_SUPER_PAGE,
    NUM_SYSTEM_PAGES_PER_PARTITION_PAGE, PARTITION_PAGE_SIZE, SUPER_PAGE_SIZE, SYSTEM_PAGE_SIZE,
};
use partalloc_pages::PageAllocator;

use crate::error::AllocError;
use crate::log::LifecycleLevel;
use crate::root::{PartitionRoot, RootState, SlotAlloc};
use crate::size_class::{self, NUM_BUCKETS, SENTINEL_BUCKET};
use crate::slot_span::{SlotSpan, SpanId};

/// One size class.
#[derive(Debug, Clone)]
pub(crate) struct Bucket {
    pub slot_size: usize,
    pub num_system_pages_per_slot_span: usize,
    pub active_head: Option<SpanId>,
    pub empty_head: Option<SpanId>,
    pub decommitted_head: Option<SpanId>,
    pub num_full_slot_spans: usize,
}

impl Bucket {
    pub fn new(slot_size: usize) -> Self {
        Self {
            slot_size,
            num_system_pages_per_slot_span: system_pages_per_slot_span(slot_size),
            active_head: None,
            empty_head: None,
            decommitted_head: None,
            num_full_slot_spans: 0,
        }
    }

    /// The bucket that owns direct-mapped spans; its slot size varies per span.
    pub fn sentinel() -> Self {
        Self {
            slot_size: 0,
            num_system_pages_per_slot_span: 0,
            active_head: None,
            empty_head: None,
            decommitted_head: None,
            num_full_slot_spans: 0,
        }
    }

    /// Buckets whose spans hold one slot record the exact request size.
    pub fn can_store_raw_size(&self) -> bool {
        self.slot_size > MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE
    }

    pub fn bytes_per_span(&self) -> usize {
        self.num_system_pages_per_slot_span * SYSTEM_PAGE_SIZE
    }

    pub fn slots_per_span(&self) -> usize {
        if self.slot_size == 0 {
            return 0;
        }
        self.bytes_per_span() / self.slot_size
    }

    pub fn num_partition_pages(&self) -> usize {
        self.num_system_pages_per_slot_span
            .div_ceil(NUM_SYSTEM_PAGES_PER_PARTITION_PAGE)
    }
}

/// Number of system pages per slot span that minimizes wasted bytes.
///
/// Unused bytes at the end of the span count as waste, and so does a guessed
/// page-table cost for each system page left unfaulted in the last partition
/// page. Slots larger than the biggest multi-slot span get a span of exactly
/// one slot.
pub(crate) fn system_pages_per_slot_span(slot_size: usize) -> usize {
    if slot_size == 0 {
        return 0;
    }
    if slot_size > MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE {
        debug_assert_eq!(slot_size % SYSTEM_PAGE_SIZE, 0);
        return slot_size.div_ceil(SYSTEM_PAGE_SIZE);
    }
    let mut best_waste_ratio = 1.0f64;
    let mut best_pages = 0;
    for pages in (NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1)..=MAX_SYSTEM_PAGES_PER_SLOT_SPAN {
        let span_size = SYSTEM_PAGE_SIZE * pages;
        let num_slots = span_size / slot_size;
        let mut waste = span_size - num_slots * slot_size;
        let remainder_pages = pages & (NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1);
        let unfaulted_pages = if remainder_pages != 0 {
            NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - remainder_pages
        } else {
            0
        };
        waste += std::mem::size_of::<usize>() * unfaulted_pages;
        let waste_ratio = waste as f64 / span_size as f64;
        if waste_ratio < best_waste_ratio {
            best_waste_ratio = waste_ratio;
            best_pages = pages;
        }
    }
    debug_assert!(best_pages > 0);
    best_pages
}

/// Builds the bucket array plus the trailing sentinel.
pub(crate) fn init_buckets() -> Vec<Bucket> {
    let mut buckets: Vec<Bucket> = (0..NUM_BUCKETS)
        .map(|index| Bucket::new(size_class::bucket_slot_size(index)))
        .collect();
    buckets.push(Bucket::sentinel());
    buckets
}

impl PartitionRoot {
    /// Allocate a slot when the active span's free list is empty.
    pub(crate) fn slow_path_allocate(
        &self,
        state: &mut RootState,
        bucket_index: usize,
        raw_size: usize,
    ) -> Result<SlotAlloc, AllocError> {
        if bucket_index == SENTINEL_BUCKET {
            return self.direct_map(state, raw_size);
        }
        self.counters.note_slow_path();

        let mut fresh = false;
        let span_id = if self.set_new_active_slot_span(state, bucket_index) {
            state.buckets[bucket_index]
                .active_head
                .ok_or(AllocError::Integrity(crate::IntegrityError::SpanCorrupted {
                    ptr: 0,
                    reason: "active list head vanished",
                }))?
        } else if let Some(id) = self.pop_empty_slot_span(state, bucket_index) {
            id
        } else if let Some(id) = state.buckets[bucket_index].decommitted_head {
            let next = state.spans.get(id).next;
            state.buckets[bucket_index].decommitted_head = next;
            self.recommit_slot_span(state, id)?;
            fresh = true;
            id
        } else {
            let id = self.alloc_new_slot_span(state, bucket_index)?;
            fresh = true;
            id
        };

        {
            let bucket = &mut state.buckets[bucket_index];
            let span = state.spans.get_mut(span_id);
            if bucket.active_head != Some(span_id) {
                span.next = bucket.active_head;
                bucket.active_head = Some(span_id);
            }
        }

        let pages: &dyn PageAllocator = self.pages.as_ref();
        let span = state.spans.get_mut(span_id);
        let (slot_start, is_already_zeroed) = if span.freelist_head != 0 {
            (span.pop_free(pages)?, false)
        } else {
            (span.provision(pages)?, fresh)
        };
        if span.stores_raw_size() {
            span.raw_size = raw_size;
        }
        Ok(SlotAlloc {
            slot_start,
            utilized_slot_size: span.utilized_slot_size(),
            is_already_zeroed,
            is_direct_mapped: false,
        })
    }

    /// Sweep the active list until a span with free or unprovisioned slots is
    /// at its head. Empty and decommitted spans move to their lists, full
    /// spans are dropped from the list and counted.
    pub(crate) fn set_new_active_slot_span(
        &self,
        state: &mut RootState,
        bucket_index: usize,
    ) -> bool {
        let mut cursor = state.buckets[bucket_index].active_head;
        while let Some(id) = cursor {
            let span = state.spans.get_mut(id);
            let next = span.next;
            let bucket = &mut state.buckets[bucket_index];
            if span.is_active() {
                bucket.active_head = Some(id);
                return true;
            }
            if span.is_empty() {
                span.next = bucket.empty_head;
                bucket.empty_head = Some(id);
            } else if span.is_decommitted() {
                span.next = bucket.decommitted_head;
                bucket.decommitted_head = Some(id);
            } else {
                debug_assert!(span.is_full());
                span.marked_full = true;
                span.next = None;
                bucket.num_full_slot_spans += 1;
            }
            cursor = next;
        }
        state.buckets[bucket_index].active_head = None;
        false
    }

    /// Pop the first span of the empty list that still has committed memory.
    /// Decommitted spans met on the way move to the decommitted list.
    fn pop_empty_slot_span(&self, state: &mut RootState, bucket_index: usize) -> Option<SpanId> {
        while let Some(id) = state.buckets[bucket_index].empty_head {
            let span = state.spans.get_mut(id);
            let bucket = &mut state.buckets[bucket_index];
            bucket.empty_head = span.next;
            if span.is_empty() {
                span.next = None;
                return Some(id);
            }
            debug_assert!(span.is_decommitted());
            span.next = bucket.decommitted_head;
            bucket.decommitted_head = Some(id);
        }
        None
    }

    fn recommit_slot_span(&self, state: &mut RootState, id: SpanId) -> Result<(), AllocError> {
        let span = state.spans.get_mut(id);
        let size = span.committed_size();
        self.pages.commit(span.base, size)?;
        self.counters.increase_committed(size);
        span.reset_for_reuse();
        self.record(
            LifecycleLevel::Debug,
            "slow_path_alloc",
            "span_recommitted",
            Some(span.base),
            Some(size),
            Some(span.bucket),
            "recommitted",
            String::new(),
        );
        Ok(())
    }

    /// Carve a new span out of the current super page, reserving another
    /// super page when the current one is exhausted.
    fn alloc_new_slot_span(
        &self,
        state: &mut RootState,
        bucket_index: usize,
    ) -> Result<SpanId, AllocError> {
        let bucket = &state.buckets[bucket_index];
        let num_partition_pages = bucket.num_partition_pages();
        let committed = bucket.bytes_per_span();
        let slot_size = bucket.slot_size;
        let capacity = bucket.slots_per_span();
        let span_bytes = num_partition_pages * PARTITION_PAGE_SIZE;
        debug_assert!(num_partition_pages <= NUM_PARTITION_PAGES_PER_SUPER_PAGE - 2);

        if state.extents.available_partition_bytes() < span_bytes {
            self.reserve_super_page(state)?;
        }
        let base = state.extents.next_partition_page;
        self.pages.commit(base, committed)?;
        self.counters.increase_committed(committed);
        state.extents.next_partition_page += span_bytes;

        let span = SlotSpan::new(bucket_index, base, slot_size, committed, capacity);
        let id = state.spans.insert(span);
        let meta = self
            .super_page_metadata(base)
            .ok_or(AllocError::Integrity(crate::IntegrityError::SpanCorrupted {
                ptr: base,
                reason: "super page metadata missing for new span",
            }))?;
        meta.map_span(base, num_partition_pages, id, bucket_index);
        self.record(
            LifecycleLevel::Debug,
            "slow_path_alloc",
            "span_created",
            Some(base),
            Some(committed),
            Some(bucket_index),
            "carved",
            format!("slot_size={slot_size};capacity={capacity};partition_pages={num_partition_pages}"),
        );
        Ok(id)
    }

    /// Reserve one super page, extending the current extent when the address
    /// space places it right after the previous one.
    fn reserve_super_page(&self, state: &mut RootState) -> Result<(), AllocError> {
        let hint = state.extents.next_super_page;
        let base = self.pages.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, hint)?;
        self.counters.increase_super_pages(SUPER_PAGE_SIZE);
        let contiguous = hint == Some(base);
        state.extents.add_super_page(base, contiguous);
        self.register_super_page(base);
        self.record(
            LifecycleLevel::Info,
            "slow_path_alloc",
            "super_page_reserved",
            Some(base),
            Some(SUPER_PAGE_SIZE),
            None,
            if contiguous { "extended" } else { "new_extent" },
            format!("extents={}", state.extents.super_pages.len()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_slots_pack_into_partition_pages() {
        // 16-byte slots pack perfectly; the ratio only penalizes unfaulted pages.
        let pages = system_pages_per_slot_span(16);
        assert_eq!(pages % NUM_SYSTEM_PAGES_PER_PARTITION_PAGE, 0);
        assert!(pages <= MAX_SYSTEM_PAGES_PER_SLOT_SPAN);
    }

    #[test]
    fn test_pages_per_span_bounded() {
        for index in 0..NUM_BUCKETS {
            if !size_class::is_valid_bucket(index) {
                continue;
            }
            let slot_size = size_class::bucket_slot_size(index);
            let bucket = Bucket::new(slot_size);
            assert!(bucket.num_system_pages_per_slot_span > 0);
            assert!(bucket.slots_per_span() >= 1, "slot size {slot_size}");
            assert!(bucket.num_partition_pages() <= NUM_PARTITION_PAGES_PER_SUPER_PAGE - 2);
            if bucket.can_store_raw_size() {
                assert_eq!(bucket.slots_per_span(), 1);
            }
        }
    }

    #[test]
    fn test_large_slot_gets_dedicated_span() {
        let bucket = Bucket::new(size_class::bucket_slot_size(NUM_BUCKETS - 1));
        assert!(bucket.can_store_raw_size());
        assert_eq!(bucket.bytes_per_span(), size_class::MAX_BUCKETED);
        assert_eq!(bucket.slots_per_span(), 1);
        assert_eq!(
            bucket.num_partition_pages(),
            size_class::MAX_BUCKETED.div_ceil(PARTITION_PAGE_SIZE)
        );
    }

    #[test]
    fn test_largest_multi_slot_span_is_not_raw() {
        let bucket = Bucket::new(MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE);
        assert!(!bucket.can_store_raw_size());
    }

    #[test]
    fn test_init_buckets_appends_sentinel() {
        let buckets = init_buckets();
        assert_eq!(buckets.len(), NUM_BUCKETS + 1);
        assert_eq!(buckets[SENTINEL_BUCKET].slot_size, 0);
        assert!(buckets.iter().all(|b| b.active_head.is_none() && b.num_full_slot_spans == 0));
    }
}
