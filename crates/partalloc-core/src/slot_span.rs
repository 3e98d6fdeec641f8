//! Slot spans: runs of equal-size slots carved from partition pages.
//!
//! A span owns the free list of its slots and a few counters. Slots are
//! provisioned lazily: only the slots whose free-list entries land in
//! already-touched system pages are linked into the free list, the rest are
//! counted as unprovisioned.

use partalloc_pages::PageAllocator;
use partalloc_pages::geometry::{MAX_SYSTEM_PAGES_PER_SLOT_SPAN, SYSTEM_PAGE_SIZE, align_up};

use crate::error::{AllocError, IntegrityError};
use crate::freelist::{self, ENTRY_SIZE};
use crate::log::LifecycleLevel;
use crate::root::{PartitionRoot, RootState};
use crate::size_class::SENTINEL_BUCKET;

/// Number of recently emptied spans kept committed before decommit.
pub const EMPTY_RING_SIZE: usize = 16;

/// Index of a span in its root's span table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(pub(crate) u32);

impl SpanId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SlotSpan {
    pub bucket: usize,
    pub base: usize,
    pub slot_size: usize,
    /// Bytes committed while the span is not decommitted.
    committed: usize,
    pub capacity: usize,
    pub freelist_head: usize,
    pub num_allocated_slots: usize,
    pub num_unprovisioned_slots: usize,
    pub raw_size: usize,
    pub marked_full: bool,
    pub empty_cache_index: Option<usize>,
    pub next: Option<SpanId>,
    pub is_direct_mapped: bool,
}

impl SlotSpan {
    pub fn new(bucket: usize, base: usize, slot_size: usize, committed: usize, capacity: usize) -> Self {
        Self {
            bucket,
            base,
            slot_size,
            committed,
            capacity,
            freelist_head: 0,
            num_allocated_slots: 0,
            num_unprovisioned_slots: capacity,
            raw_size: 0,
            marked_full: false,
            empty_cache_index: None,
            next: None,
            is_direct_mapped: false,
        }
    }

    /// A direct-mapped span holding its single slot as allocated.
    pub fn direct_mapped(base: usize, slot_size: usize, raw_size: usize) -> Self {
        Self {
            bucket: SENTINEL_BUCKET,
            base,
            slot_size,
            committed: slot_size,
            capacity: 1,
            freelist_head: 0,
            num_allocated_slots: 1,
            num_unprovisioned_slots: 0,
            raw_size,
            marked_full: false,
            empty_cache_index: None,
            next: None,
            is_direct_mapped: true,
        }
    }

    fn vacant() -> Self {
        Self::new(SENTINEL_BUCKET, 0, 0, 0, 0)
    }

    pub fn committed_size(&self) -> usize {
        self.committed
    }

    pub fn set_committed_size(&mut self, committed: usize) {
        self.committed = committed;
    }

    pub fn end(&self) -> usize {
        self.base + self.capacity * self.slot_size
    }

    pub fn is_active(&self) -> bool {
        self.num_allocated_slots > 0
            && (self.freelist_head != 0 || self.num_unprovisioned_slots > 0)
    }

    pub fn is_full(&self) -> bool {
        self.num_allocated_slots == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.num_allocated_slots == 0 && self.freelist_head != 0
    }

    pub fn is_decommitted(&self) -> bool {
        let decommitted = self.num_allocated_slots == 0 && self.freelist_head == 0;
        debug_assert!(!decommitted || self.num_unprovisioned_slots == 0);
        decommitted
    }

    pub fn stores_raw_size(&self) -> bool {
        self.is_direct_mapped || self.slot_size > MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE
    }

    /// Bytes of the slot the current allocation may touch.
    pub fn utilized_slot_size(&self) -> usize {
        if self.stores_raw_size() && self.raw_size != 0 {
            self.raw_size
        } else {
            self.slot_size
        }
    }

    /// Whether `slot_start` is the start of one of this span's slots.
    pub fn contains_slot(&self, slot_start: usize) -> bool {
        slot_start >= self.base
            && slot_start < self.end()
            && (slot_start - self.base) % self.slot_size == 0
    }

    /// State after a decommitted span's memory is committed again.
    pub fn reset_for_reuse(&mut self) {
        debug_assert!(self.is_decommitted());
        self.freelist_head = 0;
        self.num_allocated_slots = 0;
        self.num_unprovisioned_slots = self.capacity;
        self.marked_full = false;
    }

    fn validated_next(&self, pages: &dyn PageAllocator, entry: usize) -> Result<usize, AllocError> {
        let next = freelist::read_next(pages, entry)?;
        if next != 0 && !self.contains_slot(next) {
            return Err(IntegrityError::FreelistCorrupted {
                span_base: self.base,
                entry: next,
            }
            .into());
        }
        Ok(next)
    }

    /// Take the free-list head.
    pub fn pop_free(&mut self, pages: &dyn PageAllocator) -> Result<usize, AllocError> {
        let head = self.freelist_head;
        debug_assert_ne!(head, 0);
        if !self.contains_slot(head) {
            return Err(IntegrityError::FreelistCorrupted {
                span_base: self.base,
                entry: head,
            }
            .into());
        }
        self.freelist_head = self.validated_next(pages, head)?;
        self.num_allocated_slots += 1;
        Ok(head)
    }

    /// Push a freed slot onto the free list.
    pub fn push_free(&mut self, pages: &dyn PageAllocator, slot_start: usize) -> Result<(), AllocError> {
        if slot_start == self.freelist_head {
            return Err(IntegrityError::DoubleFree { ptr: slot_start }.into());
        }
        if self.num_allocated_slots == 0 {
            return Err(IntegrityError::SpanCorrupted {
                ptr: slot_start,
                reason: "free of a slot in a span with no allocations",
            }
            .into());
        }
        freelist::write_next(pages, slot_start, self.freelist_head)?;
        self.freelist_head = slot_start;
        self.num_allocated_slots -= 1;
        Ok(())
    }

    /// Return the first unprovisioned slot and link as many following slots
    /// into the free list as fit before the next system page boundary.
    pub fn provision(&mut self, pages: &dyn PageAllocator) -> Result<usize, AllocError> {
        debug_assert_eq!(self.freelist_head, 0);
        let mut num_slots = self.num_unprovisioned_slots;
        if num_slots == 0 {
            return Err(IntegrityError::SpanCorrupted {
                ptr: self.base,
                reason: "provisioning a span with no unprovisioned slots",
            }
            .into());
        }
        let size = self.slot_size;
        let return_slot = self.base + size * (self.capacity - num_slots);
        let first_entry = return_slot + size;
        let first_entry_extent = first_entry + ENTRY_SIZE;
        let sub_page_limit = align_up(first_entry, SYSTEM_PAGE_SIZE);
        let slots_limit = return_slot + size * num_slots;
        let freelist_limit = sub_page_limit.min(slots_limit);

        let mut num_new_entries = 0;
        if first_entry_extent <= freelist_limit {
            num_new_entries = 1 + (freelist_limit - first_entry_extent) / size;
        }
        debug_assert!(num_new_entries < num_slots);
        num_slots -= num_new_entries + 1;
        self.num_unprovisioned_slots = num_slots;
        self.num_allocated_slots += 1;

        if num_new_entries > 0 {
            self.freelist_head = first_entry;
            let mut entry = first_entry;
            for _ in 1..num_new_entries {
                let next = entry + size;
                freelist::write_next(pages, entry, next)?;
                entry = next;
            }
            freelist::write_next(pages, entry, 0)?;
        } else {
            self.freelist_head = 0;
        }
        Ok(return_slot)
    }

    /// Walk the free list, bounded by the capacity so a cycle cannot hang.
    pub fn free_slots(&self, pages: &dyn PageAllocator) -> Result<Vec<usize>, AllocError> {
        let mut slots = Vec::new();
        let mut entry = self.freelist_head;
        while entry != 0 {
            if slots.len() >= self.capacity || !self.contains_slot(entry) {
                return Err(IntegrityError::FreelistCorrupted {
                    span_base: self.base,
                    entry,
                }
                .into());
            }
            slots.push(entry);
            entry = self.validated_next(pages, entry)?;
        }
        Ok(slots)
    }
}

/// Span metadata for one root. Ids of removed spans are reused.
#[derive(Debug, Default)]
pub(crate) struct SpanTable {
    spans: Vec<SlotSpan>,
    vacant: Vec<SpanId>,
}

impl SpanTable {
    pub fn insert(&mut self, span: SlotSpan) -> SpanId {
        if let Some(id) = self.vacant.pop() {
            self.spans[id.index()] = span;
            return id;
        }
        let id = SpanId(self.spans.len() as u32);
        self.spans.push(span);
        id
    }

    pub fn remove(&mut self, id: SpanId) -> SlotSpan {
        let span = std::mem::replace(&mut self.spans[id.index()], SlotSpan::vacant());
        self.vacant.push(id);
        span
    }

    pub fn get(&self, id: SpanId) -> &SlotSpan {
        &self.spans[id.index()]
    }

    pub fn get_mut(&mut self, id: SpanId) -> &mut SlotSpan {
        &mut self.spans[id.index()]
    }

    /// Live spans with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (SpanId, &SlotSpan)> {
        self.spans
            .iter()
            .enumerate()
            .filter(|(_, span)| span.slot_size != 0)
            .map(|(index, span)| (SpanId(index as u32), span))
    }

    pub fn ids(&self) -> Vec<SpanId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

/// Ring of the most recently emptied spans.
#[derive(Debug, Default)]
pub(crate) struct EmptyRing {
    entries: [Option<SpanId>; EMPTY_RING_SIZE],
    cursor: usize,
}

impl EmptyRing {
    /// Drop every entry, returning the ids that were registered.
    pub fn drain(&mut self) -> Vec<SpanId> {
        self.cursor = 0;
        self.entries.iter_mut().filter_map(Option::take).collect()
    }

    pub fn occupied(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

impl PartitionRoot {
    /// Return one slot to its span. Must run under the root lock.
    pub(crate) fn free_to_span(
        &self,
        state: &mut RootState,
        id: SpanId,
        slot_start: usize,
    ) -> Result<(), AllocError> {
        let bucket_index = {
            let pages: &dyn PageAllocator = self.pages.as_ref();
            let span = state.spans.get_mut(id);
            if !span.contains_slot(slot_start) {
                return Err(IntegrityError::MisalignedSlot { ptr: slot_start }.into());
            }
            span.push_free(pages, slot_start)?;
            span.bucket
        };

        let span = state.spans.get_mut(id);
        if span.marked_full {
            // A full span regains a free slot: back to the head of the active list.
            span.marked_full = false;
            let bucket = &mut state.buckets[bucket_index];
            debug_assert!(bucket.num_full_slot_spans > 0);
            bucket.num_full_slot_spans = bucket.num_full_slot_spans.saturating_sub(1);
            span.next = bucket.active_head;
            bucket.active_head = Some(id);
        }

        if state.spans.get(id).num_allocated_slots == 0 {
            if state.buckets[bucket_index].active_head == Some(id) {
                self.set_new_active_slot_span(state, bucket_index);
            }
            self.register_empty_slot_span(state, id)?;
        }
        Ok(())
    }

    fn register_empty_slot_span(&self, state: &mut RootState, id: SpanId) -> Result<(), AllocError> {
        if let Some(index) = state.spans.get_mut(id).empty_cache_index.take() {
            state.empty_ring.entries[index] = None;
        }
        let cursor = state.empty_ring.cursor;
        if let Some(evicted) = state.empty_ring.entries[cursor].take() {
            state.spans.get_mut(evicted).empty_cache_index = None;
            self.decommit_if_possible(state, evicted)?;
        }
        state.empty_ring.entries[cursor] = Some(id);
        state.spans.get_mut(id).empty_cache_index = Some(cursor);
        state.empty_ring.cursor = (cursor + 1) % EMPTY_RING_SIZE;
        Ok(())
    }

    /// Decommit a span that is still empty. Returns the bytes decommitted.
    pub(crate) fn decommit_if_possible(&self, state: &mut RootState, id: SpanId) -> Result<usize, AllocError> {
        let span = state.spans.get_mut(id);
        span.empty_cache_index = None;
        if !span.is_empty() {
            return Ok(0);
        }
        let size = span.committed_size();
        self.pages.decommit(span.base, size)?;
        self.counters.decrease_committed(size);
        span.freelist_head = 0;
        span.num_unprovisioned_slots = 0;
        let (base, bucket) = (span.base, span.bucket);
        self.record(
            LifecycleLevel::Debug,
            "free",
            "span_decommitted",
            Some(base),
            Some(size),
            Some(bucket),
            "decommitted",
            String::new(),
        );
        Ok(size)
    }

    /// Decommit every span registered in the empty ring.
    pub(crate) fn decommit_empty_slot_spans(&self, state: &mut RootState) -> Result<usize, AllocError> {
        let mut decommitted = 0;
        for id in state.empty_ring.drain() {
            decommitted += self.decommit_if_possible(state, id)?;
        }
        Ok(decommitted)
    }
}
