//! Purging: decommitting empty spans and discarding unused system pages.

use partalloc_pages::geometry::{SYSTEM_PAGE_SIZE, align_down, align_up};
use partalloc_pages::{PageAllocator, PageState};
use serde::Serialize;

use crate::error::AllocError;
use crate::freelist::{self, ENTRY_SIZE};
use crate::root::{PartitionRoot, RootState};
use crate::slot_span::SpanId;

/// Bytes released by one purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PurgeReport {
    pub decommitted_bytes: usize,
    pub discarded_bytes: usize,
}

/// Resident bytes in `[begin, end)`.
fn resident_bytes(pages: &dyn PageAllocator, begin: usize, end: usize) -> usize {
    (begin..end)
        .step_by(SYSTEM_PAGE_SIZE)
        .filter(|&page| pages.page_state(page) == Some(PageState::Resident))
        .count()
        * SYSTEM_PAGE_SIZE
}

/// Discard (or, with `discard == false`, only measure) `[begin, end)`.
fn release_range(pages: &dyn PageAllocator, begin: usize, end: usize, discard: bool) -> Result<usize, AllocError> {
    if begin >= end {
        return Ok(0);
    }
    let resident = resident_bytes(pages, begin, end);
    if discard && resident > 0 {
        pages.discard(begin, end - begin)?;
    }
    Ok(resident)
}

impl PartitionRoot {
    /// Measure, and with `discard` release, the system pages of a span that
    /// hold no live data. Trailing free slots are turned back into
    /// unprovisioned slots and the free list is rebuilt in address order.
    pub(crate) fn purge_slot_span(&self, state: &mut RootState, id: SpanId, discard: bool) -> Result<usize, AllocError> {
        let pages: &dyn PageAllocator = self.pages.as_ref();
        let span = state.spans.get_mut(id);
        let slot_size = span.slot_size;
        if slot_size < SYSTEM_PAGE_SIZE || span.num_allocated_slots == 0 || span.is_direct_mapped {
            return Ok(0);
        }

        if span.stores_raw_size() {
            let used = align_up(span.utilized_slot_size(), SYSTEM_PAGE_SIZE);
            return release_range(pages, span.base + used, span.base + span.committed_size(), discard);
        }

        let capacity = span.capacity;
        let mut in_use = vec![true; capacity];
        let mut last_slot = None;
        for entry in span.free_slots(pages)? {
            let index = (entry - span.base) / slot_size;
            in_use[index] = false;
            if freelist::read_next(pages, entry)? == 0 {
                last_slot = Some(index);
            }
        }
        // Slots past the provisioned ones never held data.
        let provisioned = capacity - span.num_unprovisioned_slots;
        for slot in in_use.iter_mut().skip(provisioned) {
            *slot = false;
        }

        let mut num_slots = provisioned;
        let mut truncated = 0;
        while num_slots > 0 && !in_use[num_slots - 1] {
            num_slots -= 1;
            truncated += 1;
        }

        let mut released = 0;
        let tail_begin = align_up(span.base + num_slots * slot_size, SYSTEM_PAGE_SIZE);
        let tail_end = align_up(span.base + provisioned * slot_size, SYSTEM_PAGE_SIZE);
        if tail_begin < tail_end {
            released += release_range(pages, tail_begin, tail_end, discard)?;
            if discard && truncated > 0 {
                span.num_unprovisioned_slots += truncated;
                let free: Vec<usize> = (0..num_slots).filter(|&i| !in_use[i]).collect();
                span.freelist_head = free.first().map_or(0, |&i| span.base + i * slot_size);
                for pair in free.windows(2) {
                    freelist::write_next(pages, span.base + pair[0] * slot_size, span.base + pair[1] * slot_size)?;
                }
                if let Some(&last) = free.last() {
                    freelist::write_next(pages, span.base + last * slot_size, 0)?;
                }
                last_slot = free.last().copied();
            }
        }

        for index in (0..num_slots).filter(|&i| !in_use[i]) {
            let slot_start = span.base + index * slot_size;
            // The free-list entry must survive unless it is the null terminator.
            let begin = if last_slot == Some(index) {
                slot_start
            } else {
                slot_start + ENTRY_SIZE
            };
            let begin = align_up(begin, SYSTEM_PAGE_SIZE);
            let end = align_down(slot_start + slot_size, SYSTEM_PAGE_SIZE);
            released += release_range(pages, begin, end, discard)?;
        }
        Ok(released)
    }

    /// Discard unused pages in every active span of the page-sized buckets.
    pub(crate) fn discard_unused_system_pages(&self, state: &mut RootState) -> Result<usize, AllocError> {
        let mut discarded = 0;
        for bucket_index in 0..state.buckets.len() {
            if state.buckets[bucket_index].slot_size < SYSTEM_PAGE_SIZE {
                continue;
            }
            let mut cursor = state.buckets[bucket_index].active_head;
            while let Some(id) = cursor {
                cursor = state.spans.get(id).next;
                discarded += self.purge_slot_span(state, id, true)?;
            }
        }
        Ok(discarded)
    }
}
