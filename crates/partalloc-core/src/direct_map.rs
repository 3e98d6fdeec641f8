//! Direct mapping of requests above the largest bucket.
//!
//! Each direct map is its own reservation, aligned to a super page:
//!
//! ```text
//! | guard / metadata partition page | slot (raw size rounded to a system page) | uncommitted tail, guard |
//! ```
//!
//! The reservation is the slot plus two partition pages, rounded up to the
//! super-page size. The slot may later grow into the uncommitted tail or give
//! back its own tail in place.

use partalloc_pages::geometry::{PARTITION_PAGE_SIZE, SUPER_PAGE_SIZE, SYSTEM_PAGE_SIZE, align_up};

use crate::error::AllocError;
use crate::extent::DirectMapExtent;
use crate::log::LifecycleLevel;
use crate::root::{PartitionRoot, RootState, SlotAlloc};
use crate::size_class::{MAX_BUCKETED, SENTINEL_BUCKET};
use crate::slot_span::{SlotSpan, SpanId};

/// Largest raw size that can be direct-mapped.
pub const MAX_DIRECT_MAPPED: usize = (1 << 31) - SYSTEM_PAGE_SIZE;

/// Smallest slot a direct map may be resized to in place.
const MIN_DIRECT_MAPPED_DOWNSIZE: usize = MAX_BUCKETED + 1;

#[must_use]
pub const fn direct_map_slot_size(raw_size: usize) -> usize {
    align_up(raw_size, SYSTEM_PAGE_SIZE)
}

#[must_use]
pub const fn direct_map_reservation_size(slot_size: usize) -> usize {
    align_up(slot_size + 2 * PARTITION_PAGE_SIZE, SUPER_PAGE_SIZE)
}

/// Largest slot that fits in a reservation of `reservation_size` bytes.
#[must_use]
pub const fn direct_map_capacity(reservation_size: usize) -> usize {
    reservation_size - 2 * PARTITION_PAGE_SIZE
}

/// A direct map removed from the root, released once the lock is dropped.
#[derive(Debug)]
#[must_use]
pub(crate) struct DeferredUnmap {
    pub reservation_base: usize,
    pub reservation_size: usize,
}

impl DeferredUnmap {
    pub fn run(self, root: &PartitionRoot) -> Result<(), AllocError> {
        root.pages.release(self.reservation_base, self.reservation_size)?;
        Ok(())
    }
}

impl PartitionRoot {
    pub(crate) fn direct_map(&self, state: &mut RootState, raw_size: usize) -> Result<SlotAlloc, AllocError> {
        if raw_size > MAX_DIRECT_MAPPED {
            return Err(AllocError::ExcessiveSize {
                size: raw_size,
                limit: MAX_DIRECT_MAPPED,
            });
        }
        let slot_size = direct_map_slot_size(raw_size);
        let reservation_size = direct_map_reservation_size(slot_size);
        let reservation_base = self.pages.reserve(reservation_size, SUPER_PAGE_SIZE, None)?;
        let slot_start = reservation_base + PARTITION_PAGE_SIZE;
        if let Err(err) = self.pages.commit(slot_start, slot_size) {
            self.pages.release(reservation_base, reservation_size)?;
            return Err(err.into());
        }
        self.counters.increase_direct_mapped(reservation_size);
        self.counters.increase_committed(slot_size);

        let id = state
            .spans
            .insert(SlotSpan::direct_mapped(slot_start, slot_size, raw_size));
        state.extents.direct_maps.push(DirectMapExtent {
            reservation_base,
            reservation_size,
            span: id,
        });
        let meta = self.register_super_page(reservation_base);
        meta.map_span(slot_start, 1, id, SENTINEL_BUCKET);

        self.record(
            LifecycleLevel::Info,
            "allocate",
            "direct_map",
            Some(slot_start),
            Some(raw_size),
            Some(SENTINEL_BUCKET),
            "mapped",
            format!("slot_size={slot_size};reservation={reservation_size}"),
        );
        Ok(SlotAlloc {
            slot_start,
            utilized_slot_size: raw_size,
            is_already_zeroed: true,
            is_direct_mapped: true,
        })
    }

    /// Forget a direct map. The reservation is released by the caller after
    /// the root lock is dropped.
    pub(crate) fn unmap_direct(&self, state: &mut RootState, id: SpanId) -> Result<DeferredUnmap, AllocError> {
        let extent = state.extents.take_direct_map(id).ok_or(crate::IntegrityError::SpanCorrupted {
            ptr: state.spans.get(id).base,
            reason: "direct map extent missing",
        })?;
        let span = state.spans.remove(id);
        self.unregister_super_page(extent.reservation_base);
        self.counters.decrease_committed(span.committed_size());
        self.counters.decrease_direct_mapped(extent.reservation_size);
        self.record(
            LifecycleLevel::Info,
            "free",
            "direct_unmap",
            Some(span.base),
            Some(span.raw_size),
            Some(SENTINEL_BUCKET),
            "unmapped",
            format!("reservation={}", extent.reservation_size),
        );
        Ok(DeferredUnmap {
            reservation_base: extent.reservation_base,
            reservation_size: extent.reservation_size,
        })
    }

    /// Resize a direct map within its reservation. Returns false when the
    /// request must be served by a fresh allocation instead.
    pub(crate) fn try_realloc_direct_in_place(
        &self,
        state: &mut RootState,
        id: SpanId,
        raw_size: usize,
    ) -> Result<bool, AllocError> {
        let new_slot_size = direct_map_slot_size(raw_size);
        if new_slot_size < MIN_DIRECT_MAPPED_DOWNSIZE || raw_size > MAX_DIRECT_MAPPED {
            return Ok(false);
        }
        let Some(extent) = state.extents.direct_map(id).copied() else {
            return Ok(false);
        };
        let capacity = direct_map_capacity(extent.reservation_size);
        let span = state.spans.get_mut(id);
        let current_slot_size = span.slot_size;

        if new_slot_size < current_slot_size {
            // Keep the mapping only while it stays at least 80% utilized.
            if (new_slot_size / SYSTEM_PAGE_SIZE) * 5 < (capacity / SYSTEM_PAGE_SIZE) * 4 {
                return Ok(false);
            }
            let shrink = current_slot_size - new_slot_size;
            self.pages.decommit(span.base + new_slot_size, shrink)?;
            self.counters.decrease_committed(shrink);
        } else if new_slot_size > current_slot_size {
            if new_slot_size > capacity {
                return Ok(false);
            }
            let grow = new_slot_size - current_slot_size;
            self.pages.commit(span.base + current_slot_size, grow)?;
            self.counters.increase_committed(grow);
        }
        span.slot_size = new_slot_size;
        span.set_committed_size(new_slot_size);
        span.raw_size = raw_size;
        let base = span.base;
        self.record(
            LifecycleLevel::Debug,
            "reallocate",
            "direct_map_resize",
            Some(base),
            Some(raw_size),
            Some(SENTINEL_BUCKET),
            "in_place",
            format!("from={current_slot_size};to={new_slot_size}"),
        );
        Ok(true)
    }
}
