//! Flag sets accepted by the allocation and purge entry points.

use bitflags::bitflags;

bitflags! {
    /// Options for a single allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        /// Return null instead of crashing when the request cannot be met.
        const RETURN_NULL = 1 << 0;
        /// Zero the usable bytes of the returned slot.
        const ZERO_FILL = 1 << 1;
        /// Skip the observer and override hooks.
        const NO_HOOKS = 1 << 2;
    }
}

bitflags! {
    /// What [`crate::PartitionRoot::purge`] reclaims.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PurgeFlags: u32 {
        /// Decommit slot spans that hold no allocations.
        const DECOMMIT_EMPTY_SLOT_SPANS = 1 << 0;
        /// Discard system pages inside spans that are covered only by free slots.
        const DISCARD_UNUSED_SYSTEM_PAGES = 1 << 1;
        /// Everything above, after flushing this thread's cache and the
        /// quarantine so that cached frees are materialized first.
        const FORCE_ALL_FREED = (1 << 2) | (1 << 0) | (1 << 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_all_freed_is_a_superset() {
        assert!(PurgeFlags::FORCE_ALL_FREED.contains(PurgeFlags::DECOMMIT_EMPTY_SLOT_SPANS));
        assert!(PurgeFlags::FORCE_ALL_FREED.contains(PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES));
        assert_ne!(
            PurgeFlags::FORCE_ALL_FREED,
            PurgeFlags::DECOMMIT_EMPTY_SLOT_SPANS | PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES
        );
    }

    #[test]
    fn alloc_flags_compose() {
        let flags = AllocFlags::RETURN_NULL | AllocFlags::ZERO_FILL;
        assert!(flags.contains(AllocFlags::ZERO_FILL));
        assert!(!flags.contains(AllocFlags::NO_HOOKS));
        assert!(AllocFlags::default().is_empty());
    }
}
