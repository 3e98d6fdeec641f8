//! Purging, statistics and the memory reclaimer.

use std::sync::Arc;

use partalloc_core::{
    AddressSpace, CheckMode, CollectingStatsDumper, IntegrityError, MemoryReclaimer, PartitionAllocator,
    PartitionOptions, PurgeFlags, ZeroOnFree,
};

const SYSTEM_PAGE: usize = 4096;

fn panic_on_corruption(err: &IntegrityError) -> ! {
    panic!("corruption: {err}")
}

fn partition(seed: u64) -> PartitionAllocator {
    PartitionAllocator::init(
        PartitionOptions::new()
            .with_name("purge-test")
            .with_checks(CheckMode::Release)
            .with_zero_on_free(ZeroOnFree::Never)
            .with_pages(Arc::new(AddressSpace::with_seed(seed)))
            .with_corruption_handler(panic_on_corruption),
    )
}

#[test]
fn decommit_returns_empty_spans() {
    let root = partition(301);
    let ptrs: Vec<usize> = (0..64).map(|_| root.allocate(SYSTEM_PAGE).unwrap()).collect();
    let committed = root.total_size_of_committed_pages();
    assert_eq!(committed, 64 * SYSTEM_PAGE);
    for ptr in ptrs {
        root.free(ptr);
    }
    assert_eq!(root.total_size_of_committed_pages(), committed);
    assert_eq!(root.empty_ring_occupancy(), 16);

    let report = root.purge(PurgeFlags::DECOMMIT_EMPTY_SLOT_SPANS);
    assert_eq!(report.decommitted_bytes, committed);
    assert_eq!(root.total_size_of_committed_pages(), 0);
    assert_eq!(root.empty_ring_occupancy(), 0);

    let again = root.purge(PurgeFlags::DECOMMIT_EMPTY_SLOT_SPANS);
    assert_eq!(again.decommitted_bytes, 0);

    // Decommitted spans are recommitted on demand.
    let ptr = root.allocate(SYSTEM_PAGE).unwrap();
    root.write(ptr, &[9; SYSTEM_PAGE]).unwrap();
    assert_eq!(root.total_size_of_committed_pages(), 4 * SYSTEM_PAGE);
    root.free(ptr);
}

#[test]
fn empty_ring_overflow_decommits_oldest_span() {
    let root = partition(302);
    // 17 single-slot spans of 16 KiB.
    let ptrs: Vec<usize> = (0..17).map(|_| root.allocate(16 * 1024).unwrap()).collect();
    let committed = root.total_size_of_committed_pages();
    for ptr in ptrs {
        root.free(ptr);
    }
    assert_eq!(root.empty_ring_occupancy(), 16);
    assert_eq!(root.total_size_of_committed_pages(), committed - 16 * 1024);
}

#[test]
fn discard_releases_pages_under_free_slots() {
    let root = partition(303);
    let slot = 12 * 1024;
    let slots: Vec<usize> = (0..4).map(|_| root.allocate(slot).unwrap()).collect();
    for &ptr in &slots {
        root.fill(ptr, slot, 0x11).unwrap();
    }
    root.free(slots[1]);
    root.free(slots[2]);

    let report = root.purge(PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES);
    // The tail of the list loses all three pages, the other free slot keeps
    // the page holding its free-list entry.
    assert_eq!(report.discarded_bytes, 5 * SYSTEM_PAGE);
    assert_eq!(report.decommitted_bytes, 0);

    let repeat = root.purge(PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES);
    assert_eq!(repeat.discarded_bytes, 0);

    for &ptr in [slots[0], slots[3]].iter() {
        assert!(root.read_vec(ptr, slot).unwrap().iter().all(|&b| b == 0x11));
    }
    // The free list survives the discard.
    let a = root.allocate(slot).unwrap();
    let b = root.allocate(slot).unwrap();
    assert_eq!(a, slots[2]);
    assert_eq!(b, slots[1]);
}

#[test]
fn force_all_freed_combines_both_passes() {
    let root = partition(304);
    let keep = root.allocate(12 * 1024).unwrap();
    let drop_me: Vec<usize> = (0..3).map(|_| root.allocate(12 * 1024).unwrap()).collect();
    let empty: Vec<usize> = (0..4).map(|_| root.allocate(64 * 1024).unwrap()).collect();
    for ptr in drop_me.into_iter().chain(empty) {
        root.fill(ptr, 4096, 1).unwrap();
        root.free(ptr);
    }
    let report = root.purge(PurgeFlags::FORCE_ALL_FREED);
    assert!(report.decommitted_bytes >= 4 * 64 * 1024);
    assert!(report.discarded_bytes > 0);
    assert_eq!(root.counters().purges, 1);
    root.free(keep);
}

#[test]
fn stats_describe_live_memory() {
    let root = partition(305);
    let small: Vec<usize> = (0..10).map(|_| root.allocate(64).unwrap()).collect();
    let big = root.allocate(1 << 20).unwrap();

    let mut dumper = CollectingStatsDumper::new();
    root.dump_stats("stats", false, &mut dumper);
    assert_eq!(dumper.partition_name.as_deref(), Some("stats"));
    let totals = dumper.totals.unwrap();
    assert_eq!(totals.total_active_bytes, 10 * 64 + (1 << 20));
    assert_eq!(totals.num_super_pages, 1);
    assert_eq!(totals.num_direct_mapped_allocations, 1);
    assert_eq!(totals.total_mmapped_bytes, 2 * (2 << 20));
    assert!(totals.total_committed_bytes >= totals.total_resident_bytes);
    assert!(!totals.has_thread_cache);

    let bucket = dumper.bucket(64).unwrap();
    assert_eq!(bucket.active_bytes, 640);
    assert_eq!(bucket.num_active_slot_spans, 1);
    assert_eq!(bucket.resident_bytes, SYSTEM_PAGE);
    let direct = dumper.buckets.iter().find(|b| b.is_direct_map).unwrap();
    assert_eq!(direct.active_bytes, 1 << 20);

    let mut light = CollectingStatsDumper::new();
    root.dump_stats("stats", true, &mut light);
    assert!(light.buckets.is_empty());
    assert_eq!(light.totals, Some(totals));

    for ptr in small {
        root.free(ptr);
    }
    root.free(big);
    let mut after = CollectingStatsDumper::new();
    root.dump_stats("stats", false, &mut after);
    let bucket = after.bucket(64).unwrap();
    assert_eq!(bucket.num_empty_slot_spans, 1);
    assert_eq!(bucket.decommittable_bytes, SYSTEM_PAGE);
    assert_eq!(after.totals.unwrap().num_direct_mapped_allocations, 0);
}

#[test]
fn stats_serialize_to_json() {
    let root = partition(306);
    let ptr = root.allocate(100).unwrap();
    let mut dumper = CollectingStatsDumper::new();
    root.dump_stats("json", false, &mut dumper);
    let json = serde_json::to_value(&dumper).unwrap();
    assert_eq!(json["partition_name"], "json");
    assert!(json["totals"]["total_active_bytes"].as_u64().unwrap() >= 100);
    root.free(ptr);
}

#[test]
fn reclaimer_purges_registered_roots() {
    let reclaimer = MemoryReclaimer::new();
    let root = partition(307);
    reclaimer.register(root.root());
    reclaimer.register(root.root());
    assert_eq!(reclaimer.registered_count(), 1);

    let ptrs: Vec<usize> = (0..8).map(|_| root.allocate(SYSTEM_PAGE).unwrap()).collect();
    for ptr in ptrs {
        root.free(ptr);
    }
    let report = reclaimer.reclaim();
    assert_eq!(report.decommitted_bytes, 8 * SYSTEM_PAGE);

    drop(root);
    assert_eq!(reclaimer.registered_count(), 0);
    assert_eq!(reclaimer.reclaim().decommitted_bytes, 0);
}
