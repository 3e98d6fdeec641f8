//! Direct-mapped allocations above the largest bucket.

use std::sync::Arc;

use partalloc_core::{
    AddressSpace, AllocFlags, CheckMode, IntegrityError, MAX_BUCKETED, MAX_DIRECT_MAPPED, PartitionAllocator,
    PartitionOptions,
};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

fn panic_on_corruption(err: &IntegrityError) -> ! {
    panic!("corruption: {err}")
}

fn partition(checks: CheckMode, seed: u64) -> PartitionAllocator {
    PartitionAllocator::init(
        PartitionOptions::new()
            .with_checks(checks)
            .with_pages(Arc::new(AddressSpace::with_seed(seed)))
            .with_corruption_handler(panic_on_corruption),
    )
}

#[test]
fn largest_bucketed_request_stays_in_a_bucket() {
    let root = partition(CheckMode::Release, 201);
    let bucketed = root.allocate(MAX_BUCKETED).unwrap();
    assert_eq!(root.total_size_of_direct_mapped_pages(), 0);
    assert_eq!(root.get_usable_size(bucketed), MAX_BUCKETED);

    let direct = root.allocate(MAX_BUCKETED + 1).unwrap();
    assert_eq!(root.total_size_of_direct_mapped_pages(), 2 * MIB);
    assert_eq!(root.get_usable_size(direct), MAX_BUCKETED + 1);
    root.free(direct);
    root.free(bucketed);
    assert_eq!(root.total_size_of_direct_mapped_pages(), 0);
}

#[test]
fn direct_map_limit_is_exact() {
    let root = partition(CheckMode::Release, 202);
    let ptr = root.allocate(MAX_DIRECT_MAPPED).unwrap();
    assert_eq!(root.get_usable_size(ptr), MAX_DIRECT_MAPPED);
    root.free(ptr);
    assert_eq!(root.allocate_flags(AllocFlags::RETURN_NULL, MAX_DIRECT_MAPPED + 1), None);
}

#[test]
fn extras_count_against_the_limit() {
    let root = partition(CheckMode::Checked, 203);
    let overhead = root.extras().size();
    assert!(overhead > 0);
    assert_eq!(
        root.allocate_flags(AllocFlags::RETURN_NULL, MAX_DIRECT_MAPPED - overhead + 1),
        None
    );
}

#[test]
fn free_unmaps_the_reservation() {
    let root = partition(CheckMode::Release, 204);
    let before = root.total_size_of_committed_pages();
    let ptr = root.allocate(3 * MIB).unwrap();
    assert_eq!(root.total_size_of_direct_mapped_pages(), 4 * MIB);
    assert_eq!(root.total_size_of_committed_pages(), before + 3 * MIB);
    root.write(ptr + 3 * MIB - 1, &[7]).unwrap();
    root.free(ptr);
    assert_eq!(root.total_size_of_direct_mapped_pages(), 0);
    assert_eq!(root.total_size_of_committed_pages(), before);
    assert!(root.read_vec(ptr, 1).is_err());
}

#[test]
fn direct_map_comes_back_zeroed() {
    let root = partition(CheckMode::Checked, 205);
    let ptr = root.allocate_flags(AllocFlags::ZERO_FILL, 1536 * KIB).unwrap();
    assert!(root.read_vec(ptr, 64 * KIB).unwrap().iter().all(|&b| b == 0));
    root.free(ptr);
}

#[test]
fn resize_in_place_within_reservation() {
    let root = partition(CheckMode::Release, 206);
    let ptr = root.allocate(1536 * KIB).unwrap();
    root.write(ptr, b"direct").unwrap();

    // Grows into the uncommitted tail of the 2 MiB reservation.
    assert_eq!(root.reallocate(ptr, 1900 * KIB), Some(ptr));
    assert_eq!(root.get_usable_size(ptr), 1900 * KIB);
    root.write(ptr + 1900 * KIB - 1, &[1]).unwrap();

    // Shrinking a little keeps the mapping.
    assert_eq!(root.reallocate(ptr, 1700 * KIB), Some(ptr));
    assert_eq!(root.total_size_of_committed_pages(), 1700 * KIB);

    // Shrinking below 80% of the reservation moves the data.
    let moved = root.reallocate(ptr, 1200 * KIB).unwrap();
    assert_ne!(moved, ptr);
    assert_eq!(root.read_vec(moved, 6).unwrap(), b"direct");

    // Growing past the reservation moves it again.
    let grown = root.reallocate(moved, 3 * MIB).unwrap();
    assert_ne!(grown, moved);
    assert_eq!(root.read_vec(grown, 6).unwrap(), b"direct");
    root.free(grown);
    assert_eq!(root.total_size_of_direct_mapped_pages(), 0);
}

#[test]
fn resize_in_place_keeps_cookies_valid() {
    let root = partition(CheckMode::Checked, 207);
    let ptr = root.allocate(1536 * KIB).unwrap();
    assert_eq!(root.reallocate(ptr, 1800 * KIB), Some(ptr));
    assert_eq!(root.reallocate(ptr, 1650 * KIB), Some(ptr));
    root.free(ptr);
}

#[test]
fn shrinking_into_bucket_range_moves_to_a_bucket() {
    let root = partition(CheckMode::Release, 208);
    let ptr = root.allocate(MIB).unwrap();
    let small = root.reallocate(ptr, 4 * KIB).unwrap();
    assert_ne!(small, ptr);
    assert_eq!(root.total_size_of_direct_mapped_pages(), 0);
    root.free(small);
}

#[test]
fn many_direct_maps_are_tracked_separately() {
    let root = partition(CheckMode::Release, 209);
    let ptrs: Vec<usize> = (1..=8).map(|i| root.allocate(i * MIB).unwrap()).collect();
    let expected: usize = (1..=8usize)
        .map(|i| (i * MIB + 32 * KIB).div_ceil(2 * MIB) * 2 * MIB)
        .sum();
    assert_eq!(root.total_size_of_direct_mapped_pages(), expected);
    for ptr in ptrs.into_iter().rev() {
        root.free(ptr);
    }
    assert_eq!(root.total_size_of_direct_mapped_pages(), 0);
    assert_eq!(root.total_size_of_committed_pages(), 0);
}
