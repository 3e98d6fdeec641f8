//! Corruption and misuse reach the corruption handler.

use std::sync::Arc;

use partalloc_core::{
    AddressSpace, CheckMode, IntegrityError, PartitionAllocator, PartitionOptions, ThreadCacheOption,
};

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
#[should_panic(expected = "cookie mismatch")]
fn overwritten_trailing_cookie_is_fatal() {
    let root = partition(CheckMode::Checked, 101);
    let ptr = root.allocate(32).unwrap();
    let usable = root.get_usable_size(ptr);
    root.write(ptr + usable, &[0]).unwrap();
    root.free(ptr);
}

#[test]
#[should_panic(expected = "cookie mismatch")]
fn underflow_into_leading_cookie_is_fatal() {
    let root = partition(CheckMode::Checked, 102);
    let ptr = root.allocate(200).unwrap();
    root.write(ptr - 1, &[0xFF]).unwrap();
    root.free(ptr);
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal() {
    let root = partition(CheckMode::Release, 103);
    let _keep = root.allocate(64).unwrap();
    let ptr = root.allocate(64).unwrap();
    root.free(ptr);
    root.free(ptr);
}

#[test]
#[should_panic(expected = "corruption")]
fn double_free_in_checked_mode_is_fatal() {
    let root = partition(CheckMode::Checked, 104);
    let _keep = root.allocate(64).unwrap();
    let ptr = root.allocate(64).unwrap();
    root.free(ptr);
    root.free(ptr);
}

#[test]
#[should_panic(expected = "not owned by this partition")]
fn foreign_pointer_is_fatal() {
    let root = partition(CheckMode::Release, 105);
    root.free(0x1234_5670);
}

#[test]
#[should_panic(expected = "not owned by this partition")]
fn pointer_of_another_root_is_fatal() {
    let space: Arc<AddressSpace> = Arc::new(AddressSpace::with_seed(106));
    let a = PartitionAllocator::init(
        PartitionOptions::new()
            .with_checks(CheckMode::Release)
            .with_pages(space.clone())
            .with_corruption_handler(panic_on_corruption),
    );
    let b = PartitionAllocator::init(
        PartitionOptions::new()
            .with_checks(CheckMode::Release)
            .with_pages(space)
            .with_corruption_handler(panic_on_corruption),
    );
    let ptr = a.allocate(48).unwrap();
    b.free(ptr);
}

#[test]
#[should_panic(expected = "not at a slot boundary")]
fn interior_pointer_is_fatal() {
    let root = partition(CheckMode::Release, 107);
    let ptr = root.allocate(64).unwrap();
    root.free(ptr + 8);
}

#[test]
#[should_panic(expected = "invalid entry")]
fn corrupted_free_list_is_detected_on_allocation() {
    let root = PartitionAllocator::init(
        PartitionOptions::new()
            .with_checks(CheckMode::Release)
            .with_thread_cache(ThreadCacheOption::Disabled)
            .with_pages(Arc::new(AddressSpace::with_seed(108)))
            .with_corruption_handler(panic_on_corruption),
    );
    let _keep = root.allocate(64).unwrap();
    let victim = root.allocate(64).unwrap();
    root.free(victim);
    // Use-after-free write over the encoded next pointer.
    root.write(victim, &[0x41; 8]).unwrap();
    let _ = root.allocate(64);
    let _ = root.allocate(64);
}

#[test]
fn intact_slots_pass_every_check() {
    let root = partition(CheckMode::Checked, 109);
    let ptrs: Vec<usize> = (1..200).map(|size| root.allocate(size * 7).unwrap()).collect();
    for (i, &ptr) in ptrs.iter().enumerate() {
        let usable = root.get_usable_size(ptr);
        root.fill(ptr, usable, (i % 256) as u8).unwrap();
    }
    for ptr in ptrs {
        root.free(ptr);
    }
    let counters = root.counters();
    assert_eq!(counters.allocations, counters.frees);
}
