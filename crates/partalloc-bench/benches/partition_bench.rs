//! Partition root hot paths.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use partalloc_core::{
    AddressSpace, CheckMode, PartitionAllocator, PartitionOptions, PurgeFlags, ThreadCacheOption,
};

fn partition(checks: CheckMode, thread_cache: ThreadCacheOption) -> PartitionAllocator {
    PartitionAllocator::init(
        PartitionOptions::new()
            .with_name("bench")
            .with_checks(checks)
            .with_thread_cache(thread_cache)
            .with_pages(Arc::new(AddressSpace::new())),
    )
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let mut group = c.benchmark_group("alloc_free_cycle");

    let cached = partition(CheckMode::Release, ThreadCacheOption::Enabled);
    let locked = partition(CheckMode::Release, ThreadCacheOption::Disabled);
    let checked = partition(CheckMode::Checked, ThreadCacheOption::Disabled);
    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("thread_cache", size), &size, |b, &sz| {
            b.iter(|| {
                let ptr = cached.allocate(criterion::black_box(sz));
                cached.free(criterion::black_box(ptr.unwrap_or(0)));
            });
        });
        group.bench_with_input(BenchmarkId::new("locked", size), &size, |b, &sz| {
            b.iter(|| {
                let ptr = locked.allocate(criterion::black_box(sz));
                locked.free(criterion::black_box(ptr.unwrap_or(0)));
            });
        });
        group.bench_with_input(BenchmarkId::new("checked", size), &size, |b, &sz| {
            b.iter(|| {
                let ptr = checked.allocate(criterion::black_box(sz));
                checked.free(criterion::black_box(ptr.unwrap_or(0)));
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");
    let root = partition(CheckMode::Release, ThreadCacheOption::Enabled);

    group.bench_function("1000x64B", |b| {
        b.iter(|| {
            let ptrs: Vec<usize> = (0..1000).filter_map(|_| root.allocate(64)).collect();
            for ptr in ptrs {
                root.free(ptr);
            }
        });
    });

    group.bench_function("direct_map_4MiB", |b| {
        b.iter(|| {
            let ptr = root.allocate(criterion::black_box(4 << 20));
            root.free(ptr.unwrap_or(0));
        });
    });

    group.finish();
}

fn bench_realloc_grow(c: &mut Criterion) {
    let root = partition(CheckMode::Release, ThreadCacheOption::Disabled);
    c.bench_function("realloc_grow_16_to_64k", |b| {
        b.iter(|| {
            let mut ptr = root.allocate(16).unwrap_or(0);
            let mut size = 16;
            while size < 64 * 1024 {
                size *= 2;
                ptr = root.reallocate(ptr, size).unwrap_or(0);
            }
            root.free(ptr);
        });
    });
}

fn bench_purge(c: &mut Criterion) {
    let root = partition(CheckMode::Release, ThreadCacheOption::Disabled);
    c.bench_function("purge_after_256_frees", |b| {
        b.iter(|| {
            let ptrs: Vec<usize> = (0..256).filter_map(|_| root.allocate(4096)).collect();
            for ptr in ptrs {
                root.free(ptr);
            }
            criterion::black_box(root.purge(PurgeFlags::FORCE_ALL_FREED));
        });
    });
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_realloc_grow,
    bench_purge
);
criterion_main!(benches);
