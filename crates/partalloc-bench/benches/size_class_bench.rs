//! Size-class lookup.

use criterion::{Criterion, criterion_group, criterion_main};
use partalloc_core::MAX_BUCKETED;
use partalloc_core::size_class::{bucket_index_for, bucket_slot_size};

fn bench_bucket_index(c: &mut Criterion) {
    let sizes: Vec<usize> = (0..4096).map(|i| 1 + (i * 7919) % MAX_BUCKETED).collect();
    c.bench_function("bucket_index_for_4096_sizes", |b| {
        b.iter(|| {
            let mut total = 0usize;
            for &size in &sizes {
                total = total.wrapping_add(bucket_slot_size(bucket_index_for(criterion::black_box(size))));
            }
            criterion::black_box(total)
        });
    });
}

criterion_group!(benches, bench_bucket_index);
criterion_main!(benches);
