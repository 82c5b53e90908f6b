//! Basic benchmarks for the `sweep_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use sweep_pool::SweepPool;

criterion_group!(benches, entrypoint);
criterion_main!(benches);

type TestItem = [u64; 4];
const SWEEP_SIZE: usize = 10_000;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep_basic");

    group.bench_function("build_empty", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(SweepPool::builder().layout_of::<TestItem>().build()));
            }

            start.elapsed()
        });
    });

    group.bench_function("allocate_one", |b| {
        b.iter_custom(|iters| {
            let mut pools = iter::repeat_with(|| SweepPool::builder().layout_of::<TestItem>().build())
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for pool in &mut pools {
                _ = black_box(pool.allocate());
            }

            start.elapsed()
        });
    });

    group.bench_function("deallocate_one", |b| {
        b.iter_custom(|iters| {
            let mut pools = iter::repeat_with(|| SweepPool::builder().layout_of::<TestItem>().build())
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let allocations = pools
                .iter_mut()
                .map(|pool| pool.allocate().expect("out of memory"))
                .collect::<Vec<_>>();

            let start = Instant::now();

            for (pool, allocation) in pools.iter_mut().zip(allocations) {
                // SAFETY: each slot is deallocated exactly once.
                unsafe { pool.deallocate_in(allocation.ptr().as_ptr(), allocation.sub_pool()) };
            }

            start.elapsed()
        });
    });

    group.bench_function("allocate_deallocate_churn", |b| {
        b.iter_custom(|iters| {
            let mut pool = SweepPool::builder().layout_of::<TestItem>().build();

            // Warm the pool so the churn runs against retained buffers.
            let warm = pool.allocate().expect("out of memory");

            let start = Instant::now();

            for _ in 0..iters {
                let allocation = black_box(pool.allocate().expect("out of memory"));
                // SAFETY: allocated right above, deallocated exactly once.
                unsafe { pool.deallocate_in(allocation.ptr().as_ptr(), allocation.sub_pool()) };
            }

            let elapsed = start.elapsed();

            // SAFETY: the warm slot is still live.
            unsafe { pool.deallocate(warm.ptr().as_ptr()) };

            elapsed
        });
    });

    group.bench_function("sweep_10k_dense", |b| {
        b.iter_custom(|iters| {
            let mut pool = SweepPool::builder().layout_of::<TestItem>().build();
            for _ in 0..SWEEP_SIZE {
                _ = pool.allocate().expect("out of memory");
            }

            let start = Instant::now();

            for _ in 0..iters {
                let mut visited = 0_usize;
                for slot in pool.iter() {
                    visited += 1;
                    _ = black_box(slot);
                }
                assert_eq!(visited, SWEEP_SIZE);
            }

            start.elapsed()
        });
    });

    group.bench_function("sweep_10k_half_empty", |b| {
        b.iter_custom(|iters| {
            let mut pool = SweepPool::builder().layout_of::<TestItem>().build();
            let allocations = (0..SWEEP_SIZE)
                .map(|_| pool.allocate().expect("out of memory"))
                .collect::<Vec<_>>();

            // Free every other slot; the sweep now alternates between live
            // slots and singleton free runs.
            for allocation in allocations.iter().step_by(2) {
                // SAFETY: each slot is deallocated exactly once.
                unsafe { pool.deallocate_in(allocation.ptr().as_ptr(), allocation.sub_pool()) };
            }

            let start = Instant::now();

            for _ in 0..iters {
                let mut visited = 0_usize;
                for slot in pool.iter() {
                    visited += 1;
                    _ = black_box(slot);
                }
                assert_eq!(visited, SWEEP_SIZE / 2);
            }

            start.elapsed()
        });
    });

    group.finish();
}
