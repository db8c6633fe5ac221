//! Compares `PoolAllocator` against the global allocator for short-lived per-item objects.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use thread_lifecycle::{PoolAllocator, with_thread_allocator};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

/// Roughly the size of a trajectory point in a transport simulation.
type TestItem = [f64; 8];
const TEST_VALUE: TestItem = [1.0; 8];

/// How many objects are alive at once within one simulated event.
const LIVE_PER_EVENT: usize = 100;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_allocator");

    group.bench_function("box_alloc_free", |b| {
        b.iter(|| drop(black_box(Box::new(black_box(TEST_VALUE)))));
    });

    group.bench_function("pool_alloc_free_warm", |b| {
        let mut allocator = PoolAllocator::<TestItem>::new();

        // Warm up so that the measurement does not include page growth.
        let warm = allocator.emplace(TEST_VALUE);
        // SAFETY: Allocated above from this allocator, released once.
        drop(unsafe { allocator.take(warm) });

        b.iter(|| {
            let item = allocator.emplace(black_box(TEST_VALUE));
            // SAFETY: Allocated above from this allocator, released once.
            black_box(unsafe { allocator.take(item) });
        });
    });

    group.bench_function("box_event", |b| {
        b.iter_custom(|iters| {
            let mut live = Vec::with_capacity(LIVE_PER_EVENT);

            let start = Instant::now();

            for _ in 0..iters {
                for _ in 0..LIVE_PER_EVENT {
                    live.push(Box::new(black_box(TEST_VALUE)));
                }

                live.clear();
            }

            start.elapsed()
        });
    });

    group.bench_function("pool_event", |b| {
        b.iter_custom(|iters| {
            let mut live = Vec::with_capacity(LIVE_PER_EVENT);

            with_thread_allocator::<TestItem, _>(|allocator| {
                let start = Instant::now();

                for _ in 0..iters {
                    for _ in 0..LIVE_PER_EVENT {
                        live.push(allocator.emplace(black_box(TEST_VALUE)));
                    }

                    for item in live.drain(..) {
                        // SAFETY: Allocated above from this allocator, released once.
                        black_box(unsafe { allocator.take(item) });
                    }
                }

                start.elapsed()
            })
        });
    });

    group.finish();
}
