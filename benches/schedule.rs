use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use weft::{parallel_for, AsyncTask, AsyncTaskDesc, LinearAllocator, SchedulingFlags};

fn bench_spawn_wait(c: &mut Criterion) {
    c.bench_function("spawn_wait_64_short_lived_tasks", |b| {
        let desc = AsyncTaskDesc {
            flags: SchedulingFlags::ShortLived,
            priority: 0,
        };
        b.iter(|| {
            let counter = Arc::new(AtomicU64::new(0));
            let handles: Vec<_> = (0..64)
                .map(|_| {
                    let counter = Arc::clone(&counter);
                    AsyncTask::new(desc, async move {
                        counter.fetch_add(1, Ordering::Relaxed);
                    })
                    .schedule()
                })
                .collect();
            for handle in &handles {
                handle.wait();
            }
            black_box(counter.load(Ordering::Relaxed));
        });
    });
}

fn bench_parallel_for(c: &mut Criterion) {
    c.bench_function("parallel_for_1024_increments", |b| {
        b.iter(|| {
            let counter = Arc::new(AtomicU64::new(0));
            let root = {
                let counter = Arc::clone(&counter);
                AsyncTask::new(
                    AsyncTaskDesc {
                        flags: SchedulingFlags::ShortLived,
                        priority: 0,
                    },
                    async move {
                        parallel_for::<16, _, _>(1024, |i| {
                            let counter = &counter;
                            async move {
                                counter.fetch_add(u64::from(i), Ordering::Relaxed);
                            }
                        })
                        .await;
                    },
                )
                .schedule()
            };
            root.wait();
            black_box(counter.load(Ordering::Relaxed));
        });
    });
}

fn bench_linear_alloc(c: &mut Criterion) {
    c.bench_function("linear_alloc_free_64b", |b| {
        b.iter(|| {
            let allocation = LinearAllocator::alloc(64, 8);
            black_box(allocation);
            unsafe { LinearAllocator::free(allocation) };
        });
    });
}

criterion_group!(
    benches,
    bench_spawn_wait,
    bench_parallel_for,
    bench_linear_alloc
);
criterion_main!(benches);
