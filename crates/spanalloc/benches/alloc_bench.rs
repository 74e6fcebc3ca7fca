//! Allocation throughput benchmarks.
//!
//! Covers the thread-cached fast path, the page-granular path, batched
//! lifetimes that force central-list traffic, and realloc growth.

use criterion::{criterion_group, criterion_main, Criterion};
use spanalloc::HotCold;
use std::hint::black_box;

const BATCH: usize = 1000;

fn bench_small_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("small_alloc_free");
    for size in [16usize, 64, 256, 1024, 8192] {
        group.bench_function(format!("{size}B"), |b| {
            b.iter(|| {
                let p = spanalloc::try_alloc(black_box(size)).expect("alloc");
                unsafe { spanalloc::dealloc_sized(p.as_ptr(), size) };
                black_box(p)
            });
        });
    }
    group.finish();
}

fn bench_batched_lifetimes(c: &mut Criterion) {
    // Holding a batch alive defeats the LIFO cache and exercises refill
    // and overflow transfers.
    c.bench_function("batched_1000x64B", |b| {
        let mut held = Vec::with_capacity(BATCH);
        b.iter(|| {
            for _ in 0..BATCH {
                held.push(spanalloc::try_alloc(64).expect("alloc"));
            }
            for p in held.drain(..) {
                unsafe { spanalloc::dealloc_sized(p.as_ptr(), 64) };
            }
        });
    });
}

fn bench_large_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("large_alloc_free");
    for size in [512 * 1024, 1 << 20, 4 << 20] {
        group.bench_function(format!("{}KiB", size / 1024), |b| {
            b.iter(|| {
                let p = spanalloc::try_alloc(black_box(size)).expect("alloc");
                unsafe { spanalloc::dealloc_sized(p.as_ptr(), size) };
                black_box(p)
            });
        });
    }
    group.finish();
}

fn bench_hinted_alloc_free(c: &mut Criterion) {
    c.bench_function("hot_hint_256B", |b| {
        b.iter(|| {
            let p = spanalloc::try_alloc_hot_cold(black_box(256), HotCold::HOTTEST)
                .expect("alloc");
            unsafe { spanalloc::dealloc(p.as_ptr()) };
            black_box(p)
        });
    });
}

fn bench_realloc_growth(c: &mut Criterion) {
    c.bench_function("realloc_64B_to_64KiB", |b| {
        b.iter(|| {
            let mut p = spanalloc::try_alloc(64).expect("alloc").as_ptr();
            let mut size = 64usize;
            while size < 64 * 1024 {
                size *= 2;
                p = unsafe { spanalloc::realloc(p, size) }.expect("realloc").as_ptr();
            }
            unsafe { spanalloc::dealloc(p) };
            black_box(size)
        });
    });
}

criterion_group!(
    benches,
    bench_small_alloc_free,
    bench_batched_lifetimes,
    bench_large_alloc_free,
    bench_hinted_alloc_free,
    bench_realloc_growth
);
criterion_main!(benches);
