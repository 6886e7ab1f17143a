//! Benchmarks for the slab context's alloc/free paths.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use mcx_slab::SlabContext;

const BLOCK_SIZE: usize = 8 * 1024;
const CHUNK_SIZE: usize = 64;
const CHUNKS: usize = 10_000;

// ============================================================================
// Fill / drain
// ============================================================================

fn bench_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill");
    group.throughput(Throughput::Elements(CHUNKS as u64));

    let mut cx = SlabContext::create("bench-fill", BLOCK_SIZE, CHUNK_SIZE).unwrap();
    let mut ptrs = Vec::with_capacity(CHUNKS);

    group.bench_function("alloc", |b| {
        b.iter(|| {
            for _ in 0..CHUNKS {
                ptrs.push(black_box(cx.alloc(CHUNK_SIZE).unwrap()));
            }
            for p in ptrs.drain(..) {
                unsafe { SlabContext::free(p) };
            }
        });
    });

    group.finish();
}

fn bench_drain_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain");
    group.throughput(Throughput::Elements(CHUNKS as u64));

    let mut cx = SlabContext::create("bench-drain", BLOCK_SIZE, CHUNK_SIZE).unwrap();
    let mut ptrs = Vec::with_capacity(CHUNKS);

    group.bench_function("free_in_order", |b| {
        b.iter(|| {
            for _ in 0..CHUNKS {
                ptrs.push(cx.alloc(CHUNK_SIZE).unwrap());
            }
            for p in ptrs.drain(..) {
                unsafe { SlabContext::free(black_box(p)) };
            }
        });
    });

    group.bench_function("free_in_reverse", |b| {
        b.iter(|| {
            for _ in 0..CHUNKS {
                ptrs.push(cx.alloc(CHUNK_SIZE).unwrap());
            }
            for p in ptrs.drain(..).rev() {
                unsafe { SlabContext::free(black_box(p)) };
            }
        });
    });

    group.finish();
}

// ============================================================================
// Steady-state churn
// ============================================================================

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");
    group.throughput(Throughput::Elements(CHUNKS as u64));

    let mut cx = SlabContext::create("bench-churn", BLOCK_SIZE, CHUNK_SIZE).unwrap();

    // Working set stays half full; every iteration replaces each element once.
    let mut live: Vec<_> = (0..CHUNKS / 2)
        .map(|_| cx.alloc(CHUNK_SIZE).unwrap())
        .collect();

    group.bench_function("replace_half", |b| {
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        b.iter(|| {
            for _ in 0..CHUNKS {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let idx = state as usize % live.len();
                let old = std::mem::replace(&mut live[idx], cx.alloc(CHUNK_SIZE).unwrap());
                unsafe { SlabContext::free(black_box(old)) };
            }
        });
    });

    for p in live {
        unsafe { SlabContext::free(p) };
    }

    group.finish();
}

criterion_group!(benches, bench_fill, bench_drain_order, bench_churn);
criterion_main!(benches);
