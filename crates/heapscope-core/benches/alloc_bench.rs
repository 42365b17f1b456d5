//! Allocation throughput under the debugging engine. The engine trades
//! speed for observability; these numbers track how expensive the
//! bookkeeping paths are relative to each other.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use heapscope_core::{Caller, HeapScope, Options};

fn bench_alloc_free(c: &mut Criterion) {
    let heap = HeapScope::with_options(Options::parse("LOGFILE=stderr CHECK=0"));
    c.bench_function("alloc_free_64", |b| {
        b.iter(|| {
            let p = heap.alloc(black_box(64), Caller::here(), 0).unwrap();
            heap.free(Some(p), Caller::here(), 0);
        });
    });
}

fn bench_alloc_free_with_guards(c: &mut Criterion) {
    let heap = HeapScope::with_options(Options::parse("LOGFILE=stderr CHECK=0 OFLOWSIZE=32"));
    c.bench_function("alloc_free_64_guarded", |b| {
        b.iter(|| {
            let p = heap.alloc(black_box(64), Caller::here(), 0).unwrap();
            heap.free(Some(p), Caller::here(), 0);
        });
    });
}

fn bench_fill(c: &mut Criterion) {
    let heap = HeapScope::with_options(Options::parse("LOGFILE=stderr CHECK=0"));
    let p = heap.alloc(4096, Caller::here(), 0).unwrap();
    c.bench_function("fill_4096", |b| {
        b.iter(|| heap.fill_mem(p, black_box(4096), 0xA5, Caller::here(), 0));
    });
}

criterion_group!(benches, bench_alloc_free, bench_alloc_free_with_guards, bench_fill);
criterion_main!(benches);
