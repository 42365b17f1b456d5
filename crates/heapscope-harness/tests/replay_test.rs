//! End-to-end: run an engine workload, then feed its streams through the
//! post-mortem readers.

use heapscope_core::{Caller, HeapScope, Options};
use heapscope_harness::{leaks, profdump, tracedump};

fn temp(tag: &str, ext: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("heapscope-replay-{tag}-{}.{ext}", std::process::id()))
}

#[test]
fn leak_checker_finds_the_unfreed_block() {
    let log = temp("leaks", "log");
    let heap = HeapScope::with_options(Options::parse(&format!(
        "LOGFILE={} LOGALL",
        log.display()
    )));
    let keep = heap.alloc(100, Caller::new("keeper", "app.rs", 12), 0).unwrap();
    let drop_me = heap.alloc(50, Caller::here(), 0).unwrap();
    heap.free(Some(drop_me), Caller::here(), 0);
    heap.shutdown();

    let report = leaks::check_file(&log).unwrap();
    let _ = std::fs::remove_file(&log);
    assert_eq!(report.alloc_count, 2);
    assert_eq!(report.free_count, 1);
    assert_eq!(report.leaks.len(), 1);
    assert_eq!(report.leaks[0].addr, keep.as_ptr() as usize as u64);
    assert_eq!(report.leaks[0].size, 100);
    assert!(report.leaks[0].caller.contains("keeper"));
}

#[test]
fn profile_stream_survives_the_full_pipeline() {
    let prof = temp("prof", "prof");
    let heap = HeapScope::with_options(Options::parse(&format!(
        "LOGFILE=stderr PROF PROFFILE={}",
        prof.display()
    )));
    for _ in 0..10 {
        let p = heap.alloc(16, Caller::here(), 0).unwrap();
        heap.free(Some(p), Caller::here(), 0);
    }
    let big = heap.alloc(10_000, Caller::here(), 0).unwrap();
    heap.free(Some(big), Caller::here(), 0);
    heap.shutdown();

    let report = profdump::read_file(&prof).unwrap();
    let _ = std::fs::remove_file(&prof);
    let allocs: u64 = report.totals.alloc_count.iter().sum();
    assert_eq!(allocs, 11);
    assert_eq!(report.totals.alloc_count[0], 10, "small-bin allocations");
    assert_eq!(report.totals.alloc_count[3], 1, "extra-large allocation");
    let frees: u64 = report.totals.free_count.iter().sum();
    assert_eq!(frees, 11);
    assert!(!report.sites.is_empty());
}

#[test]
fn trace_stream_replays_to_matching_counts() {
    let trace = temp("trace", "trace");
    let heap = HeapScope::with_options(Options::parse(&format!(
        "LOGFILE=stderr TRACE TRACEFILE={}",
        trace.display()
    )));
    let a = heap.alloc(64, Caller::here(), 0).unwrap();
    let b = heap.alloc(128, Caller::here(), 0).unwrap();
    heap.free(Some(a), Caller::here(), 0);
    heap.shutdown();

    let report = tracedump::read_file(&trace).unwrap();
    let _ = std::fs::remove_file(&trace);
    assert_eq!(report.alloc_count, 2);
    assert_eq!(report.free_count, 1);
    assert_eq!(report.leaked_blocks, 1);
    assert_eq!(report.leaked_bytes, 128);
    assert!(report.peak_live_bytes >= 192);
    assert!(report.heap_reserved > 0, "heap reservations should be traced");
    assert!(report.internal_reserved > 0, "metadata slabs should be traced");
    let _ = b;
}
