//! End-to-end engine behaviour: contract checks, misuse detection,
//! retention, scheduled failures and log output.

use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use heapscope_core::{Caller, HeapScope, Options, TypeInfo};

fn scope(opts: &str) -> HeapScope {
    HeapScope::with_options(Options::parse(&format!("LOGFILE=stderr {opts}")))
}

fn scope_logged(opts: &str, tag: &str) -> (HeapScope, PathBuf) {
    let path = std::env::temp_dir().join(format!(
        "heapscope-test-{tag}-{}.log",
        std::process::id()
    ));
    let heap = HeapScope::with_options(Options::parse(&format!(
        "LOGFILE={} {opts}",
        path.display()
    )));
    (heap, path)
}

fn read_byte(p: NonNull<u8>, off: usize) -> u8 {
    unsafe { p.as_ptr().add(off).read() }
}

fn write_byte(p: NonNull<u8>, off: usize, v: u8) {
    unsafe { p.as_ptr().add(off).write(v) }
}

#[test]
fn alloc_returns_pattern_filled_block() {
    let h = scope("OFLOWSIZE=8");
    let p = h.alloc(32, Caller::here(), 0).unwrap();
    for off in 0..32 {
        assert_eq!(read_byte(p, off), 0xFF, "allocation byte at offset {off}");
    }
    let zeroed = h.alloc_zeroed(16, Caller::here(), 0).unwrap();
    for off in 0..16 {
        assert_eq!(read_byte(zeroed, off), 0x00);
    }
}

#[test]
fn double_free_is_reported_and_live_bytes_drop() {
    let (h, log) = scope_logged("NOFREE=4 LOGALL", "dblfree");
    let p = h.alloc(16, Caller::here(), 0).unwrap();
    assert!(h.free(Some(p), Caller::here(), 0));
    assert_eq!(h.stats().live_bytes, 0);
    assert!(!h.free(Some(p), Caller::here(), 0));
    let stats = h.stats();
    assert_eq!(stats.error_count, 1);
    assert_eq!(stats.free_count, 1);
    h.shutdown();
    let text = std::fs::read_to_string(&log).unwrap();
    let _ = std::fs::remove_file(&log);
    assert!(text.contains("FRDAGN"), "double free code missing:\n{text}");
    assert!(text.contains("already freed with free"));
}

#[test]
fn freed_block_is_wiped_and_readable_under_retention() {
    let h = scope("NOFREE=4");
    let p = h.alloc(16, Caller::here(), 0).unwrap();
    write_byte(p, 0, 0x42);
    h.free(Some(p), Caller::here(), 0);
    // Retained memory stays mapped and carries the free-byte pattern.
    for off in 0..16 {
        assert_eq!(read_byte(p, off), 0x55, "free byte at offset {off}");
    }
    let info = h.block_info(p).unwrap();
    assert!(info.freed);
}

#[test]
fn use_of_freed_block_is_an_error() {
    let h = scope("NOFREE=4");
    let p = h.alloc(16, Caller::here(), 0).unwrap();
    h.free(Some(p), Caller::here(), 0);
    assert!(!h.fill_mem(p, 8, 0xAB, Caller::here(), 0));
    assert!(h.stats().error_count >= 1);
}

#[test]
fn typed_pair_mismatch_keeps_block_live() {
    let h = scope("");
    let ty = TypeInfo {
        name: "Widget",
        size: 4,
    };
    let p = h.typed_alloc(4, ty, Caller::here(), 0);
    // Scalar free must be rejected and leave the block live.
    assert!(!h.free(Some(p), Caller::here(), 0));
    let info = h.block_info(p).unwrap();
    assert!(!info.freed);
    assert_eq!(info.type_name.as_deref(), Some("Widget"));
    assert_eq!(h.stats().error_count, 1);
    // The matching pair succeeds.
    assert!(h.typed_free(Some(p), Caller::here(), 0));
}

#[test]
fn typed_resize_requires_typed_creator() {
    let h = scope("");
    let p = h.alloc(16, Caller::here(), 0).unwrap();
    let ty = TypeInfo {
        name: "Widget",
        size: 4,
    };
    assert!(h.typed_resize(Some(p), 8, ty, Caller::here(), 0).is_none());
    assert!(!h.block_info(p).unwrap().freed);
    assert!(h.free(Some(p), Caller::here(), 0));
}

#[test]
fn in_place_only_resize_fails_cleanly_when_too_large() {
    let h = scope("OFLOWSIZE=8");
    let p = h.alloc(16, Caller::here(), 0).unwrap();
    write_byte(p, 0, 0x42);
    // Far larger than any residue the carve could have kept.
    let grown = h.resize_in_place(Some(p), 1 << 20, Caller::here(), 0);
    assert!(grown.is_none());
    let info = h.block_info(p).unwrap();
    assert!(!info.freed);
    assert_eq!(info.size, 16);
    assert_eq!(read_byte(p, 0), 0x42, "contents untouched after failed resize");
}

#[test]
fn resize_relocation_copies_contents() {
    let h = scope("OFLOWSIZE=4");
    let p = h.alloc(8, Caller::here(), 0).unwrap();
    for off in 0..8 {
        write_byte(p, off, off as u8);
    }
    let q = h.resize(Some(p), 1 << 16, Caller::here(), 0).unwrap();
    for off in 0..8 {
        assert_eq!(read_byte(q, off), off as u8);
    }
    assert_eq!(h.block_info(q).unwrap().realloc_count, 1);
    h.free(Some(q), Caller::here(), 0);
}

#[test]
fn resize_null_allocates_and_resize_zero_frees() {
    let h = scope("");
    let p = h.resize(None, 24, Caller::here(), 0).unwrap();
    assert_eq!(h.stats().alloc_count, 1);
    assert!(h.resize(Some(p), 0, Caller::here(), 0).is_none());
    assert_eq!(h.stats().free_count, 1);
    assert_eq!(h.stats().live_bytes, 0);
}

static NOMEM_HITS: AtomicU32 = AtomicU32::new(0);

fn count_nomem() {
    NOMEM_HITS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn scheduled_failure_fails_allocation_and_fires_callback() {
    let h = scope("FAILFREQ=1 FAILSEED=7");
    h.set_nomemory(Some(count_nomem));
    let before = h.event_count();
    let p = h.alloc(64, Caller::here(), 0);
    assert!(p.is_none());
    assert!(NOMEM_HITS.load(Ordering::SeqCst) >= 1);
    assert_eq!(h.event_count(), before + 1);
    assert_eq!(h.stats().fail_count, 1);
}

#[test]
fn heap_limit_caps_total_live_bytes() {
    let h = scope("LIMIT=4096");
    let p = h.alloc(1024, Caller::here(), 0).unwrap();
    assert!(h.alloc(8192, Caller::here(), 0).is_none());
    assert_eq!(h.stats().error_count, 1);
    h.free(Some(p), Caller::here(), 0);
}

static REENTRY_HEAP: OnceLock<HeapScope> = OnceLock::new();
static REENTRY_VICTIM: AtomicUsize = AtomicUsize::new(0);

fn release_victim() {
    let addr = REENTRY_VICTIM.swap(0, Ordering::SeqCst);
    if addr != 0
        && let Some(h) = REENTRY_HEAP.get()
    {
        h.free(NonNull::new(addr as *mut u8), Caller::here(), 0);
    }
}

#[test]
fn low_memory_callback_may_reenter_the_engine() {
    let h = scope("LIMIT=4096");
    REENTRY_HEAP.set(h.clone()).ok();
    let victim = h.alloc(3000, Caller::here(), 0).unwrap();
    REENTRY_VICTIM.store(victim.as_ptr() as usize, Ordering::SeqCst);
    h.set_nomemory(Some(release_victim));
    // Over the limit until the callback frees the victim from inside the
    // same operation; the retry must then succeed instead of panicking.
    let p = h
        .alloc(3000, Caller::here(), 0)
        .expect("retry after the reentrant callback should succeed");
    assert_eq!(REENTRY_VICTIM.load(Ordering::SeqCst), 0, "callback ran");
    assert_eq!(h.stats().live_bytes, 3000);
    assert_eq!(h.stats().free_count, 1);
    h.free(Some(p), Caller::here(), 0);
}

#[test]
fn checkmemory_escalates_zero_length_byte_ops() {
    let h = scope("");
    let p = h.alloc(16, Caller::here(), 0).unwrap();
    // Benign no-op by default.
    assert!(h.fill_mem(p, 0, 0xAA, Caller::here(), 0));
    assert_eq!(h.stats().error_count, 0);

    let strict = scope("CHECKMEMORY");
    let q = strict.alloc(16, Caller::here(), 0).unwrap();
    assert!(!strict.fill_mem(q, 0, 0xAA, Caller::here(), 0));
    assert_eq!(strict.stats().error_count, 1);
    assert!(strict.compare_mem(q, q, 0, Caller::here(), 0).is_none());
}

#[test]
fn zero_size_request_warns_and_returns_sentinel() {
    let h = scope("");
    let p = h.alloc(0, Caller::here(), 0);
    assert!(p.is_some());
    assert_eq!(h.stats().warning_count, 1);

    let strict = scope("CHECKALL");
    assert!(strict.alloc(0, Caller::here(), 0).is_none());
    assert_eq!(strict.stats().error_count, 1);
}

#[test]
fn free_null_is_a_warning_by_default_and_error_under_checkfrees() {
    let h = scope("");
    assert!(!h.free(None, Caller::here(), 0));
    assert_eq!(h.stats().warning_count, 1);
    assert_eq!(h.stats().error_count, 0);

    let strict = scope("CHECKFREES");
    assert!(!strict.free(None, Caller::here(), 0));
    assert_eq!(strict.stats().error_count, 1);
}

#[test]
fn alignment_edges() {
    let h = scope("");
    let one = h.alloc_aligned(8, 1, Caller::here(), 0).unwrap();
    assert!(!one.as_ptr().is_null());
    let paged = h.alloc_page(8, Caller::here(), 0).unwrap();
    assert_eq!(paged.as_ptr() as usize % 4096, 0);
    // Alignment above the page size is clamped with a warning.
    let clamped = h.alloc_aligned(8, 1 << 20, Caller::here(), 0).unwrap();
    assert_eq!(clamped.as_ptr() as usize % 4096, 0);
    assert!(h.stats().warning_count >= 1);
    let odd = h.alloc_aligned(8, 12, Caller::here(), 0).unwrap();
    assert_eq!(odd.as_ptr() as usize % 16, 0);
}

#[test]
fn set_then_compare_round_trip() {
    let h = scope("");
    let p = h.alloc(64, Caller::here(), 0).unwrap();
    let q = h.alloc(64, Caller::here(), 0).unwrap();
    assert!(h.fill_mem(p, 64, 0xC3, Caller::here(), 0));
    assert!(h.fill_mem(q, 64, 0xC3, Caller::here(), 0));
    assert_eq!(h.compare_mem(p, q, 64, Caller::here(), 0), Some(None));
    write_byte(q, 10, 0x00);
    assert_eq!(h.compare_mem(p, q, 64, Caller::here(), 0), Some(Some(10)));
}

#[test]
fn find_byte_and_sequence_within_block() {
    let h = scope("");
    let p = h.alloc_zeroed(32, Caller::here(), 0).unwrap();
    write_byte(p, 5, b'x');
    write_byte(p, 6, b'y');
    let hit = h.find_byte(p, 32, b'x', Caller::here(), 0).unwrap();
    assert_eq!(hit.as_ptr() as usize, p.as_ptr() as usize + 5);
    let pat = h.alloc(2, Caller::here(), 0).unwrap();
    write_byte(pat, 0, b'x');
    write_byte(pat, 1, b'y');
    let seq = h.find_seq(p, 32, pat, 2, Caller::here(), 0).unwrap();
    assert_eq!(seq.as_ptr() as usize, p.as_ptr() as usize + 5);
}

#[test]
fn bounds_overflow_is_an_error_unless_allowed() {
    // Sweeps off: the deliberate overflow corrupts a guard.
    let h = scope("CHECK=0 OFLOWSIZE=8");
    let p = h.alloc(16, Caller::here(), 0).unwrap();
    assert!(!h.fill_mem(p, 17, 0x00, Caller::here(), 0));
    assert_eq!(h.stats().error_count, 1);

    let loose = scope("CHECK=0 OFLOWSIZE=8 ALLOWOFLOW");
    let q = loose.alloc(16, Caller::here(), 0).unwrap();
    assert!(loose.fill_mem(q, 17, 0x00, Caller::here(), 0));
    assert_eq!(loose.stats().error_count, 0);
    assert!(loose.stats().warning_count >= 1);
}

#[test]
fn copy_between_blocks_and_bounded_copy() {
    let h = scope("");
    let src = h.alloc(16, Caller::here(), 0).unwrap();
    let dst = h.alloc_zeroed(16, Caller::here(), 0).unwrap();
    for off in 0..16 {
        write_byte(src, off, off as u8 + 1);
    }
    assert!(h.copy_mem(dst, src, 16, Caller::here(), 0));
    assert_eq!(read_byte(dst, 15), 16);

    // Bounded copy stops after the stop byte.
    let bounded = h.alloc_zeroed(16, Caller::here(), 0).unwrap();
    let end = h
        .copy_mem_bounded(bounded, src, 16, 3, Caller::here(), 0)
        .unwrap();
    assert_eq!(end.as_ptr() as usize, bounded.as_ptr() as usize + 3);
    assert_eq!(read_byte(bounded, 2), 3);
    assert_eq!(read_byte(bounded, 3), 0, "bytes past the stop are untouched");
}

#[test]
fn dup_str_copies_including_nul() {
    let h = scope("");
    let s = std::ffi::CString::new("hello").unwrap();
    let p = h.dup_str(&s, Caller::here(), 0).unwrap();
    let copied: Vec<u8> = (0..6).map(|i| read_byte(p, i)).collect();
    assert_eq!(&copied, b"hello\0");

    let capped = h.dup_str_bounded(&s, 3, Caller::here(), 0).unwrap();
    let copied: Vec<u8> = (0..4).map(|i| read_byte(capped, i)).collect();
    assert_eq!(&copied, b"hel\0");
    assert_eq!(h.block_info(capped).unwrap().size, 4);
}

#[test]
fn retention_purges_oldest_block_first() {
    let h = scope("NOFREE=1");
    let p1 = h.alloc(16, Caller::here(), 0).unwrap();
    let p2 = h.alloc(16, Caller::here(), 0).unwrap();
    h.free(Some(p1), Caller::here(), 0);
    assert!(h.block_info(p1).unwrap().freed);
    h.free(Some(p2), Caller::here(), 0);
    // p1 left the retention pool; only p2 is still indexed.
    assert!(h.block_info(p1).is_none());
    assert!(h.block_info(p2).unwrap().freed);
}

#[test]
fn event_counter_is_strictly_monotonic() {
    let h = scope("");
    let mut last = h.event_count();
    let p = h.alloc(8, Caller::here(), 0).unwrap();
    for _ in 0..3 {
        h.fill_mem(p, 8, 1, Caller::here(), 0);
        let now = h.event_count();
        assert!(now > last);
        last = now;
    }
    h.free(Some(p), Caller::here(), 0);
    assert!(h.event_count() > last);
}

#[inline(never)]
fn scoped_in_deep_frame(h: &HeapScope) -> NonNull<u8> {
    // A fat frame so returning from here moves the stack pointer well past
    // the tracker's comparison bias.
    let pad = [0u8; 4096];
    std::hint::black_box(&pad);
    h.scope_alloc(32, Caller::here(), 0).unwrap()
}

#[test]
fn scope_bound_allocation_is_freed_after_frame_exit() {
    let h = scope("NOFREE=8");
    let p = scoped_in_deep_frame(&h);
    assert!(!h.block_info(p).unwrap().freed);
    // The next engine entry notices the frame is gone.
    let _tick = h.alloc(8, Caller::here(), 0).unwrap();
    let info = h.block_info(p).unwrap();
    assert!(info.freed, "scope-bound block should be freed lazily");
}

#[test]
fn scope_free_releases_explicitly() {
    let h = scope("");
    let p = h.scope_alloc(16, Caller::here(), 0).unwrap();
    assert!(h.scope_free(Some(p), Caller::here(), 0));
    assert_eq!(h.stats().live_bytes, 0);
}

#[test]
fn log_contains_banner_events_and_summary() {
    let (h, log) = scope_logged("LOGALL SHOWUNFREED", "logfmt");
    let p = h.alloc(48, Caller::here(), 0).unwrap();
    h.fill_mem(p, 8, 0xEE, Caller::here(), 0);
    let q = h.alloc(8, Caller::here(), 0).unwrap();
    h.free(Some(q), Caller::here(), 0);
    h.shutdown();
    let text = std::fs::read_to_string(&log).unwrap();
    let _ = std::fs::remove_file(&log);
    assert!(text.contains("heapscope 0.1.0"), "banner missing");
    assert!(text.contains("ALLOC: alloc (1, 48 bytes"), "ALLOC line missing:\n{text}");
    assert!(text.contains("MEMSET: fill"), "MEMSET line missing");
    assert!(text.contains("FREE: free"), "FREE line missing");
    assert!(text.contains("engine_test.rs"), "caller file missing");
    assert!(text.contains("summary:"), "summary missing");
    assert!(text.contains("allocation count"), "counters missing");
    assert!(text.contains("unfreed blocks (1 blocks, 48 bytes)"), "unfreed report:\n{text}");
}

#[test]
fn marked_blocks_are_exempt_from_the_unfreed_report() {
    let (h, log) = scope_logged("SHOWUNFREED", "marked");
    let keep = h.alloc(24, Caller::here(), 0).unwrap();
    assert!(h.mark(keep));
    h.shutdown();
    let text = std::fs::read_to_string(&log).unwrap();
    let _ = std::fs::remove_file(&log);
    assert!(text.contains("unfreed blocks (0 blocks, 0 bytes)"), "{text}");
}

#[test]
fn page_placement_surrounds_blocks_with_trap_pages() {
    let h = scope("PAGEALLOC=LOWER");
    let p = h.alloc(100, Caller::here(), 0).unwrap();
    assert_eq!(p.as_ptr() as usize % 4096, 0);
    write_byte(p, 99, 1);
    h.free(Some(p), Caller::here(), 0);
    let again = h.alloc(64, Caller::here(), 0).unwrap();
    h.free(Some(again), Caller::here(), 0);
}

#[test]
fn allocation_records_carry_caller_and_stack() {
    let h = scope("");
    let p = h.alloc(8, Caller::new("my_fn", "my_file.rs", 77), 0).unwrap();
    let info = h.block_info(p).unwrap();
    assert_eq!(info.func.as_deref(), Some("my_fn"));
    assert_eq!(info.file.as_deref(), Some("my_file.rs"));
    assert_eq!(info.line, 77);
    assert_eq!(info.alloc_index, 1);
    assert!(!info.stack.is_empty(), "captured stack should not be empty");
}

#[test]
fn memory_map_and_print_info_write_to_the_log() {
    let (h, log) = scope_logged("", "map");
    let p = h.alloc(40, Caller::new("owner_fn", "owner.rs", 3), 0).unwrap();
    h.memory_map();
    assert!(h.print_info(p));
    h.summary();
    h.shutdown();
    let text = std::fs::read_to_string(&log).unwrap();
    let _ = std::fs::remove_file(&log);
    assert!(text.contains("memory map:"));
    assert!(text.contains("allocated"));
    assert!(text.contains("internal"), "metadata slabs belong in the map");
    assert!(text.contains("{alloc:1:0}"), "record reference missing:\n{text}");
    assert!(text.contains("owner_fn"));
    // summary() mid-run plus the shutdown summary.
    assert_eq!(text.matches("summary:").count(), 2);
}

#[test]
fn log_dir_and_filename_substitution_route_the_log() {
    let dir = std::env::temp_dir().join(format!("heapscope-dir-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let h = HeapScope::with_options(Options::parse(&format!(
        "LOGDIR={} LOGFILE=run.%n.log PROGFILE=target",
        dir.display()
    )));
    let _p = h.alloc(8, Caller::here(), 0);
    h.shutdown();
    let expected = dir.join(format!("run.{}.log", std::process::id()));
    let text = std::fs::read_to_string(&expected).unwrap();
    assert!(text.contains("program: target"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn accounting_invariant_under_deterministic_workload() {
    fn lcg(state: &mut u64) -> u64 {
        *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        *state
    }

    let h = scope("OFLOWSIZE=8 CHECK=1-/64");
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
    let mut rng = 0xA5A5_5A5A_DEAD_BEEFu64;

    for _ in 0..600 {
        let r = lcg(&mut rng);
        match r % 3 {
            0 => {
                let size = ((r >> 8) as usize % 512).max(1);
                if let Some(p) = h.alloc(size, Caller::here(), 0) {
                    live.push((p, size));
                }
            }
            1 if !live.is_empty() => {
                let idx = (r as usize) % live.len();
                let (p, _) = live.swap_remove(idx);
                assert!(h.free(Some(p), Caller::here(), 0));
            }
            2 if !live.is_empty() => {
                let idx = (r as usize) % live.len();
                let (p, _) = live[idx];
                let new_size = ((r >> 16) as usize % 512).max(1);
                if let Some(q) = h.resize(Some(p), new_size, Caller::here(), 0) {
                    live[idx] = (q, new_size);
                }
            }
            _ => {}
        }

        let expected: usize = live.iter().map(|&(_, s)| s).sum();
        assert_eq!(h.stats().live_bytes, expected);
        for &(p, s) in &live {
            let info = h.block_info(p).expect("tracked pointer must stay known");
            assert!(!info.freed);
            assert_eq!(info.size, s);
        }
    }

    for (p, _) in live {
        assert!(h.free(Some(p), Caller::here(), 0));
    }
    assert_eq!(h.stats().live_bytes, 0);
}

// Deliberate guard corruption must abort the process; exercised in a child
// so the failure is observable from the outside.
#[test]
fn overflow_corruption_aborts_the_process() {
    const CHILD_ENV: &str = "HEAPSCOPE_CRASH_CHILD";
    if std::env::var(CHILD_ENV).is_ok() {
        let log = std::env::var("HEAPSCOPE_CRASH_LOG").unwrap();
        let h = HeapScope::with_options(Options::parse(&format!(
            "LOGFILE={log} OFLOWSIZE=8 CHECK=0"
        )));
        let p = h.alloc(16, Caller::here(), 0).unwrap();
        // One byte past the block lands in the upper guard.
        write_byte(p, 16, 0x41);
        h.check(Caller::here(), 0);
        unreachable!("integrity sweep should have aborted");
    }

    let log = std::env::temp_dir().join(format!("heapscope-crash-{}.log", std::process::id()));
    let status = std::process::Command::new(std::env::current_exe().unwrap())
        .args(["overflow_corruption_aborts_the_process", "--exact", "--nocapture"])
        .env(CHILD_ENV, "1")
        .env("HEAPSCOPE_CRASH_LOG", log.display().to_string())
        .output()
        .unwrap();
    assert!(!status.status.success(), "child should abort on corruption");
    let text = std::fs::read_to_string(&log).unwrap_or_default();
    let _ = std::fs::remove_file(&log);
    assert!(text.contains("OVFCOR"), "corruption report missing:\n{text}");
    assert!(text.contains("memory corruption detected"));
}
