//! # heapscope-core
//!
//! A debugging allocator: a drop-in replacement for the C-style heap
//! interface that validates every call, detects misuse (double frees,
//! mismatched pairs, overflow corruption, use of freed blocks), records a
//! full lifetime record for every block, and emits a human-readable log
//! plus machine-readable profile and trace streams.
//!
//! The engine trades speed and memory for observability; it is not meant
//! to replace the production allocator in performance-critical paths.
//! There is exactly one process-wide heap state, reached through the
//! [`HeapScope`] handle.
//!
//! ```no_run
//! use heapscope_core::{Caller, HeapScope};
//!
//! let heap = HeapScope::global();
//! let p = heap.alloc(64, Caller::here(), 0).expect("out of memory");
//! heap.free(Some(p), Caller::here(), 0);
//! ```

pub mod alloca;
pub mod arena;
pub mod diag;
pub mod engine;
pub mod heap;
pub mod index;
pub mod leb128;
pub mod ops;
pub mod options;
pub mod profile;
pub mod record;
pub mod sink;
pub mod stack;
pub mod symbols;
pub mod trace;

use std::cell::{Cell, UnsafeCell};
use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use parking_lot::ReentrantMutex;

use engine::{AllocArgs, Engine};

pub use diag::{DiagKind, Stats};
pub use engine::{EpilogueFn, NoMemoryFn, PrologueFn};
pub use ops::{Caller, Family, OpKind, TypeInfo};
pub use options::{OPTIONS_ENV, Options, PagePlacement};
pub use record::BlockInfo;

/// Magic framing the profile and trace streams.
pub const STREAM_MAGIC: [u8; 4] = *b"MPTL";
/// Library version written into the stream headers.
pub const LIB_VERSION: u64 = 100;
/// Human-readable version for the log banner.
pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

static GLOBAL: OnceLock<HeapScope> = OnceLock::new();

extern "C" fn exit_hook() {
    if let Some(heap) = GLOBAL.get() {
        heap.shutdown();
    }
}

/// Engine state plus the reentrancy counter, shared under the recursive
/// lock. User callbacks (low-memory, prologue, epilogue) run while an
/// operation is on the stack and may legitimately call back into the
/// engine from the same thread, so a `RefCell` would panic here; instead
/// the cell hands out its reference manually under the depth discipline
/// documented on [`HeapScope::with`].
struct EngineCell {
    engine: UnsafeCell<Engine>,
    /// Nesting depth of engine operations on the owning thread. Signal
    /// shielding and the metadata write permit belong to the outermost
    /// frame only.
    depth: Cell<u32>,
}

/// Handle to the engine. Every public entry point goes through a handle;
/// no free function sees the state directly. Cheap to clone.
#[derive(Clone)]
pub struct HeapScope {
    inner: Arc<ReentrantMutex<EngineCell>>,
}

impl HeapScope {
    /// The process-wide engine, lazily initialised from the
    /// `HEAPSCOPE_OPTIONS` environment variable on first use. The exit
    /// summary hook is registered here.
    pub fn global() -> &'static HeapScope {
        GLOBAL.get_or_init(|| {
            let heap = HeapScope::with_options(Options::from_env());
            heapscope_os::on_exit(exit_hook);
            heap
        })
    }

    /// A private engine with explicit options. Intended for tests and
    /// embedders that manage their own lifecycle; production use goes
    /// through [`HeapScope::global`].
    pub fn with_options(opts: Options) -> HeapScope {
        HeapScope {
            inner: Arc::new(ReentrantMutex::new(EngineCell {
                engine: UnsafeCell::new(Engine::new(opts)),
                depth: Cell::new(0),
            })),
        }
    }

    /// Serialises an operation against the engine: takes the global
    /// recursive lock, bumps the reentrancy counter, and on the outermost
    /// frame only shields signals and opens the metadata write permit,
    /// re-protecting on the way out. Nested frames (an operation invoked
    /// from inside a user callback on the same thread) reuse the open
    /// permit and held signals of the frame below them.
    fn with<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        let guard = self.inner.lock();
        let depth = guard.depth.get();
        guard.depth.set(depth + 1);
        let outermost = depth == 0;
        // SAFETY: the recursive mutex serialises access across threads,
        // and on the owning thread frames nest strictly: an outer frame is
        // parked inside a callback while an inner frame runs, and every
        // frame re-derives its reference from the cell, so exactly one is
        // in use at any point in time.
        let held = (outermost && unsafe { &*guard.engine.get() }.safe_signals())
            .then(heapscope_os::HeldSignals::hold);
        if outermost {
            // SAFETY: as above.
            unsafe { &mut *guard.engine.get() }.open_permit();
        }
        // SAFETY: as above.
        let result = f(unsafe { &mut *guard.engine.get() });
        if outermost {
            // SAFETY: as above; any nested frames have finished by now.
            unsafe { &mut *guard.engine.get() }.close_permit();
        }
        guard.depth.set(depth);
        drop(held);
        result
    }

    // ------------------------------------------------------------------
    // Allocation entry points
    // ------------------------------------------------------------------

    /// Scalar allocation of `size` bytes at the default alignment.
    pub fn alloc(&self, size: usize, caller: Caller<'_>, skip: usize) -> Option<NonNull<u8>> {
        self.allocate(OpKind::Alloc, size, None, false, None, 0, caller, skip)
    }

    /// Zero-filled allocation.
    pub fn alloc_zeroed(&self, size: usize, caller: Caller<'_>, skip: usize) -> Option<NonNull<u8>> {
        self.allocate(OpKind::AllocZeroed, size, None, true, None, 0, caller, skip)
    }

    /// Allocation at an explicit alignment.
    pub fn alloc_aligned(
        &self,
        size: usize,
        align: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        self.allocate(OpKind::AllocAligned, size, Some(align), false, None, 0, caller, skip)
    }

    /// Page-aligned allocation.
    pub fn alloc_page(&self, size: usize, caller: Caller<'_>, skip: usize) -> Option<NonNull<u8>> {
        self.with(|e| {
            let page = e.mem.page_size();
            e.allocate(
                AllocArgs {
                    kind: OpKind::AllocPage,
                    size,
                    align: Some(page),
                    zero: false,
                    type_info: None,
                    frame_hint: 0,
                },
                &caller,
                skip,
            )
        })
        .and_then(|a| NonNull::new(a as *mut u8))
    }

    /// Page-aligned allocation rounded up to a whole number of pages.
    pub fn alloc_page_rounded(
        &self,
        size: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        self.with(|e| {
            let page = e.mem.page_size();
            let rounded = e.mem.round_to_pages(size.max(1));
            e.allocate(
                AllocArgs {
                    kind: OpKind::AllocPageRounded,
                    size: rounded,
                    align: Some(page),
                    zero: false,
                    type_info: None,
                    frame_hint: 0,
                },
                &caller,
                skip,
            )
        })
        .and_then(|a| NonNull::new(a as *mut u8))
    }

    /// Duplicates a NUL-terminated string into a fresh block.
    pub fn dup_str(&self, s: &CStr, caller: Caller<'_>, skip: usize) -> Option<NonNull<u8>> {
        let bytes = s.to_bytes_with_nul();
        let dst = self.allocate(
            OpKind::DupStr,
            bytes.len(),
            None,
            false,
            None,
            0,
            caller,
            skip,
        )?;
        // SAFETY: the fresh block holds at least bytes.len() bytes.
        unsafe { heapscope_os::raw::copy(dst.as_ptr() as usize, bytes.as_ptr() as usize, bytes.len()) };
        Some(dst)
    }

    /// Duplicates at most `max` bytes of a string, always NUL-terminating
    /// the copy.
    pub fn dup_str_bounded(
        &self,
        s: &CStr,
        max: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        let body = s.to_bytes();
        let count = body.len().min(max);
        let dst = self.allocate(
            OpKind::DupStrBounded,
            count + 1,
            None,
            false,
            None,
            0,
            caller,
            skip,
        )?;
        let addr = dst.as_ptr() as usize;
        // SAFETY: the fresh block holds count + 1 bytes.
        unsafe {
            heapscope_os::raw::copy(addr, body.as_ptr() as usize, count);
            heapscope_os::raw::fill(addr + count, 1, 0);
        }
        Some(dst)
    }

    /// Scope-bound allocation, freed automatically once execution leaves
    /// the calling frame.
    #[inline(never)]
    pub fn scope_alloc(&self, size: usize, caller: Caller<'_>, skip: usize) -> Option<NonNull<u8>> {
        let probe = 0u8;
        let frame_hint = &raw const probe as usize;
        self.allocate(OpKind::ScopeAlloc, size, None, false, None, frame_hint, caller, skip)
    }

    /// Typed-array allocation of `count` elements. This variant must
    /// succeed: an unsatisfiable request terminates the process after the
    /// low-memory callback and diagnostics have run.
    pub fn typed_alloc(
        &self,
        count: usize,
        ty: TypeInfo<'_>,
        caller: Caller<'_>,
        skip: usize,
    ) -> NonNull<u8> {
        let size = count.checked_mul(ty.size).unwrap_or(usize::MAX);
        match self.allocate(OpKind::TypedAlloc, size, None, false, Some(ty), 0, caller, skip) {
            Some(p) => p,
            None => {
                self.shutdown();
                std::process::abort();
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn allocate(
        &self,
        kind: OpKind,
        size: usize,
        align: Option<usize>,
        zero: bool,
        type_info: Option<TypeInfo<'_>>,
        frame_hint: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        self.with(|e| {
            e.allocate(
                AllocArgs {
                    kind,
                    size,
                    align,
                    zero,
                    type_info,
                    frame_hint,
                },
                &caller,
                skip,
            )
        })
        .and_then(|a| NonNull::new(a as *mut u8))
    }

    // ------------------------------------------------------------------
    // Resize entry points
    // ------------------------------------------------------------------

    /// Resizes a block, relocating when it cannot grow in place. A null
    /// pointer allocates; a zero size frees.
    pub fn resize(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        self.resize_with(ptr, new_size, OpKind::Resize, false, false, None, caller, skip)
    }

    /// Resize that frees the block when the resize itself fails.
    pub fn resize_or_free(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        self.resize_with(ptr, new_size, OpKind::ResizeOrFree, false, true, None, caller, skip)
    }

    /// Resize that zero-fills any newly exposed bytes.
    pub fn resize_zeroed(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        self.resize_with(ptr, new_size, OpKind::ResizeZeroed, true, false, None, caller, skip)
    }

    /// In-place-only resize: never relocates, returns `None` when the new
    /// size does not fit the block's carved region.
    pub fn resize_in_place(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        self.resize_with(ptr, new_size, OpKind::ResizeInPlace, false, false, None, caller, skip)
    }

    /// Typed-array resize, checked against the creating entry point.
    pub fn typed_resize(
        &self,
        ptr: Option<NonNull<u8>>,
        new_count: usize,
        ty: TypeInfo<'_>,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        let size = new_count.checked_mul(ty.size).unwrap_or(usize::MAX);
        self.resize_with(ptr, size, OpKind::TypedResize, false, false, Some(ty), caller, skip)
    }

    #[allow(clippy::too_many_arguments)]
    fn resize_with(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        kind: OpKind,
        zero: bool,
        free_on_failure: bool,
        ty: Option<TypeInfo<'_>>,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        let addr = ptr.map_or(0, |p| p.as_ptr() as usize);
        self.with(|e| e.resize(addr, new_size, kind, zero, free_on_failure, &caller, skip, ty))
            .and_then(|a| NonNull::new(a as *mut u8))
    }

    // ------------------------------------------------------------------
    // Free entry points
    // ------------------------------------------------------------------

    /// Releases a block. Freeing null is a warning (an error under
    /// `CHECKFREES`); an unknown or already-freed pointer is an error.
    pub fn free(&self, ptr: Option<NonNull<u8>>, caller: Caller<'_>, skip: usize) -> bool {
        self.release_with(ptr, OpKind::Free, caller, skip)
    }

    /// Array-compatible release.
    pub fn free_array(&self, ptr: Option<NonNull<u8>>, caller: Caller<'_>, skip: usize) -> bool {
        self.release_with(ptr, OpKind::FreeArray, caller, skip)
    }

    /// Releases a scope-bound block before its frame exits.
    pub fn scope_free(&self, ptr: Option<NonNull<u8>>, caller: Caller<'_>, skip: usize) -> bool {
        self.release_with(ptr, OpKind::ScopeFree, caller, skip)
    }

    /// Typed-array release, checked against the creating entry point.
    pub fn typed_free(&self, ptr: Option<NonNull<u8>>, caller: Caller<'_>, skip: usize) -> bool {
        self.release_with(ptr, OpKind::TypedFree, caller, skip)
    }

    fn release_with(
        &self,
        ptr: Option<NonNull<u8>>,
        kind: OpKind,
        caller: Caller<'_>,
        skip: usize,
    ) -> bool {
        let addr = ptr.map_or(0, |p| p.as_ptr() as usize);
        self.with(|e| e.release(addr, kind, &caller, skip))
    }

    // ------------------------------------------------------------------
    // Byte operations
    // ------------------------------------------------------------------

    /// Fills `len` bytes with `byte`, checking the range against the live
    /// block that contains it.
    pub fn fill_mem(
        &self,
        ptr: NonNull<u8>,
        len: usize,
        byte: u8,
        caller: Caller<'_>,
        skip: usize,
    ) -> bool {
        self.with(|e| e.mem_set(ptr.as_ptr() as usize, len, byte, OpKind::Fill, &caller, skip))
    }

    /// Zero-fills `len` bytes.
    pub fn zero_mem(&self, ptr: NonNull<u8>, len: usize, caller: Caller<'_>, skip: usize) -> bool {
        self.with(|e| e.mem_set(ptr.as_ptr() as usize, len, 0, OpKind::ZeroFill, &caller, skip))
    }

    /// Copies `len` bytes; overlapping ranges draw a warning.
    pub fn copy_mem(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        len: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> bool {
        self.with(|e| {
            e.mem_copy(
                dst.as_ptr() as usize,
                src.as_ptr() as usize,
                len,
                OpKind::Copy,
                &caller,
                skip,
            )
        })
    }

    /// Overlap-safe copy.
    pub fn move_mem(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        len: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> bool {
        self.with(|e| {
            e.mem_copy(
                dst.as_ptr() as usize,
                src.as_ptr() as usize,
                len,
                OpKind::SafeCopy,
                &caller,
                skip,
            )
        })
    }

    /// Bounded copy: copies up to `len` bytes, stopping after the first
    /// occurrence of `stop`. Returns the address one past the copied stop
    /// byte when found.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_mem_bounded(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        len: usize,
        stop: u8,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        self.with(|e| {
            e.mem_copy_until(
                dst.as_ptr() as usize,
                src.as_ptr() as usize,
                len,
                stop,
                &caller,
                skip,
            )
        })
        .and_then(|a| NonNull::new(a as *mut u8))
    }

    /// Scans for a byte; returns the address of the first occurrence.
    pub fn find_byte(
        &self,
        ptr: NonNull<u8>,
        len: usize,
        byte: u8,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        self.with(|e| e.mem_find_byte(ptr.as_ptr() as usize, len, byte, &caller, skip))
            .and_then(|a| NonNull::new(a as *mut u8))
    }

    /// Searches for a byte sub-sequence; returns the address of the first
    /// match.
    #[allow(clippy::too_many_arguments)]
    pub fn find_seq(
        &self,
        ptr: NonNull<u8>,
        len: usize,
        pat: NonNull<u8>,
        pat_len: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<NonNull<u8>> {
        self.with(|e| {
            e.mem_find_seq(
                ptr.as_ptr() as usize,
                len,
                pat.as_ptr() as usize,
                pat_len,
                &caller,
                skip,
            )
        })
        .and_then(|a| NonNull::new(a as *mut u8))
    }

    /// Compares two ranges. `None` means the ranges failed validation;
    /// `Some(None)` means they are equal; `Some(Some(off))` is the offset
    /// of the first difference.
    pub fn compare_mem(
        &self,
        a: NonNull<u8>,
        b: NonNull<u8>,
        len: usize,
        caller: Caller<'_>,
        skip: usize,
    ) -> Option<Option<usize>> {
        self.with(|e| e.mem_compare(a.as_ptr() as usize, b.as_ptr() as usize, len, &caller, skip))
    }

    // ------------------------------------------------------------------
    // Queries, callbacks, lifecycle
    // ------------------------------------------------------------------

    /// Snapshot of the record owning the block containing `ptr`.
    pub fn block_info(&self, ptr: NonNull<u8>) -> Option<BlockInfo> {
        self.with(|e| e.block_info(ptr.as_ptr() as usize))
    }

    /// Writes the owning record of `ptr` to the log.
    pub fn print_info(&self, ptr: NonNull<u8>) -> bool {
        self.with(|e| e.print_info(ptr.as_ptr() as usize))
    }

    /// Marks a block as intentionally unfreed; marked blocks are omitted
    /// from the unfreed report and the abort threshold.
    pub fn mark(&self, ptr: NonNull<u8>) -> bool {
        self.with(|e| e.mark(ptr.as_ptr() as usize))
    }

    /// Writes the address-ordered memory map to the log.
    pub fn memory_map(&self) {
        self.with(|e| e.memory_map_now());
    }

    /// Writes the summary table to the log.
    pub fn summary(&self) {
        self.with(|e| e.summary_now());
    }

    /// Forces a full integrity sweep.
    pub fn check(&self, caller: Caller<'_>, skip: usize) {
        self.with(|e| e.check_now(&caller, skip));
    }

    /// Installs the pre-operation callback; returns the previous one.
    pub fn set_prologue(&self, hook: Option<PrologueFn>) -> Option<PrologueFn> {
        self.with(|e| e.set_prologue(hook))
    }

    /// Installs the post-operation callback; returns the previous one.
    pub fn set_epilogue(&self, hook: Option<EpilogueFn>) -> Option<EpilogueFn> {
        self.with(|e| e.set_epilogue(hook))
    }

    /// Installs the low-memory callback; returns the previous one.
    pub fn set_nomemory(&self, hook: Option<NoMemoryFn>) -> Option<NoMemoryFn> {
        self.with(|e| e.set_nomemory(hook))
    }

    /// Current cumulative counters.
    pub fn stats(&self) -> Stats {
        self.with(|e| e.stats())
    }

    /// Current heap event ordinal.
    pub fn event_count(&self) -> u64 {
        self.with(|e| e.event_count())
    }

    /// Final reports and stream close-out. Runs once; registered as an
    /// exit hook for the global engine.
    pub fn shutdown(&self) {
        self.with(|e| e.shutdown());
    }
}
