//! The high-level engine.
//!
//! Owns the process-wide state and mediates every public operation:
//! event counting, scheduled integrity sweeps, stop points, failure
//! injection, pairing checks, record bookkeeping, profiling, tracing,
//! logging and the metadata protection windows.

mod check;

use std::collections::VecDeque;

use heapscope_os::{Access, Memory, note_heap_bounds, raw};

use crate::alloca::{Marker, ScopeTracker, stack_grows_down};
use crate::diag::{CallerView, Diag, DiagKind, Stats};
use crate::heap::Heap;
use crate::ops::{Caller, Family, OpKind, TypeInfo};
use crate::options::Options;
use crate::profile::Profiler;
use crate::record::{BlockState, RecordStore, current_thread_id, flags};
use crate::stack::{BacktraceWalker, StackWalker};
use crate::symbols::{BacktraceSymbols, SymbolReader};
use crate::trace::Tracer;

/// Callback invoked before each allocation, resize or free with the
/// pointer (0 when absent) and the requested size.
pub type PrologueFn = fn(addr: usize, size: usize);
/// Callback invoked after each allocation, resize or free with the result
/// address (0 when absent or failed).
pub type EpilogueFn = fn(result: usize);
/// Callback invoked when an allocation cannot be satisfied.
pub type NoMemoryFn = fn();

/// Frames the engine itself contributes between a public entry point and
/// the user's call site.
const ENGINE_FRAMES: usize = 3;

/// Deterministic generator for the failure schedule.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }
}

/// Caller identification after optional symbol-reader fallback.
struct ResolvedCaller {
    thread: u64,
    func: Option<String>,
    file: Option<String>,
    line: u32,
}

impl ResolvedCaller {
    fn view(&self) -> CallerView<'_> {
        CallerView {
            thread: self.thread,
            func: self.func.as_deref(),
            file: self.file.as_deref(),
            line: self.line,
        }
    }

    fn as_caller(&self) -> Caller<'_> {
        Caller {
            func: self.func.as_deref(),
            file: self.file.as_deref(),
            line: self.line,
        }
    }
}

/// Per-operation context produced by the entry preamble.
struct OpContext {
    stack: Vec<usize>,
    caller: ResolvedCaller,
}

/// Arguments for one allocation, validated by the entry points.
pub(crate) struct AllocArgs<'a> {
    pub kind: OpKind,
    pub size: usize,
    pub align: Option<usize>,
    pub zero: bool,
    pub type_info: Option<TypeInfo<'a>>,
    /// Local-frame address for scope-bound allocations in heuristic mode.
    pub frame_hint: usize,
}

pub struct Engine {
    pub(crate) mem: Memory,
    pub(crate) heap: Heap,
    pub(crate) records: RecordStore,
    pub(crate) opts: Options,
    pub(crate) diag: Diag,
    profiler: Profiler,
    tracer: Tracer,
    scopes: ScopeTracker,
    walker: Box<dyn StackWalker + Send>,
    pub(crate) symbols: Box<dyn SymbolReader + Send>,
    pub(crate) stats: Stats,
    /// Total order over heap events; drives every schedule.
    event_count: u64,
    /// Monotonic allocation index.
    alloc_index: u64,
    /// Monotonic reallocation index.
    realloc_index: u64,
    /// Retained-freed block addresses, oldest first, for NOFREE purging.
    retained: VecDeque<usize>,
    default_align: usize,
    lcg: Lcg,
    prologue: Option<PrologueFn>,
    epilogue: Option<EpilogueFn>,
    nomemory: Option<NoMemoryFn>,
    finished: bool,
}

impl Engine {
    pub fn new(mut opts: Options) -> Self {
        let mem = Memory::new(opts.use_mmap);
        let page = mem.page_size();

        let program = opts
            .prog_file
            .clone()
            .or_else(|| {
                std::env::current_exe()
                    .ok()
                    .map(|p| p.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let route = |name: &str, dir: &Option<String>| {
            let expanded = crate::options::expand_filename(name, &program);
            match (dir, expanded.as_str()) {
                (_, "stderr" | "stdout") => expanded,
                (Some(d), _) => format!("{d}/{expanded}"),
                (None, _) => expanded,
            }
        };
        let log_path = route(&opts.log_file, &opts.log_dir);
        let prof_path = route(&opts.prof_file, &opts.log_dir);
        let trace_path = route(&opts.trace_file, &opts.log_dir);

        // Clamp options the platform cannot honour before anything uses them.
        if opts.def_align > page {
            opts.warnings.push(format!(
                "alignment {} exceeds the page size; clamped",
                opts.def_align
            ));
            opts.def_align = page;
        }
        if opts.oflow_watch && mem.watch(0, 0, Access::None).is_err() {
            opts.warnings
                .push("watch traps are not supported here; using byte patterns".to_string());
            opts.oflow_watch = false;
        }

        let mut diag = Diag::new(
            &log_path,
            opts.log_allocs,
            opts.log_reallocs,
            opts.log_frees,
            opts.log_memory,
        );
        diag.banner(&program);
        diag.option_warnings(&opts.warnings);

        heapscope_os::install_fault_handler();

        let default_align = if opts.def_align == 0 {
            mem.natural_alignment()
        } else {
            opts.def_align
        };
        let profiler = Profiler::new(
            opts.prof,
            prof_path,
            opts.small_bound,
            opts.medium_bound,
            opts.large_bound,
            opts.auto_save,
        );
        let tracer = Tracer::new(opts.trace, trace_path);
        let scopes = ScopeTracker::new(opts.alloca_bias, stack_grows_down());
        let heap = Heap::new(&mem, 2);
        let records = RecordStore::new(&mem, 2);
        let seed = if opts.fail_seed == 0 {
            0x2545_F491_4F6C_DD1D
        } else {
            opts.fail_seed
        };
        let use_debug = opts.use_debug;

        Self {
            mem,
            heap,
            records,
            opts,
            diag,
            profiler,
            tracer,
            scopes,
            walker: Box::new(BacktraceWalker),
            symbols: Box::new(BacktraceSymbols::new(use_debug)),
            stats: Stats::default(),
            event_count: 0,
            alloc_index: 0,
            realloc_index: 0,
            retained: VecDeque::new(),
            default_align,
            lcg: Lcg(seed),
            prologue: None,
            epilogue: None,
            nomemory: None,
            finished: false,
        }
    }

    // ------------------------------------------------------------------
    // Metadata protection windows
    // ------------------------------------------------------------------

    /// Opens the write permit: flips every metadata slab read-write.
    pub(crate) fn open_permit(&mut self) {
        if self.opts.no_protect {
            return;
        }
        for region in self
            .records
            .slab_regions()
            .chain(self.heap.header_slabs().iter().copied())
        {
            let _ = self.mem.protect(region.base, region.size, Access::ReadWrite);
        }
    }

    /// Closes the write permit: metadata slabs go read-only until the next
    /// operation, so a wild write from user code traps.
    pub(crate) fn close_permit(&mut self) {
        if self.opts.no_protect {
            return;
        }
        for region in self
            .records
            .slab_regions()
            .chain(self.heap.header_slabs().iter().copied())
        {
            let _ = self.mem.protect(region.base, region.size, Access::Read);
        }
    }

    pub(crate) fn safe_signals(&self) -> bool {
        self.opts.safe_signals
    }

    // ------------------------------------------------------------------
    // Entry preamble
    // ------------------------------------------------------------------

    /// The shared preamble: event tick, scheduled sweep, stack capture,
    /// caller resolution and scope drainage.
    fn enter(&mut self, caller: &Caller<'_>, skip: usize) -> OpContext {
        self.event_count += 1;
        self.stats.event_count = self.event_count;

        if self.opts.check_range_contains(self.event_count)
            && self.event_count % self.opts.check_freq == 0
        {
            self.integrity_sweep();
        }

        let stack = self.walker.capture(skip + ENGINE_FRAMES);

        let mut resolved = ResolvedCaller {
            thread: current_thread_id(),
            func: caller.func.map(str::to_string),
            file: caller.file.map(str::to_string),
            line: caller.line,
        };
        if resolved.file.is_none()
            && let Some(&top) = stack.first()
            && let Some(info) = self.symbols.resolve(top)
        {
            resolved.func = resolved.func.or(info.name);
            resolved.file = info.file;
            resolved.line = info.line.unwrap_or(0);
        }

        let probe = 0u8;
        let out = self
            .scopes
            .drain_out_of_scope(&stack, &raw const probe as usize);
        for block in out {
            self.release_core(block, OpKind::ScopeFree, None, &[]);
        }

        OpContext {
            stack,
            caller: resolved,
        }
    }

    /// Emits trace events and widens the fault-report bounds for regions
    /// and metadata slabs acquired during the current operation.
    fn publish_regions(&mut self) {
        for r in self.heap.take_fresh_regions() {
            note_heap_bounds(r.base, r.limit());
            self.tracer.reserve(r.base, r.size, false);
        }
        let mut slabs = self.records.take_fresh_slabs();
        slabs.extend(self.heap.take_fresh_header_slabs());
        for r in slabs {
            note_heap_bounds(r.base, r.limit());
            self.tracer.reserve(r.base, r.size, true);
        }
    }

    fn warn(&mut self, kind: DiagKind, op: OpKind, message: &str) {
        self.stats.warning_count += 1;
        self.diag.warning(kind, op, message);
    }

    fn fail(&mut self, kind: DiagKind, op: OpKind, message: &str) {
        self.stats.error_count += 1;
        self.diag.error(kind, op, message);
    }

    fn notify_nomemory(&mut self) {
        if let Some(hook) = self.nomemory {
            hook();
        }
    }

    fn note_block_size(&mut self, size: usize) {
        self.stats.total_requested += size as u64;
        self.stats.largest_block = self.stats.largest_block.max(size);
        self.stats.smallest_block = if self.stats.smallest_block == 0 {
            size
        } else {
            self.stats.smallest_block.min(size)
        };
    }

    /// Prints a summary and raises a debugger trap at a stop point.
    fn stop_point(&mut self, what: &str, index: u64) {
        self.diag.stop(what, index);
        self.summary_now();
        // SAFETY: raising SIGTRAP hands control to an attached debugger.
        unsafe { libc::raise(libc::SIGTRAP) };
    }

    /// Picks the effective alignment for an allocation, warning on values
    /// the engine cannot honour.
    fn effective_align(&mut self, kind: OpKind, requested: Option<usize>) -> usize {
        let page = self.mem.page_size();
        match requested {
            None | Some(0) => self.default_align,
            Some(a) if a > page => {
                self.warn(
                    DiagKind::BadAlign,
                    kind,
                    &format!("alignment {a} exceeds the page size; clamped to {page}"),
                );
                page
            }
            Some(a) if !a.is_power_of_two() => {
                let rounded = a.next_power_of_two().min(page);
                self.warn(
                    DiagKind::BadAlign,
                    kind,
                    &format!("alignment {a} is not a power of two; using {rounded}"),
                );
                rounded
            }
            Some(a) => a,
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    pub(crate) fn allocate(
        &mut self,
        args: AllocArgs<'_>,
        caller: &Caller<'_>,
        skip: usize,
    ) -> Option<usize> {
        let ctx = self.enter(caller, skip);
        if let Some(hook) = self.prologue {
            hook(0, args.size);
        }
        let result = self.allocate_core(args, &ctx);
        if let Some(hook) = self.epilogue {
            hook(result.unwrap_or(0));
        }
        result
    }

    fn allocate_core(&mut self, mut args: AllocArgs<'_>, ctx: &OpContext) -> Option<usize> {
        let kind = args.kind;

        if args.size == 0 {
            if self.opts.check_allocs {
                self.fail(DiagKind::ZeroSize, kind, "attempt to create a block of size 0");
                return None;
            }
            self.warn(DiagKind::ZeroSize, kind, "size 0 requested; creating a sentinel byte");
            args.size = 1;
        }
        let align = self.effective_align(kind, args.align);

        if self.opts.alloc_stop != 0 && self.alloc_index + 1 == self.opts.alloc_stop {
            self.stop_point("allocation stop", self.alloc_index + 1);
        }

        if self.opts.fail_freq != 0 && self.lcg.next() % self.opts.fail_freq == 0 {
            self.stats.fail_count += 1;
            self.fail(DiagKind::OutOfMemory, kind, "scheduled allocation failure");
            self.notify_nomemory();
            self.log_alloc(kind, args.size, align, ctx, None);
            return None;
        }

        if self.opts.limit != 0 && self.stats.live_bytes + args.size > self.opts.limit {
            // The low-memory callback may free blocks (re-entering the
            // engine) before the limit is re-checked once.
            self.notify_nomemory();
            if self.stats.live_bytes + args.size > self.opts.limit {
                self.fail(
                    DiagKind::LimitExceeded,
                    kind,
                    &format!("heap limit of {} bytes would be exceeded", self.opts.limit),
                );
                self.log_alloc(kind, args.size, align, ctx, None);
                return None;
            }
        }

        let placed = match self.heap.get(&mut self.mem, &self.opts, args.size, align, args.zero) {
            Some(p) => Some(p),
            None => {
                // One retry after the low-memory callback has had a chance
                // to release something.
                self.notify_nomemory();
                self.heap.get(&mut self.mem, &self.opts, args.size, align, args.zero)
            }
        };
        let Some(placed) = placed else {
            self.stats.fail_count += 1;
            self.fail(DiagKind::OutOfMemory, kind, "out of memory");
            self.log_alloc(kind, args.size, align, ctx, None);
            return None;
        };

        self.alloc_index += 1;
        let index = self.alloc_index;
        let created = self.records.create(
            &mut self.mem,
            placed.user,
            placed.user_size,
            align,
            kind,
            index,
            &ctx.caller.as_caller(),
            &ctx.stack,
            args.type_info.as_ref(),
        );
        let Some(handle) = created else {
            self.heap.release(&mut self.mem, &self.opts, placed.user);
            self.fail(DiagKind::OutOfMemory, kind, "out of memory for metadata");
            return None;
        };

        self.stats.alloc_count += 1;
        self.stats.live_bytes += placed.user_size;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
        self.note_block_size(placed.user_size);

        let mut flag_bits = 0u8;
        if self.profiler.enabled() {
            flag_bits |= flags::PROFILED;
            let site = ctx.stack.first().copied().unwrap_or(0);
            if self.profiler.record_alloc(site, placed.user_size) {
                self.save_profile();
            }
        }
        if self.tracer.enabled() {
            flag_bits |= flags::TRACED;
        }
        if flag_bits != 0 {
            self.records.update(handle, |r| r.flags |= flag_bits);
        }

        self.publish_regions();
        self.tracer.alloc(index, placed.user, placed.user_size);
        self.log_alloc(kind, placed.user_size, align, ctx, Some(placed.user));

        if kind == OpKind::ScopeAlloc {
            let marker = if self.walker.frames_comparable() && ctx.stack.len() > 1 {
                Marker::FullStack(ctx.stack[1..].to_vec())
            } else {
                Marker::LocalAddr(args.frame_hint)
            };
            self.scopes.push(placed.user, marker);
        }

        Some(placed.user)
    }

    fn log_alloc(&mut self, kind: OpKind, size: usize, align: usize, ctx: &OpContext, result: Option<usize>) {
        self.diag.alloc(
            self.symbols.as_ref(),
            kind,
            self.alloc_index,
            size,
            align,
            ctx.caller.view(),
            &ctx.stack,
            result,
        );
    }

    fn save_profile(&mut self) {
        let symbols = self.symbols.as_ref();
        if self
            .profiler
            .save(|addr| symbols.resolve(addr).and_then(|s| s.name))
            .is_err()
        {
            self.stats.warning_count += 1;
        }
    }

    // ------------------------------------------------------------------
    // Resize
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn resize(
        &mut self,
        addr: usize,
        new_size: usize,
        kind: OpKind,
        zero: bool,
        free_on_failure: bool,
        caller: &Caller<'_>,
        skip: usize,
        type_info: Option<TypeInfo<'_>>,
    ) -> Option<usize> {
        let ctx = self.enter(caller, skip);
        if let Some(hook) = self.prologue {
            hook(addr, new_size);
        }
        let result = self.resize_core(addr, new_size, kind, zero, free_on_failure, type_info, &ctx);
        if let Some(hook) = self.epilogue {
            hook(result.unwrap_or(0));
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn resize_core(
        &mut self,
        addr: usize,
        new_size: usize,
        kind: OpKind,
        zero: bool,
        free_on_failure: bool,
        type_info: Option<TypeInfo<'_>>,
        ctx: &OpContext,
    ) -> Option<usize> {
        // A null pointer resizes like a fresh allocation.
        if addr == 0 {
            if self.opts.check_reallocs {
                self.fail(DiagKind::NullPointer, kind, "attempt to resize a null pointer");
                return None;
            }
            return self.allocate_core(
                AllocArgs {
                    kind,
                    size: new_size,
                    align: None,
                    zero,
                    type_info,
                    frame_hint: 0,
                },
                ctx,
            );
        }
        // Size zero resizes like a free.
        if new_size == 0 {
            self.release_core(addr, kind, Some(ctx), &ctx.stack);
            return None;
        }

        let Some(handle) = self.lookup_live(addr, kind) else {
            return None;
        };
        let record = self.records.get(handle);
        if record.kind().family() != kind.family() {
            self.fail(
                DiagKind::PairMismatch,
                kind,
                &format!(
                    "{addr:#x} was allocated with {} and cannot be resized with {}",
                    record.kind().name(),
                    kind.name()
                ),
            );
            return None;
        }

        self.realloc_index += 1;
        if self.opts.realloc_stop != 0 && self.realloc_index == self.opts.realloc_stop {
            self.stop_point("reallocation stop", self.realloc_index);
        }

        if self.opts.fail_freq != 0 && self.lcg.next() % self.opts.fail_freq == 0 {
            self.stats.fail_count += 1;
            self.fail(DiagKind::OutOfMemory, kind, "scheduled reallocation failure");
            self.notify_nomemory();
            return self.resize_failed(addr, kind, free_on_failure, ctx);
        }

        let old_size = record.size;
        if self.opts.limit != 0
            && new_size > old_size
            && self.stats.live_bytes + (new_size - old_size) > self.opts.limit
        {
            // As in the allocation path: one callback-driven retry before
            // the limit failure is final.
            self.notify_nomemory();
            // The callback may have freed the very block being resized;
            // the handle must not be used past that.
            if self.records.allocated.get(addr).is_none() {
                self.fail(
                    DiagKind::NotAllocated,
                    kind,
                    &format!("{addr:#x} was freed by the low-memory callback"),
                );
                return None;
            }
            if self.stats.live_bytes + (new_size - old_size) > self.opts.limit {
                self.fail(
                    DiagKind::LimitExceeded,
                    kind,
                    &format!("heap limit of {} bytes would be exceeded", self.opts.limit),
                );
                return self.resize_failed(addr, kind, free_on_failure, ctx);
            }
        }

        // Retention turns every resize into allocate-copy-retain.
        let relocate_always = self.opts.nofree > 0;
        if !relocate_always && self.heap.resize_in_place(&self.opts, addr, new_size, zero) {
            self.records.update(handle, |r| {
                r.size = new_size;
                r.realloc_count += 1;
            });
            self.records.allocated.remove(addr);
            self.records.allocated.insert(addr, new_size, handle);
            self.stats.realloc_count += 1;
            self.stats.live_bytes = self.stats.live_bytes + new_size - old_size;
            self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
            self.tracer.free(record.alloc_index);
            self.tracer.alloc(record.alloc_index, addr, new_size);
            self.log_realloc(kind, addr, new_size, record.align, ctx, Some(addr));
            return Some(addr);
        }

        if kind == OpKind::ResizeInPlace {
            // In-place-only resize never relocates; the block is unchanged.
            self.log_realloc(kind, addr, new_size, record.align, ctx, None);
            return None;
        }

        // Relocate: place a new block, copy, then retire the old one.
        let placed = match self
            .heap
            .get(&mut self.mem, &self.opts, new_size, record.align, zero)
        {
            Some(p) => Some(p),
            None => {
                self.notify_nomemory();
                self.heap
                    .get(&mut self.mem, &self.opts, new_size, record.align, zero)
            }
        };
        let Some(placed) = placed else {
            self.stats.fail_count += 1;
            self.fail(DiagKind::OutOfMemory, kind, "out of memory");
            return self.resize_failed(addr, kind, free_on_failure, ctx);
        };
        // A retry that went through the low-memory callback may have freed
        // the source block; bail out before copying from it.
        if self.records.allocated.get(addr).is_none() {
            self.heap.release(&mut self.mem, &self.opts, placed.user);
            self.fail(
                DiagKind::NotAllocated,
                kind,
                &format!("{addr:#x} was freed by the low-memory callback"),
            );
            return None;
        }
        // SAFETY: both blocks are live and disjoint.
        unsafe { raw::copy(placed.user, addr, old_size.min(new_size)) };

        self.alloc_index += 1;
        let new_index = self.alloc_index;
        let creator = record.kind();
        let created = self.records.create(
            &mut self.mem,
            placed.user,
            placed.user_size,
            record.align,
            creator,
            new_index,
            &ctx.caller.as_caller(),
            &ctx.stack,
            type_info.as_ref(),
        );
        let Some(new_handle) = created else {
            self.heap.release(&mut self.mem, &self.opts, placed.user);
            self.fail(DiagKind::OutOfMemory, kind, "out of memory for metadata");
            return self.resize_failed(addr, kind, free_on_failure, ctx);
        };
        self.records.update(new_handle, |r| {
            r.realloc_count = record.realloc_count + 1;
            r.flags = record.flags & (flags::PROFILED | flags::TRACED);
        });

        self.stats.realloc_count += 1;
        self.stats.live_bytes = self.stats.live_bytes + placed.user_size - old_size;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
        self.note_block_size(placed.user_size);

        // Retire the old block without running the full free-path checks.
        self.records.update(handle, |r| r.freed_by = kind as u8);
        self.retire(addr, handle);
        self.tracer.free(record.alloc_index);
        self.tracer.alloc(new_index, placed.user, placed.user_size);
        self.publish_regions();
        self.log_realloc(kind, addr, new_size, record.align, ctx, Some(placed.user));
        Some(placed.user)
    }

    fn resize_failed(
        &mut self,
        addr: usize,
        kind: OpKind,
        free_on_failure: bool,
        ctx: &OpContext,
    ) -> Option<usize> {
        if free_on_failure {
            self.release_core(addr, kind, Some(ctx), &ctx.stack);
        }
        self.log_realloc(kind, addr, 0, 0, ctx, None);
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn log_realloc(&mut self, kind: OpKind, addr: usize, new_size: usize, align: usize, ctx: &OpContext, result: Option<usize>) {
        self.diag.realloc(
            self.symbols.as_ref(),
            kind,
            addr,
            new_size,
            align,
            ctx.caller.view(),
            &ctx.stack,
            result,
        );
    }

    // ------------------------------------------------------------------
    // Free
    // ------------------------------------------------------------------

    pub(crate) fn release(
        &mut self,
        addr: usize,
        kind: OpKind,
        caller: &Caller<'_>,
        skip: usize,
    ) -> bool {
        let ctx = self.enter(caller, skip);
        if let Some(hook) = self.prologue {
            hook(addr, 0);
        }
        let result = if addr == 0 {
            if self.opts.check_frees {
                self.fail(DiagKind::NullPointer, kind, "attempt to free a null pointer");
            } else {
                self.warn(DiagKind::NullPointer, kind, "attempt to free a null pointer");
            }
            false
        } else {
            self.release_core(addr, kind, Some(&ctx), &ctx.stack)
        };
        if let Some(hook) = self.epilogue {
            hook(0);
        }
        result
    }

    /// Looks up a live block that must start exactly at `addr`, reporting
    /// the precise failure otherwise.
    fn lookup_live(&mut self, addr: usize, op: OpKind) -> Option<crate::arena::SlotHandle> {
        if let Some((_size, handle)) = self.records.allocated.get(addr) {
            return Some(handle);
        }
        if let Some((_, _, handle)) = self.records.find_freed(addr) {
            let freed_with = OpKind::from_u8(self.records.get(handle).freed_by);
            self.fail(
                DiagKind::DoubleFree,
                op,
                &format!("{addr:#x} was already freed with {}", freed_with.name()),
            );
            return None;
        }
        if let Some((base, _, _, state)) = self.records.find(addr) {
            if state == BlockState::Live {
                self.fail(
                    DiagKind::NotStart,
                    op,
                    &format!("{addr:#x} is inside the block at {base:#x}, not its start"),
                );
                return None;
            }
        }
        self.fail(
            DiagKind::NotAllocated,
            op,
            &format!("{addr:#x} has not been allocated"),
        );
        None
    }

    /// The free path shared by the public entry points, the scope tracker
    /// and zero-size resizes.
    fn release_core(
        &mut self,
        addr: usize,
        kind: OpKind,
        ctx: Option<&OpContext>,
        stack: &[usize],
    ) -> bool {
        let Some(handle) = self.lookup_live(addr, kind) else {
            return false;
        };
        let record = self.records.get(handle);
        if record.kind().family() != kind.family() {
            self.fail(
                DiagKind::PairMismatch,
                kind,
                &format!(
                    "{addr:#x} was allocated with {} and cannot be freed with {}",
                    record.kind().name(),
                    kind.name()
                ),
            );
            return false;
        }

        if self.opts.free_stop != 0 && record.alloc_index == self.opts.free_stop {
            self.stop_point("free stop", record.alloc_index);
        }

        if record.kind().family() == Family::Scope {
            self.scopes.remove(addr);
        }

        self.stats.free_count += 1;
        self.stats.live_bytes -= record.size;

        if record.flags & flags::PROFILED != 0 {
            let site = self.records.stack_of(&record).first().copied().unwrap_or(0);
            self.profiler.record_free(site, record.size);
        }
        if record.flags & flags::TRACED != 0 {
            self.tracer.free(record.alloc_index);
        }

        let owner = self.records.info(handle);
        let view = ctx.map(|c| c.caller.view()).unwrap_or_default();
        self.diag
            .free(self.symbols.as_ref(), kind, addr, view, stack, Some(&owner));

        self.records.update(handle, |r| r.freed_by = kind as u8);
        self.retire(addr, handle);
        self.publish_regions();
        true
    }

    /// Moves a block out of the live set: into retention under NOFREE,
    /// straight back to the free pool otherwise.
    fn retire(&mut self, addr: usize, handle: crate::arena::SlotHandle) {
        if self.opts.nofree > 0 {
            self.records.retain_freed(addr);
            self.heap.retain(&self.mem, &self.opts, addr);
            self.retained.push_back(addr);
            while self.opts.nofree != usize::MAX && self.retained.len() > self.opts.nofree {
                if let Some(oldest) = self.retained.pop_front() {
                    self.purge_retained(oldest);
                }
            }
        } else {
            self.records.allocated.remove(addr);
            self.records.discard(handle);
            self.heap.release(&mut self.mem, &self.opts, addr);
        }
    }

    /// Recycles the oldest retained block into the free pool.
    fn purge_retained(&mut self, addr: usize) {
        if let Some((_, handle)) = self.records.freed.remove(addr) {
            self.records.discard(handle);
        }
        self.heap.release(&mut self.mem, &self.opts, addr);
    }

    // ------------------------------------------------------------------
    // Byte operations
    // ------------------------------------------------------------------

    /// Argument checking for the byte-level entries: a zero-length
    /// operation is a benign no-op unless `CHECKMEMORY` escalates it.
    fn check_mem_args(&mut self, op: OpKind, len: usize) -> bool {
        if len == 0 && self.opts.check_memory {
            self.fail(DiagKind::ZeroSize, op, "byte operation of size 0");
            return false;
        }
        true
    }

    /// Validates that `[addr, addr + len)` lies within a single live block.
    /// Ranges wholly outside the observed heap are not policed.
    fn check_range(&mut self, op: OpKind, addr: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        match self.records.find(addr) {
            Some((_, _, _, BlockState::Retained)) => {
                self.fail(
                    DiagKind::UseAfterFree,
                    op,
                    &format!("{addr:#x} points into a freed block"),
                );
                false
            }
            Some((base, size, _, BlockState::Live)) => {
                if addr + len <= base + size {
                    true
                } else if self.opts.allow_oflow {
                    self.warn(
                        DiagKind::BoundsOverflow,
                        op,
                        &format!("range [{addr:#x}, {:#x}) overflows the block at {base:#x}", addr + len),
                    );
                    true
                } else {
                    self.fail(
                        DiagKind::BoundsOverflow,
                        op,
                        &format!("range [{addr:#x}, {:#x}) overflows the block at {base:#x}", addr + len),
                    );
                    false
                }
            }
            None => {
                let inside_heap = self
                    .heap
                    .bounds()
                    .is_some_and(|(lo, hi)| addr >= lo && addr < hi);
                if inside_heap {
                    self.fail(
                        DiagKind::NotAllocated,
                        op,
                        &format!("{addr:#x} does not point into a live block"),
                    );
                    false
                } else {
                    true
                }
            }
        }
    }

    pub(crate) fn mem_set(
        &mut self,
        addr: usize,
        len: usize,
        byte: u8,
        kind: OpKind,
        caller: &Caller<'_>,
        skip: usize,
    ) -> bool {
        let ctx = self.enter(caller, skip);
        if !self.check_mem_args(kind, len) || !self.check_range(kind, addr, len) {
            return false;
        }
        // SAFETY: the range was validated against the live-block indices.
        unsafe { raw::fill(addr, len, byte) };
        self.stats.fill_count += 1;
        self.stats.fill_bytes += len as u64;
        self.diag.memset(kind, addr, len, byte, ctx.caller.view());
        true
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn mem_copy(
        &mut self,
        dst: usize,
        src: usize,
        len: usize,
        kind: OpKind,
        caller: &Caller<'_>,
        skip: usize,
    ) -> bool {
        let ctx = self.enter(caller, skip);
        if !self.check_mem_args(kind, len)
            || !self.check_range(kind, src, len)
            || !self.check_range(kind, dst, len)
        {
            return false;
        }
        let overlaps = src < dst + len && dst < src + len;
        if overlaps && kind == OpKind::Copy {
            self.warn(
                DiagKind::BoundsOverflow,
                kind,
                &format!("ranges at {src:#x} and {dst:#x} overlap"),
            );
        }
        // SAFETY: ranges validated; the overlap-tolerant primitive covers
        // both directions.
        unsafe { raw::copy_overlapping(dst, src, len) };
        self.stats.copy_count += 1;
        self.stats.copy_bytes += len as u64;
        self.diag.memcpy(kind, dst, src, len, ctx.caller.view());
        true
    }

    /// Bounded copy: copies up to `len` bytes from `src` to `dst`, stopping
    /// after the first occurrence of `stop`. Returns the address one past
    /// the copied stop byte when it was found.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn mem_copy_until(
        &mut self,
        dst: usize,
        src: usize,
        len: usize,
        stop: u8,
        caller: &Caller<'_>,
        skip: usize,
    ) -> Option<usize> {
        let ctx = self.enter(caller, skip);
        let kind = OpKind::CopyBounded;
        if !self.check_mem_args(kind, len) {
            return None;
        }
        // SAFETY: source range validated below before any copy.
        let found = if self.check_range(kind, src, len) {
            unsafe { raw::find_byte(src, len, stop) }
        } else {
            return None;
        };
        let count = found.map_or(len, |off| off + 1);
        if !self.check_range(kind, dst, count) {
            return None;
        }
        // SAFETY: both ranges validated.
        unsafe { raw::copy_overlapping(dst, src, count) };
        self.stats.copy_count += 1;
        self.stats.copy_bytes += count as u64;
        self.diag.memcpy(kind, dst, src, count, ctx.caller.view());
        found.map(|off| dst + off + 1)
    }

    pub(crate) fn mem_compare(
        &mut self,
        a: usize,
        b: usize,
        len: usize,
        caller: &Caller<'_>,
        skip: usize,
    ) -> Option<Option<usize>> {
        let ctx = self.enter(caller, skip);
        let kind = OpKind::Compare;
        if !self.check_mem_args(kind, len)
            || !self.check_range(kind, a, len)
            || !self.check_range(kind, b, len)
        {
            return None;
        }
        self.stats.compare_count += 1;
        self.stats.compare_bytes += len as u64;
        self.diag.memcmp(kind, a, b, len, ctx.caller.view());
        // SAFETY: ranges validated.
        Some(unsafe { raw::compare(a, b, len) })
    }

    pub(crate) fn mem_find_byte(
        &mut self,
        addr: usize,
        len: usize,
        byte: u8,
        caller: &Caller<'_>,
        skip: usize,
    ) -> Option<usize> {
        let ctx = self.enter(caller, skip);
        let kind = OpKind::FindByte;
        if !self.check_mem_args(kind, len) || !self.check_range(kind, addr, len) {
            return None;
        }
        self.stats.find_count += 1;
        self.stats.find_bytes += len as u64;
        self.diag.memfind(kind, addr, len, 1, ctx.caller.view());
        // SAFETY: range validated.
        unsafe { raw::find_byte(addr, len, byte) }.map(|off| addr + off)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn mem_find_seq(
        &mut self,
        addr: usize,
        len: usize,
        pat: usize,
        pat_len: usize,
        caller: &Caller<'_>,
        skip: usize,
    ) -> Option<usize> {
        let ctx = self.enter(caller, skip);
        let kind = OpKind::FindSeq;
        if !self.check_mem_args(kind, len)
            || !self.check_range(kind, addr, len)
            || !self.check_range(kind, pat, pat_len)
        {
            return None;
        }
        self.stats.find_count += 1;
        self.stats.find_bytes += len as u64;
        self.diag.memfind(kind, addr, len, pat_len, ctx.caller.view());
        // SAFETY: ranges validated.
        unsafe { raw::find_seq(addr, len, pat, pat_len) }.map(|off| addr + off)
    }

    // ------------------------------------------------------------------
    // Queries and callbacks
    // ------------------------------------------------------------------

    /// Snapshot of the record owning the block that contains `addr`.
    pub(crate) fn block_info(&mut self, addr: usize) -> Option<crate::record::BlockInfo> {
        self.event_count += 1;
        self.stats.event_count = self.event_count;
        let (_, _, handle, _) = self.records.find(addr)?;
        Some(self.records.info(handle))
    }

    /// Writes the owning record of `addr` to the log.
    pub(crate) fn print_info(&mut self, addr: usize) -> bool {
        match self.block_info(addr) {
            Some(info) => {
                self.diag.record_dump(self.symbols.as_ref(), &info);
                self.diag.flush();
                true
            }
            None => false,
        }
    }

    /// Marks a block as intentionally unfreed, exempting it from the
    /// unfreed report and abort threshold.
    pub(crate) fn mark(&mut self, addr: usize) -> bool {
        self.event_count += 1;
        self.stats.event_count = self.event_count;
        match self.records.allocated.get(addr) {
            Some((_, handle)) => {
                self.records.update(handle, |r| r.flags |= flags::MARKED);
                true
            }
            None => false,
        }
    }

    /// Runs a full integrity sweep on demand.
    pub(crate) fn check_now(&mut self, caller: &Caller<'_>, skip: usize) {
        let _ = self.enter(caller, skip);
        self.integrity_sweep();
    }

    pub(crate) fn set_prologue(&mut self, hook: Option<PrologueFn>) -> Option<PrologueFn> {
        std::mem::replace(&mut self.prologue, hook)
    }

    pub(crate) fn set_epilogue(&mut self, hook: Option<EpilogueFn>) -> Option<EpilogueFn> {
        std::mem::replace(&mut self.epilogue, hook)
    }

    pub(crate) fn set_nomemory(&mut self, hook: Option<NoMemoryFn>) -> Option<NoMemoryFn> {
        std::mem::replace(&mut self.nomemory, hook)
    }

    pub(crate) fn stats(&self) -> Stats {
        self.stats
    }

    pub(crate) fn event_count(&self) -> u64 {
        self.event_count
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Final reports, stream close-out and the unfreed-abort check. Runs
    /// once; later calls are no-ops.
    pub(crate) fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if self.profiler.enabled() {
            self.save_profile();
        }
        let _ = self.tracer.close();

        self.termination_reports();
        let stats = self.stats;
        self.diag
            .summary(&stats, self.heap.heap_total(), self.mem.page_size());
        self.diag.flush();

        if self.opts.unfreed_abort != 0 && self.stats.live_bytes >= self.opts.unfreed_abort {
            self.diag.error(
                DiagKind::LimitExceeded,
                OpKind::Free,
                &format!(
                    "{} bytes still allocated at exit (threshold {})",
                    self.stats.live_bytes, self.opts.unfreed_abort
                ),
            );
            self.diag.flush();
            std::process::abort();
        }
    }
}
