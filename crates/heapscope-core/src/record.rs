//! Allocation records and their indices.
//!
//! One record accompanies every user block from creation until it is
//! genuinely recycled (immediately on free, or after leaving the retained
//! pool under `NOFREE`). Records and captured stack frames are POD entries
//! in slot arenas; all strings are interned in a table owned here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use heapscope_os::{Memory, Region};

use crate::arena::{SlotArena, SlotHandle};
use crate::index::AddrIndex;
use crate::ops::{Caller, OpKind, TypeInfo};

/// Record flag bits.
pub mod flags {
    pub const FREED: u8 = 1 << 0;
    pub const PROFILED: u8 = 1 << 1;
    pub const TRACED: u8 = 1 << 2;
    pub const INTERNAL: u8 = 1 << 3;
    pub const MARKED: u8 = 1 << 4;
}

/// Interned string id; zero means absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sym(u32);

impl Sym {
    pub const NONE: Sym = Sym(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// String interning table for function, file and type names.
#[derive(Debug, Default)]
pub struct StringTable {
    lookup: HashMap<String, Sym>,
    entries: Vec<String>,
}

impl StringTable {
    pub fn intern(&mut self, s: &str) -> Sym {
        if let Some(&sym) = self.lookup.get(s) {
            return sym;
        }
        self.entries.push(s.to_string());
        let sym = Sym(self.entries.len() as u32);
        self.lookup.insert(s.to_string(), sym);
        sym
    }

    pub fn get(&self, sym: Sym) -> Option<&str> {
        if sym.is_none() {
            return None;
        }
        self.entries.get(sym.0 as usize - 1).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// POD allocation record stored in a slot arena.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RecordSlot {
    /// User address of the block.
    pub block: usize,
    /// Current user size in bytes.
    pub size: usize,
    /// Alignment the block was created with.
    pub align: usize,
    /// Element size for typed allocations (0 otherwise).
    pub type_size: usize,
    /// Monotonic index assigned at creation.
    pub alloc_index: u64,
    /// Number of resizes applied to this record.
    pub realloc_count: u64,
    /// Identifier of the creating thread.
    pub thread_id: u64,
    /// Head of the captured stack chain in the frame arena.
    pub stack: SlotHandle,
    /// Caller tuple, interned.
    pub func: Sym,
    pub file: Sym,
    pub line: u32,
    /// Type string for typed allocations.
    pub type_name: Sym,
    /// Creating entry point, as `OpKind as u8`.
    pub kind: u8,
    /// Entry point that freed the block, for double-free reports.
    pub freed_by: u8,
    /// Flag bits from [`flags`].
    pub flags: u8,
}

impl RecordSlot {
    pub fn kind(&self) -> OpKind {
        OpKind::from_u8(self.kind)
    }

    pub fn is_freed(&self) -> bool {
        self.flags & flags::FREED != 0
    }
}

/// POD captured-stack frame: one return address in a singly linked chain.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct FrameSlot {
    pub addr: usize,
    pub next: SlotHandle,
}

/// Which index a looked-up block was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Live,
    Retained,
}

/// Public snapshot of a record, for the query API.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub block: usize,
    pub size: usize,
    pub align: usize,
    pub kind: OpKind,
    pub alloc_index: u64,
    pub realloc_count: u64,
    pub thread_id: u64,
    pub func: Option<String>,
    pub file: Option<String>,
    pub line: u32,
    pub type_name: Option<String>,
    pub type_size: usize,
    pub stack: Vec<usize>,
    pub freed: bool,
    pub marked: bool,
}

/// The record store: slot arenas plus the allocated / retained-freed
/// address indices.
pub struct RecordStore {
    records: SlotArena<RecordSlot>,
    frames: SlotArena<FrameSlot>,
    pub strings: StringTable,
    pub allocated: AddrIndex<SlotHandle>,
    pub freed: AddrIndex<SlotHandle>,
}

impl RecordStore {
    pub fn new(mem: &Memory, factor: usize) -> Self {
        Self {
            records: SlotArena::new(mem, factor),
            frames: SlotArena::new(mem, factor),
            strings: StringTable::default(),
            allocated: AddrIndex::new(),
            freed: AddrIndex::new(),
        }
    }

    /// Creates a record for a fresh block and indexes it as allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        mem: &mut Memory,
        block: usize,
        size: usize,
        align: usize,
        kind: OpKind,
        alloc_index: u64,
        caller: &Caller<'_>,
        stack: &[usize],
        type_info: Option<&TypeInfo<'_>>,
    ) -> Option<SlotHandle> {
        let handle = self.records.obtain(mem)?;
        let record = RecordSlot {
            block,
            size,
            align,
            type_size: type_info.map_or(0, |t| t.size),
            alloc_index,
            realloc_count: 0,
            thread_id: current_thread_id(),
            stack: self.store_stack(mem, stack),
            func: caller.func.map_or(Sym::NONE, |s| self.strings.intern(s)),
            file: caller.file.map_or(Sym::NONE, |s| self.strings.intern(s)),
            line: caller.line,
            type_name: type_info.map_or(Sym::NONE, |t| self.strings.intern(t.name)),
            kind: kind as u8,
            freed_by: 0,
            flags: 0,
        };
        self.records.put(handle, record);
        self.allocated.insert(block, size, handle);
        Some(handle)
    }

    /// Stores a captured stack as a chain in the frame arena. Frames that
    /// fail to obtain a slot truncate the chain.
    fn store_stack(&mut self, mem: &mut Memory, stack: &[usize]) -> SlotHandle {
        let mut head = SlotHandle::NULL;
        for &addr in stack.iter().rev() {
            let Some(h) = self.frames.obtain(mem) else {
                break;
            };
            self.frames.put(h, FrameSlot { addr, next: head });
            head = h;
        }
        head
    }

    /// Reads a record's captured stack back out, top-most first.
    pub fn stack_of(&self, record: &RecordSlot) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = record.stack;
        while !cur.is_null() {
            let frame = self.frames.get(cur);
            out.push(frame.addr);
            cur = frame.next;
        }
        out
    }

    pub fn get(&self, handle: SlotHandle) -> RecordSlot {
        self.records.get(handle)
    }

    pub fn update(&mut self, handle: SlotHandle, f: impl FnOnce(&mut RecordSlot)) {
        self.records.update(handle, f);
    }

    /// Finds the block containing `addr` among live and retained blocks.
    pub fn find(&self, addr: usize) -> Option<(usize, usize, SlotHandle, BlockState)> {
        if let Some((base, size, h)) = self.allocated.find_containing(addr) {
            return Some((base, size, h, BlockState::Live));
        }
        self.freed
            .find_containing(addr)
            .map(|(base, size, h)| (base, size, h, BlockState::Retained))
    }

    /// Finds a retained-freed block containing `addr`.
    pub fn find_freed(&self, addr: usize) -> Option<(usize, usize, SlotHandle)> {
        self.freed.find_containing(addr)
    }

    /// Moves a block from the allocated index to the retained-freed index
    /// and sets its freed flag.
    pub fn retain_freed(&mut self, base: usize) -> Option<SlotHandle> {
        let (size, handle) = self.allocated.remove(base)?;
        self.records.update(handle, |r| r.flags |= flags::FREED);
        self.freed.insert(base, size, handle);
        Some(handle)
    }

    /// Drops a record entirely, returning its stack chain to the arena.
    pub fn discard(&mut self, handle: SlotHandle) {
        let record = self.records.get(handle);
        let mut cur = record.stack;
        while !cur.is_null() {
            let next = self.frames.get(cur).next;
            self.frames.release(cur);
            cur = next;
        }
        self.records.release(handle);
    }

    /// Builds the public snapshot of a record.
    pub fn info(&self, handle: SlotHandle) -> BlockInfo {
        let r = self.records.get(handle);
        BlockInfo {
            block: r.block,
            size: r.size,
            align: r.align,
            kind: r.kind(),
            alloc_index: r.alloc_index,
            realloc_count: r.realloc_count,
            thread_id: r.thread_id,
            func: self.strings.get(r.func).map(str::to_string),
            file: self.strings.get(r.file).map(str::to_string),
            line: r.line,
            type_name: self.strings.get(r.type_name).map(str::to_string),
            type_size: r.type_size,
            stack: self.stack_of(&r),
            freed: r.is_freed(),
            marked: r.flags & flags::MARKED != 0,
        }
    }

    /// Metadata slab regions, for protection sweeps.
    pub fn slab_regions(&self) -> impl Iterator<Item = Region> + '_ {
        self.records
            .slabs()
            .iter()
            .chain(self.frames.slabs().iter())
            .copied()
    }

    /// Freshly acquired metadata slabs since the last drain.
    pub fn take_fresh_slabs(&mut self) -> Vec<Region> {
        let mut fresh = self.records.take_fresh_slabs();
        fresh.extend(self.frames.take_fresh_slabs());
        fresh
    }

    pub fn live_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn retained_count(&self) -> usize {
        self.freed.len()
    }
}

/// Stable small integer id for the current thread.
pub fn current_thread_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}
