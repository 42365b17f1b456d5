//! Fixed-size slot arenas for engine metadata.
//!
//! Allocation records, captured stack frames and free-block headers are all
//! plain-old-data entries living in slabs obtained from the OS provider,
//! never on the heap being debugged. Slots within a slab sit on a singly
//! linked free list threaded through their first pointer-sized bytes. The
//! slabs are exposed so the engine can flip their page protection between
//! operations.

use core::marker::PhantomData;

use heapscope_os::{Memory, Region, raw};

/// Handle to a slot in a [`SlotArena`]. Zero is the null handle, so handles
/// can be embedded in POD entries stored in other slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SlotHandle(u32);

impl SlotHandle {
    pub const NULL: SlotHandle = SlotHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    fn from_index(index: usize) -> Self {
        SlotHandle(index as u32 + 1)
    }
}

/// A pool of fixed-size POD slots backed by page-multiple slabs.
pub struct SlotArena<T: Copy> {
    slabs: Vec<Region>,
    /// Slabs acquired since the engine last drained them, for trace events
    /// and protection bookkeeping.
    fresh: Vec<Region>,
    /// Head of the threaded free list.
    free_head: SlotHandle,
    /// Bytes per slot; a multiple of the slot alignment, at least one word.
    entry_size: usize,
    /// Slots per slab.
    slab_capacity: usize,
    /// Requested slab size (a multiple of the page size).
    slab_size: usize,
    /// Number of slots currently handed out.
    in_use: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> SlotArena<T> {
    /// Creates an empty arena whose slabs cover `factor` pages-worth of
    /// entries per OS request.
    pub fn new(mem: &Memory, factor: usize) -> Self {
        let align = align_of::<T>().max(align_of::<usize>());
        let entry_size = size_of::<T>()
            .max(size_of::<usize>())
            .next_multiple_of(align);
        let slab_size = mem.page_size() * factor.max(1);
        Self {
            slabs: Vec::new(),
            fresh: Vec::new(),
            free_head: SlotHandle::NULL,
            entry_size,
            slab_capacity: slab_size / entry_size,
            slab_size,
            in_use: 0,
            _marker: PhantomData,
        }
    }

    /// Address of the slot behind `handle`.
    fn slot_addr(&self, handle: SlotHandle) -> usize {
        let index = handle.index();
        let slab = &self.slabs[index / self.slab_capacity];
        slab.base + (index % self.slab_capacity) * self.entry_size
    }

    /// Obtains a zeroed slot, growing the arena from `mem` when the free
    /// list is empty. Returns `None` when the OS refuses more memory.
    pub fn obtain(&mut self, mem: &mut Memory) -> Option<SlotHandle> {
        if self.free_head.is_null() {
            let region = mem.acquire(self.slab_size).ok()?;
            self.seed(region);
        }
        let handle = self.free_head;
        let addr = self.slot_addr(handle);
        // SAFETY: the slot lies in a slab this arena owns and is mapped
        // read-write while the engine holds the write permit.
        unsafe {
            self.free_head = SlotHandle(raw::read_word(addr) as u32);
            raw::fill(addr, self.entry_size, 0);
        }
        self.in_use += 1;
        Some(handle)
    }

    /// Splices a fresh region into the arena as one slab of free slots.
    fn seed(&mut self, region: Region) {
        let first = self.slabs.len() * self.slab_capacity;
        self.slabs.push(region);
        self.fresh.push(region);
        for i in (0..self.slab_capacity).rev() {
            let handle = SlotHandle::from_index(first + i);
            let addr = self.slot_addr(handle);
            // SAFETY: freshly acquired read-write slab owned by this arena.
            unsafe { raw::write_word(addr, self.free_head.0 as usize) };
            self.free_head = handle;
        }
    }

    /// Returns a slot to the free list.
    pub fn release(&mut self, handle: SlotHandle) {
        debug_assert!(!handle.is_null());
        let addr = self.slot_addr(handle);
        // SAFETY: slot owned by this arena, mapped read-write.
        unsafe { raw::write_word(addr, self.free_head.0 as usize) };
        self.free_head = handle;
        self.in_use -= 1;
    }

    /// Copies the entry out of a slot.
    pub fn get(&self, handle: SlotHandle) -> T {
        debug_assert!(!handle.is_null());
        // SAFETY: entry_size covers T, the slot is aligned for T, and every
        // occupied slot was initialised by put() or zeroed by obtain().
        unsafe { raw::read_pod(self.slot_addr(handle)) }
    }

    /// Stores an entry into a slot.
    pub fn put(&mut self, handle: SlotHandle, value: T) {
        debug_assert!(!handle.is_null());
        // SAFETY: as in get(); the slot is mapped read-write inside the
        // engine's write-permit window.
        unsafe { raw::write_pod(self.slot_addr(handle), value) };
    }

    /// Reads, transforms and writes back an entry.
    pub fn update(&mut self, handle: SlotHandle, f: impl FnOnce(&mut T)) {
        let mut value = self.get(handle);
        f(&mut value);
        self.put(handle, value);
    }

    /// All slab regions owned by the arena.
    pub fn slabs(&self) -> &[Region] {
        &self.slabs
    }

    /// Slabs acquired since the last drain.
    pub fn take_fresh_slabs(&mut self) -> Vec<Region> {
        std::mem::take(&mut self.fresh)
    }

    /// Number of slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use
    }
}
