//! Low-level block placement.
//!
//! Carves user blocks out of free ranges obtained from the OS provider,
//! splits and coalesces the free pool, lays out guard regions, applies the
//! fill patterns, and implements whole-page placement with no-access guard
//! pages. Policy above this (records, pairing, retention scheduling,
//! logging) lives in the engine.

use heapscope_os::{Access, Memory, Region, raw};

use crate::arena::{SlotArena, SlotHandle};
use crate::index::{AddrIndex, SizeIndex};
use crate::options::{Options, PagePlacement};

/// Free ranges smaller than this stay attached to the carved block rather
/// than becoming their own free node.
const RESIDUE_MIN: usize = 16;

/// POD free-block header stored in a slot arena.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct FreeSlot {
    base: usize,
    size: usize,
}

/// Geometry of one carved block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Start of the carved range, including the lower guard.
    pub base: usize,
    /// Total carved size, including both guards.
    pub size: usize,
    /// User address.
    pub user: usize,
    /// Current user size in bytes.
    pub user_size: usize,
    /// Whether the block uses whole-page placement with no-access guards.
    pub paged: bool,
}

impl Extent {
    /// Exclusive upper bound of the carved range.
    pub fn limit(&self) -> usize {
        self.base + self.size
    }

    /// The readable guard ranges of the block, `(addr, len)` pairs. For
    /// paged blocks the no-access guard pages are excluded; only the
    /// pattern-filled slack inside the user pages remains.
    pub fn guard_ranges(&self, page: usize) -> [(usize, usize); 2] {
        if self.paged {
            let lo = self.base + page;
            let hi = self.limit() - page;
            [
                (lo, self.user - lo),
                (self.user + self.user_size, hi - (self.user + self.user_size)),
            ]
        } else {
            [
                (self.base, self.user - self.base),
                (
                    self.user + self.user_size,
                    self.limit() - (self.user + self.user_size),
                ),
            ]
        }
    }
}

/// A successfully placed block.
#[derive(Debug, Clone, Copy)]
pub struct Placed {
    pub user: usize,
    pub user_size: usize,
}

/// The low-level allocator state.
pub struct Heap {
    headers: SlotArena<FreeSlot>,
    free_addr: AddrIndex<SlotHandle>,
    free_size: SizeIndex<SlotHandle>,
    /// Carve geometry per user address, live and retained blocks alike.
    extents: std::collections::BTreeMap<usize, Extent>,
    /// Every region acquired from the OS for user blocks.
    regions: Vec<Region>,
    /// Regions acquired since the engine last drained them.
    fresh: Vec<Region>,
    /// Total bytes acquired from the OS.
    heap_total: usize,
    page: usize,
    alloc_factor: usize,
}

impl Heap {
    pub fn new(mem: &Memory, alloc_factor: usize) -> Self {
        Self {
            headers: SlotArena::new(mem, alloc_factor.max(1)),
            free_addr: AddrIndex::new(),
            free_size: SizeIndex::new(),
            extents: std::collections::BTreeMap::new(),
            regions: Vec::new(),
            fresh: Vec::new(),
            heap_total: 0,
            page: mem.page_size(),
            alloc_factor: alloc_factor.max(1),
        }
    }

    /// Places a user block of `user_size` bytes at `align`. Fills guards
    /// with the overflow byte and user bytes with the allocation byte (or
    /// zeroes). Returns `None` when the OS refuses more memory.
    pub fn get(
        &mut self,
        mem: &mut Memory,
        opts: &Options,
        user_size: usize,
        align: usize,
        zero: bool,
    ) -> Option<Placed> {
        let extent = match opts.page_alloc {
            None => self.carve(mem, opts, user_size, align)?,
            Some(edge) => self.carve_paged(mem, opts, user_size, align, edge)?,
        };
        let fill = if zero { 0x00 } else { opts.alloc_byte };
        // SAFETY: the carved user range was just taken from mapped
        // read-write territory owned by this heap.
        unsafe { raw::fill(extent.user, extent.user_size, fill) };
        self.extents.insert(extent.user, extent);
        Some(Placed {
            user: extent.user,
            user_size: extent.user_size,
        })
    }

    /// Attempts to grow or shrink a block within its carved range. On
    /// success the guards are re-laid and newly exposed bytes filled.
    pub fn resize_in_place(
        &mut self,
        opts: &Options,
        user: usize,
        new_size: usize,
        zero: bool,
    ) -> bool {
        let Some(&extent) = self.extents.get(&user) else {
            return false;
        };
        if extent.paged {
            return self.resize_paged(opts, extent, new_size, zero);
        }
        let capacity = extent.limit() - extent.user - opts.oflow_size;
        if new_size > capacity {
            return false;
        }
        let old_size = extent.user_size;
        // SAFETY: all touched ranges lie inside the carved extent.
        unsafe {
            if new_size > old_size {
                let fill = if zero { 0x00 } else { opts.alloc_byte };
                raw::fill(user + old_size, new_size - old_size, fill);
            }
            // Everything above the user bytes becomes upper guard again.
            raw::fill(user + new_size, extent.limit() - (user + new_size), opts.oflow_byte);
        }
        if let Some(e) = self.extents.get_mut(&user) {
            e.user_size = new_size;
        }
        true
    }

    fn resize_paged(
        &mut self,
        opts: &Options,
        extent: Extent,
        new_size: usize,
        zero: bool,
    ) -> bool {
        // Upper placement keeps the user end pinned to the guard page, so
        // any size change would move the start; relocate instead.
        if opts.page_alloc != Some(PagePlacement::Lower) {
            return false;
        }
        let span_end = extent.limit() - self.page;
        if extent.user + new_size > span_end {
            return false;
        }
        let old_size = extent.user_size;
        // SAFETY: user pages of a paged block are mapped read-write.
        unsafe {
            if new_size > old_size {
                let fill = if zero { 0x00 } else { opts.alloc_byte };
                raw::fill(extent.user + old_size, new_size - old_size, fill);
            }
            raw::fill(
                extent.user + new_size,
                span_end - (extent.user + new_size),
                opts.oflow_byte,
            );
        }
        if let Some(e) = self.extents.get_mut(&extent.user) {
            e.user_size = new_size;
        }
        true
    }

    /// Wipes a block that stays in the retained-freed pool. Its extent is
    /// kept so the range can be purged later. Paged blocks are made fully
    /// inaccessible instead of being wiped.
    pub fn retain(&mut self, mem: &Memory, opts: &Options, user: usize) {
        let Some(&extent) = self.extents.get(&user) else {
            return;
        };
        if extent.paged {
            let _ = mem.protect(extent.base, extent.size, Access::None);
            return;
        }
        if !opts.preserve {
            // SAFETY: the user range of a block this heap placed.
            unsafe { raw::fill(extent.user, extent.user_size, opts.free_byte) };
        }
    }

    /// Returns a block's carved range to the free pool, wiping it with the
    /// free byte and coalescing with free neighbours.
    pub fn release(&mut self, mem: &mut Memory, opts: &Options, user: usize) {
        let Some(extent) = self.extents.remove(&user) else {
            return;
        };
        if extent.paged {
            // Re-open the pages so the range can be wiped and reused.
            let _ = mem.protect(extent.base, extent.size, Access::ReadWrite);
        }
        // SAFETY: the whole carved range belongs to this heap.
        unsafe { raw::fill(extent.base, extent.size, opts.free_byte) };
        self.insert_free(mem, extent.base, extent.size);
    }

    /// Carve geometry of a live or retained block.
    pub fn extent_of(&self, user: usize) -> Option<Extent> {
        self.extents.get(&user).copied()
    }

    /// All free ranges in address order.
    pub fn free_blocks(&self) -> Vec<(usize, usize)> {
        self.free_addr.iter().map(|(b, s, _)| (b, s)).collect()
    }

    /// Acquired OS regions in acquisition order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Regions acquired since the last drain, for trace events.
    pub fn take_fresh_regions(&mut self) -> Vec<Region> {
        std::mem::take(&mut self.fresh)
    }

    /// Total bytes acquired from the OS.
    pub fn heap_total(&self) -> usize {
        self.heap_total
    }

    /// Lowest and highest addresses ever acquired.
    pub fn bounds(&self) -> Option<(usize, usize)> {
        let lo = self.regions.iter().map(|r| r.base).min()?;
        let hi = self.regions.iter().map(Region::limit).max()?;
        Some((lo, hi))
    }

    /// Slab regions of the free-header arena, for protection sweeps.
    pub fn header_slabs(&self) -> &[Region] {
        self.headers.slabs()
    }

    pub fn take_fresh_header_slabs(&mut self) -> Vec<Region> {
        self.headers.take_fresh_slabs()
    }

    // ------------------------------------------------------------------
    // Carving
    // ------------------------------------------------------------------

    fn carve(
        &mut self,
        mem: &mut Memory,
        opts: &Options,
        user_size: usize,
        align: usize,
    ) -> Option<Extent> {
        let guard = opts.oflow_size;
        let need = user_size + 2 * guard + align.saturating_sub(1);
        let (nbase, nsize) = self.take_fit(mem, opts, need)?;

        let user = (nbase + guard).next_multiple_of(align);
        let wanted_end = user + user_size + guard;
        let residue = nbase + nsize - wanted_end;
        let (carve_size, residue) = if residue >= RESIDUE_MIN {
            (wanted_end - nbase, residue)
        } else {
            (nsize, 0)
        };
        if residue > 0 {
            self.insert_free(mem, nbase + carve_size, residue);
        }

        let extent = Extent {
            base: nbase,
            size: carve_size,
            user,
            user_size,
            paged: false,
        };
        // SAFETY: guard ranges lie inside the carved range.
        unsafe {
            raw::fill(extent.base, user - extent.base, opts.oflow_byte);
            raw::fill(
                user + user_size,
                extent.limit() - (user + user_size),
                opts.oflow_byte,
            );
        }
        Some(extent)
    }

    fn carve_paged(
        &mut self,
        mem: &mut Memory,
        opts: &Options,
        user_size: usize,
        align: usize,
        edge: PagePlacement,
    ) -> Option<Extent> {
        let span = mem.round_to_pages(user_size);
        let need = span + 2 * self.page;
        let (nbase, nsize) = self.take_fit(mem, opts, need)?;
        debug_assert_eq!(nbase % self.page, 0);

        let residue = nsize - need;
        if residue > 0 {
            self.insert_free(mem, nbase + need, residue);
        }
        let span_base = nbase + self.page;
        let user = match edge {
            PagePlacement::Lower => span_base,
            PagePlacement::Upper => (span_base + span - user_size) / align * align,
        };
        let extent = Extent {
            base: nbase,
            size: need,
            user,
            user_size,
            paged: true,
        };
        // SAFETY: slack inside the user pages belongs to the carved range.
        unsafe {
            raw::fill(span_base, user - span_base, opts.oflow_byte);
            raw::fill(
                user + user_size,
                span_base + span - (user + user_size),
                opts.oflow_byte,
            );
        }
        // Guard pages trap on any access.
        let _ = mem.protect(nbase, self.page, Access::None);
        let _ = mem.protect(nbase + need - self.page, self.page, Access::None);
        Some(extent)
    }

    /// Pops the smallest free node of at least `need` bytes, acquiring and
    /// splicing a fresh region when the pool has no fit.
    fn take_fit(
        &mut self,
        mem: &mut Memory,
        opts: &Options,
        need: usize,
    ) -> Option<(usize, usize)> {
        // In page mode every carve is page-granular so node bases stay
        // page-aligned; round the request up to keep it that way.
        let need = if opts.page_alloc.is_some() {
            mem.round_to_pages(need)
        } else {
            need
        };
        if let Some((size, base, handle)) = self.free_size.find_smallest_ge(need) {
            self.remove_free(handle, base, size);
            return Some((base, size));
        }
        let want = mem.round_to_pages(need) * self.alloc_factor;
        let region = mem.acquire(want).ok()?;
        self.regions.push(region);
        self.fresh.push(region);
        self.heap_total += region.size;
        // SAFETY: fresh region, mapped read-write.
        unsafe { raw::fill(region.base, region.size, opts.free_byte) };
        self.insert_free(mem, region.base, region.size);
        let (size, base, handle) = self.free_size.find_smallest_ge(need)?;
        self.remove_free(handle, base, size);
        Some((base, size))
    }

    // ------------------------------------------------------------------
    // Free pool maintenance
    // ------------------------------------------------------------------

    fn remove_free(&mut self, handle: SlotHandle, base: usize, size: usize) {
        self.free_addr.remove(base);
        self.free_size.remove(size, base);
        self.headers.release(handle);
    }

    /// Inserts `[base, base + size)` into the free pool, coalescing with
    /// the adjacent free block below, above or both.
    fn insert_free(&mut self, mem: &mut Memory, mut base: usize, mut size: usize) {
        if let Some((pbase, psize, ph)) = self.free_addr.predecessor(base)
            && pbase + psize == base
        {
            self.remove_free(ph, pbase, psize);
            base = pbase;
            size += psize;
        }
        if let Some((sbase, ssize, sh)) = self.free_addr.successor(base)
            && base + size == sbase
        {
            self.remove_free(sh, sbase, ssize);
            size += ssize;
        }
        let Some(handle) = self.headers.obtain(mem) else {
            // The header arena could not grow; the range leaks out of the
            // pool but stays acquired, which only wastes memory.
            return;
        };
        self.headers.put(handle, FreeSlot { base, size });
        self.free_addr.insert(base, size, handle);
        self.free_size.insert(size, base, handle);
    }
}
