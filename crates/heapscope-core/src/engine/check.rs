//! Integrity sweeps and termination reports.

use heapscope_os::raw;

use super::Engine;
use crate::diag::DiagKind;
use crate::record::BlockInfo;

/// Bytes shown around a corrupt address in the hex window.
const WINDOW: usize = 32;

impl Engine {
    /// Walks every known block in address order and verifies its fill
    /// patterns: free and retained ranges must hold the free byte, guards
    /// must hold the overflow byte. Any mismatch is fatal.
    pub(crate) fn integrity_sweep(&mut self) {
        if !self.records.allocated.check_no_overlap() || !self.records.freed.check_no_overlap() {
            self.die(DiagKind::FreeCorrupt, 0, None, None);
        }

        // Live blocks: both guards still carry the overflow byte.
        let live: Vec<(usize, crate::arena::SlotHandle)> = self
            .records
            .allocated
            .iter()
            .map(|(base, _, h)| (base, h))
            .collect();
        for (base, handle) in live {
            let Some(extent) = self.heap.extent_of(base) else {
                continue;
            };
            for (addr, len) in extent.guard_ranges(self.mem.page_size()) {
                // SAFETY: guard ranges of a live block are readable.
                if let Some(off) = unsafe { raw::check_fill(addr, len, self.opts.oflow_byte) } {
                    let info = self.records.info(handle);
                    self.die(DiagKind::OverflowCorrupt, addr + off, Some(extent), Some(info));
                }
            }
        }

        // Retained-freed blocks: wiped contents must still be wiped and
        // their guards intact. Paged retention protects instead of wiping.
        let retained: Vec<(usize, crate::arena::SlotHandle)> = self
            .records
            .freed
            .iter()
            .map(|(base, _, h)| (base, h))
            .collect();
        for (base, handle) in retained {
            let Some(extent) = self.heap.extent_of(base) else {
                continue;
            };
            if extent.paged {
                continue;
            }
            if !self.opts.preserve {
                // SAFETY: the retained user range is readable.
                if let Some(off) =
                    unsafe { raw::check_fill(extent.user, extent.user_size, self.opts.free_byte) }
                {
                    let info = self.records.info(handle);
                    self.die(DiagKind::FreeCorrupt, extent.user + off, Some(extent), Some(info));
                }
            }
            for (addr, len) in extent.guard_ranges(self.mem.page_size()) {
                // SAFETY: guard ranges of a retained block are readable.
                if let Some(off) = unsafe { raw::check_fill(addr, len, self.opts.oflow_byte) } {
                    let info = self.records.info(handle);
                    self.die(DiagKind::OverflowCorrupt, addr + off, Some(extent), Some(info));
                }
            }
        }

        // Free pool: every byte still carries the free byte.
        for (base, size) in self.heap.free_blocks() {
            // SAFETY: free ranges are wiped read-write territory.
            if let Some(off) = unsafe { raw::check_fill(base, size, self.opts.free_byte) } {
                let window = (base.max((base + off).saturating_sub(WINDOW / 2)), WINDOW);
                self.stats.error_count += 1;
                self.diag.corruption(
                    self.symbols.as_ref(),
                    DiagKind::FreeCorrupt,
                    base + off,
                    window,
                    None,
                );
                std::process::abort();
            }
        }
    }

    /// Reports a fatal corruption and terminates.
    fn die(
        &mut self,
        kind: DiagKind,
        addr: usize,
        extent: Option<crate::heap::Extent>,
        owner: Option<BlockInfo>,
    ) -> ! {
        self.stats.error_count += 1;
        // The hex window must stay inside readable territory; paged blocks
        // are fenced by no-access pages.
        let window = match extent {
            Some(e) => {
                let page = self.mem.page_size();
                let (lo, hi) = if e.paged {
                    (e.base + page, e.limit() - page)
                } else {
                    (e.base, e.limit())
                };
                let start = addr.saturating_sub(WINDOW / 2).clamp(lo, hi);
                (start, WINDOW.min(hi - start))
            }
            None => (addr, 0),
        };
        self.diag
            .corruption(self.symbols.as_ref(), kind, addr, window, owner.as_ref());
        std::process::abort();
    }

    /// Prints the summary table without closing the engine down, used by
    /// stop points and the `summary` query.
    pub(crate) fn summary_now(&mut self) {
        let stats = self.stats;
        self.diag
            .summary(&stats, self.heap.heap_total(), self.mem.page_size());
        self.diag.flush();
    }

    /// Prints the address-ordered memory map.
    pub(crate) fn memory_map_now(&mut self) {
        let rows = self.map_rows();
        self.diag.show_map(&rows);
        self.diag.flush();
    }

    fn map_rows(&self) -> Vec<(usize, usize, &'static str)> {
        let mut rows: Vec<(usize, usize, &'static str)> = Vec::new();
        rows.extend(
            self.records
                .allocated
                .iter()
                .map(|(b, s, _)| (b, s, "allocated")),
        );
        rows.extend(self.records.freed.iter().map(|(b, s, _)| (b, s, "freed")));
        rows.extend(self.heap.free_blocks().iter().map(|&(b, s)| (b, s, "free")));
        rows.extend(
            self.records
                .slab_regions()
                .chain(self.heap.header_slabs().iter().copied())
                .map(|r| (r.base, r.size, "internal")),
        );
        rows.sort_by_key(|&(b, _, _)| b);
        rows
    }

    /// The SHOW sections selected by the options, written at termination.
    pub(crate) fn termination_reports(&mut self) {
        if self.opts.show_map {
            let rows = self.map_rows();
            self.diag.show_map(&rows);
        }
        if self.opts.show_free {
            let blocks = self.heap.free_blocks();
            self.diag.show_free(&blocks);
        }
        if self.opts.show_freed {
            let infos: Vec<BlockInfo> = self
                .records
                .freed
                .iter()
                .map(|(_, _, h)| self.records.info(h))
                .collect();
            let total = infos.iter().map(|i| i.size).sum();
            self.diag
                .show_records(self.symbols.as_ref(), "freed blocks", &infos, total);
        }
        if self.opts.show_unfreed {
            let infos: Vec<BlockInfo> = self
                .records
                .allocated
                .iter()
                .map(|(_, _, h)| self.records.info(h))
                .filter(|i| !i.marked)
                .collect();
            let total = infos.iter().map(|i| i.size).sum();
            self.diag
                .show_records(self.symbols.as_ref(), "unfreed blocks", &infos, total);
        }
        if self.opts.show_symbols {
            let mut addrs: Vec<usize> = self
                .records
                .allocated
                .iter()
                .chain(self.records.freed.iter())
                .flat_map(|(_, _, h)| {
                    let record = self.records.get(h);
                    self.records.stack_of(&record)
                })
                .collect();
            addrs.sort_unstable();
            addrs.dedup();
            self.diag.show_symbols(self.symbols.as_ref(), &addrs);
        }
    }
}
