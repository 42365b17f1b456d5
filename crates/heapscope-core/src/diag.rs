//! Diagnostic log formatting.
//!
//! Turns engine events and errors into the human-readable log stream:
//! per-event lines with the bracketed caller tuple and indented captured
//! stack, error reports with a hex window around the faulty address and the
//! owning record's history, the opening banner and the closing summary with
//! its optional SHOW sections.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;

use heapscope_os::raw;

use crate::ops::OpKind;
use crate::record::BlockInfo;
use crate::sink::Sink;
use crate::symbols::SymbolReader;

/// Classified diagnostics, each with the short code used in log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagKind {
    ZeroSize,
    BadAlign,
    NullPointer,
    NotAllocated,
    NotStart,
    DoubleFree,
    PairMismatch,
    FreeCorrupt,
    OverflowCorrupt,
    BoundsOverflow,
    OutOfMemory,
    LimitExceeded,
    UseAfterFree,
    Unsupported,
}

impl DiagKind {
    pub fn code(self) -> &'static str {
        match self {
            DiagKind::ZeroSize => "ZERALL",
            DiagKind::BadAlign => "BADALN",
            DiagKind::NullPointer => "NULOPN",
            DiagKind::NotAllocated => "NOTALL",
            DiagKind::NotStart => "NOTBEG",
            DiagKind::DoubleFree => "FRDAGN",
            DiagKind::PairMismatch => "MISMAT",
            DiagKind::FreeCorrupt => "FRECOR",
            DiagKind::OverflowCorrupt => "OVFCOR",
            DiagKind::BoundsOverflow => "RNGOVF",
            DiagKind::OutOfMemory => "OUTMEM",
            DiagKind::LimitExceeded => "ALLLIM",
            DiagKind::UseAfterFree => "USEFRD",
            DiagKind::Unsupported => "NOSUPP",
        }
    }
}

/// Caller identification attached to every logged event.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerView<'a> {
    pub thread: u64,
    pub func: Option<&'a str>,
    pub file: Option<&'a str>,
    pub line: u32,
}

impl fmt::Display for CallerView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}|{}|{}|{}]",
            self.thread,
            self.func.unwrap_or("-"),
            self.file.unwrap_or("-"),
            self.line
        )
    }
}

/// Cumulative operation counters, printed in the closing summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub event_count: u64,
    pub alloc_count: u64,
    pub realloc_count: u64,
    pub free_count: u64,
    pub fail_count: u64,
    pub fill_count: u64,
    pub fill_bytes: u64,
    pub copy_count: u64,
    pub copy_bytes: u64,
    pub compare_count: u64,
    pub compare_bytes: u64,
    pub find_count: u64,
    pub find_bytes: u64,
    pub warning_count: u64,
    pub error_count: u64,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    /// Cumulative bytes handed out over the whole run.
    pub total_requested: u64,
    /// Extremes over every successful allocation (0 until the first one).
    pub largest_block: usize,
    pub smallest_block: usize,
}

/// The log writer.
pub struct Diag {
    sink: Option<Sink>,
    log_allocs: bool,
    log_reallocs: bool,
    log_frees: bool,
    log_memory: bool,
    /// Resolved-name cache for captured addresses.
    names: HashMap<usize, Option<String>>,
}

impl Diag {
    pub fn new(path: &str, log_allocs: bool, log_reallocs: bool, log_frees: bool, log_memory: bool) -> Self {
        Self {
            sink: Sink::open(path).ok(),
            log_allocs,
            log_reallocs,
            log_frees,
            log_memory,
            names: HashMap::new(),
        }
    }

    /// A writer that drops everything, for tests and disabled logging.
    pub fn disabled() -> Self {
        Self {
            sink: None,
            log_allocs: false,
            log_reallocs: false,
            log_frees: false,
            log_memory: false,
            names: HashMap::new(),
        }
    }

    fn out(&mut self, args: fmt::Arguments<'_>) {
        if let Some(sink) = self.sink.as_mut()
            && sink.write_fmt(args).is_err()
        {
            self.sink = None;
        }
    }

    pub fn flush(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            let _ = sink.flush();
        }
    }

    /// Opening banner: version, copyright and timestamp.
    pub fn banner(&mut self, program: &str) {
        let (date, time) = crate::options::local_date_time();
        self.out(format_args!(
            "heapscope {} (debugging allocator)\ncopyright (c) the heapscope authors\n\nprogram: {program}\nstarted: {date} {time}\n\n",
            crate::VERSION_STRING,
        ));
    }

    /// Reports option-parse warnings collected before the log was open.
    pub fn option_warnings(&mut self, warnings: &[String]) {
        for w in warnings {
            self.out(format_args!("WARNING: [OPTERR]: {w}\n"));
        }
        if !warnings.is_empty() {
            self.out(format_args!("\n"));
        }
    }

    fn resolve(&mut self, symbols: &dyn SymbolReader, addr: usize) -> Option<String> {
        self.names
            .entry(addr)
            .or_insert_with(|| {
                symbols.resolve(addr).map(|s| {
                    let name = s.name.unwrap_or_else(|| "?".to_string());
                    match (s.file, s.line) {
                        (Some(file), Some(line)) => format!("{name} at {file}:{line}"),
                        _ => name,
                    }
                })
            })
            .clone()
    }

    fn stack(&mut self, symbols: &dyn SymbolReader, frames: &[usize]) {
        for &addr in frames {
            match self.resolve(symbols, addr) {
                Some(name) => self.out(format_args!("        {addr:#018x} {name}\n")),
                None => self.out(format_args!("        {addr:#018x}\n")),
            }
        }
    }

    /// ALLOC line for a successful or failed allocation.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &mut self,
        symbols: &dyn SymbolReader,
        kind: OpKind,
        index: u64,
        size: usize,
        align: usize,
        caller: CallerView<'_>,
        frames: &[usize],
        result: Option<usize>,
    ) {
        if !self.log_allocs {
            return;
        }
        self.out(format_args!(
            "ALLOC: {} ({index}, {size} bytes, {align} align) {caller}\n",
            kind.name()
        ));
        self.stack(symbols, frames);
        match result {
            Some(addr) => self.out(format_args!("    returns {addr:#x}\n\n")),
            None => self.out(format_args!("    returns null\n\n")),
        }
    }

    /// REALLOC line.
    #[allow(clippy::too_many_arguments)]
    pub fn realloc(
        &mut self,
        symbols: &dyn SymbolReader,
        kind: OpKind,
        addr: usize,
        new_size: usize,
        align: usize,
        caller: CallerView<'_>,
        frames: &[usize],
        result: Option<usize>,
    ) {
        if !self.log_reallocs {
            return;
        }
        self.out(format_args!(
            "REALLOC: {} ({addr:#x}, {new_size} bytes, {align} align) {caller}\n",
            kind.name()
        ));
        self.stack(symbols, frames);
        match result {
            Some(a) => self.out(format_args!("    returns {a:#x}\n\n")),
            None => self.out(format_args!("    returns null\n\n")),
        }
    }

    /// FREE line, including the owning record of the block being freed.
    pub fn free(
        &mut self,
        symbols: &dyn SymbolReader,
        kind: OpKind,
        addr: usize,
        caller: CallerView<'_>,
        frames: &[usize],
        owner: Option<&BlockInfo>,
    ) {
        if !self.log_frees {
            return;
        }
        self.out(format_args!(
            "FREE: {} ({addr:#x}) {caller}\n",
            kind.name()
        ));
        self.stack(symbols, frames);
        if let Some(info) = owner {
            self.record_line(info);
        }
        self.out(format_args!("\n"));
    }

    /// MEMSET / MEMCPY / MEMCMP / MEMFIND lines.
    pub fn memset(&mut self, kind: OpKind, addr: usize, len: usize, byte: u8, caller: CallerView<'_>) {
        if self.log_memory {
            self.out(format_args!(
                "MEMSET: {} ({addr:#x}, {len} bytes, {byte:#04x} byte) {caller}\n\n",
                kind.name()
            ));
        }
    }

    pub fn memcpy(&mut self, kind: OpKind, dst: usize, src: usize, len: usize, caller: CallerView<'_>) {
        if self.log_memory {
            self.out(format_args!(
                "MEMCPY: {} ({dst:#x}, {src:#x}, {len} bytes) {caller}\n\n",
                kind.name()
            ));
        }
    }

    pub fn memcmp(&mut self, kind: OpKind, a: usize, b: usize, len: usize, caller: CallerView<'_>) {
        if self.log_memory {
            self.out(format_args!(
                "MEMCMP: {} ({a:#x}, {b:#x}, {len} bytes) {caller}\n\n",
                kind.name()
            ));
        }
    }

    pub fn memfind(
        &mut self,
        kind: OpKind,
        addr: usize,
        len: usize,
        pat_len: usize,
        caller: CallerView<'_>,
    ) {
        if self.log_memory {
            self.out(format_args!(
                "MEMFIND: {} ({addr:#x}, {len} bytes, {pat_len} byte pattern) {caller}\n\n",
                kind.name()
            ));
        }
    }

    /// A stop-point notice, written just before the debugger trap.
    pub fn stop(&mut self, what: &str, index: u64) {
        self.out(format_args!("STOP: {what} reached at index {index}\n\n"));
        self.flush();
    }

    /// A recoverable warning.
    pub fn warning(&mut self, kind: DiagKind, op: OpKind, message: &str) {
        self.out(format_args!(
            "WARNING: [{}]: {}: {message}\n\n",
            kind.code(),
            op.name()
        ));
    }

    /// A non-fatal error.
    pub fn error(&mut self, kind: DiagKind, op: OpKind, message: &str) {
        self.out(format_args!(
            "ERROR: [{}]: {}: {message}\n\n",
            kind.code(),
            op.name()
        ));
    }

    /// A fatal corruption report: hex window around the corrupt address,
    /// then the owning record's history. The engine aborts after this.
    pub fn corruption(
        &mut self,
        symbols: &dyn SymbolReader,
        kind: DiagKind,
        addr: usize,
        window: (usize, usize),
        owner: Option<&BlockInfo>,
    ) {
        self.out(format_args!(
            "ERROR: [{}]: memory corruption detected at {addr:#x}\n",
            kind.code()
        ));
        self.hex_window(window.0, window.1);
        if let Some(info) = owner {
            self.record_dump(symbols, info);
        }
        self.flush();
    }

    /// Prints `len` bytes from `addr` as hex rows. The range must be
    /// readable; the engine passes ranges inside known blocks.
    fn hex_window(&mut self, addr: usize, len: usize) {
        // SAFETY: the engine only requests windows inside readable blocks.
        let bytes = unsafe { raw::read_bytes(addr, len) };
        for (i, row) in bytes.chunks(16).enumerate() {
            let hex: Vec<String> = row.iter().map(|b| format!("{b:02X}")).collect();
            let ascii: String = row
                .iter()
                .map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { '.' })
                .collect();
            self.out(format_args!(
                "    {:#018x}  {:<47}  {ascii}\n",
                addr + i * 16,
                hex.join(" ")
            ));
        }
    }

    /// One-line record reference: `{kind:alloc_index:realloc_count}`.
    fn record_line(&mut self, info: &BlockInfo) {
        self.out(format_args!(
            "    block {:#x} ({} bytes) {{{}:{}:{}}} [{}|{}|{}|{}]\n",
            info.block,
            info.size,
            info.kind.name(),
            info.alloc_index,
            info.realloc_count,
            info.thread_id,
            info.func.as_deref().unwrap_or("-"),
            info.file.as_deref().unwrap_or("-"),
            info.line,
        ));
    }

    /// Full record history: reference line, type, then captured stack.
    pub fn record_dump(&mut self, symbols: &dyn SymbolReader, info: &BlockInfo) {
        self.record_line(info);
        if let Some(ty) = &info.type_name {
            self.out(format_args!(
                "        type {ty} ({} byte elements)\n",
                info.type_size
            ));
        }
        if info.freed {
            self.out(format_args!("        freed\n"));
        }
        let frames = info.stack.clone();
        self.stack(symbols, &frames);
    }

    /// Closing summary table of every numeric counter.
    pub fn summary(&mut self, stats: &Stats, heap_total: usize, page_size: usize) {
        self.out(format_args!("\nsummary:\n"));
        let rows: [(&str, u64); 18] = [
            ("system page size", page_size as u64),
            ("heap bytes acquired", heap_total as u64),
            ("event count", stats.event_count),
            ("allocation count", stats.alloc_count),
            ("reallocation count", stats.realloc_count),
            ("free count", stats.free_count),
            ("forced failures", stats.fail_count),
            ("bytes requested", stats.total_requested),
            ("largest block", stats.largest_block as u64),
            ("smallest block", stats.smallest_block as u64),
            ("byte fills", stats.fill_count),
            ("bytes filled", stats.fill_bytes),
            ("byte copies", stats.copy_count),
            ("bytes copied", stats.copy_bytes),
            ("byte compares", stats.compare_count),
            ("bytes compared", stats.compare_bytes),
            ("warnings", stats.warning_count),
            ("errors", stats.error_count),
        ];
        for (label, value) in rows {
            self.out(format_args!("    {label:<24} {value}\n"));
        }
        self.out(format_args!(
            "    {:<24} {}\n    {:<24} {}\n",
            "live bytes", stats.live_bytes, "peak live bytes", stats.peak_bytes
        ));
    }

    /// SHOWMAP section: every block in address order.
    pub fn show_map(&mut self, rows: &[(usize, usize, &'static str)]) {
        self.out(format_args!("\nmemory map:\n"));
        for (base, size, what) in rows {
            self.out(format_args!(
                "    {base:#018x} - {:#018x}  {size:>10} bytes  {what}\n",
                base + size
            ));
        }
    }

    /// SHOWFREE section.
    pub fn show_free(&mut self, blocks: &[(usize, usize)]) {
        self.out(format_args!("\nfree blocks:\n"));
        for (base, size) in blocks {
            self.out(format_args!("    {base:#018x}  {size} bytes\n"));
        }
    }

    /// SHOWFREED / SHOWUNFREED sections: a record dump per block.
    pub fn show_records(
        &mut self,
        symbols: &dyn SymbolReader,
        title: &str,
        infos: &[BlockInfo],
        total: usize,
    ) {
        self.out(format_args!("\n{title} ({} blocks, {total} bytes):\n", infos.len()));
        for info in infos {
            self.record_dump(symbols, info);
        }
    }

    /// SHOWSYMBOLS section: every distinct captured address with its
    /// resolution.
    pub fn show_symbols(&mut self, symbols: &dyn SymbolReader, addrs: &[usize]) {
        self.out(format_args!("\nsymbols:\n"));
        for &addr in addrs {
            match self.resolve(symbols, addr) {
                Some(name) => self.out(format_args!("    {addr:#018x}  {name}\n")),
                None => self.out(format_args!("    {addr:#018x}  ?\n")),
            }
        }
    }
}
