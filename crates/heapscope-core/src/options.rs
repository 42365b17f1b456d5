//! Runtime option parsing.
//!
//! A single string, read once at initialisation from the `HEAPSCOPE_OPTIONS`
//! environment variable, controls every runtime policy. The string is a
//! sequence of `KEY=VALUE` tokens separated by whitespace; quoted values may
//! contain spaces, duplicate keys take the last value, and unrecognised keys
//! produce warnings without aborting.

use std::fmt::Write as _;

/// Environment variable holding the options string.
pub const OPTIONS_ENV: &str = "HEAPSCOPE_OPTIONS";

/// Placement edge for whole-page allocation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePlacement {
    /// User bytes at the lowest aligned offset of the page range.
    Lower,
    /// User bytes at the highest aligned offset of the page range.
    Upper,
}

/// Parsed runtime options with their defaults.
#[derive(Debug, Clone)]
pub struct Options {
    /// Fill pattern for freshly allocated bytes.
    pub alloc_byte: u8,
    /// Fill pattern for free and freed bytes.
    pub free_byte: u8,
    /// Fill pattern for guard regions.
    pub oflow_byte: u8,
    /// Allocation index to stop at (0 disables).
    pub alloc_stop: u64,
    /// Reallocation index to stop at (0 disables).
    pub realloc_stop: u64,
    /// Allocation index whose free stops (0 disables).
    pub free_stop: u64,
    /// Guard size in bytes on each side of a block.
    pub oflow_size: usize,
    /// Default alignment for untyped allocations (0 selects the natural one).
    pub def_align: usize,
    /// Total byte cap above which allocations fail (0 disables).
    pub limit: usize,
    /// One forced failure every `fail_freq` allocation events (0 disables).
    pub fail_freq: u64,
    /// Seed for the failure schedule.
    pub fail_seed: u64,
    /// Integrity sweeps run for events in `[check_lo, check_hi]`
    /// (`u64::MAX` leaves the range open-ended)...
    pub check_lo: u64,
    pub check_hi: u64,
    /// ...whenever the event counter is a multiple of this.
    pub check_freq: u64,
    /// Escalate zero-size/null argument warnings to errors per entry family.
    pub check_allocs: bool,
    pub check_reallocs: bool,
    pub check_frees: bool,
    /// Same escalation for the byte-level set/copy/compare/search entries.
    pub check_memory: bool,
    /// Retain up to this many freed blocks for use-after-free detection.
    pub nofree: usize,
    /// Use OS watch traps instead of guard patterns when supported.
    pub oflow_watch: bool,
    /// Whole-page placement mode.
    pub page_alloc: Option<PagePlacement>,
    /// Do not wipe block contents on free or resize.
    pub preserve: bool,
    /// Save and restore interrupt/terminate handlers per operation.
    pub safe_signals: bool,
    /// Leave metadata pages read-write between operations.
    pub no_protect: bool,
    /// Downgrade bounds-overflow errors on byte operations to warnings.
    pub allow_oflow: bool,
    /// Log-level toggles.
    pub log_allocs: bool,
    pub log_reallocs: bool,
    pub log_frees: bool,
    pub log_memory: bool,
    /// Termination report toggles.
    pub show_map: bool,
    pub show_symbols: bool,
    pub show_free: bool,
    pub show_freed: bool,
    pub show_unfreed: bool,
    /// Profiling.
    pub prof: bool,
    pub prof_file: String,
    /// Profile auto-save period in allocation events (0 disables).
    pub auto_save: u64,
    pub small_bound: usize,
    pub medium_bound: usize,
    pub large_bound: usize,
    /// Tracing.
    pub trace: bool,
    pub trace_file: String,
    /// Output routing.
    pub log_file: String,
    pub log_dir: Option<String>,
    pub prog_file: Option<String>,
    /// Abort at exit if this many bytes are still live (0 disables).
    pub unfreed_abort: usize,
    /// Read debug line information when resolving symbols.
    pub use_debug: bool,
    /// Obtain memory with anonymous mappings rather than the break pointer.
    pub use_mmap: bool,
    /// Byte bias for the alloca scope tracker's frame comparison.
    pub alloca_bias: usize,
    /// Warnings produced while parsing, reported once the log is open.
    pub warnings: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            alloc_byte: 0xFF,
            free_byte: 0x55,
            oflow_byte: 0xAA,
            alloc_stop: 0,
            realloc_stop: 0,
            free_stop: 0,
            oflow_size: 0,
            def_align: 0,
            limit: 0,
            fail_freq: 0,
            fail_seed: 0,
            check_lo: 1,
            check_hi: u64::MAX,
            check_freq: 1,
            check_allocs: false,
            check_reallocs: false,
            check_frees: false,
            check_memory: false,
            nofree: 0,
            oflow_watch: false,
            page_alloc: None,
            preserve: false,
            safe_signals: false,
            no_protect: false,
            allow_oflow: false,
            log_allocs: false,
            log_reallocs: false,
            log_frees: false,
            log_memory: false,
            show_map: false,
            show_symbols: false,
            show_free: false,
            show_freed: false,
            show_unfreed: false,
            prof: false,
            prof_file: "heapscope.prof".to_string(),
            auto_save: 0,
            small_bound: 32,
            medium_bound: 256,
            large_bound: 2048,
            trace: false,
            trace_file: "heapscope.trace".to_string(),
            log_file: "heapscope.log".to_string(),
            log_dir: None,
            prog_file: None,
            unfreed_abort: 0,
            use_debug: false,
            use_mmap: true,
            alloca_bias: 256,
            warnings: Vec::new(),
        }
    }
}

impl Options {
    /// Parses the options string from the environment, falling back to
    /// defaults when unset.
    pub fn from_env() -> Self {
        match std::env::var(OPTIONS_ENV) {
            Ok(s) => Self::parse(&s),
            Err(_) => Self::default(),
        }
    }

    /// Parses an options string. Never fails: bad tokens become warnings.
    pub fn parse(input: &str) -> Self {
        let mut opts = Self::default();
        for token in tokenize(input) {
            opts.apply(&token);
        }
        if opts.small_bound >= opts.medium_bound || opts.medium_bound >= opts.large_bound {
            opts.warnings.push(format!(
                "profile boundaries must increase (small {} / medium {} / large {}); using defaults",
                opts.small_bound, opts.medium_bound, opts.large_bound
            ));
            opts.small_bound = 32;
            opts.medium_bound = 256;
            opts.large_bound = 2048;
        }
        opts
    }

    /// Whether the event counter value falls inside the sweep range.
    pub fn check_range_contains(&self, event: u64) -> bool {
        event >= self.check_lo && event <= self.check_hi
    }

    fn apply(&mut self, token: &str) {
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (token, None),
        };
        match key {
            "ALLOCBYTE" => self.set_byte(key, value, |o, v| o.alloc_byte = v),
            "FREEBYTE" => self.set_byte(key, value, |o, v| o.free_byte = v),
            "OFLOWBYTE" => self.set_byte(key, value, |o, v| o.oflow_byte = v),
            "ALLOCSTOP" => self.set_u64(key, value, |o, v| o.alloc_stop = v),
            "REALLOCSTOP" => self.set_u64(key, value, |o, v| o.realloc_stop = v),
            "FREESTOP" => self.set_u64(key, value, |o, v| o.free_stop = v),
            "OFLOWSIZE" => self.set_usize(key, value, |o, v| o.oflow_size = v),
            "DEFALIGN" => match value.and_then(parse_number) {
                Some(v) if v > 0 && (v as usize).is_power_of_two() => {
                    self.def_align = v as usize;
                }
                _ => self.bad_value(key, value),
            },
            "LIMIT" => self.set_usize(key, value, |o, v| o.limit = v),
            "FAILFREQ" => self.set_u64(key, value, |o, v| o.fail_freq = v),
            "FAILSEED" => self.set_u64(key, value, |o, v| o.fail_seed = v),
            "CHECK" => match value.map(parse_check_range) {
                Some(Some((lo, hi, freq))) => {
                    self.check_lo = lo;
                    self.check_hi = hi;
                    self.check_freq = freq.max(1);
                }
                _ => self.bad_value(key, value),
            },
            // Argument checking only; the CHECK sweep range is a separate
            // option and stays whatever the user set it to.
            "CHECKALL" => {
                self.check_allocs = true;
                self.check_reallocs = true;
                self.check_frees = true;
                self.check_memory = true;
            }
            "CHECKALLOCS" => self.check_allocs = true,
            "CHECKREALLOCS" => self.check_reallocs = true,
            "CHECKFREES" => self.check_frees = true,
            "CHECKMEMORY" => self.check_memory = true,
            "NOFREE" => match value {
                None => self.nofree = usize::MAX,
                Some(_) => self.set_usize(key, value, |o, v| o.nofree = v),
            },
            "OFLOWWATCH" => self.oflow_watch = true,
            "PAGEALLOC" => match value {
                Some("LOWER") => self.page_alloc = Some(PagePlacement::Lower),
                Some("UPPER") => self.page_alloc = Some(PagePlacement::Upper),
                _ => self.bad_value(key, value),
            },
            "PRESERVE" => self.preserve = true,
            "SAFESIGNALS" => self.safe_signals = true,
            "NOPROTECT" => self.no_protect = true,
            "ALLOWOFLOW" => self.allow_oflow = true,
            "LOGALL" => {
                self.log_allocs = true;
                self.log_reallocs = true;
                self.log_frees = true;
                self.log_memory = true;
            }
            "LOGALLOCS" => self.log_allocs = true,
            "LOGREALLOCS" => self.log_reallocs = true,
            "LOGFREES" => self.log_frees = true,
            "LOGMEMORY" => self.log_memory = true,
            "SHOWALL" => {
                self.show_map = true;
                self.show_symbols = true;
                self.show_free = true;
                self.show_freed = true;
                self.show_unfreed = true;
            }
            "SHOWMAP" => self.show_map = true,
            "SHOWSYMBOLS" => self.show_symbols = true,
            "SHOWFREE" => self.show_free = true,
            "SHOWFREED" => self.show_freed = true,
            "SHOWUNFREED" => self.show_unfreed = true,
            "PROF" => self.prof = true,
            "PROFFILE" => self.set_string(key, value, |o, v| o.prof_file = v),
            "AUTOSAVE" => self.set_u64(key, value, |o, v| o.auto_save = v),
            "SMALLBOUND" => self.set_usize(key, value, |o, v| o.small_bound = v),
            "MEDIUMBOUND" => self.set_usize(key, value, |o, v| o.medium_bound = v),
            "LARGEBOUND" => self.set_usize(key, value, |o, v| o.large_bound = v),
            "TRACE" => self.trace = true,
            "TRACEFILE" => self.set_string(key, value, |o, v| o.trace_file = v),
            "LOGFILE" => self.set_string(key, value, |o, v| o.log_file = v),
            "LOGDIR" => self.set_string(key, value, |o, v| o.log_dir = Some(v)),
            "PROGFILE" => self.set_string(key, value, |o, v| o.prog_file = Some(v)),
            "UNFREEDABORT" => self.set_usize(key, value, |o, v| o.unfreed_abort = v),
            "USEDEBUG" => self.use_debug = true,
            "USEMMAP" => self.use_mmap = true,
            "USEBRK" => self.use_mmap = false,
            "ALLOCABIAS" => self.set_usize(key, value, |o, v| o.alloca_bias = v),
            _ => self
                .warnings
                .push(format!("unrecognised option `{key}` ignored")),
        }
    }

    fn set_byte(&mut self, key: &str, value: Option<&str>, set: fn(&mut Self, u8)) {
        match value.and_then(parse_number) {
            Some(v) if v <= 0xFF => set(self, v as u8),
            _ => self.bad_value(key, value),
        }
    }

    fn set_u64(&mut self, key: &str, value: Option<&str>, set: fn(&mut Self, u64)) {
        match value.and_then(parse_number) {
            Some(v) => set(self, v),
            None => self.bad_value(key, value),
        }
    }

    fn set_usize(&mut self, key: &str, value: Option<&str>, set: fn(&mut Self, usize)) {
        match value.and_then(parse_number) {
            Some(v) => set(self, v as usize),
            None => self.bad_value(key, value),
        }
    }

    fn set_string(&mut self, key: &str, value: Option<&str>, set: fn(&mut Self, String)) {
        match value {
            Some(v) if !v.is_empty() => set(self, v.to_string()),
            _ => self.bad_value(key, value),
        }
    }

    fn bad_value(&mut self, key: &str, value: Option<&str>) {
        let mut msg = format!("invalid value for option `{key}`");
        if let Some(v) = value {
            let _ = write!(msg, ": `{v}`");
        }
        self.warnings.push(msg);
    }
}

/// Splits the options string into tokens, honouring double quotes around
/// whole tokens or values.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Parses decimal, `0x` hexadecimal, `0b` binary or `0` octal numbers.
fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

/// Parses a `lo[-hi][/freq]` event range. An omitted upper bound leaves
/// the range open-ended; `CHECK=0` disables sweeps (events start at 1).
fn parse_check_range(s: &str) -> Option<(u64, u64, u64)> {
    let (range, freq) = match s.split_once('/') {
        Some((r, f)) => (r, parse_number(f)?),
        None => (s, 1),
    };
    match range.split_once('-') {
        Some((lo, "")) => Some((parse_number(lo)?, u64::MAX, freq)),
        Some(("", hi)) => Some((1, parse_number(hi)?, freq)),
        Some((lo, hi)) => {
            let (lo, hi) = (parse_number(lo)?, parse_number(hi)?);
            (lo <= hi).then_some((lo, hi, freq))
        }
        None => {
            let v = parse_number(range)?;
            Some((v, v, freq))
        }
    }
}

/// Expands `%d` (date), `%t` (time), `%n` (pid), `%p` (program name) and
/// `%f` (program path with separators replaced by underscores) in an output
/// filename.
pub fn expand_filename(template: &str, program: &str) -> String {
    let (date, time) = local_date_time();
    let name = program.rsplit('/').next().unwrap_or(program);
    let flat = program.replace('/', "_");
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('d') => out.push_str(&date),
            Some('t') => out.push_str(&time),
            Some('n') => {
                let _ = write!(out, "{}", std::process::id());
            }
            Some('p') => out.push_str(name),
            Some('f') => out.push_str(&flat),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Local date as `YYYYMMDD` and time as `HHMMSS`.
pub(crate) fn local_date_time() -> (String, String) {
    // SAFETY: time(2) and localtime_r(3) with stack-owned out-parameters.
    unsafe {
        let mut now: libc::time_t = 0;
        libc::time(&raw mut now);
        let mut tm: libc::tm = core::mem::zeroed();
        if libc::localtime_r(&now, &raw mut tm).is_null() {
            return ("00000000".to_string(), "000000".to_string());
        }
        (
            format!("{:04}{:02}{:02}", tm.tm_year + 1900, tm.tm_mon + 1, tm.tm_mday),
            format!("{:02}{:02}{:02}", tm.tm_hour, tm.tm_min, tm.tm_sec),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_patterns() {
        let o = Options::default();
        assert_eq!(o.alloc_byte, 0xFF);
        assert_eq!(o.free_byte, 0x55);
        assert_eq!(o.oflow_byte, 0xAA);
        assert_eq!(o.small_bound, 32);
        assert_eq!(o.medium_bound, 256);
        assert_eq!(o.large_bound, 2048);
        assert!(o.use_mmap);
    }

    #[test]
    fn test_parse_basic_tokens() {
        let o = Options::parse("OFLOWSIZE=8 LOGALL NOFREE=16 PAGEALLOC=UPPER");
        assert_eq!(o.oflow_size, 8);
        assert!(o.log_allocs && o.log_frees && o.log_memory);
        assert_eq!(o.nofree, 16);
        assert_eq!(o.page_alloc, Some(PagePlacement::Upper));
        assert!(o.warnings.is_empty());
    }

    #[test]
    fn test_duplicate_keys_take_last_value() {
        let o = Options::parse("ALLOCBYTE=0x11 ALLOCBYTE=0x22");
        assert_eq!(o.alloc_byte, 0x22);
    }

    #[test]
    fn test_quoted_values_keep_spaces() {
        let o = Options::parse("LOGFILE=\"my logs/run.log\" PROF");
        assert_eq!(o.log_file, "my logs/run.log");
        assert!(o.prof);
    }

    #[test]
    fn test_unknown_key_warns_but_does_not_abort() {
        let o = Options::parse("BOGUS=1 FREEBYTE=0x66");
        assert_eq!(o.free_byte, 0x66);
        assert_eq!(o.warnings.len(), 1);
        assert!(o.warnings[0].contains("BOGUS"));
    }

    #[test]
    fn test_invalid_alignment_is_rejected() {
        let o = Options::parse("DEFALIGN=12");
        assert_eq!(o.def_align, 0);
        assert_eq!(o.warnings.len(), 1);
    }

    #[test]
    fn test_check_range_forms() {
        let o = Options::parse("CHECK=100-200/8");
        assert_eq!((o.check_lo, o.check_hi, o.check_freq), (100, 200, 8));
        let o = Options::parse("CHECK=50");
        assert_eq!((o.check_lo, o.check_hi, o.check_freq), (50, 50, 1));
        let o = Options::parse("CHECK=10-");
        assert_eq!((o.check_lo, o.check_hi), (10, u64::MAX));
        assert!(o.check_range_contains(1_000_000));
        assert!(!o.check_range_contains(9));
        let o = Options::parse("CHECK=0");
        assert!(!o.check_range_contains(1));
    }

    #[test]
    fn test_checkall_sets_argument_flags_only() {
        let o = Options::parse("CHECK=100-200/8 CHECKALL");
        assert!(o.check_allocs && o.check_reallocs && o.check_frees && o.check_memory);
        // The sweep range set alongside it survives.
        assert_eq!((o.check_lo, o.check_hi, o.check_freq), (100, 200, 8));
    }

    #[test]
    fn test_checkmemory_is_independent() {
        let o = Options::parse("CHECKMEMORY");
        assert!(o.check_memory);
        assert!(!o.check_allocs && !o.check_reallocs && !o.check_frees);
    }

    #[test]
    fn test_number_bases() {
        assert_eq!(parse_number("0x10"), Some(16));
        assert_eq!(parse_number("010"), Some(8));
        assert_eq!(parse_number("0b101"), Some(5));
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("x"), None);
    }

    #[test]
    fn test_degenerate_profile_bounds_reset() {
        let o = Options::parse("SMALLBOUND=512 MEDIUMBOUND=256");
        assert_eq!(o.small_bound, 32);
        assert_eq!(o.medium_bound, 256);
        assert!(!o.warnings.is_empty());
    }

    #[test]
    fn test_expand_filename_substitutions() {
        let out = expand_filename("%p.%n.log", "/usr/bin/target");
        assert!(out.starts_with("target."));
        assert!(out.ends_with(".log"));
        let flat = expand_filename("%f", "/a/b/c");
        assert_eq!(flat, "_a_b_c");
        assert_eq!(expand_filename("plain.log", "x"), "plain.log");
    }
}
