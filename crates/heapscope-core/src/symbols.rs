//! Symbol and debug-line resolution.
//!
//! The engine treats the symbol reader as an external collaborator behind a
//! trait: given a return address, produce the enclosing function name and,
//! when debug information is read, the source file and line.

/// Resolution result for one address.
#[derive(Debug, Clone, Default)]
pub struct SymbolInfo {
    pub name: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Maps return addresses to symbolic information.
pub trait SymbolReader {
    fn resolve(&self, addr: usize) -> Option<SymbolInfo>;
}

/// Resolution through the `backtrace` crate's symbol tables.
#[derive(Debug)]
pub struct BacktraceSymbols {
    /// Whether to surface debug line information as well as names.
    use_debug: bool,
}

impl BacktraceSymbols {
    pub fn new(use_debug: bool) -> Self {
        Self { use_debug }
    }
}

impl SymbolReader for BacktraceSymbols {
    fn resolve(&self, addr: usize) -> Option<SymbolInfo> {
        let mut out: Option<SymbolInfo> = None;
        backtrace::resolve(addr as *mut core::ffi::c_void, |symbol| {
            if out.is_some() {
                return;
            }
            let mut info = SymbolInfo {
                name: symbol.name().map(|n| n.to_string()),
                ..SymbolInfo::default()
            };
            if self.use_debug {
                info.file = symbol
                    .filename()
                    .map(|p| p.to_string_lossy().into_owned());
                info.line = symbol.lineno();
            }
            out = Some(info);
        });
        out.filter(|i| i.name.is_some() || i.file.is_some())
    }
}

/// No symbol tables available; addresses stay numeric.
#[derive(Debug, Default)]
pub struct NullSymbols;

impl SymbolReader for NullSymbols {
    fn resolve(&self, _addr: usize) -> Option<SymbolInfo> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_reader_resolves_nothing() {
        assert!(NullSymbols.resolve(0x1234).is_none());
    }

    #[test]
    fn test_backtrace_reader_handles_garbage_addresses() {
        let reader = BacktraceSymbols::new(true);
        // A junk address must not panic; it may or may not resolve.
        let _ = reader.resolve(1);
    }
}
