//! Leak checking over the text log.
//!
//! Re-plays the ALLOC / REALLOC / FREE lines of a heapscope log and reports
//! every allocation without a matching free, with its size and caller.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

/// One unfreed allocation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Leak {
    pub addr: u64,
    pub size: u64,
    /// Bracketed caller tuple from the log line.
    pub caller: String,
}

/// The leak report for one log file.
#[derive(Debug, Clone, Serialize, Default)]
pub struct LeakReport {
    pub alloc_count: u64,
    pub free_count: u64,
    pub leaked_bytes: u64,
    pub leaks: Vec<Leak>,
}

/// Parses a log file and computes the leak report.
pub fn check_file(path: &Path) -> std::io::Result<LeakReport> {
    Ok(check_text(&std::fs::read_to_string(path)?))
}

/// Parses log text and computes the leak report.
pub fn check_text(log: &str) -> LeakReport {
    let mut report = LeakReport::default();
    let mut live: HashMap<u64, (u64, String)> = HashMap::new();
    // Details of an ALLOC/REALLOC line waiting for its `returns` line.
    let mut pending: Option<(Option<u64>, u64, String)> = None;

    for line in log.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("ALLOC: ") {
            pending = parse_header(rest).map(|(size, caller)| (None, size, caller));
        } else if let Some(rest) = trimmed.strip_prefix("REALLOC: ") {
            pending = parse_realloc_header(rest);
        } else if let Some(rest) = trimmed.strip_prefix("FREE: ") {
            pending = None;
            if let Some(addr) = parse_paren_addr(rest) {
                if live.remove(&addr).is_some() {
                    report.free_count += 1;
                }
            }
        } else if let Some(rest) = trimmed.strip_prefix("returns ") {
            let Some((old, size, caller)) = pending.take() else {
                continue;
            };
            let returned = parse_number(rest.trim());
            if let Some(old_addr) = old {
                // A successful relocation frees the old block.
                match returned {
                    Some(new_addr) if new_addr != 0 => {
                        if live.remove(&old_addr).is_some() {
                            report.free_count += 1;
                        }
                        report.alloc_count += 1;
                        live.insert(new_addr, (size, caller));
                    }
                    _ => {}
                }
            } else if let Some(addr) = returned
                && addr != 0
            {
                report.alloc_count += 1;
                live.insert(addr, (size, caller));
            }
        }
    }

    let mut leaks: Vec<Leak> = live
        .into_iter()
        .map(|(addr, (size, caller))| Leak { addr, size, caller })
        .collect();
    leaks.sort_by_key(|l| l.addr);
    report.leaked_bytes = leaks.iter().map(|l| l.size).sum();
    report.leaks = leaks;
    report
}

/// Renders the report as the classic text table.
pub fn render(report: &LeakReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} allocations, {} freed, {} bytes leaked in {} blocks\n",
        report.alloc_count,
        report.free_count,
        report.leaked_bytes,
        report.leaks.len()
    ));
    for leak in &report.leaks {
        out.push_str(&format!(
            "    {:#018x}  {:>10} bytes  {}\n",
            leak.addr, leak.size, leak.caller
        ));
    }
    out
}

/// Parses `alloc (53, 16 bytes, 16 align) [tuple]` into size and tuple.
fn parse_header(rest: &str) -> Option<(u64, String)> {
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    let mut fields = rest[open + 1..close].split(',');
    let _index = fields.next()?;
    let size = parse_number(fields.next()?.trim().strip_suffix(" bytes")?)?;
    let caller = rest[close + 1..].trim().to_string();
    Some((size, caller))
}

/// Parses `resize (0xA, 32 bytes, 16 align) [tuple]`.
fn parse_realloc_header(rest: &str) -> Option<(Option<u64>, u64, String)> {
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    let mut fields = rest[open + 1..close].split(',');
    let addr = parse_number(fields.next()?.trim())?;
    let size = parse_number(fields.next()?.trim().strip_suffix(" bytes")?)?;
    let caller = rest[close + 1..].trim().to_string();
    Some((Some(addr), size, caller))
}

/// Parses the `(0xADDR)` of a FREE line.
fn parse_paren_addr(rest: &str) -> Option<u64> {
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    parse_number(rest[open + 1..close].trim())
}

fn parse_number(s: &str) -> Option<u64> {
    if s == "null" {
        return Some(0);
    }
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
heapscope 0.1.0 (debugging allocator)

ALLOC: alloc (1, 16 bytes, 16 align) [1|main|main.rs|10]
        0x0000000000001111 main
    returns 0x5000

ALLOC: alloc (2, 32 bytes, 16 align) [1|main|main.rs|11]
    returns 0x6000

FREE: free (0x6000) [1|main|main.rs|12]

ALLOC: alloc (3, 8 bytes, 16 align) [1|lib|lib.rs|5]
    returns null
";

    #[test]
    fn test_unfreed_blocks_are_reported() {
        let report = check_text(LOG);
        assert_eq!(report.alloc_count, 2);
        assert_eq!(report.free_count, 1);
        assert_eq!(report.leaks.len(), 1);
        assert_eq!(report.leaks[0].addr, 0x5000);
        assert_eq!(report.leaks[0].size, 16);
        assert_eq!(report.leaks[0].caller, "[1|main|main.rs|10]");
        assert_eq!(report.leaked_bytes, 16);
    }

    #[test]
    fn test_realloc_moves_ownership() {
        let log = "\
ALLOC: alloc (1, 16 bytes, 16 align) [1|main|main.rs|10]
    returns 0x5000

REALLOC: resize (0x5000, 64 bytes, 16 align) [1|main|main.rs|11]
    returns 0x7000
";
        let report = check_text(log);
        assert_eq!(report.alloc_count, 2);
        assert_eq!(report.free_count, 1);
        assert_eq!(report.leaks.len(), 1);
        assert_eq!(report.leaks[0].addr, 0x7000);
        assert_eq!(report.leaks[0].size, 64);
    }

    #[test]
    fn test_failed_realloc_keeps_old_block() {
        let log = "\
ALLOC: alloc (1, 16 bytes, 16 align) [1|main|main.rs|10]
    returns 0x5000

REALLOC: resize (0x5000, 64 bytes, 16 align) [1|main|main.rs|11]
    returns null
";
        let report = check_text(log);
        assert_eq!(report.leaks.len(), 1);
        assert_eq!(report.leaks[0].addr, 0x5000);
    }

    #[test]
    fn test_render_lists_each_leak() {
        let report = check_text(LOG);
        let text = render(&report);
        assert!(text.contains("16 bytes leaked in 1 blocks"));
        assert!(text.contains("0x0000000000005000"));
    }

    #[test]
    fn test_empty_log() {
        let report = check_text("");
        assert_eq!(report.alloc_count, 0);
        assert!(report.leaks.is_empty());
    }
}
