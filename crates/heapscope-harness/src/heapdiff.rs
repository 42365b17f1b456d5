//! Heap difference reports.
//!
//! Compares the unfreed sets of two heapscope logs, usually a baseline run
//! and a changed run of the same program, and reports the allocations that
//! appeared, disappeared, or changed in volume per call site. Block
//! addresses differ run to run, so call sites are compared by their
//! bracketed caller tuple.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::leaks::{self, LeakReport};

/// Unfreed volume attributed to one call site.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SiteTotals {
    pub blocks: u64,
    pub bytes: u64,
}

/// One call site whose unfreed volume differs between the runs.
#[derive(Debug, Clone, Serialize)]
pub struct SiteDelta {
    pub caller: String,
    pub before: SiteTotals,
    pub after: SiteTotals,
}

/// The full difference report.
#[derive(Debug, Clone, Serialize, Default)]
pub struct DiffReport {
    /// Call sites leaking in the second run but not the first.
    pub appeared: Vec<SiteDelta>,
    /// Call sites leaking in the first run but not the second.
    pub disappeared: Vec<SiteDelta>,
    /// Call sites leaking in both runs with different volumes.
    pub changed: Vec<SiteDelta>,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Diffs two log files.
pub fn diff_files(before: &Path, after: &Path) -> std::io::Result<DiffReport> {
    Ok(diff(
        &leaks::check_file(before)?,
        &leaks::check_file(after)?,
    ))
}

/// Diffs two leak reports by call site.
pub fn diff(before: &LeakReport, after: &LeakReport) -> DiffReport {
    let old = totals_by_site(before);
    let new = totals_by_site(after);

    let mut report = DiffReport {
        bytes_before: before.leaked_bytes,
        bytes_after: after.leaked_bytes,
        ..DiffReport::default()
    };

    for (caller, &after_totals) in &new {
        match old.get(caller) {
            None => report.appeared.push(SiteDelta {
                caller: caller.clone(),
                before: SiteTotals::default(),
                after: after_totals,
            }),
            Some(&before_totals) if before_totals != after_totals => {
                report.changed.push(SiteDelta {
                    caller: caller.clone(),
                    before: before_totals,
                    after: after_totals,
                });
            }
            Some(_) => {}
        }
    }
    for (caller, &before_totals) in &old {
        if !new.contains_key(caller) {
            report.disappeared.push(SiteDelta {
                caller: caller.clone(),
                before: before_totals,
                after: SiteTotals::default(),
            });
        }
    }
    report
}

fn totals_by_site(report: &LeakReport) -> BTreeMap<String, SiteTotals> {
    let mut sites: BTreeMap<String, SiteTotals> = BTreeMap::new();
    for leak in &report.leaks {
        let entry = sites.entry(leak.caller.clone()).or_default();
        entry.blocks += 1;
        entry.bytes += leak.size;
    }
    sites
}

/// Renders the report as text.
pub fn render(report: &DiffReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "unfreed bytes: {} before, {} after\n",
        report.bytes_before, report.bytes_after
    ));
    let sections: [(&str, &[SiteDelta]); 3] = [
        ("appeared", &report.appeared),
        ("disappeared", &report.disappeared),
        ("changed", &report.changed),
    ];
    for (title, deltas) in sections {
        if deltas.is_empty() {
            continue;
        }
        out.push_str(&format!("\n{title}:\n"));
        for delta in deltas {
            out.push_str(&format!(
                "    {}  {} blocks / {} bytes -> {} blocks / {} bytes\n",
                delta.caller,
                delta.before.blocks,
                delta.before.bytes,
                delta.after.blocks,
                delta.after.bytes
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaks::check_text;

    const BASE: &str = "\
ALLOC: alloc (1, 16 bytes, 16 align) [1|a|a.rs|1]
    returns 0x1000

ALLOC: alloc (2, 32 bytes, 16 align) [1|b|b.rs|2]
    returns 0x2000
";

    const NEXT: &str = "\
ALLOC: alloc (1, 16 bytes, 16 align) [1|a|a.rs|1]
    returns 0x5000

ALLOC: alloc (2, 64 bytes, 16 align) [1|b|b.rs|2]
    returns 0x6000

ALLOC: alloc (3, 8 bytes, 16 align) [1|c|c.rs|3]
    returns 0x7000
";

    #[test]
    fn test_diff_classifies_sites() {
        let report = diff(&check_text(BASE), &check_text(NEXT));
        assert_eq!(report.appeared.len(), 1);
        assert_eq!(report.appeared[0].caller, "[1|c|c.rs|3]");
        assert_eq!(report.changed.len(), 1);
        assert_eq!(report.changed[0].before.bytes, 32);
        assert_eq!(report.changed[0].after.bytes, 64);
        assert!(report.disappeared.is_empty());
        assert_eq!(report.bytes_before, 48);
        assert_eq!(report.bytes_after, 88);
    }

    #[test]
    fn test_identical_runs_report_nothing() {
        let report = diff(&check_text(BASE), &check_text(BASE));
        assert!(report.appeared.is_empty());
        assert!(report.disappeared.is_empty());
        assert!(report.changed.is_empty());
    }

    #[test]
    fn test_freed_site_disappears() {
        let report = diff(&check_text(NEXT), &check_text(BASE));
        assert_eq!(report.disappeared.len(), 1);
        assert_eq!(report.disappeared[0].caller, "[1|c|c.rs|3]");
    }

    #[test]
    fn test_render_sections() {
        let report = diff(&check_text(BASE), &check_text(NEXT));
        let text = render(&report);
        assert!(text.contains("unfreed bytes: 48 before, 88 after"));
        assert!(text.contains("appeared:"));
        assert!(text.contains("changed:"));
        assert!(!text.contains("disappeared:"));
    }
}
