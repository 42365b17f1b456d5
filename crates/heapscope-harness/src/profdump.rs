//! Profile stream decoding.
//!
//! Reads the binary profile stream written by the engine (MPTL magic,
//! word-size marker, LEB128 payloads) back into a structured report.

use std::path::Path;

use serde::Serialize;

use heapscope_core::STREAM_MAGIC;
use heapscope_core::leb128::read_uleb128;

use crate::ReplayError;

/// Counters over the four size bins.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct Bins {
    pub alloc_count: [u64; 4],
    pub alloc_total: [u64; 4],
    pub free_count: [u64; 4],
    pub free_total: [u64; 4],
}

/// Per-call-site counters.
#[derive(Debug, Clone, Serialize)]
pub struct SiteProfile {
    pub addr: u64,
    pub name: Option<String>,
    pub bins: Bins,
}

/// The decoded profile stream.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileReport {
    pub word_size: u8,
    pub version: u64,
    pub small_bound: u64,
    pub medium_bound: u64,
    pub large_bound: u64,
    pub totals: Bins,
    pub sites: Vec<SiteProfile>,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ReplayError> {
        if self.pos + n > self.bytes.len() {
            return Err(ReplayError::Truncated(self.pos));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn uleb(&mut self) -> Result<u64, ReplayError> {
        let (value, used) =
            read_uleb128(&self.bytes[self.pos..]).ok_or(ReplayError::Truncated(self.pos))?;
        self.pos += used;
        Ok(value)
    }

    fn bins(&mut self) -> Result<Bins, ReplayError> {
        let mut bins = Bins::default();
        for group in [
            &mut bins.alloc_count,
            &mut bins.alloc_total,
            &mut bins.free_count,
            &mut bins.free_total,
        ] {
            for slot in group.iter_mut() {
                *slot = self.uleb()?;
            }
        }
        Ok(bins)
    }
}

/// Decodes a profile stream from a file.
pub fn read_file(path: &Path) -> Result<ProfileReport, ReplayError> {
    decode(&std::fs::read(path)?)
}

/// Decodes a profile stream from bytes.
pub fn decode(bytes: &[u8]) -> Result<ProfileReport, ReplayError> {
    let mut c = Cursor { bytes, pos: 0 };
    if c.take(4)? != STREAM_MAGIC {
        return Err(ReplayError::BadMagic);
    }
    let word_size = c.take(1)?[0];
    let version = c.uleb()?;
    let small_bound = c.uleb()?;
    let medium_bound = c.uleb()?;
    let large_bound = c.uleb()?;
    let totals = c.bins()?;

    let site_count = c.uleb()? as usize;
    let mut raw_sites = Vec::with_capacity(site_count);
    for _ in 0..site_count {
        let addr = c.uleb()?;
        let bins = c.bins()?;
        let name_index = c.uleb()?;
        raw_sites.push((addr, bins, name_index));
    }

    let name_count = c.uleb()? as usize;
    let mut names = Vec::with_capacity(name_count);
    for _ in 0..name_count {
        let len = c.uleb()? as usize;
        let raw = c.take(len)?;
        names.push(String::from_utf8_lossy(raw).into_owned());
    }
    if c.take(4)? != STREAM_MAGIC {
        return Err(ReplayError::BadMagic);
    }

    let sites = raw_sites
        .into_iter()
        .map(|(addr, bins, name_index)| SiteProfile {
            addr,
            name: (name_index > 0)
                .then(|| names.get(name_index as usize - 1).cloned())
                .flatten(),
            bins,
        })
        .collect();

    Ok(ProfileReport {
        word_size,
        version,
        small_bound,
        medium_bound,
        large_bound,
        totals,
        sites,
    })
}

/// Renders the report as a text table, busiest call sites first.
pub fn render(report: &ProfileReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "profile v{} ({}-byte words), bins ≤{} / ≤{} / ≤{} / larger\n\n",
        report.version, report.word_size, report.small_bound, report.medium_bound,
        report.large_bound
    ));
    let total_allocs: u64 = report.totals.alloc_count.iter().sum();
    let total_bytes: u64 = report.totals.alloc_total.iter().sum();
    out.push_str(&format!(
        "{total_allocs} allocations, {total_bytes} bytes requested\n"
    ));
    out.push_str(&format!(
        "bins: {:?} allocations, {:?} bytes\n\n",
        report.totals.alloc_count, report.totals.alloc_total
    ));

    let mut sites: Vec<&SiteProfile> = report.sites.iter().collect();
    sites.sort_by_key(|s| std::cmp::Reverse(s.bins.alloc_total.iter().sum::<u64>()));
    for site in sites {
        let allocs: u64 = site.bins.alloc_count.iter().sum();
        let bytes: u64 = site.bins.alloc_total.iter().sum();
        let name = site.name.as_deref().unwrap_or("?");
        out.push_str(&format!(
            "    {:#018x}  {allocs:>8} allocs  {bytes:>12} bytes  {name}\n",
            site.addr
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapscope_core::profile::Profiler;

    fn sample_stream() -> Vec<u8> {
        let mut p = Profiler::new(true, "stderr".to_string(), 32, 256, 2048, 0);
        p.record_alloc(0x1111, 16);
        p.record_alloc(0x1111, 300);
        p.record_alloc(0x2222, 5000);
        p.record_free(0x1111, 16);
        p.encode(|site| (site == 0x1111).then(|| "hot_path".to_string()))
    }

    #[test]
    fn test_round_trip_via_engine_encoder() {
        let report = decode(&sample_stream()).unwrap();
        assert_eq!(report.small_bound, 32);
        assert_eq!(report.large_bound, 2048);
        assert_eq!(report.sites.len(), 2);
        let hot = report.sites.iter().find(|s| s.addr == 0x1111).unwrap();
        assert_eq!(hot.name.as_deref(), Some("hot_path"));
        assert_eq!(hot.bins.alloc_count[0], 1);
        assert_eq!(hot.bins.alloc_count[3], 0);
        assert_eq!(hot.bins.free_count[0], 1);
        let big = report.sites.iter().find(|s| s.addr == 0x2222).unwrap();
        assert_eq!(big.bins.alloc_count[3], 1);
        assert!(big.name.is_none());
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut bytes = sample_stream();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(ReplayError::BadMagic)));
    }

    #[test]
    fn test_truncation_is_detected() {
        let bytes = sample_stream();
        let cut = &bytes[..bytes.len() / 2];
        assert!(matches!(
            decode(cut),
            Err(ReplayError::Truncated(_) | ReplayError::BadMagic)
        ));
    }

    #[test]
    fn test_render_orders_by_bytes() {
        let report = decode(&sample_stream()).unwrap();
        let text = render(&report);
        let big = text.find("0x0000000000002222").unwrap();
        let hot = text.find("0x0000000000001111").unwrap();
        assert!(big < hot, "heaviest site should print first");
        assert!(text.contains("hot_path"));
    }
}
