//! Trace stream replay.
//!
//! Reads the binary trace stream (`A` allocate, `F` free, `H` heap
//! reservation, `I` internal block events) and replays it to reconstruct
//! allocation lifetimes and peak memory usage.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use heapscope_core::STREAM_MAGIC;
use heapscope_core::leb128::read_uleb128;

use crate::ReplayError;

/// One decoded trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Event {
    Alloc { index: u64, addr: u64, size: u64 },
    Free { index: u64 },
    Heap { addr: u64, size: u64 },
    Internal { addr: u64, size: u64 },
}

/// Replay statistics over a whole stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceReport {
    pub word_size: u8,
    pub version: u64,
    pub alloc_count: u64,
    pub free_count: u64,
    pub heap_reserved: u64,
    pub internal_reserved: u64,
    pub peak_live_bytes: u64,
    pub leaked_blocks: u64,
    pub leaked_bytes: u64,
    pub events: Vec<Event>,
}

/// Decodes and replays a trace stream from a file.
pub fn read_file(path: &Path) -> Result<TraceReport, ReplayError> {
    decode(&std::fs::read(path)?)
}

/// Decodes and replays a trace stream from bytes.
pub fn decode(bytes: &[u8]) -> Result<TraceReport, ReplayError> {
    if bytes.len() < 9 || bytes[..4] != STREAM_MAGIC {
        return Err(ReplayError::BadMagic);
    }
    let mut report = TraceReport {
        word_size: bytes[4],
        ..TraceReport::default()
    };
    let mut pos = 5;
    let mut uleb = |pos: &mut usize| -> Result<u64, ReplayError> {
        let (value, used) = read_uleb128(&bytes[*pos..]).ok_or(ReplayError::Truncated(*pos))?;
        *pos += used;
        Ok(value)
    };
    report.version = uleb(&mut pos)?;

    let mut live: HashMap<u64, u64> = HashMap::new();
    let mut live_bytes = 0u64;
    while pos < bytes.len() {
        if bytes.len() - pos == 4 {
            if bytes[pos..] == STREAM_MAGIC {
                break;
            }
            return Err(ReplayError::BadMagic);
        }
        let tag = bytes[pos];
        pos += 1;
        match tag {
            b'A' => {
                let index = uleb(&mut pos)?;
                let addr = uleb(&mut pos)?;
                let size = uleb(&mut pos)?;
                report.events.push(Event::Alloc { index, addr, size });
                report.alloc_count += 1;
                live.insert(index, size);
                live_bytes += size;
                report.peak_live_bytes = report.peak_live_bytes.max(live_bytes);
            }
            b'F' => {
                let index = uleb(&mut pos)?;
                report.events.push(Event::Free { index });
                report.free_count += 1;
                if let Some(size) = live.remove(&index) {
                    live_bytes -= size;
                }
            }
            b'H' => {
                let addr = uleb(&mut pos)?;
                let size = uleb(&mut pos)?;
                report.events.push(Event::Heap { addr, size });
                report.heap_reserved += size;
            }
            b'I' => {
                let addr = uleb(&mut pos)?;
                let size = uleb(&mut pos)?;
                report.events.push(Event::Internal { addr, size });
                report.internal_reserved += size;
            }
            tag => return Err(ReplayError::UnknownTag { tag, offset: pos - 1 }),
        }
    }

    report.leaked_blocks = live.len() as u64;
    report.leaked_bytes = live.values().sum();
    Ok(report)
}

/// Renders the replay as text, optionally listing every event.
pub fn render(report: &TraceReport, list_events: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "trace v{} ({}-byte words)\n{} allocations, {} frees, peak {} bytes live\n{} bytes reserved from the OS, {} bytes internal\n{} blocks ({} bytes) never freed\n",
        report.version,
        report.word_size,
        report.alloc_count,
        report.free_count,
        report.peak_live_bytes,
        report.heap_reserved,
        report.internal_reserved,
        report.leaked_blocks,
        report.leaked_bytes,
    ));
    if list_events {
        out.push('\n');
        for event in &report.events {
            match event {
                Event::Alloc { index, addr, size } => {
                    out.push_str(&format!("    A {index:>6} {addr:#014x} {size} bytes\n"));
                }
                Event::Free { index } => out.push_str(&format!("    F {index:>6}\n")),
                Event::Heap { addr, size } => {
                    out.push_str(&format!("    H        {addr:#014x} {size} bytes\n"));
                }
                Event::Internal { addr, size } => {
                    out.push_str(&format!("    I        {addr:#014x} {size} bytes\n"));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapscope_core::trace::Tracer;

    fn sample_stream() -> Vec<u8> {
        let path = std::env::temp_dir().join(format!(
            "heapscope-tracedump-{}",
            std::process::id()
        ));
        let mut t = Tracer::new(true, path.to_string_lossy().into_owned());
        t.reserve(0x10000, 0x4000, false);
        t.reserve(0x90000, 0x1000, true);
        t.alloc(1, 0x10040, 64);
        t.alloc(2, 0x10100, 128);
        t.free(1);
        t.close().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        bytes
    }

    #[test]
    fn test_replay_from_engine_tracer() {
        let report = decode(&sample_stream()).unwrap();
        assert_eq!(report.alloc_count, 2);
        assert_eq!(report.free_count, 1);
        assert_eq!(report.peak_live_bytes, 192);
        assert_eq!(report.heap_reserved, 0x4000);
        assert_eq!(report.internal_reserved, 0x1000);
        assert_eq!(report.leaked_blocks, 1);
        assert_eq!(report.leaked_bytes, 128);
        assert_eq!(report.events.len(), 5);
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(decode(b"XXXX1234"), Err(ReplayError::BadMagic)));
        assert!(matches!(decode(b"MP"), Err(ReplayError::BadMagic)));
    }

    #[test]
    fn test_unknown_tag() {
        let mut bytes = sample_stream();
        // Overwrite the first event tag (after magic + word byte + version).
        bytes[6] = b'Z';
        assert!(matches!(
            decode(&bytes),
            Err(ReplayError::UnknownTag { tag: b'Z', .. })
        ));
    }

    #[test]
    fn test_render_summary() {
        let report = decode(&sample_stream()).unwrap();
        let text = render(&report, true);
        assert!(text.contains("2 allocations, 1 frees"));
        assert!(text.contains("peak 192 bytes live"));
        assert!(text.contains("A      1"));
    }
}
