//! Heap event tracing.
//!
//! When tracing is enabled every allocation, deallocation and heap
//! reservation is written to a compact binary stream for later processing.
//! Reservations that happen while the engine is still initialising are held
//! in a bounded cache and flushed once the output file is safe to open.

use std::io::{self, Write};

use crate::leb128::write_uleb128;
use crate::sink::Sink;
use crate::{LIB_VERSION, STREAM_MAGIC};

/// Reservations buffered before the stream opens.
const RESERVE_CACHE: usize = 64;

/// Event tags.
const TAG_ALLOC: u8 = b'A';
const TAG_FREE: u8 = b'F';
const TAG_HEAP: u8 = b'H';
const TAG_INTERNAL: u8 = b'I';

/// The tracer state.
pub struct Tracer {
    enabled: bool,
    path: String,
    sink: Option<Sink>,
    /// `(internal, addr, size)` reservations awaiting the open stream.
    pending: Vec<(bool, usize, usize)>,
    open_failed: bool,
}

impl Tracer {
    pub fn new(enabled: bool, path: String) -> Self {
        Self {
            enabled,
            path,
            sink: None,
            pending: Vec::new(),
            open_failed: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Records a heap region reservation (`H`) or internal block (`I`).
    /// Safe to call before the stream is open; the event is cached.
    pub fn reserve(&mut self, addr: usize, size: usize, internal: bool) {
        if !self.enabled {
            return;
        }
        if self.sink.is_none() {
            if self.pending.len() < RESERVE_CACHE {
                self.pending.push((internal, addr, size));
            }
            return;
        }
        let mut buf = Vec::with_capacity(24);
        buf.push(if internal { TAG_INTERNAL } else { TAG_HEAP });
        write_uleb128(&mut buf, addr as u64);
        write_uleb128(&mut buf, size as u64);
        self.write(&buf);
    }

    /// Records an allocation event.
    pub fn alloc(&mut self, index: u64, addr: usize, size: usize) {
        if !self.enabled || !self.ensure_open() {
            return;
        }
        let mut buf = Vec::with_capacity(24);
        buf.push(TAG_ALLOC);
        write_uleb128(&mut buf, index);
        write_uleb128(&mut buf, addr as u64);
        write_uleb128(&mut buf, size as u64);
        self.write(&buf);
    }

    /// Records a deallocation event.
    pub fn free(&mut self, index: u64) {
        if !self.enabled || !self.ensure_open() {
            return;
        }
        let mut buf = Vec::with_capacity(12);
        buf.push(TAG_FREE);
        write_uleb128(&mut buf, index);
        self.write(&buf);
    }

    /// Writes the closing magic and flushes the stream.
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.write_all(&STREAM_MAGIC)?;
            sink.flush()?;
        }
        self.enabled = false;
        Ok(())
    }

    /// Opens the stream on first use, writing the header and any cached
    /// reservations. A failed open disables tracing.
    fn ensure_open(&mut self) -> bool {
        if self.sink.is_some() {
            return true;
        }
        if self.open_failed {
            return false;
        }
        let mut sink = match Sink::open(&self.path) {
            Ok(s) => s,
            Err(_) => {
                self.open_failed = true;
                self.enabled = false;
                return false;
            }
        };
        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(&STREAM_MAGIC);
        header.push(size_of::<usize>() as u8);
        write_uleb128(&mut header, LIB_VERSION);
        if sink.write_all(&header).is_err() {
            self.open_failed = true;
            self.enabled = false;
            return false;
        }
        self.sink = Some(sink);
        for (internal, addr, size) in std::mem::take(&mut self.pending) {
            self.reserve(addr, size, internal);
        }
        true
    }

    fn write(&mut self, bytes: &[u8]) {
        if let Some(sink) = self.sink.as_mut()
            && sink.write_all(bytes).is_err()
        {
            self.sink = None;
            self.enabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leb128::read_uleb128;

    fn temp_path(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!("heapscope-trace-{tag}-{}", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_stream_layout() {
        let path = temp_path("layout");
        let mut t = Tracer::new(true, path.clone());
        t.reserve(0x1000, 0x2000, false);
        t.reserve(0x9000, 0x1000, true);
        t.alloc(1, 0x1040, 64);
        t.free(1);
        t.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(&bytes[..4], &STREAM_MAGIC);
        assert_eq!(&bytes[bytes.len() - 4..], &STREAM_MAGIC);
        assert_eq!(bytes[4] as usize, size_of::<usize>());
        let mut pos = 5;
        let (version, n) = read_uleb128(&bytes[pos..]).unwrap();
        assert_eq!(version, LIB_VERSION);
        pos += n;
        // Cached reservations come first, in order.
        assert_eq!(bytes[pos], TAG_HEAP);
        pos += 1;
        let (addr, n) = read_uleb128(&bytes[pos..]).unwrap();
        assert_eq!(addr, 0x1000);
        pos += n;
        let (size, n) = read_uleb128(&bytes[pos..]).unwrap();
        assert_eq!(size, 0x2000);
        pos += n;
        assert_eq!(bytes[pos], TAG_INTERNAL);
    }

    #[test]
    fn test_disabled_tracer_writes_nothing() {
        let path = temp_path("disabled");
        let mut t = Tracer::new(false, path.clone());
        t.alloc(1, 0x1000, 8);
        t.close().unwrap();
        assert!(!std::path::Path::new(&path).exists());
    }

    #[test]
    fn test_reservation_cache_is_bounded() {
        let mut t = Tracer::new(true, temp_path("bounded"));
        for i in 0..(RESERVE_CACHE + 10) {
            t.reserve(0x1000 + i, 0x100, false);
        }
        assert_eq!(t.pending.len(), RESERVE_CACHE);
    }
}
