//! # heapscope-harness
//!
//! Post-mortem tooling for heapscope: a leak checker over the text log, a
//! decoder for the binary profile stream, a replayer for the binary trace
//! stream, and a launcher that runs a target process under a heapscope
//! options string.

pub mod heapdiff;
pub mod leaks;
pub mod profdump;
pub mod runner;
pub mod tracedump;

use thiserror::Error;

/// Failures shared by the stream readers.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic: expected MPTL")]
    BadMagic,
    #[error("truncated stream at offset {0}")]
    Truncated(usize),
    #[error("unknown event tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },
}
