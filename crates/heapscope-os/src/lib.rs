//! # heapscope-os
//!
//! OS memory provider for the heapscope debugging allocator. Acquires and
//! releases page-aligned raw regions, changes page protection, reports
//! illegal accesses, and exposes the raw byte primitives the rest of the
//! workspace uses to touch heap memory.
//!
//! All `unsafe` in the workspace lives in this crate and in the slot-arena
//! slab accessor of `heapscope-core`; the policy layers above are safe Rust.

pub mod memory;
pub mod raw;
pub mod signals;

pub use memory::{Access, Memory, Region};
pub use signals::{HeldSignals, install_fault_handler, note_heap_bounds, on_exit};

use thiserror::Error;

/// Failures surfaced by the OS layer.
#[derive(Debug, Error)]
pub enum OsError {
    #[error("out of memory acquiring {size} bytes")]
    OutOfMemory { size: usize },
    #[error("cannot release region at {base:#x} ({size} bytes)")]
    Release { base: usize, size: usize },
    #[error("cannot change protection at {base:#x} ({size} bytes)")]
    Protect { base: usize, size: usize },
    #[error("{what} are not supported on this platform")]
    Unsupported { what: &'static str },
}
