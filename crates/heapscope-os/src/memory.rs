//! Page-granular memory acquisition and protection.
//!
//! Obtains raw page-aligned regions from the operating system, either through
//! anonymous mappings or by growing the break pointer, and changes page
//! protection on ranges it handed out. Regions flow one way out of this
//! layer: a released mapping is never re-issued from here, reuse happens in
//! the heap layer above.

use crate::OsError;

/// Page access level for [`Memory::protect`] and [`Memory::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No access at all; any read or write traps.
    None,
    /// Read-only.
    Read,
    /// Full read-write access.
    ReadWrite,
}

impl Access {
    fn prot_flags(self) -> libc::c_int {
        match self {
            Access::None => libc::PROT_NONE,
            Access::Read => libc::PROT_READ,
            Access::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// A contiguous page-aligned byte range owned by the OS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: usize,
    pub size: usize,
}

impl Region {
    /// Exclusive upper bound of the region.
    pub fn limit(&self) -> usize {
        self.base + self.size
    }

    /// Whether `addr` lies inside the region.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.limit()
    }
}

/// Backend used to obtain fresh territory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    /// Anonymous `mmap`.
    Map,
    /// Grow the break pointer.
    Break,
}

/// The OS memory provider.
///
/// One instance per engine. Tracks the page size, the selected backend and,
/// for the break backend, a monotonic high-water offset used to page-align
/// fresh territory when the break pointer was not aligned.
pub struct Memory {
    page: usize,
    backend: Backend,
    /// Highest address handed out by the break backend.
    high_water: usize,
}

impl Memory {
    /// Creates a provider. `use_map` selects anonymous mappings; otherwise
    /// the break pointer is grown.
    pub fn new(use_map: bool) -> Self {
        // SAFETY: sysconf is always safe to call.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page = if page > 0 { page as usize } else { 4096 };
        Self {
            page,
            backend: if use_map { Backend::Map } else { Backend::Break },
            high_water: 0,
        }
    }

    /// The system page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page
    }

    /// The most restrictive native alignment for a scalar type.
    pub fn natural_alignment(&self) -> usize {
        core::mem::align_of::<libc::max_align_t>()
    }

    /// Rounds `size` up to a whole number of pages (at least one).
    pub fn round_to_pages(&self, size: usize) -> usize {
        let size = size.max(1);
        size.div_ceil(self.page) * self.page
    }

    /// Acquires a fresh page-aligned region of at least `size` bytes.
    ///
    /// The actual size is rounded up to a page multiple. Returns
    /// [`OsError::OutOfMemory`] when the OS refuses.
    pub fn acquire(&mut self, size: usize) -> Result<Region, OsError> {
        let size = self.round_to_pages(size);
        match self.backend {
            Backend::Map => self.acquire_map(size),
            Backend::Break => self.acquire_break(size),
        }
    }

    fn acquire_map(&self, size: usize) -> Result<Region, OsError> {
        // SAFETY: anonymous private mapping with no fixed address; the
        // kernel picks a non-overlapping range or fails.
        let p = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(OsError::OutOfMemory { size });
        }
        Ok(Region {
            base: p as usize,
            size,
        })
    }

    fn acquire_break(&mut self, size: usize) -> Result<Region, OsError> {
        // The break pointer is not guaranteed to be page-aligned, so the
        // first request over-asks by up to a page and skips to the next
        // page boundary. high_water remembers where aligned territory ends.
        // SAFETY: sbrk(0) only queries the current break.
        let cur = unsafe { libc::sbrk(0) } as usize;
        if cur == usize::MAX {
            return Err(OsError::OutOfMemory { size });
        }
        let start = cur.max(self.high_water);
        let aligned = start.next_multiple_of(self.page);
        let grow = aligned + size - cur;
        // SAFETY: growing the break by a computed positive amount.
        let old = unsafe { libc::sbrk(grow as libc::intptr_t) } as usize;
        if old == usize::MAX {
            return Err(OsError::OutOfMemory { size });
        }
        self.high_water = aligned + size;
        Ok(Region {
            base: aligned,
            size,
        })
    }

    /// Returns a region to the OS. Break-backed regions cannot shrink the
    /// break (allocations above may exist), so they are made inaccessible
    /// instead.
    pub fn release(&mut self, region: Region) -> Result<(), OsError> {
        match self.backend {
            Backend::Map => {
                // SAFETY: region came from acquire_map with this exact size.
                let rc = unsafe { libc::munmap(region.base as *mut libc::c_void, region.size) };
                if rc != 0 {
                    return Err(OsError::Release {
                        base: region.base,
                        size: region.size,
                    });
                }
                Ok(())
            }
            Backend::Break => self.protect(region.base, region.size, Access::None),
        }
    }

    /// Changes page protection on `[base, base + size)`. Both ends are
    /// rounded outward to page boundaries.
    pub fn protect(&self, base: usize, size: usize, access: Access) -> Result<(), OsError> {
        if size == 0 {
            return Ok(());
        }
        let lo = base / self.page * self.page;
        let hi = (base + size).next_multiple_of(self.page);
        // SAFETY: the caller owns the pages being re-protected.
        let rc = unsafe {
            libc::mprotect(lo as *mut libc::c_void, hi - lo, access.prot_flags())
        };
        if rc != 0 {
            return Err(OsError::Protect { base: lo, size: hi - lo });
        }
        Ok(())
    }

    /// Arms an OS watch trap on a byte range so that any access raises a
    /// fault. Not available on this platform; callers fall back to byte
    /// patterns.
    pub fn watch(&self, _base: usize, _size: usize, _access: Access) -> Result<(), OsError> {
        Err(OsError::Unsupported { what: "watch traps" })
    }
}
