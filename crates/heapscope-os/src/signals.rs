//! Fault-signal reporting and per-operation signal shielding.
//!
//! The engine installs a handler for the illegal-access signals so that a
//! wild read or write through a guard page produces a diagnostic instead of
//! a silent crash. The handler runs with the engine lock in an unknown
//! state, so it only touches atomics and writes with `write(2)` before
//! terminating.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Known heap bounds, published by the engine so the fault handler can say
/// whether the faulting address lies inside the arena.
static HEAP_LO: AtomicUsize = AtomicUsize::new(usize::MAX);
static HEAP_HI: AtomicUsize = AtomicUsize::new(0);

/// Publishes the current arena bounds for fault reports. Called by the
/// engine whenever the heap grows.
pub fn note_heap_bounds(lo: usize, hi: usize) {
    HEAP_LO.fetch_min(lo, Ordering::Relaxed);
    HEAP_HI.fetch_max(hi, Ordering::Relaxed);
}

fn write_stderr(msg: &[u8]) {
    // SAFETY: write(2) on fd 2 is async-signal-safe.
    unsafe { libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len()) };
}

fn write_hex(mut v: usize) {
    let mut buf = [0u8; 18];
    let mut i = buf.len();
    if v == 0 {
        i -= 1;
        buf[i] = b'0';
    }
    while v != 0 {
        i -= 1;
        buf[i] = b"0123456789abcdef"[v & 0xF];
        v >>= 4;
    }
    write_stderr(b"0x");
    write_stderr(&buf[i..]);
}

extern "C" fn fault_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    write_stderr(b"\nheapscope: illegal memory access");
    if !info.is_null() {
        // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
        let addr = unsafe { (*info).si_addr() } as usize;
        write_stderr(b" at address ");
        write_hex(addr);
        let lo = HEAP_LO.load(Ordering::Relaxed);
        let hi = HEAP_HI.load(Ordering::Relaxed);
        if addr >= lo && addr < hi {
            write_stderr(b" (inside the heap arena)");
        } else {
            write_stderr(b" (outside the heap arena)");
        }
    }
    write_stderr(b"\n");
    // SAFETY: abort is async-signal-safe and does not return.
    unsafe { libc::abort() };
}

/// Installs the illegal-access handler for SIGSEGV and SIGBUS.
pub fn install_fault_handler() {
    // SAFETY: filling in a sigaction with a handler that only performs
    // async-signal-safe work, then installing it.
    unsafe {
        let mut sa: libc::sigaction = MaybeUninit::zeroed().assume_init();
        sa.sa_sigaction = fault_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&raw mut sa.sa_mask);
        libc::sigaction(libc::SIGSEGV, &sa, core::ptr::null_mut());
        libc::sigaction(libc::SIGBUS, &sa, core::ptr::null_mut());
    }
}

/// Saved interrupt and terminate dispositions, held across one engine
/// operation so that a signal raised mid-operation cannot corrupt engine
/// state. Restores on drop.
pub struct HeldSignals {
    saved: [(libc::c_int, libc::sigaction); 2],
}

impl HeldSignals {
    /// Ignores SIGINT and SIGTERM, remembering the previous dispositions.
    pub fn hold() -> Self {
        let mut saved: [(libc::c_int, libc::sigaction); 2] =
            // SAFETY: sigaction is plain old data; zeroed is a valid initial value.
            unsafe { MaybeUninit::zeroed().assume_init() };
        for (slot, sig) in saved.iter_mut().zip([libc::SIGINT, libc::SIGTERM]) {
            slot.0 = sig;
            // SAFETY: swapping in SIG_IGN while capturing the old action.
            unsafe {
                let mut ign: libc::sigaction = MaybeUninit::zeroed().assume_init();
                ign.sa_sigaction = libc::SIG_IGN;
                libc::sigemptyset(&raw mut ign.sa_mask);
                libc::sigaction(sig, &ign, &raw mut slot.1);
            }
        }
        Self { saved }
    }
}

impl Drop for HeldSignals {
    fn drop(&mut self) {
        for (sig, old) in &self.saved {
            // SAFETY: restoring the action captured in hold().
            unsafe { libc::sigaction(*sig, old, core::ptr::null_mut()) };
        }
    }
}

/// Registers `f` to run at normal process termination.
pub fn on_exit(f: extern "C" fn()) {
    // SAFETY: atexit with a valid extern "C" function pointer.
    let _ = unsafe { libc::atexit(f) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_bounds_widen_monotonically() {
        note_heap_bounds(0x2000, 0x3000);
        note_heap_bounds(0x1000, 0x2000);
        assert!(HEAP_LO.load(Ordering::Relaxed) <= 0x1000);
        assert!(HEAP_HI.load(Ordering::Relaxed) >= 0x3000);
    }

    #[test]
    fn test_held_signals_restore_on_drop() {
        let before = current_int_action();
        {
            let _held = HeldSignals::hold();
        }
        assert_eq!(before, current_int_action());
    }

    fn current_int_action() -> usize {
        // SAFETY: querying the current disposition without changing it.
        unsafe {
            let mut cur: libc::sigaction = MaybeUninit::zeroed().assume_init();
            libc::sigaction(libc::SIGINT, core::ptr::null(), &raw mut cur);
            cur.sa_sigaction
        }
    }
}
