//! Call-stack capture.
//!
//! The engine only requires an ordered, bounded sequence of return
//! addresses, top-most first; the mechanism behind it is a strategy chosen
//! at construction. Capture must never allocate through the engine (the
//! `backtrace` crate allocates from the host heap, which is separate from
//! the heap under observation).

/// Upper bound on captured frames; deep recursion is truncated.
const MAX_FRAMES: usize = 64;

/// Strategy producing an ordered list of return addresses.
pub trait StackWalker {
    /// Captures the current call stack, dropping `skip` frames from the top
    /// (the engine's own entry frames).
    fn capture(&self, skip: usize) -> Vec<usize>;

    /// Whether two captures taken through different entry points can be
    /// compared frame-by-frame. Decides the scope tracker's marker mode:
    /// only exact walkers support the full-stack-comparison markers.
    fn frames_comparable(&self) -> bool;
}

/// Frame capture through the `backtrace` crate.
#[derive(Debug, Default)]
pub struct BacktraceWalker;

impl StackWalker for BacktraceWalker {
    fn capture(&self, skip: usize) -> Vec<usize> {
        let mut frames = Vec::with_capacity(16);
        backtrace::trace(|frame| {
            frames.push(frame.ip() as usize);
            frames.len() < MAX_FRAMES + skip
        });
        // Drop our own trace frame as well as the requested entry frames.
        frames.drain(..(skip + 1).min(frames.len()));
        frames
    }

    fn frames_comparable(&self) -> bool {
        // Captures keep a residue of engine frames whose depth differs per
        // entry point, so suffix comparison across operations is not exact.
        // The scope tracker falls back to the address heuristic.
        false
    }
}

/// No capture available; every stack is empty.
#[derive(Debug, Default)]
pub struct NullWalker;

impl StackWalker for NullWalker {
    fn capture(&self, _skip: usize) -> Vec<usize> {
        Vec::new()
    }

    fn frames_comparable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_is_bounded_and_nonempty() {
        let walker = BacktraceWalker;
        let frames = walker.capture(0);
        assert!(!frames.is_empty());
        assert!(frames.len() <= MAX_FRAMES);
        assert!(frames.iter().all(|&a| a != 0));
    }

    #[test]
    fn test_skip_shortens_the_capture() {
        let walker = BacktraceWalker;
        let full = walker.capture(0);
        let skipped = walker.capture(2);
        assert!(skipped.len() < full.len());
    }

    #[test]
    fn test_null_walker() {
        let walker = NullWalker;
        assert!(walker.capture(0).is_empty());
        assert!(!walker.frames_comparable());
    }
}
