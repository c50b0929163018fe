//! Pool of call frames for reuse.
//!
//! Frames are cleared and recycled when a callable returns, so steady-state
//! execution pushes and pops without fresh allocations. The pool belongs to
//! one thread; only the VM task touches it.

use core::fmt;

use crate::interpreter::Frame;

/// Free-list of cleared frames.
#[derive(Default)]
pub struct FramePool {
    free: Vec<Frame>,
}

impl FramePool {
    /// Take a cleared frame, allocating one if the free-list is empty.
    pub(crate) fn take(&mut self) -> Frame {
        self.free.pop().unwrap_or_default()
    }

    /// Clear a frame and return it to the free-list.
    pub(crate) fn recycle(&mut self, mut frame: Frame) {
        frame.clear();
        self.free.push(frame);
    }

    /// Grow the free-list by `n` frames.
    pub fn reserve(&mut self, n: usize) {
        self.free.reserve(n);
        for _ in 0..n {
            self.free.push(Frame::default());
        }
    }

    /// Number of frames currently pooled.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FramePool {{ free: [{} frames] }}", self.free.len())
    }
}
