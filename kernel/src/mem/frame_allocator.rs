mod placement_algorithms;

pub use placement_algorithms::{NextFit, PlacementAlgorithm};

use crate::mem::FrameNumber;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::{boxed::Box, vec::Vec};
use bitbybit::bitfield;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    pinned: bool,
}

/// The contents of one physical frame.
pub type Frame = Box<[u8; PAGE_FRAME_SIZE]>;

/// Bookkeeping for the frames available to user pages.
///
/// The pool hands out single frames and tracks which are allocated and which
/// are pinned against eviction. It does not own frame contents; see
/// [`PhysicalMemory`].
pub struct UserPool<P: PlacementAlgorithm = NextFit> {
    core_map: Box<[CoreMapEntry]>,
    placement: P,
    frames_allocated: usize,
}

impl<P: PlacementAlgorithm> UserPool<P> {
    pub fn new(frames: usize) -> Self {
        Self {
            core_map: (0..frames).map(|_| CoreMapEntry::DEFAULT).collect(),
            placement: P::default(),
            frames_allocated: 0,
        }
    }

    /// Allocate one frame, or `None` if the pool is exhausted.
    pub fn alloc(&mut self) -> Option<FrameNumber> {
        if self.frames_allocated == self.core_map.len() {
            return None;
        }

        let frame = self.placement.place(&self.core_map)?;
        assert!(!self.core_map[frame].allocated());
        self.core_map[frame] = CoreMapEntry::DEFAULT.with_allocated(true);
        self.frames_allocated += 1;
        Some(frame)
    }

    /// Return `frame` to the pool. Returns `false` if it was not allocated.
    pub fn dealloc(&mut self, frame: FrameNumber) -> bool {
        match self.core_map.get(frame) {
            Some(entry) if entry.allocated() => {
                self.core_map[frame] = CoreMapEntry::DEFAULT;
                self.frames_allocated -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn set_pinned(&mut self, frame: FrameNumber, pinned: bool) {
        if let Some(entry) = self.core_map.get_mut(frame) {
            if entry.allocated() {
                *entry = entry.with_pinned(pinned);
            }
        }
    }

    pub fn is_pinned(&self, frame: FrameNumber) -> bool {
        self.core_map.get(frame).is_some_and(|entry| entry.pinned())
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }
}

/// Simulated physical memory backing the user pool.
///
/// Each frame sits behind its own lock so that copying one page never waits
/// on I/O to another.
pub struct PhysicalMemory {
    frames: Box<[Mutex<Frame>]>,
}

impl PhysicalMemory {
    pub fn new(frames: usize) -> Self {
        let frames: Vec<_> = (0..frames)
            .map(|_| Mutex::new(Box::new([0; PAGE_FRAME_SIZE])))
            .collect();
        Self {
            frames: frames.into_boxed_slice(),
        }
    }

    /// Lock and return the contents of `frame`.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is outside physical memory. Frame numbers only come
    /// from the matching [`UserPool`].
    pub fn frame(&self, frame: FrameNumber) -> MutexGuard<Frame> {
        self.frames[frame].lock()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_until_exhausted() {
        let mut pool: UserPool = UserPool::new(3);
        assert_eq!(pool.alloc(), Some(0));
        assert_eq!(pool.alloc(), Some(1));
        assert_eq!(pool.alloc(), Some(2));
        assert_eq!(pool.alloc(), None);

        assert!(pool.dealloc(1));
        assert!(!pool.dealloc(1));
        assert_eq!(pool.alloc(), Some(1));
        assert_eq!(pool.frames_allocated(), 3);
    }

    #[test]
    fn test_dealloc_clears_pin() {
        let mut pool: UserPool = UserPool::new(2);
        let frame = pool.alloc().unwrap();
        pool.set_pinned(frame, true);
        assert!(pool.is_pinned(frame));
        assert!(pool.dealloc(frame));
        assert!(!pool.is_pinned(frame));

        // Unallocated frames cannot be pinned.
        pool.set_pinned(frame, true);
        assert!(!pool.is_pinned(frame));
    }

    #[test]
    fn test_physical_memory_frames_are_independent() {
        let memory = PhysicalMemory::new(2);
        memory.frame(0).fill(0xAA);
        let first = memory.frame(0);
        let second = memory.frame(1);
        assert!(first.iter().all(|&b| b == 0xAA));
        assert!(second.iter().all(|&b| b == 0));
    }
}
