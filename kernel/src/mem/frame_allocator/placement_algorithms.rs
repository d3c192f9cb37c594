//! Frame placement policy for the user pool.

use super::CoreMapEntry;
use crate::mem::FrameNumber;

/// A placement algorithm for allocating frames.
pub trait PlacementAlgorithm: Default {
    /// Returns the frame number to allocate, or `None` if every frame is
    /// taken.
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<FrameNumber>;
}

#[derive(Default)]
pub struct NextFit {
    /// The next frame number to start searching for a free frame.
    position: usize,
}

impl PlacementAlgorithm for NextFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<FrameNumber> {
        let frames = core_map.len();
        let start = self.position.min(frames);
        let frame = (start..frames)
            .chain(0..start)
            .find(|&frame| !core_map[frame].allocated())?;
        self.position = (frame + 1) % frames;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ops::Range;

    /// Marks the coremap entries in `range` as allocated.
    fn fill_coremap_range(core_map: &mut [CoreMapEntry], range: Range<usize>) {
        for entry in &mut core_map[range] {
            assert!(!entry.allocated());
            *entry = entry.with_allocated(true);
        }
    }

    #[test]
    fn test_next_fit() {
        let mut core_map = [CoreMapEntry::DEFAULT; 16];
        fill_coremap_range(&mut core_map, 1..4);
        fill_coremap_range(&mut core_map, 5..12);
        fill_coremap_range(&mut core_map, 14..16);

        // Frames left are 0, 4, 12-13 (inclusive)
        let mut algorithm = NextFit::default();
        assert_eq!(algorithm.place(&core_map), Some(0));
        fill_coremap_range(&mut core_map, 0..1);

        // Next allocation continues from frame 1 rather than restarting at 0
        assert_eq!(algorithm.place(&core_map), Some(4));
        fill_coremap_range(&mut core_map, 4..5);
        assert_eq!(algorithm.place(&core_map), Some(12));
        fill_coremap_range(&mut core_map, 12..13);

        // Frame 4 is freed again, but the search carries on from frame 13
        core_map[4] = CoreMapEntry::DEFAULT;
        assert_eq!(algorithm.place(&core_map), Some(13));
        fill_coremap_range(&mut core_map, 13..14);

        // Only frame 4 is left, found after wrapping around
        assert_eq!(algorithm.place(&core_map), Some(4));
        fill_coremap_range(&mut core_map, 4..5);
        assert_eq!(algorithm.place(&core_map), None);
    }

    #[test]
    fn test_next_fit_empty_map() {
        let mut algorithm = NextFit::default();
        assert_eq!(algorithm.place(&[]), None);
    }
}
