use crate::block::{BlockError, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::mutex::Mutex;
use alloc::{vec, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

/// A block device backed by kernel memory.
///
/// Contents are lost when the device is dropped, which is all a swap
/// partition needs.
pub struct RamDisk {
    sectors: Mutex<Vec<u8>>,
    failing: AtomicBool,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            sectors: Mutex::new(vec![0; sectors as usize * BLOCK_SECTOR_SIZE]),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent transfer fail, as a dead disk would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn range(&self, sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockOp for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(BlockError::ReadError);
        }
        let sectors = self.sectors.lock();
        let data = sectors
            .get(self.range(sector))
            .ok_or(BlockError::SectorOutOfBounds)?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(BlockError::WriteError);
        }
        let range = self.range(sector);
        let mut sectors = self.sectors.lock();
        sectors
            .get_mut(range)
            .ok_or(BlockError::SectorOutOfBounds)?
            .copy_from_slice(buf);
        Ok(())
    }
}
