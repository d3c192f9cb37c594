//! Swap slot allocation over the swap disk.
//!
//! The disk is an undifferentiated array of page-sized slots, each a run of
//! `SECTORS_PER_PAGE` sectors. The bitmap has one bit per sector; a slot is
//! in use when its whole run is set.

use super::{Result, VmError};
use crate::block::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, vec};
use core::fmt;
use kidneyos_shared::{bit_array::BitArray, mem::PAGE_FRAME_SIZE, mem::SECTORS_PER_PAGE};
use log::{trace, warn};

const SECTORS_IN_PAGE: usize = SECTORS_PER_PAGE as usize;
const SLOTS_PER_WORD: usize = BitArray::<u64>::BITS / SECTORS_IN_PAGE;

/// Index of a page-sized slot on the swap disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        // Slot counts are bounded by the disk size, which fits in a sector index.
        #[allow(clippy::cast_possible_truncation)]
        let sector = (self.0 * SECTORS_IN_PAGE) as BlockSector;
        sector
    }

    fn sector_bits(self) -> (usize, usize, usize) {
        let word = self.0 / SLOTS_PER_WORD;
        let low = (self.0 % SLOTS_PER_WORD) * SECTORS_IN_PAGE;
        (word, low, low + SECTORS_IN_PAGE)
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct SwapBitmap {
    words: Box<[BitArray<u64>]>,
    slots: usize,
    used: usize,
}

impl SwapBitmap {
    fn new(slots: usize) -> Self {
        Self {
            words: vec![BitArray(0u64); slots.div_ceil(SLOTS_PER_WORD)].into_boxed_slice(),
            slots,
            used: 0,
        }
    }

    fn is_free(&self, slot: SwapSlot) -> bool {
        let (word, low, high) = slot.sector_bits();
        self.words[word].range_clear(low, high)
    }

    fn is_used(&self, slot: SwapSlot) -> bool {
        let (word, low, high) = slot.sector_bits();
        self.words[word].range_set(low, high)
    }

    fn set(&mut self, slot: SwapSlot, used: bool) {
        let (word, low, high) = slot.sector_bits();
        self.words[word] = self.words[word].with_range(used, low, high);
    }
}

pub struct SwapTable {
    disk: Block,
    bitmap: Mutex<SwapBitmap>,
}

impl SwapTable {
    pub fn new(disk: Block) -> Self {
        let slots = disk.get_size() as usize / SECTORS_IN_PAGE;
        Self {
            disk,
            bitmap: Mutex::new(SwapBitmap::new(slots)),
        }
    }

    pub fn disk(&self) -> &Block {
        &self.disk
    }

    pub fn slot_count(&self) -> usize {
        self.bitmap.lock().slots
    }

    pub fn used_slots(&self) -> usize {
        self.bitmap.lock().used
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        let bitmap = self.bitmap.lock();
        slot.0 < bitmap.slots && bitmap.is_used(slot)
    }

    /// Find a free slot and mark its sectors in use.
    pub fn allocate(&self) -> Result<SwapSlot> {
        let mut bitmap = self.bitmap.lock();
        let Some(slot) = (0..bitmap.slots)
            .map(SwapSlot)
            .find(|&slot| bitmap.is_free(slot))
        else {
            warn!("swap: all {} slots in use", bitmap.slots);
            return Err(VmError::SwapExhausted);
        };

        bitmap.set(slot, true);
        bitmap.used += 1;
        trace!("swap: allocated slot {}", slot);
        Ok(slot)
    }

    /// Mark `slot` free. Freeing a slot that is not in use is ignored.
    pub fn free(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        if slot.0 >= bitmap.slots || !bitmap.is_used(slot) {
            warn!("swap: ignoring free of unused slot {}", slot);
            return;
        }

        bitmap.set(slot, false);
        bitmap.used -= 1;
        trace!("swap: freed slot {}", slot);
    }

    /// Write one page to `slot`, one sector at a time.
    pub fn write_slot(&self, slot: SwapSlot, page: &[u8; PAGE_FRAME_SIZE]) -> Result<()> {
        let first = slot.first_sector();
        for (sector, chunk) in (first..).zip(page.chunks_exact(BLOCK_SECTOR_SIZE)) {
            self.disk.write(sector, chunk)?;
        }
        trace!("swap: wrote slot {} (sectors {}..{})", slot, first, first + SECTORS_PER_PAGE);
        Ok(())
    }

    /// Read one page from `slot`, one sector at a time.
    pub fn read_slot(&self, slot: SwapSlot, page: &mut [u8; PAGE_FRAME_SIZE]) -> Result<()> {
        let first = slot.first_sector();
        for (sector, chunk) in (first..).zip(page.chunks_exact_mut(BLOCK_SECTOR_SIZE)) {
            self.disk.read(sector, chunk)?;
        }
        trace!("swap: read slot {} (sectors {}..{})", slot, first, first + SECTORS_PER_PAGE);
        Ok(())
    }
}
