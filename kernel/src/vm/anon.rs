//! Anonymous pages: stack, heap and data with no file to return to. Evicted
//! contents go to a swap slot.

use super::{
    swap::{SwapSlot, SwapTable},
    Result, VmError,
};
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::trace;

#[derive(Debug, Default)]
pub struct AnonPage {
    /// Where the contents live while the page is evicted.
    slot: Option<SwapSlot>,
}

impl AnonPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    /// Read the page back from its slot and release the slot.
    pub(super) fn swap_in(
        &mut self,
        swap: &SwapTable,
        frame: &mut [u8; PAGE_FRAME_SIZE],
    ) -> Result<()> {
        let slot = self.slot.ok_or(VmError::NotSwapped)?;
        swap.read_slot(slot, frame)?;
        swap.free(slot);
        self.slot = None;
        trace!("anon: swapped in from slot {}", slot);
        Ok(())
    }

    /// Write the page to a fresh slot and remember it.
    pub(super) fn swap_out(&mut self, swap: &SwapTable, frame: &[u8; PAGE_FRAME_SIZE]) -> Result<()> {
        let slot = swap.allocate()?;
        if let Err(err) = swap.write_slot(slot, frame) {
            swap.free(slot);
            return Err(err);
        }
        self.slot = Some(slot);
        trace!("anon: swapped out to slot {}", slot);
        Ok(())
    }

    /// Release the slot, if the page holds one.
    pub(super) fn destroy(&mut self, swap: &SwapTable) {
        if let Some(slot) = self.slot.take() {
            swap.free(slot);
        }
    }
}
