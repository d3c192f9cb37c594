//! Demand-paged virtual memory.
//!
//! A [`Vm`] is created once at boot and shared by every [`AddressSpace`]. It
//! owns the pieces that are global to the machine: the frame table over the
//! user pool, with its clock hand, and the swap table over the swap disk.
//! Everything per-process lives in the address space's
//! [`SupplementalPageTable`].

pub mod address_space;
pub mod anon;
pub mod fault;
pub mod file;
pub mod frame;
pub mod page;
pub mod spt;
pub mod swap;

pub use address_space::AddressSpace;
pub use fault::{FaultError, PageFault};
pub use file::FileSegment;
pub use frame::FrameTable;
pub use page::{LazyLoad, Page, PageKind, PageRef, PageType};
pub use spt::SupplementalPageTable;
pub use swap::{SwapSlot, SwapTable};

use crate::block::{Block, BlockError};
use crate::vfs;
use alloc::sync::Arc;
use kidneyos_shared::mem::{MAX_FRAMES, MAX_USER_STACK_SIZE, OFFSET, PAGE_FRAME_SIZE, USER_STACK_TOP};
use kidneyos_shared::sizes::MB;
use log::info;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A page is already registered at this address.
    #[error("a page is already registered at {0:#x}")]
    AlreadyMapped(usize),
    #[error("no page is registered at {0:#x}")]
    NotMapped(usize),
    /// The hardware page table already has a present entry here.
    #[error("page table slot for {0:#x} is already occupied")]
    SlotOccupied(usize),
    #[error("page at {0:#x} is not resident")]
    NotResident(usize),
    #[error("swap space exhausted")]
    SwapExhausted,
    /// An anonymous page was asked to swap in without a recorded slot.
    #[error("anonymous page has no swap slot to read")]
    NotSwapped,
    #[error("no user frames to allocate or evict")]
    OutOfFrames,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("block device error: {0}")]
    Block(#[from] BlockError),
    #[error("file error: {0}")]
    File(#[from] vfs::Error),
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite { expected: usize, actual: usize },
}

pub type Result<T> = core::result::Result<T, VmError>;

/// Runtime parameters of the VM subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames in the user pool.
    pub user_frames: usize,
    /// Exclusive upper bound of every user stack.
    pub user_stack_top: usize,
    /// How far below `user_stack_top` a stack may grow.
    pub max_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: 4 * MB / PAGE_FRAME_SIZE,
            user_stack_top: USER_STACK_TOP,
            max_stack_size: MAX_USER_STACK_SIZE,
        }
    }
}

impl VmConfig {
    fn validate(&self) -> Result<()> {
        if self.user_frames > MAX_FRAMES {
            return Err(VmError::InvalidArgument("user pool larger than physical address space"));
        }
        if self.user_stack_top % PAGE_FRAME_SIZE != 0 || self.user_stack_top > OFFSET {
            return Err(VmError::InvalidArgument("user stack top"));
        }
        if self.max_stack_size % PAGE_FRAME_SIZE != 0
            || self.max_stack_size > self.user_stack_top
        {
            return Err(VmError::InvalidArgument("maximum stack size"));
        }
        Ok(())
    }
}

/// Machine-wide VM state shared by every address space.
pub struct Vm {
    config: VmConfig,
    frames: FrameTable,
    swap: SwapTable,
}

impl Vm {
    /// Initialize the frame table over `config.user_frames` frames and the
    /// swap table over `swap_disk`.
    pub fn new(config: VmConfig, swap_disk: Block) -> Result<Arc<Self>> {
        config.validate()?;

        let frames = FrameTable::new(config.user_frames);
        let swap = SwapTable::new(swap_disk);
        info!(
            "vm: {} user frames, {} swap slots on \"{}\", stack {:#x}..{:#x}",
            frames.capacity(),
            swap.slot_count(),
            swap.disk().get_name(),
            config.user_stack_top - config.max_stack_size,
            config.user_stack_top,
        );

        Ok(Arc::new(Self {
            config,
            frames,
            swap,
        }))
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{init_logging, swap_disk};

    #[test]
    fn test_new_reports_geometry() {
        init_logging();
        let config = VmConfig {
            user_frames: 8,
            ..VmConfig::default()
        };
        let vm = Vm::new(config, swap_disk(4)).unwrap();
        assert_eq!(vm.frames().capacity(), 8);
        assert_eq!(vm.swap().slot_count(), 4);
        assert_eq!(vm.config().user_stack_top, USER_STACK_TOP);
    }

    #[test]
    fn test_rejects_bad_stack_layout() {
        let config = VmConfig {
            user_stack_top: OFFSET + PAGE_FRAME_SIZE,
            ..VmConfig::default()
        };
        assert!(matches!(
            Vm::new(config, swap_disk(1)),
            Err(VmError::InvalidArgument(_))
        ));

        let config = VmConfig {
            max_stack_size: 100,
            ..VmConfig::default()
        };
        assert!(matches!(
            Vm::new(config, swap_disk(1)),
            Err(VmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_pool_beyond_frame_numbers() {
        let config = VmConfig {
            user_frames: MAX_FRAMES + 1,
            ..VmConfig::default()
        };
        assert_eq!(
            Vm::new(config, swap_disk(1)).err(),
            Some(VmError::InvalidArgument("user pool larger than physical address space"))
        );
    }
}
