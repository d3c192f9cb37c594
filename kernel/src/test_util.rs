//! Fixtures shared by the unit tests.

use crate::block::{Block, BlockSector, BlockType};
use crate::drivers::ram_disk::RamDisk;
use crate::vm::{Vm, VmConfig};
use alloc::{boxed::Box, sync::Arc};
use kidneyos_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};

/// Stack size limit of the address spaces built by `test_vm`, in pages.
pub const TEST_STACK_PAGES: usize = 4;

/// Route log output through the test harness. Set `RUST_LOG` to see it.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An in-memory swap disk holding `slots` pages.
pub fn swap_disk(slots: usize) -> Block {
    let sectors = slots as BlockSector * SECTORS_PER_PAGE;
    Block::new(
        BlockType::Swap,
        "ram-swap",
        sectors,
        Box::new(RamDisk::new(sectors)),
    )
}

/// A VM with `frames` user frames and `swap_slots` pages of swap.
pub fn test_vm(frames: usize, swap_slots: usize) -> Arc<Vm> {
    init_logging();
    let config = VmConfig {
        user_frames: frames,
        max_stack_size: TEST_STACK_PAGES * PAGE_FRAME_SIZE,
        ..VmConfig::default()
    };
    match Vm::new(config, swap_disk(swap_slots)) {
        Ok(vm) => vm,
        Err(err) => panic!("test vm: {}", err),
    }
}
