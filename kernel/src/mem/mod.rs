pub mod frame_allocator;

pub use frame_allocator::{CoreMapEntry, PhysicalMemory, UserPool};

/// Index of a physical frame in the user pool.
pub type FrameNumber = usize;
