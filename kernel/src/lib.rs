#![cfg_attr(target_os = "none", no_std)]

pub mod block;
pub mod drivers;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod vfs;
pub mod vm;

#[cfg(test)]
mod test_util;

extern crate alloc;
