#![cfg_attr(not(test), no_std)]

pub mod bit_array;
pub mod mem;
pub mod paging;
pub mod sizes;
