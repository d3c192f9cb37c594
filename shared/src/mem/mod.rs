use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Machine word of the 32-bit x86 target, whatever the host.
pub const WORD_SIZE: usize = 4;

// Page table entries hold a 20-bit frame number.
pub const MAX_FRAMES: usize = 1 << 20;

// A swap slot holds exactly one page.
pub const SECTORS_PER_PAGE: u32 = PAGE_FRAME_SIZE as u32 / SECTOR_SIZE;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

// The user stack grows down from just below the kernel.
pub const USER_STACK_TOP: usize = OFFSET;
pub const MAX_USER_STACK_SIZE: usize = MB;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    page_round_down(addr + PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_round_down(0x1000), 0x1000);
        assert_eq!(page_round_up(0x1001), 0x2000);
        assert_eq!(page_round_up(0x1000), 0x1000);
        assert_eq!(page_offset(0x1234), 0x234);
    }

    #[test]
    fn test_user_vaddr() {
        assert!(is_user_vaddr(0));
        assert!(is_user_vaddr(OFFSET - 1));
        assert!(!is_user_vaddr(OFFSET));
        assert_eq!(SECTORS_PER_PAGE, 8);
        assert_eq!(MAX_FRAMES, 0x10_0000);
    }
}
