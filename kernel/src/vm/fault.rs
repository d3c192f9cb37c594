//! Page fault resolution.
//!
//! Called by the trap handler with what the hardware reported. Every error
//! returned here is fatal for the faulting process and for nothing else.

use super::{AddressSpace, VmError};
use kidneyos_shared::mem::{is_user_vaddr, page_round_down, PAGE_FRAME_SIZE, WORD_SIZE};
use log::{debug, error};
use thiserror::Error;

/// `push` may touch memory one word below the stack pointer before moving it.
const STACK_SLACK: usize = WORD_SIZE;

/// A page fault as reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting linear address.
    pub addr: usize,
    /// Raised while running in user mode.
    pub user: bool,
    /// Raised by a write.
    pub write: bool,
    /// The page was not present, rather than present but protected.
    pub not_present: bool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    #[error("access to kernel address {0:#x}")]
    KernelAddress(usize),
    #[error("protection violation at {0:#x}")]
    ProtectionViolation(usize),
    #[error("{0:#x} is unmapped and not a stack access")]
    NotStackGrowth(usize),
    #[error("could not bring in page: {0}")]
    Claim(#[from] VmError),
}

impl AddressSpace {
    /// Resolve `fault`: load the page if one is registered there, grow the
    /// stack if the access is a push just below it, and fail otherwise.
    pub fn handle_page_fault(&mut self, fault: PageFault) -> Result<(), FaultError> {
        debug!(
            "fault: {:#x} ({} {} in {} mode)",
            fault.addr,
            if fault.not_present { "not present" } else { "rights violation" },
            if fault.write { "writing" } else { "reading" },
            if fault.user { "user" } else { "kernel" },
        );

        let result = self.resolve(fault);
        if let Err(err) = &result {
            error!("fault: killing process: {}", err);
        }
        result
    }

    fn resolve(&mut self, fault: PageFault) -> Result<(), FaultError> {
        let addr = fault.addr;
        if !is_user_vaddr(addr) {
            return Err(FaultError::KernelAddress(addr));
        }
        if !fault.not_present {
            return Err(FaultError::ProtectionViolation(addr));
        }

        if self.spt().find(addr).is_some() {
            self.spt_mut().fault_in(addr)?;
            return Ok(());
        }

        if !self.is_stack_access(addr) {
            return Err(FaultError::NotStackGrowth(addr));
        }
        self.grow_stack(addr)?;
        Ok(())
    }

    /// Whether `addr` is a plausible stack access: inside the stack region and
    /// no more than a word below the user stack pointer saved on kernel entry.
    fn is_stack_access(&self, addr: usize) -> bool {
        let config = self.spt().vm().config();
        let stack_limit = config.user_stack_top - config.max_stack_size;
        addr >= self.user_sp().saturating_sub(STACK_SLACK)
            && addr >= stack_limit
            && addr < config.user_stack_top
    }

    /// Add zero-filled pages below the stack bottom until `addr` is covered.
    /// Stops at the first page that would overlap an existing mapping.
    fn grow_stack(&mut self, addr: usize) -> Result<(), VmError> {
        let target = page_round_down(addr);
        while self.stack_bottom() > target {
            let va = self.stack_bottom() - PAGE_FRAME_SIZE;
            self.spt_mut().register_stack(va)?;
            if let Err(err) = self.spt_mut().claim(va) {
                // Leave the stack as it was.
                self.spt_mut().remove(va)?;
                return Err(err);
            }
            self.set_stack_bottom(va);
            debug!("fault: stack grew to {:#x}", va);
        }
        Ok(())
    }
}
