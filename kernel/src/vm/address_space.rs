//! A process's user address space: its supplemental page table, page
//! directory and stack, plus the entry points the loader and the mmap system
//! calls go through.

use super::{
    fault::{FaultError, PageFault},
    file::{do_mmap, do_munmap, FileSegment},
    page::{LazyLoad, PageType},
    spt::SupplementalPageTable,
    Result, Vm, VmError,
};
use crate::paging::{AccessFault, PageManager};
use crate::sync::mutex::Mutex;
use crate::vfs::File;
use alloc::sync::Arc;
use core::cmp::min;
use kidneyos_shared::mem::{is_user_vaddr, page_offset, PAGE_FRAME_SIZE};
use log::{debug, trace};

pub struct AddressSpace {
    spt: SupplementalPageTable,
    /// Lowest address of the stack; equal to the stack top before `setup_stack`.
    stack_bottom: usize,
    /// User stack pointer saved on the most recent entry into the kernel.
    user_sp: usize,
    faults: usize,
}

impl AddressSpace {
    pub fn new(vm: Arc<Vm>) -> Self {
        let top = vm.config().user_stack_top;
        Self {
            spt: SupplementalPageTable::new(vm),
            stack_bottom: top,
            user_sp: top,
            faults: 0,
        }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        self.spt.vm()
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    pub fn spt_mut(&mut self) -> &mut SupplementalPageTable {
        &mut self.spt
    }

    pub fn page_manager(&self) -> &Arc<Mutex<PageManager>> {
        self.spt.page_manager()
    }

    pub fn stack_bottom(&self) -> usize {
        self.stack_bottom
    }

    pub(super) fn set_stack_bottom(&mut self, stack_bottom: usize) {
        self.stack_bottom = stack_bottom;
    }

    pub fn user_sp(&self) -> usize {
        self.user_sp
    }

    /// Number of page faults resolved by `read_user`/`write_user`.
    pub fn fault_count(&self) -> usize {
        self.faults
    }

    /// Record the user stack pointer on a user to kernel transition.
    pub fn enter_kernel(&mut self, user_sp: usize) {
        self.user_sp = user_sp;
    }

    /// Map the first stack page right below the stack top. Returns the initial
    /// user stack pointer.
    pub fn setup_stack(&mut self) -> Result<usize> {
        let top = self.vm().config().user_stack_top;
        let va = top - PAGE_FRAME_SIZE;
        self.spt.register_stack(va)?;
        if let Err(err) = self.spt.claim(va) {
            self.spt.remove(va)?;
            return Err(err);
        }
        self.stack_bottom = va;
        self.user_sp = top;
        debug!("stack: {:#x}..{:#x}", va, top);
        Ok(top)
    }

    /// Register a program segment lazily: `read_bytes` bytes of `file` from
    /// `offset` are mapped at `upage`, followed by `zero_bytes` zeroes.
    pub fn load_segment(
        &mut self,
        file: &Arc<dyn File>,
        offset: usize,
        upage: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        if page_offset(upage) != 0 || page_offset(offset) != 0 {
            return Err(VmError::InvalidArgument("segment not page aligned"));
        }
        if (read_bytes + zero_bytes) % PAGE_FRAME_SIZE != 0 {
            return Err(VmError::InvalidArgument("segment size not a page multiple"));
        }

        let file = file.reopen()?;
        let start = upage;
        let mut read_bytes = read_bytes;
        let mut zero_bytes = zero_bytes;
        let mut offset = offset;
        let mut upage = upage;
        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = min(read_bytes, PAGE_FRAME_SIZE);
            let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

            let loader = if page_read_bytes == 0 {
                Ok(LazyLoad::Zero)
            } else {
                FileSegment::new(file.clone(), offset, page_read_bytes).map(LazyLoad::File)
            };
            let registered = loader
                .and_then(|loader| self.spt.register(upage, writable, PageType::Anonymous, loader));
            if let Err(err) = registered {
                self.spt.roll_back(start, upage);
                return Err(err);
            }

            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            offset += page_read_bytes;
            upage += PAGE_FRAME_SIZE;
        }
        Ok(())
    }

    /// Map `length` bytes of `file` from `offset` at `addr`. Returns `addr`.
    pub fn mmap(
        &mut self,
        addr: usize,
        length: usize,
        writable: bool,
        file: &Arc<dyn File>,
        offset: usize,
    ) -> Result<usize> {
        if addr == 0 || page_offset(addr) != 0 {
            return Err(VmError::InvalidArgument("mmap address"));
        }
        if length == 0 {
            return Err(VmError::InvalidArgument("mmap length"));
        }
        let end = addr
            .checked_add(length)
            .ok_or(VmError::InvalidArgument("mmap range"))?;
        if !is_user_vaddr(addr) || !is_user_vaddr(end - 1) {
            return Err(VmError::InvalidArgument("mmap range"));
        }
        if page_offset(offset) != 0 {
            return Err(VmError::InvalidArgument("mmap offset"));
        }
        if self.spt.find(addr).is_some() {
            return Err(VmError::AlreadyMapped(addr));
        }
        if file.is_empty() {
            return Err(VmError::InvalidArgument("mmap of an empty file"));
        }

        do_mmap(&mut self.spt, addr, length, writable, file, offset)
    }

    /// Unmap the mapping at `addr`. Returns the number of pages removed.
    pub fn munmap(&mut self, addr: usize) -> usize {
        do_munmap(&mut self.spt, addr)
    }

    /// A copy of this address space for a child process.
    pub fn fork(&self) -> Result<AddressSpace> {
        let mut child = AddressSpace::new(self.vm().clone());
        child.spt.fork_copy(&self.spt)?;
        child.stack_bottom = self.stack_bottom;
        child.user_sp = self.user_sp;
        Ok(child)
    }

    /// Copy `buf.len()` bytes from user address `va`, faulting pages in as
    /// the hardware would.
    pub fn read_user(&mut self, va: usize, buf: &mut [u8]) -> core::result::Result<(), FaultError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done;
            let chunk = min(buf.len() - done, PAGE_FRAME_SIZE - page_offset(addr));
            let copied = self.with_user_page(addr, false, |page| {
                let start = page_offset(addr);
                buf[done..done + chunk].copy_from_slice(&page[start..start + chunk]);
            })?;
            if copied {
                done += chunk;
            }
        }
        Ok(())
    }

    /// Copy `buf` to user address `va`, faulting pages in as the hardware
    /// would.
    pub fn write_user(&mut self, va: usize, buf: &[u8]) -> core::result::Result<(), FaultError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done;
            let chunk = min(buf.len() - done, PAGE_FRAME_SIZE - page_offset(addr));
            let copied = self.with_user_page(addr, true, |page| {
                let start = page_offset(addr);
                page[start..start + chunk].copy_from_slice(&buf[done..done + chunk]);
            })?;
            if copied {
                done += chunk;
            }
        }
        Ok(())
    }

    /// Run `f` on the frame mapped at `addr` if the access succeeds, otherwise
    /// resolve the fault. Returns whether `f` ran.
    fn with_user_page<F>(&mut self, addr: usize, write: bool, f: F) -> core::result::Result<bool, FaultError>
    where
        F: FnOnce(&mut [u8; PAGE_FRAME_SIZE]),
    {
        let vm = self.vm().clone();
        let access = {
            let mut page_manager = self.page_manager().lock();
            let access = page_manager.access(addr, write);
            if let Ok(frame) = access {
                // The directory stays locked so the frame cannot be evicted
                // underneath the copy.
                f(&mut vm.frames().memory().frame(frame));
            }
            access
        };

        match access {
            Ok(_) => Ok(true),
            Err(fault) => {
                trace!("access: {:?} at {:#x}", fault, addr);
                self.handle_page_fault(PageFault {
                    addr,
                    user: true,
                    write,
                    not_present: fault == AccessFault::NotPresent,
                })?;
                self.faults += 1;
                Ok(false)
            }
        }
    }

    /// Release every page, writing dirty file-backed pages back.
    pub fn exit(mut self) {
        self.spt.teardown();
        self.page_manager().lock().clear();
    }
}
