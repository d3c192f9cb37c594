//! Per-process page tables.
//!
//! `PageManager` keeps the same two-level layout the MMU walks (a directory of
//! 1024-entry page tables), and `access` performs that walk in software,
//! setting the accessed and dirty bits the way the hardware would.

use crate::mem::FrameNumber;
use alloc::{boxed::Box, collections::BTreeMap};
use kidneyos_shared::{
    mem::is_user_vaddr,
    paging::{PageTable, PageTableEntry, VirtualAddress},
};

/// Why a software page walk failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    /// No present mapping for the address.
    NotPresent,
    /// A present mapping that does not allow the access.
    Protection,
}

#[derive(Default)]
pub struct PageManager {
    tables: BTreeMap<usize, Box<PageTable>>,
}

impl PageManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, virt_addr: usize) -> Option<&PageTableEntry> {
        let addr = VirtualAddress::from(virt_addr);
        let table = self
            .tables
            .get(&(addr.page_directory_index().value() as usize))?;
        Some(&table[addr.page_table_index().value() as usize])
    }

    fn entry_mut(&mut self, virt_addr: usize) -> Option<&mut PageTableEntry> {
        let addr = VirtualAddress::from(virt_addr);
        let table = self
            .tables
            .get_mut(&(addr.page_directory_index().value() as usize))?;
        Some(&mut table[addr.page_table_index().value() as usize])
    }

    fn present_entry_mut(&mut self, virt_addr: usize) -> Option<&mut PageTableEntry> {
        self.entry_mut(virt_addr).filter(|entry| entry.present())
    }

    /// Install `entry` for the page containing `virt_addr`, allocating the
    /// page table if needed. Returns `false` if the slot is already present
    /// or the address belongs to the kernel.
    #[must_use]
    pub fn install(&mut self, virt_addr: usize, entry: PageTableEntry) -> bool {
        if !is_user_vaddr(virt_addr) || self.is_mapped(virt_addr) {
            return false;
        }

        let addr = VirtualAddress::from(virt_addr);
        let table = self
            .tables
            .entry(addr.page_directory_index().value() as usize)
            .or_default();
        table[addr.page_table_index().value() as usize] = entry;
        true
    }

    /// Map the page containing `virt_addr` to `frame` for user access.
    #[must_use]
    pub fn map(&mut self, virt_addr: usize, frame: FrameNumber, writable: bool) -> bool {
        self.install(virt_addr, PageTableEntry::user(frame, writable))
    }

    /// Mark the page containing `virt_addr` not present and return the entry
    /// it had, with its accessed and dirty bits as they were at removal.
    pub fn unmap(&mut self, virt_addr: usize) -> Option<PageTableEntry> {
        let addr = VirtualAddress::from(virt_addr);
        let dir_index = addr.page_directory_index().value() as usize;
        let table = self.tables.get_mut(&dir_index)?;
        let slot = &mut table[addr.page_table_index().value() as usize];
        if !slot.present() {
            return None;
        }

        let old = *slot;
        *slot = PageTableEntry::DEFAULT;
        if table.is_empty() {
            self.tables.remove(&dir_index);
        }
        Some(old)
    }

    pub fn is_mapped(&self, virt_addr: usize) -> bool {
        self.entry(virt_addr).is_some_and(|entry| entry.present())
    }

    /// The frame mapped at `virt_addr`, if any.
    pub fn translate(&self, virt_addr: usize) -> Option<FrameNumber> {
        self.entry(virt_addr)
            .filter(|entry| entry.present())
            .map(PageTableEntry::frame)
    }

    pub fn is_writable(&self, virt_addr: usize) -> bool {
        self.entry(virt_addr)
            .is_some_and(|entry| entry.present() && entry.read_write())
    }

    pub fn is_dirty(&self, virt_addr: usize) -> bool {
        self.entry(virt_addr)
            .is_some_and(|entry| entry.present() && entry.dirty())
    }

    pub fn set_dirty(&mut self, virt_addr: usize, dirty: bool) {
        if let Some(entry) = self.present_entry_mut(virt_addr) {
            *entry = entry.with_dirty(dirty);
        }
    }

    pub fn is_accessed(&self, virt_addr: usize) -> bool {
        self.entry(virt_addr)
            .is_some_and(|entry| entry.present() && entry.accessed())
    }

    pub fn set_accessed(&mut self, virt_addr: usize, accessed: bool) {
        if let Some(entry) = self.present_entry_mut(virt_addr) {
            *entry = entry.with_accessed(accessed);
        }
    }

    /// Walk the tables for a user access to `virt_addr`, as the MMU would.
    ///
    /// On success the accessed bit is set, and the dirty bit too for writes.
    pub fn access(&mut self, virt_addr: usize, write: bool) -> Result<FrameNumber, AccessFault> {
        let entry = self
            .present_entry_mut(virt_addr)
            .ok_or(AccessFault::NotPresent)?;
        if !entry.user_supervisor() || (write && !entry.read_write()) {
            return Err(AccessFault::Protection);
        }

        let mut updated = entry.with_accessed(true);
        if write {
            updated = updated.with_dirty(true);
        }
        *entry = updated;
        Ok(entry.frame())
    }

    /// Number of present mappings.
    pub fn len(&self) -> usize {
        self.tables
            .values()
            .map(|table| table.iter().filter(|entry| entry.present()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Drop every mapping.
    pub fn clear(&mut self) {
        self.tables.clear();
    }
}
