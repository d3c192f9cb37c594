//! File-backed pages and memory-mapped files.
//!
//! The file is the backing store: evicting a file-backed page writes it back
//! if dirty and never touches swap.

use super::{
    page::{LazyLoad, PageType},
    spt::SupplementalPageTable,
    Result, VmError,
};
use crate::vfs::File;
use alloc::sync::Arc;
use core::{cmp::min, fmt};
use kidneyos_shared::mem::{page_round_down, PAGE_FRAME_SIZE};
use log::{debug, warn};

/// A page-sized window onto a file: `length` bytes at `offset`, followed by
/// zeroes up to the end of the page.
#[derive(Clone)]
pub struct FileSegment {
    file: Arc<dyn File>,
    offset: usize,
    length: usize,
}

impl FileSegment {
    pub fn new(file: Arc<dyn File>, offset: usize, length: usize) -> Result<Self> {
        if length > PAGE_FRAME_SIZE {
            return Err(VmError::InvalidArgument("file segment longer than a page"));
        }
        Ok(Self {
            file,
            offset,
            length,
        })
    }

    pub fn file(&self) -> &Arc<dyn File> {
        &self.file
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// The same window over a different handle.
    pub(super) fn with_file(&self, file: Arc<dyn File>) -> Self {
        Self {
            file,
            offset: self.offset,
            length: self.length,
        }
    }

    /// Fill `frame` from the file, zeroing whatever the segment does not cover.
    pub(super) fn load(&self, frame: &mut [u8; PAGE_FRAME_SIZE]) -> Result<()> {
        self.file.seek(self.offset);
        let read = self.file.read(&mut frame[..self.length])?;
        if read != self.length {
            warn!(
                "file: short read of inode {} at {:#x}: {} of {} bytes",
                self.file.inode(),
                self.offset,
                read,
                self.length
            );
            return Err(VmError::ShortRead {
                expected: self.length,
                actual: read,
            });
        }
        frame[self.length..].fill(0);
        Ok(())
    }

    /// Write the covered part of `frame` back to the file.
    pub(super) fn write_back(&self, frame: &[u8; PAGE_FRAME_SIZE]) -> Result<()> {
        let written = self.file.write_at(&frame[..self.length], self.offset)?;
        if written != self.length {
            return Err(VmError::ShortWrite {
                expected: self.length,
                actual: written,
            });
        }
        debug!(
            "file: wrote back {} bytes of inode {} at {:#x}",
            written,
            self.file.inode(),
            self.offset
        );
        Ok(())
    }
}

impl fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileSegment")
            .field("inode", &self.file.inode())
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

/// Backend state of a materialized file-backed page.
#[derive(Debug)]
pub struct FilePage {
    segment: FileSegment,
}

impl FilePage {
    pub(super) fn new(segment: FileSegment) -> Self {
        Self { segment }
    }

    pub fn segment(&self) -> &FileSegment {
        &self.segment
    }

    pub(super) fn swap_in(&self, frame: &mut [u8; PAGE_FRAME_SIZE]) -> Result<()> {
        self.segment.load(frame)
    }

    /// Write the frame back if the page was dirty. A clean page needs no I/O;
    /// its contents can be read from the file again.
    pub(super) fn swap_out(&self, frame: &[u8; PAGE_FRAME_SIZE], dirty: bool) -> Result<()> {
        if dirty {
            self.segment.write_back(frame)?;
        }
        Ok(())
    }
}

/// Register lazy file-backed pages for `length` bytes of `file` starting at
/// `offset`, mapped at `addr`. The mapping holds its own handle on the file.
///
/// Only the part of the file that exists is mapped: the mapping covers
/// `min(length, file length - offset)` bytes, rounded up to whole pages.
pub(super) fn do_mmap(
    spt: &mut SupplementalPageTable,
    addr: usize,
    length: usize,
    writable: bool,
    file: &Arc<dyn File>,
    offset: usize,
) -> Result<usize> {
    let file = file.reopen()?;
    let available = file.len().saturating_sub(offset);
    if available == 0 {
        return Err(VmError::InvalidArgument("offset at or past end of file"));
    }

    let mut remaining = min(length, available);
    let mut page_offset = offset;
    let mut upage = addr;
    while remaining > 0 {
        let page_read_bytes = min(remaining, PAGE_FRAME_SIZE);
        let registered = FileSegment::new(file.clone(), page_offset, page_read_bytes).and_then(
            |segment| spt.register(upage, writable, PageType::FileBacked, LazyLoad::File(segment)),
        );
        if let Err(err) = registered {
            spt.roll_back(addr, upage);
            return Err(err);
        }

        remaining -= page_read_bytes;
        page_offset += PAGE_FRAME_SIZE;
        upage += PAGE_FRAME_SIZE;
    }

    debug!(
        "mmap: inode {} offset {:#x} at {:#x}..{:#x}",
        file.inode(),
        offset,
        addr,
        upage
    );
    Ok(addr)
}

/// Unmap the mapping that starts at `addr`, writing back dirty pages.
///
/// The walk goes up page by page and stops at the first address with no page
/// or with a page from a different mapping. Returns the number of pages
/// unmapped.
pub(super) fn do_munmap(spt: &mut SupplementalPageTable, addr: usize) -> usize {
    let mut va = page_round_down(addr);
    let Some(file) = mapped_file(spt, va) else {
        return 0;
    };

    let mut unmapped = 0;
    while mapped_file(spt, va).is_some_and(|other| Arc::ptr_eq(&other, &file)) {
        if let Err(err) = spt.remove(va) {
            warn!("munmap: failed to remove {:#x}: {}", va, err);
            break;
        }
        unmapped += 1;
        va += PAGE_FRAME_SIZE;
    }

    debug!("munmap: {} pages from {:#x}", unmapped, page_round_down(addr));
    unmapped
}

fn mapped_file(spt: &SupplementalPageTable, va: usize) -> Option<Arc<dyn File>> {
    let page = spt.find(va)?;
    let page = page.lock();
    page.file_segment().map(|segment| segment.file().clone())
}
