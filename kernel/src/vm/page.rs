//! Virtual pages and their backends.
//!
//! A page starts out [`PageKind::Uninit`]: registered, but holding only a
//! recipe for its first contents. The first `swap_in` runs that recipe and
//! turns the page into the anonymous or file-backed kind it was destined to
//! be. After that it moves between resident (holding a frame) and evicted
//! (contents in swap or in the file) until it is destroyed.

use super::{
    anon::AnonPage,
    file::{FilePage, FileSegment},
    Result, Vm, VmError,
};
use crate::mem::FrameNumber;
use crate::paging::PageManager;
use crate::sync::mutex::Mutex;
use alloc::sync::Arc;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, trace, warn};

pub type PageRef = Arc<Mutex<Page>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Anonymous,
    FileBacked,
}

/// How a page gets its first contents.
#[derive(Debug, Clone)]
pub enum LazyLoad {
    /// A page of zeroes.
    Zero,
    /// A page read from a file.
    File(FileSegment),
}

impl LazyLoad {
    fn load(&self, frame: &mut [u8; PAGE_FRAME_SIZE]) -> Result<()> {
        match self {
            LazyLoad::Zero => {
                frame.fill(0);
                Ok(())
            }
            LazyLoad::File(segment) => segment.load(frame),
        }
    }
}

/// A page that has never been faulted in.
#[derive(Debug, Clone)]
pub enum UninitPage {
    /// Becomes anonymous; loaded from a file (an executable's data segment)
    /// or zero-filled.
    Anonymous(LazyLoad),
    /// Becomes a file-backed page over this segment.
    FileBacked(FileSegment),
}

impl UninitPage {
    pub fn new(page_type: PageType, loader: LazyLoad) -> Result<Self> {
        match (page_type, loader) {
            (PageType::Anonymous, loader) => Ok(UninitPage::Anonymous(loader)),
            (PageType::FileBacked, LazyLoad::File(segment)) => Ok(UninitPage::FileBacked(segment)),
            (PageType::FileBacked, LazyLoad::Zero) => Err(VmError::InvalidArgument(
                "file-backed page needs a file to load from",
            )),
        }
    }

    pub fn page_type(&self) -> PageType {
        match self {
            UninitPage::Anonymous(_) => PageType::Anonymous,
            UninitPage::FileBacked(_) => PageType::FileBacked,
        }
    }

    pub fn file_segment(&self) -> Option<&FileSegment> {
        match self {
            UninitPage::Anonymous(LazyLoad::File(segment)) | UninitPage::FileBacked(segment) => {
                Some(segment)
            }
            UninitPage::Anonymous(LazyLoad::Zero) => None,
        }
    }

    /// The same recipe with its file segment (if any) replaced.
    pub(super) fn with_segment(&self, segment: FileSegment) -> Self {
        match self {
            UninitPage::Anonymous(LazyLoad::Zero) => UninitPage::Anonymous(LazyLoad::Zero),
            UninitPage::Anonymous(LazyLoad::File(_)) => {
                UninitPage::Anonymous(LazyLoad::File(segment))
            }
            UninitPage::FileBacked(_) => UninitPage::FileBacked(segment),
        }
    }

    fn load(&self, frame: &mut [u8; PAGE_FRAME_SIZE]) -> Result<()> {
        match self {
            UninitPage::Anonymous(loader) => loader.load(frame),
            UninitPage::FileBacked(segment) => segment.load(frame),
        }
    }

    /// The backend this page turns into once loaded.
    fn materialize(&self) -> PageKind {
        match self {
            UninitPage::Anonymous(_) => PageKind::Anonymous(AnonPage::new()),
            UninitPage::FileBacked(segment) => PageKind::FileBacked(FilePage::new(segment.clone())),
        }
    }
}

#[derive(Debug)]
pub enum PageKind {
    Uninit(UninitPage),
    Anonymous(AnonPage),
    FileBacked(FilePage),
}

pub struct Page {
    va: usize,
    writable: bool,
    /// Part of the process stack.
    stack: bool,
    frame: Option<FrameNumber>,
    kind: PageKind,
    page_manager: Arc<Mutex<PageManager>>,
}

impl Page {
    pub(super) fn new(
        va: usize,
        writable: bool,
        kind: PageKind,
        page_manager: Arc<Mutex<PageManager>>,
    ) -> Self {
        Self {
            va,
            writable,
            stack: false,
            frame: None,
            kind,
            page_manager,
        }
    }

    pub(super) fn into_stack(mut self) -> Self {
        self.stack = true;
        self
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_stack(&self) -> bool {
        self.stack
    }

    pub fn frame(&self) -> Option<FrameNumber> {
        self.frame
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    /// The page's type; for a page not yet loaded, the type it will become.
    pub fn page_type(&self) -> PageType {
        match &self.kind {
            PageKind::Uninit(uninit) => uninit.page_type(),
            PageKind::Anonymous(_) => PageType::Anonymous,
            PageKind::FileBacked(_) => PageType::FileBacked,
        }
    }

    /// The file window behind a page that is, or will become, file-backed.
    pub fn file_segment(&self) -> Option<&FileSegment> {
        match &self.kind {
            PageKind::Uninit(UninitPage::FileBacked(segment)) => Some(segment),
            PageKind::FileBacked(file) => Some(file.segment()),
            _ => None,
        }
    }

    pub(super) fn bind(&mut self, frame: FrameNumber) {
        self.frame = Some(frame);
    }

    pub(super) fn unbind(&mut self) {
        self.frame = None;
    }

    /// Fill `frame` with this page's contents.
    ///
    /// An uninitialized page runs its loader and becomes anonymous or
    /// file-backed; the others read back from swap or from their file.
    pub fn swap_in(&mut self, vm: &Vm, frame: FrameNumber) -> Result<()> {
        let mut data = vm.frames().memory().frame(frame);
        trace!(
            "page: swap in {:#x} ({:?}) to frame {}",
            self.va,
            self.page_type(),
            frame
        );
        match &mut self.kind {
            PageKind::Uninit(uninit) => {
                uninit.load(&mut data)?;
                let loaded = uninit.materialize();
                self.kind = loaded;
                Ok(())
            }
            PageKind::Anonymous(anon) => anon.swap_in(vm.swap(), &mut data),
            PageKind::FileBacked(file) => file.swap_in(&mut data),
        }
    }

    /// Move this resident page's contents to its backing store and give up its
    /// frame.
    ///
    /// The mapping is removed before the contents are saved, so the owner
    /// faults instead of writing to a frame that is being copied out. On
    /// failure the mapping is put back and the page stays resident.
    pub fn swap_out(&mut self, vm: &Vm) -> Result<()> {
        let frame = self.frame.ok_or(VmError::NotResident(self.va))?;
        let entry = self.page_manager.lock().unmap(self.va);
        let dirty = entry.is_some_and(|entry| entry.dirty());

        let result = {
            let data = vm.frames().memory().frame(frame);
            match &mut self.kind {
                PageKind::Uninit(_) => Err(VmError::NotResident(self.va)),
                PageKind::Anonymous(anon) => anon.swap_out(vm.swap(), &data),
                PageKind::FileBacked(file) => file.swap_out(&data, dirty),
            }
        };

        if let Err(err) = result {
            if let Some(entry) = entry {
                if !self.page_manager.lock().install(self.va, entry) {
                    warn!("page: could not restore mapping for {:#x}", self.va);
                }
            }
            return Err(err);
        }

        debug!("page: swapped out {:#x} from frame {}", self.va, frame);
        self.frame = None;
        Ok(())
    }

    /// Release everything this page holds: write back a dirty file-backed
    /// page, free its frame and free its swap slot. Safe to call more than
    /// once.
    pub fn destroy(&mut self, vm: &Vm) {
        if let Some(frame) = self.frame.take() {
            let entry = self.page_manager.lock().unmap(self.va);
            if let PageKind::FileBacked(file) = &self.kind {
                let dirty = entry.is_some_and(|entry| entry.dirty());
                let data = vm.frames().memory().frame(frame);
                if let Err(err) = file.swap_out(&data, dirty) {
                    warn!("page: write back of {:#x} failed: {}", self.va, err);
                }
            }
            vm.frames().release(frame);
        }

        if let PageKind::Anonymous(anon) = &mut self.kind {
            anon.destroy(vm.swap());
        }
    }
}
