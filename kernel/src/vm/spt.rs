//! The supplemental page table: every page an address space has registered,
//! keyed by page-aligned virtual address.

use super::{
    anon::AnonPage,
    file::{FilePage, FileSegment},
    frame::FrameEntry,
    page::{LazyLoad, Page, PageKind, PageRef, PageType, UninitPage},
    Result, Vm, VmError,
};
use crate::mem::frame_allocator::Frame;
use crate::paging::PageManager;
use crate::sync::mutex::Mutex;
use crate::vfs::File;
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use kidneyos_shared::mem::{is_user_vaddr, page_round_down, PAGE_FRAME_SIZE};
use log::{debug, warn};

/// What a child needs to rebuild one parent page.
enum ForkSource {
    /// Never loaded: the child loads it on its own.
    Lazy(UninitPage),
    /// Contents copied from the parent's frame or swap slot.
    Copied {
        segment: Option<FileSegment>,
        contents: Frame,
        dirty: bool,
    },
    /// A clean file page, evicted: the file has the contents.
    Evicted(FileSegment),
}

pub struct SupplementalPageTable {
    vm: Arc<Vm>,
    page_manager: Arc<Mutex<PageManager>>,
    pages: BTreeMap<usize, PageRef>,
}

impl SupplementalPageTable {
    /// An empty table with a fresh page directory.
    pub fn new(vm: Arc<Vm>) -> Self {
        Self {
            vm,
            page_manager: Arc::new(Mutex::new(PageManager::new())),
            pages: BTreeMap::new(),
        }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn page_manager(&self) -> &Arc<Mutex<PageManager>> {
        &self.page_manager
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Registered page addresses, in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = usize> + '_ {
        self.pages.keys().copied()
    }

    /// Register an uninitialized page covering `va`. Its contents come from
    /// `loader` on first fault.
    pub fn register(
        &mut self,
        va: usize,
        writable: bool,
        page_type: PageType,
        loader: LazyLoad,
    ) -> Result<()> {
        let uninit = UninitPage::new(page_type, loader)?;
        self.insert(page_round_down(va), writable, PageKind::Uninit(uninit), false)?;
        Ok(())
    }

    /// Register a zero-filled anonymous stack page at `va`.
    pub(super) fn register_stack(&mut self, va: usize) -> Result<()> {
        let uninit = UninitPage::Anonymous(LazyLoad::Zero);
        self.insert(page_round_down(va), true, PageKind::Uninit(uninit), true)?;
        Ok(())
    }

    fn insert(&mut self, va: usize, writable: bool, kind: PageKind, stack: bool) -> Result<PageRef> {
        if !is_user_vaddr(va) {
            return Err(VmError::InvalidArgument("page outside user space"));
        }
        if self.pages.contains_key(&va) {
            warn!("spt: {:#x} is already registered", va);
            return Err(VmError::AlreadyMapped(va));
        }

        let mut page = Page::new(va, writable, kind, self.page_manager.clone());
        if stack {
            page = page.into_stack();
        }
        debug!(
            "spt: register {:#x} ({:?}{})",
            va,
            page.page_type(),
            if writable { ", writable" } else { "" }
        );
        let page = Arc::new(Mutex::new(page));
        self.pages.insert(va, page.clone());
        Ok(page)
    }

    /// The page containing `va`.
    pub fn find(&self, va: usize) -> Option<PageRef> {
        self.pages.get(&page_round_down(va)).cloned()
    }

    /// Bring the page containing `va` into memory and map it.
    pub fn claim(&mut self, va: usize) -> Result<()> {
        let page = self
            .find(va)
            .ok_or(VmError::NotMapped(page_round_down(va)))?;
        self.do_claim(&page, None)
    }

    /// Resolve a not-present fault on the page containing `va`.
    ///
    /// A fault can race with a failed eviction of the same page: the evictor
    /// unmaps the page, cannot save it, and maps it again while the faulting
    /// thread waits on the page lock. Such a page is resident and mapped by
    /// the time the lock is ours, and the fault is already resolved.
    pub(super) fn fault_in(&mut self, va: usize) -> Result<()> {
        let page = self
            .find(va)
            .ok_or(VmError::NotMapped(page_round_down(va)))?;
        let mut guard = page.lock();
        if guard.is_resident() && self.page_manager.lock().is_mapped(guard.va()) {
            debug!("spt: {:#x} is back in place, nothing to claim", guard.va());
            return Ok(());
        }
        self.claim_locked(&page, &mut guard, None)
    }

    fn do_claim(&self, page: &PageRef, contents: Option<&Frame>) -> Result<()> {
        let mut guard = page.lock();
        self.claim_locked(page, &mut guard, contents)
    }

    /// Give `page`, locked as `guard`, a frame, map it, then fill it from its
    /// backend, or from `contents` if given. Each step is undone if a later
    /// one fails.
    fn claim_locked(
        &self,
        page: &PageRef,
        guard: &mut Page,
        contents: Option<&Frame>,
    ) -> Result<()> {
        let va = guard.va();
        if guard.is_resident() || self.page_manager.lock().is_mapped(va) {
            return Err(VmError::SlotOccupied(va));
        }

        let frame = self
            .vm
            .acquire_frame(FrameEntry::new(page, va, &self.page_manager))?;
        guard.bind(frame);

        if !self.page_manager.lock().map(va, frame, guard.is_writable()) {
            guard.unbind();
            self.vm.frames().release(frame);
            return Err(VmError::SlotOccupied(va));
        }

        let filled = match contents {
            Some(contents) => {
                self.vm.frames().memory().frame(frame).copy_from_slice(&contents[..]);
                Ok(())
            }
            None => guard.swap_in(&self.vm, frame),
        };
        if let Err(err) = filled {
            warn!("spt: claim of {:#x} failed: {}", va, err);
            self.page_manager.lock().unmap(va);
            guard.unbind();
            self.vm.frames().release(frame);
            return Err(err);
        }

        self.vm.frames().unpin(frame);
        debug!("spt: claimed {:#x} in frame {}", va, frame);
        Ok(())
    }

    /// Destroy the page containing `va` and forget it.
    pub fn remove(&mut self, va: usize) -> Result<()> {
        let va = page_round_down(va);
        let page = self.pages.remove(&va).ok_or(VmError::NotMapped(va))?;
        page.lock().destroy(&self.vm);
        Ok(())
    }

    /// Remove the pages in `start..end` registered by a call that then failed
    /// part way.
    pub(super) fn roll_back(&mut self, start: usize, end: usize) {
        for va in (start..end).step_by(PAGE_FRAME_SIZE) {
            if let Err(err) = self.remove(va) {
                warn!("spt: rollback of {:#x} failed: {}", va, err);
            }
        }
    }

    /// Copy every page of `parent` into this table, for fork.
    ///
    /// Unloaded pages are registered again with the same recipe. Loaded pages
    /// get a private copy of the parent's contents right away, whether those
    /// are in a frame or in swap. File handles are reopened so the child's
    /// reads never move the parent's file position.
    pub fn fork_copy(&mut self, parent: &SupplementalPageTable) -> Result<()> {
        let mut files = ReopenedFiles::default();
        let parent_pages: Vec<PageRef> = parent.pages.values().cloned().collect();

        for parent_page in parent_pages {
            let (va, writable, stack, source) = {
                let page = parent_page.lock();
                let source = parent.fork_source(&page)?;
                (page.va(), page.is_writable(), page.is_stack(), source)
            };

            match source {
                ForkSource::Lazy(uninit) => {
                    let uninit = match uninit.file_segment() {
                        Some(segment) => uninit.with_segment(files.reopen(segment)?),
                        None => uninit,
                    };
                    self.insert(va, writable, PageKind::Uninit(uninit), stack)?;
                }
                ForkSource::Copied {
                    segment,
                    contents,
                    dirty,
                } => {
                    let kind = match segment {
                        Some(segment) => PageKind::FileBacked(FilePage::new(files.reopen(&segment)?)),
                        None => PageKind::Anonymous(AnonPage::new()),
                    };
                    let page = self.insert(va, writable, kind, stack)?;
                    self.do_claim(&page, Some(&contents))?;
                    if dirty {
                        self.page_manager.lock().set_dirty(va, true);
                    }
                }
                ForkSource::Evicted(segment) => {
                    let uninit = UninitPage::FileBacked(files.reopen(&segment)?);
                    self.insert(va, writable, PageKind::Uninit(uninit), stack)?;
                }
            }
        }

        debug!("spt: forked {} pages", self.pages.len());
        Ok(())
    }

    /// Snapshot what a child needs from `page`, which the caller has locked.
    fn fork_source(&self, page: &Page) -> Result<ForkSource> {
        let source = match (page.kind(), page.frame()) {
            (PageKind::Uninit(uninit), _) => ForkSource::Lazy(uninit.clone()),
            (kind, Some(frame)) => {
                let mut contents: Frame = Box::new([0; PAGE_FRAME_SIZE]);
                contents.copy_from_slice(&self.vm.frames().memory().frame(frame)[..]);
                let segment = match kind {
                    PageKind::FileBacked(file) => Some(file.segment().clone()),
                    _ => None,
                };
                ForkSource::Copied {
                    segment,
                    contents,
                    dirty: self.page_manager.lock().is_dirty(page.va()),
                }
            }
            (PageKind::Anonymous(anon), None) => {
                // Read the slot without releasing it; it still belongs to the parent.
                let slot = anon.slot().ok_or(VmError::NotSwapped)?;
                let mut contents: Frame = Box::new([0; PAGE_FRAME_SIZE]);
                self.vm.swap().read_slot(slot, &mut contents)?;
                ForkSource::Copied {
                    segment: None,
                    contents,
                    dirty: false,
                }
            }
            (PageKind::FileBacked(file), None) => ForkSource::Evicted(file.segment().clone()),
        };
        Ok(source)
    }

    /// Destroy every page: dirty file-backed pages are written back, frames
    /// and swap slots are released.
    pub fn teardown(&mut self) {
        let pages = core::mem::take(&mut self.pages);
        if pages.is_empty() {
            return;
        }
        debug!("spt: tearing down {} pages", pages.len());
        for page in pages.into_values() {
            page.lock().destroy(&self.vm);
        }
    }
}

impl Drop for SupplementalPageTable {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// One new handle per parent handle, shared by all of a mapping's pages.
#[derive(Default)]
struct ReopenedFiles {
    files: BTreeMap<usize, Arc<dyn File>>,
}

impl ReopenedFiles {
    fn reopen(&mut self, segment: &FileSegment) -> Result<FileSegment> {
        let key = Arc::as_ptr(segment.file()).cast::<()>() as usize;
        let file = match self.files.get(&key) {
            Some(file) => file.clone(),
            None => {
                let file = segment.file().reopen()?;
                self.files.insert(key, file.clone());
                file
            }
        };
        Ok(segment.with_file(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_vm;
    use crate::vfs::tempfs::TempFs;

    const BASE: usize = 0x1000_0000;

    #[test]
    fn test_find_rounds_down() {
        let vm = test_vm(2, 2);
        let mut spt = SupplementalPageTable::new(vm);
        for addr in [BASE, BASE + 1, BASE + 0x7ff, BASE + 0x1fff] {
            spt.register(addr, true, PageType::Anonymous, LazyLoad::Zero)
                .or_else(|err| match err {
                    VmError::AlreadyMapped(_) => Ok(()),
                    err => Err(err),
                })
                .unwrap();
            let page = spt.find(addr).unwrap();
            assert_eq!(page.lock().va(), page_round_down(addr));
        }
        assert_eq!(spt.len(), 2);
        assert!(spt.find(BASE + 2 * PAGE_FRAME_SIZE).is_none());
    }

    #[test]
    fn test_double_register_rejected() {
        let vm = test_vm(2, 2);
        let mut spt = SupplementalPageTable::new(vm);
        spt.register(BASE, false, PageType::Anonymous, LazyLoad::Zero).unwrap();
        assert_eq!(
            spt.register(BASE + 8, true, PageType::Anonymous, LazyLoad::Zero),
            Err(VmError::AlreadyMapped(BASE))
        );
        // The first registration is kept.
        assert!(!spt.find(BASE).unwrap().lock().is_writable());
    }

    #[test]
    fn test_register_kernel_address() {
        let vm = test_vm(1, 1);
        let mut spt = SupplementalPageTable::new(vm);
        assert!(matches!(
            spt.register(kidneyos_shared::mem::OFFSET, true, PageType::Anonymous, LazyLoad::Zero),
            Err(VmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_claim_maps_and_loads() {
        let vm = test_vm(2, 2);
        let mut spt = SupplementalPageTable::new(vm.clone());
        assert_eq!(spt.claim(BASE), Err(VmError::NotMapped(BASE)));

        spt.register(BASE, true, PageType::Anonymous, LazyLoad::Zero).unwrap();
        spt.claim(BASE + 12).unwrap();
        let frame = spt.find(BASE).unwrap().lock().frame().unwrap();
        assert_eq!(spt.page_manager().lock().translate(BASE), Some(frame));
        assert!(!vm.frames().is_pinned(frame));

        assert_eq!(spt.claim(BASE), Err(VmError::SlotOccupied(BASE)));
    }

    #[test]
    fn test_failed_load_is_undone() {
        let vm = test_vm(2, 2);
        let fs = TempFs::new();
        let file = fs.open(fs.create(&[1; 10])).unwrap();
        // Asks for more bytes than the file has.
        let segment = FileSegment::new(file, 0, 20).unwrap();

        let mut spt = SupplementalPageTable::new(vm.clone());
        spt.register(BASE, true, PageType::Anonymous, LazyLoad::File(segment)).unwrap();
        assert!(matches!(spt.claim(BASE), Err(VmError::ShortRead { .. })));

        let page = spt.find(BASE).unwrap();
        assert!(!page.lock().is_resident());
        assert!(matches!(page.lock().kind(), PageKind::Uninit(_)));
        assert!(!spt.page_manager().lock().is_mapped(BASE));
        assert_eq!(vm.frames().resident(), 0);
    }

    #[test]
    fn test_swap_round_trip_through_eviction() {
        let vm = test_vm(1, 2);
        let mut spt = SupplementalPageTable::new(vm.clone());
        spt.register(BASE, true, PageType::Anonymous, LazyLoad::Zero).unwrap();
        spt.register(BASE + PAGE_FRAME_SIZE, true, PageType::Anonymous, LazyLoad::Zero)
            .unwrap();

        spt.claim(BASE).unwrap();
        {
            let frame = spt.find(BASE).unwrap().lock().frame().unwrap();
            let mut data = vm.frames().memory().frame(frame);
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = (i * 7) as u8;
            }
        }

        // Only one frame: the second claim evicts the first page.
        spt.claim(BASE + PAGE_FRAME_SIZE).unwrap();
        let first = spt.find(BASE).unwrap();
        assert!(!first.lock().is_resident());
        assert_eq!(vm.swap().used_slots(), 1);

        spt.claim(BASE).unwrap();
        let frame = first.lock().frame().unwrap();
        let data = vm.frames().memory().frame(frame);
        assert!(data.iter().enumerate().all(|(i, &b)| b == (i * 7) as u8));
        // The second page went to swap in turn, and the first page's slot was freed.
        assert_eq!(vm.swap().used_slots(), 1);
    }

    #[test]
    fn test_destroy_evicted_page_frees_slot_once() {
        let vm = test_vm(1, 2);
        let mut spt = SupplementalPageTable::new(vm.clone());
        spt.register(BASE, true, PageType::Anonymous, LazyLoad::Zero).unwrap();
        spt.register(BASE + PAGE_FRAME_SIZE, true, PageType::Anonymous, LazyLoad::Zero)
            .unwrap();
        spt.claim(BASE).unwrap();
        spt.claim(BASE + PAGE_FRAME_SIZE).unwrap();

        let evicted = spt.find(BASE).unwrap();
        spt.remove(BASE).unwrap();
        assert_eq!(vm.swap().used_slots(), 0);
        assert_eq!(vm.frames().resident(), 1);

        // Destroying again releases nothing more.
        evicted.lock().destroy(&vm);
        assert_eq!(vm.swap().used_slots(), 0);
        assert_eq!(vm.frames().resident(), 1);
        assert_eq!(spt.remove(BASE), Err(VmError::NotMapped(BASE)));
    }

    #[test]
    fn test_fork_isolation() {
        let vm = test_vm(4, 4);
        let mut parent = SupplementalPageTable::new(vm.clone());
        parent.register(BASE, true, PageType::Anonymous, LazyLoad::Zero).unwrap();
        parent.claim(BASE).unwrap();
        let parent_frame = parent.find(BASE).unwrap().lock().frame().unwrap();
        vm.frames().memory().frame(parent_frame)[0] = 1;

        let mut child = SupplementalPageTable::new(vm.clone());
        child.fork_copy(&parent).unwrap();
        let child_frame = child.find(BASE).unwrap().lock().frame().unwrap();
        assert_ne!(child_frame, parent_frame);
        assert_eq!(vm.frames().memory().frame(child_frame)[0], 1);

        vm.frames().memory().frame(child_frame)[0] = 2;
        assert_eq!(vm.frames().memory().frame(parent_frame)[0], 1);
    }

    #[test]
    fn test_fork_keeps_lazy_pages_lazy() {
        let vm = test_vm(2, 2);
        let fs = TempFs::new();
        let file = fs.open(fs.create(&[3; PAGE_FRAME_SIZE])).unwrap();
        let mut parent = SupplementalPageTable::new(vm.clone());
        let segment = FileSegment::new(file.clone(), 0, PAGE_FRAME_SIZE).unwrap();
        parent.register(BASE, false, PageType::Anonymous, LazyLoad::File(segment)).unwrap();

        let mut child = SupplementalPageTable::new(vm.clone());
        child.fork_copy(&parent).unwrap();
        let page = child.find(BASE).unwrap();
        {
            let page = page.lock();
            assert!(matches!(page.kind(), PageKind::Uninit(_)));
            assert!(!page.is_writable());
            // The child's loader reads through its own handle.
            let PageKind::Uninit(uninit) = page.kind() else {
                unreachable!()
            };
            let child_file = uninit.file_segment().unwrap().file();
            assert!(!Arc::ptr_eq(child_file, &file));
        }
        assert_eq!(vm.frames().resident(), 0);

        child.claim(BASE).unwrap();
        let frame = page.lock().frame().unwrap();
        assert!(vm.frames().memory().frame(frame).iter().all(|&b| b == 3));
    }

    #[test]
    fn test_fork_copies_swapped_page() {
        let vm = test_vm(2, 8);
        let mut parent = SupplementalPageTable::new(vm.clone());
        for i in 0..3 {
            let va = BASE + i * PAGE_FRAME_SIZE;
            parent.register(va, true, PageType::Anonymous, LazyLoad::Zero).unwrap();
            parent.claim(va).unwrap();
            let frame = parent.find(va).unwrap().lock().frame().unwrap();
            vm.frames().memory().frame(frame).fill(i as u8 + 1);
        }

        // Three pages in two frames: the first was evicted.
        let evicted = parent.find(BASE).unwrap();
        let slot_of = |page: &PageRef| {
            let page = page.lock();
            let PageKind::Anonymous(anon) = page.kind() else {
                unreachable!()
            };
            anon.slot()
        };
        assert!(!evicted.lock().is_resident());
        let slot = slot_of(&evicted).unwrap();

        let mut child = SupplementalPageTable::new(vm.clone());
        child.fork_copy(&parent).unwrap();

        // The parent still owns its slot.
        assert!(vm.swap().is_allocated(slot));
        assert_eq!(slot_of(&evicted), Some(slot));

        let page = child.find(BASE).unwrap();
        if !page.lock().is_resident() {
            child.claim(BASE).unwrap();
        }
        let frame = page.lock().frame().unwrap();
        assert!(vm.frames().memory().frame(frame).iter().all(|&b| b == 1));
    }

    #[test]
    fn test_teardown_releases_everything() {
        let vm = test_vm(1, 2);
        let mut spt = SupplementalPageTable::new(vm.clone());
        spt.register(BASE, true, PageType::Anonymous, LazyLoad::Zero).unwrap();
        spt.register(BASE + PAGE_FRAME_SIZE, true, PageType::Anonymous, LazyLoad::Zero)
            .unwrap();
        spt.register(BASE + 2 * PAGE_FRAME_SIZE, true, PageType::Anonymous, LazyLoad::Zero)
            .unwrap();
        spt.claim(BASE).unwrap();
        spt.claim(BASE + PAGE_FRAME_SIZE).unwrap();

        spt.teardown();
        assert!(spt.is_empty());
        assert_eq!(vm.frames().resident(), 0);
        assert_eq!(vm.swap().used_slots(), 0);
        assert!(spt.page_manager().lock().is_empty());
    }
}
