//! The frame table: which page owns each user frame, and clock eviction when
//! the pool runs dry.
//!
//! The table is indexed by frame number. Entries hold a weak reference to the
//! owning page together with the page's address and page directory, so the
//! clock hand can test and clear accessed bits without locking any page.
//!
//! A frame is pinned while it is being evicted or filled. Pinned frames are
//! skipped by the clock and are never chosen as victims.
//!
//! The clock locks page directories while holding the table lock, so the
//! table lock must never be taken with a page directory locked. Page locks
//! come before both.

use super::{page::Page, PageRef, Result, Vm, VmError};
use crate::mem::{FrameNumber, PhysicalMemory, UserPool};
use crate::paging::PageManager;
use crate::sync::mutex::Mutex;
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use log::{debug, trace, warn};

/// The owner of a frame.
#[derive(Clone)]
pub(super) struct FrameEntry {
    page: Weak<Mutex<Page>>,
    va: usize,
    page_manager: Arc<Mutex<PageManager>>,
}

impl FrameEntry {
    pub(super) fn new(page: &PageRef, va: usize, page_manager: &Arc<Mutex<PageManager>>) -> Self {
        Self {
            page: Arc::downgrade(page),
            va,
            page_manager: page_manager.clone(),
        }
    }
}

enum Victim {
    Frame(FrameNumber, Weak<Mutex<Page>>),
    /// Every candidate is pinned by someone else.
    Busy,
    /// The table is empty.
    None,
}

struct FrameTableInner {
    pool: UserPool,
    entries: Box<[Option<FrameEntry>]>,
    /// The clock hand.
    hand: usize,
}

impl FrameTableInner {
    /// Take a free frame from the pool for `entry`, pinned.
    fn allocate(&mut self, entry: FrameEntry) -> Option<FrameNumber> {
        let frame = self.pool.alloc()?;
        self.pool.set_pinned(frame, true);
        self.entries[frame] = Some(entry);
        Some(frame)
    }

    /// Sweep from the hand, clearing accessed bits, until an entry with its
    /// accessed bit already clear turns up. That entry is pinned and returned,
    /// and the hand is left just past it.
    ///
    /// Two full turns are enough: the first clears every accessed bit it
    /// passes.
    fn select_victim(&mut self) -> Victim {
        let frames = self.entries.len();
        let mut busy = false;
        for _ in 0..2 * frames {
            let frame = self.hand;
            self.hand = (self.hand + 1) % frames;

            let Some(entry) = &self.entries[frame] else {
                continue;
            };
            if self.pool.is_pinned(frame) {
                busy = true;
                continue;
            }

            let mut page_manager = entry.page_manager.lock();
            if page_manager.is_accessed(entry.va) {
                trace!("clock: clearing accessed bit of {:#x} in frame {}", entry.va, frame);
                page_manager.set_accessed(entry.va, false);
                continue;
            }
            drop(page_manager);

            let page = entry.page.clone();
            debug!("clock: evicting {:#x} from frame {}", entry.va, frame);
            self.pool.set_pinned(frame, true);
            return Victim::Frame(frame, page);
        }

        if busy {
            Victim::Busy
        } else {
            Victim::None
        }
    }

    /// Hand `frame` to `entry` if it still belongs to `victim`.
    fn rebind(&mut self, frame: FrameNumber, victim: &Weak<Mutex<Page>>, entry: FrameEntry) -> bool {
        let owned = self.entries[frame]
            .as_ref()
            .is_some_and(|current| Weak::ptr_eq(&current.page, victim));
        if owned {
            self.entries[frame] = Some(entry);
        }
        owned
    }
}

pub struct FrameTable {
    inner: Mutex<FrameTableInner>,
    memory: PhysicalMemory,
}

impl FrameTable {
    pub fn new(frames: usize) -> Self {
        let entries: Vec<Option<FrameEntry>> = (0..frames).map(|_| None).collect();
        Self {
            inner: Mutex::new(FrameTableInner {
                pool: UserPool::new(frames),
                entries: entries.into_boxed_slice(),
                hand: 0,
            }),
            memory: PhysicalMemory::new(frames),
        }
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Number of frames currently owned by a page.
    pub fn resident(&self) -> usize {
        self.inner.lock().pool.frames_allocated()
    }

    pub fn is_pinned(&self, frame: FrameNumber) -> bool {
        self.inner.lock().pool.is_pinned(frame)
    }

    /// Virtual address of the page that owns `frame`.
    pub fn owner_va(&self, frame: FrameNumber) -> Option<usize> {
        let inner = self.inner.lock();
        inner.entries.get(frame)?.as_ref().map(|entry| entry.va)
    }

    /// Position of the clock hand.
    pub fn hand(&self) -> usize {
        self.inner.lock().hand
    }

    pub(super) fn unpin(&self, frame: FrameNumber) {
        self.inner.lock().pool.set_pinned(frame, false);
    }

    /// Return `frame` to the pool.
    pub(super) fn release(&self, frame: FrameNumber) {
        let mut inner = self.inner.lock();
        inner.entries[frame] = None;
        if !inner.pool.dealloc(frame) {
            warn!("frame: release of free frame {}", frame);
        }
    }
}

impl Vm {
    /// Get a frame for the page described by `entry`, evicting another page
    /// if the pool is empty.
    ///
    /// The frame comes back pinned and already owned by `entry`; the caller
    /// unpins it once the page is mapped and filled.
    pub(super) fn acquire_frame(&self, entry: FrameEntry) -> Result<FrameNumber> {
        loop {
            let (frame, victim) = {
                let mut inner = self.frames.inner.lock();
                if let Some(frame) = inner.allocate(entry.clone()) {
                    trace!("frame: {:#x} gets free frame {}", entry.va, frame);
                    return Ok(frame);
                }
                match inner.select_victim() {
                    Victim::Frame(frame, victim) => (frame, victim),
                    Victim::Busy => {
                        drop(inner);
                        core::hint::spin_loop();
                        continue;
                    }
                    Victim::None => return Err(VmError::OutOfFrames),
                }
            };

            if !self.evict(frame, &victim)? {
                // The victim let go of the frame on its own; start over.
                continue;
            }
            if self.frames.inner.lock().rebind(frame, &victim, entry.clone()) {
                trace!("frame: {:#x} takes over frame {}", entry.va, frame);
                return Ok(frame);
            }
        }
    }

    /// Swap out the page in pinned `frame`. Returns `false` if the page no
    /// longer holds the frame.
    fn evict(&self, frame: FrameNumber, victim: &Weak<Mutex<Page>>) -> Result<bool> {
        // A page dropped without being destroyed leaves its frame behind.
        let Some(page) = victim.upgrade() else {
            return Ok(true);
        };

        let mut page = page.lock();
        if page.frame() != Some(frame) {
            return Ok(false);
        }
        if let Err(err) = page.swap_out(self) {
            self.frames.unpin(frame);
            return Err(err);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_vm;
    use crate::vm::{LazyLoad, PageType, SupplementalPageTable};
    use kidneyos_shared::mem::PAGE_FRAME_SIZE;

    const BASE: usize = 0x1000_0000;

    fn resident_spt(vm: &Arc<Vm>, pages: usize) -> SupplementalPageTable {
        let mut spt = SupplementalPageTable::new(vm.clone());
        for i in 0..pages {
            let va = BASE + i * PAGE_FRAME_SIZE;
            spt.register(va, true, PageType::Anonymous, LazyLoad::Zero).unwrap();
            spt.claim(va).unwrap();
        }
        spt
    }

    #[test]
    fn test_free_frames_first() {
        let vm = test_vm(4, 4);
        let spt = resident_spt(&vm, 4);
        assert_eq!(vm.frames().resident(), 4);
        for frame in 0..4 {
            assert_eq!(vm.frames().owner_va(frame), Some(BASE + frame * PAGE_FRAME_SIZE));
            assert!(!vm.frames().is_pinned(frame));
        }
        assert_eq!(vm.swap().used_slots(), 0);
        drop(spt);
        assert_eq!(vm.frames().resident(), 0);
    }

    #[test]
    fn test_clock_clears_at_most_every_bit() {
        let vm = test_vm(4, 4);
        let mut spt = resident_spt(&vm, 4);
        {
            let mut page_manager = spt.page_manager().lock();
            for i in 0..4 {
                page_manager.set_accessed(BASE + i * PAGE_FRAME_SIZE, true);
            }
        }

        // Every frame is accessed: one full turn clears all four bits and the
        // frame under the hand at the start is the victim.
        let va = BASE + 4 * PAGE_FRAME_SIZE;
        spt.register(va, true, PageType::Anonymous, LazyLoad::Zero).unwrap();
        spt.claim(va).unwrap();

        assert_eq!(vm.frames().owner_va(0), Some(va));
        assert_eq!(vm.frames().hand(), 1);
        let page_manager = spt.page_manager().lock();
        for i in 1..4 {
            assert!(!page_manager.is_accessed(BASE + i * PAGE_FRAME_SIZE));
        }
        assert!(!page_manager.is_mapped(BASE));
        assert_eq!(vm.swap().used_slots(), 1);
    }

    #[test]
    fn test_clock_skips_recently_used() {
        let vm = test_vm(3, 4);
        let mut spt = resident_spt(&vm, 3);
        spt.page_manager().lock().set_accessed(BASE, true);

        let va = BASE + 3 * PAGE_FRAME_SIZE;
        spt.register(va, true, PageType::Anonymous, LazyLoad::Zero).unwrap();
        spt.claim(va).unwrap();

        // Frame 0 was accessed and survives; frame 1 is taken.
        assert_eq!(vm.frames().owner_va(0), Some(BASE));
        assert_eq!(vm.frames().owner_va(1), Some(va));
        assert_eq!(vm.frames().hand(), 2);
        assert!(!spt.page_manager().lock().is_accessed(BASE));
    }

    #[test]
    fn test_swap_exhaustion_is_reported() {
        let vm = test_vm(1, 0);
        let mut spt = resident_spt(&vm, 1);

        let va = BASE + PAGE_FRAME_SIZE;
        spt.register(va, true, PageType::Anonymous, LazyLoad::Zero).unwrap();
        assert_eq!(spt.claim(va), Err(VmError::SwapExhausted));

        // The old page is untouched and still mapped.
        assert_eq!(vm.frames().owner_va(0), Some(BASE));
        assert!(!vm.frames().is_pinned(0));
        assert!(spt.page_manager().lock().is_mapped(BASE));
        assert!(!spt.find(va).unwrap().lock().is_resident());
    }

    #[test]
    fn test_empty_pool() {
        let vm = test_vm(0, 1);
        let mut spt = SupplementalPageTable::new(vm.clone());
        spt.register(BASE, true, PageType::Anonymous, LazyLoad::Zero).unwrap();
        assert_eq!(spt.claim(BASE), Err(VmError::OutOfFrames));
    }
}
