//! Physical page slots
//!
//! - Maintains a descriptor per page slot behind a short per-page interlock
//! - Ownership is a single enum, so a page has at most one authoritative owner
//! - Handles carry a generation so a freed-and-reused slot is detectable

use alloc::{boxed::Box, vec::Vec};
use bitflags::bitflags;
use crossbeam_queue::ArrayQueue;
use log::trace;
use spin::{Mutex, MutexGuard};

use crate::anon::AnonHandle;
use crate::object::ObjectHandle;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PageFlags: u8 {
        /// Claimed by an in-flight operation; must not be freed until cleared.
        const BUSY = 0b01;
        /// In-memory copy differs from the swap copy; never discard silently.
        const DIRTY = 0b10;
    }
}

/// Who may free this page. `PendingFree` is a page whose owning descriptor
/// was torn down while the page was busy; reclamation is deferred until the
/// busy holder finishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageOwner {
    Unowned,
    Object(ObjectHandle),
    Anon(AnonHandle),
    PendingFree(AnonHandle),
}

/// Generation-checked reference to a page slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageHandle {
    pub(crate) idx: u32,
    pub(crate) gen: u32,
}

/// Per-page state, guarded by the slot's interlock. The interlock is the
/// innermost lock in the layer: it is always obtainable without risking the
/// anon/object lock-order inversion, which is why loan counts live here.
#[derive(Debug)]
pub struct PageState {
    pub(crate) owner: PageOwner,
    /// Back-reference to the descriptor the page is owned by or loaned to.
    pub(crate) anon: Option<AnonHandle>,
    /// How many parties beyond the owner may use the page without its consent.
    pub(crate) loan_count: u32,
    pub(crate) flags: PageFlags,
    gen: u32,
    live: bool,
}

impl PageState {
    const fn empty() -> Self {
        PageState {
            owner: PageOwner::Unowned,
            anon: None,
            loan_count: 0,
            flags: PageFlags::empty(),
            gen: 0,
            live: false,
        }
    }

    pub fn owner(&self) -> PageOwner {
        self.owner
    }

    pub fn loan_count(&self) -> u32 {
        self.loan_count
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }
}

/// Slab of page slots with a lock-free reuse queue.
pub struct PageArena {
    slots: Box<[Mutex<PageState>]>,
    free: ArrayQueue<u32>,
}

impl PageArena {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "page arena needs at least one slot");
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Mutex::new(PageState::empty()));
        }
        let free = ArrayQueue::new(capacity);
        for idx in 0..capacity as u32 {
            free.push(idx).expect("free queue sized to capacity");
        }
        PageArena {
            slots: slots.into_boxed_slice(),
            free,
        }
    }

    /// Grabs a free page slot, or `None` when the arena is exhausted.
    pub fn alloc(&self) -> Option<PageHandle> {
        let idx = self.free.pop()?;
        let mut st = self.slots[idx as usize].lock();
        debug_assert!(!st.live);
        st.live = true;
        st.owner = PageOwner::Unowned;
        st.anon = None;
        st.loan_count = 0;
        st.flags = PageFlags::empty();
        let handle = PageHandle { idx, gen: st.gen };
        trace!("page {:?} allocated", handle);
        Some(handle)
    }

    /// Takes the page interlock. Panics on a stale handle; that is a
    /// use-after-free of the slot.
    pub fn lock(&self, h: PageHandle) -> MutexGuard<'_, PageState> {
        let st = self.slots[h.idx as usize].lock();
        assert!(st.live && st.gen == h.gen, "stale page handle {:?}", h);
        st
    }

    /// Takes the interlock only if the page is still the one the handle was
    /// minted for. `None` means it was freed concurrently.
    pub(crate) fn lock_live(&self, h: PageHandle) -> Option<MutexGuard<'_, PageState>> {
        let st = self.slots[h.idx as usize].lock();
        if st.live && st.gen == h.gen {
            Some(st)
        } else {
            None
        }
    }

    /// Frees a page whose interlock the caller already holds.
    pub(crate) fn free_locked(&self, h: PageHandle, st: &mut PageState) {
        assert!(st.live && st.gen == h.gen, "freeing a stale page handle");
        assert!(
            !st.flags.contains(PageFlags::BUSY),
            "freeing a busy page {:?}",
            h
        );
        assert_eq!(st.loan_count, 0, "freeing a loaned page {:?}", h);
        st.live = false;
        st.gen = st.gen.wrapping_add(1);
        st.owner = PageOwner::Unowned;
        st.anon = None;
        st.flags = PageFlags::empty();
        trace!("page {:?} freed", h);
        self.free.push(h.idx).expect("page freed twice");
    }

    /// Returns a page to the arena.
    pub fn free(&self, h: PageHandle) {
        let mut st = self.lock(h);
        self.free_locked(h, &mut st);
    }

    pub fn mark_dirty(&self, h: PageHandle) {
        self.lock(h).flags.insert(PageFlags::DIRTY);
    }

    /// Marks the page claimed by an in-flight operation.
    pub fn set_busy(&self, h: PageHandle) {
        self.lock(h).flags.insert(PageFlags::BUSY);
    }

    /// Clears the busy mark. Whether a deferred reclamation is pending is
    /// the caller's concern; see `AnonVm::finish_release`.
    pub fn clear_busy(&self, h: PageHandle) {
        let mut st = self.lock(h);
        assert!(st.flags.contains(PageFlags::BUSY), "page {:?} not busy", h);
        st.flags.remove(PageFlags::BUSY);
    }

    pub fn is_live(&self, h: PageHandle) -> bool {
        let st = self.slots[h.idx as usize].lock();
        st.live && st.gen == h.gen
    }

    pub fn free_pages(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Allocates every slot, frees one, and checks that the freed handle is
    /// dead while its slot becomes allocatable again under a new generation.
    #[test]
    fn test_alloc_free_generation() {
        let arena = PageArena::new(2);
        let a = arena.alloc().expect("first slot");
        let b = arena.alloc().expect("second slot");
        assert!(arena.alloc().is_none(), "arena should be exhausted");

        arena.free(a);
        assert!(!arena.is_live(a));
        assert!(arena.is_live(b));
        assert!(arena.lock_live(a).is_none());

        let c = arena.alloc().expect("slot reusable after free");
        assert_eq!(c.idx, a.idx);
        assert_ne!(c.gen, a.gen);
        assert!(!arena.is_live(a), "old handle must stay dead after reuse");
    }

    /// A busy page must never be freed outright.
    #[test]
    #[should_panic(expected = "freeing a busy page")]
    fn test_free_busy_page_panics() {
        let arena = PageArena::new(1);
        let p = arena.alloc().unwrap();
        arena.set_busy(p);
        arena.free(p);
    }

    /// Dirty and busy marks are independent and survive until cleared.
    #[test]
    fn test_flag_marks() {
        let arena = PageArena::new(1);
        let p = arena.alloc().unwrap();
        arena.mark_dirty(p);
        arena.set_busy(p);
        assert_eq!(arena.lock(p).flags(), PageFlags::BUSY | PageFlags::DIRTY);
        arena.clear_busy(p);
        assert_eq!(arena.lock(p).flags(), PageFlags::DIRTY);
    }
}
