//! Anon descriptors
//!
//! The unit of ownership for one anonymous page: a refcounted descriptor
//! that either holds a resident page (possibly loaned), a swap slot, or
//! both (the swap copy then being stale)
//! - The pool hands out canonical-empty descriptors and takes them back
//! - `release` is the single teardown path once the refcount hits zero
//! - Teardown of a busy page is split off into `finish_release`

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::Ordering;
use crossbeam_queue::ArrayQueue;
use log::{debug, trace};
use spin::{Mutex, MutexGuard};

use crate::lock::{AmapGuard, AmapLock};
use crate::page::{PageFlags, PageHandle, PageOwner};
use crate::pager::{PagePolicy, SwapBackend};
use crate::AnonVm;

/// Identifier of a reserved swap backing-store location.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwapSlot(pub u32);

/// Generation-checked reference to a descriptor slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AnonHandle {
    pub(crate) idx: u32,
    pub(crate) gen: u32,
}

/// Descriptor state. All fields are serialized by the container lock the
/// descriptor is bound to; the slot mutex only makes the interior
/// mutability sound.
#[derive(Debug)]
pub struct AnonState {
    /// Independent holders referencing this descriptor. At zero the
    /// descriptor owns nothing reachable and must go through `release`.
    pub(crate) refcount: u32,
    /// Handle to the shared container lock; a reference, not ownership.
    pub(crate) lock: Option<AmapLock>,
    pub(crate) page: Option<PageHandle>,
    pub(crate) swap_slot: Option<SwapSlot>,
    gen: u32,
    live: bool,
}

impl AnonState {
    const fn empty() -> Self {
        AnonState {
            refcount: 0,
            lock: None,
            page: None,
            swap_slot: None,
            gen: 0,
            live: false,
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn resident_page(&self) -> Option<PageHandle> {
        self.page
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.swap_slot
    }
}

/// Descriptor pool: a slab of slots plus a lock-free reuse queue. `allocate`
/// failing is transient backpressure, never fatal.
pub struct AnonArena {
    slots: Box<[Mutex<AnonState>]>,
    free: ArrayQueue<u32>,
}

impl AnonArena {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "descriptor pool needs at least one slot");
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Mutex::new(AnonState::empty()));
        }
        let free = ArrayQueue::new(capacity);
        for idx in 0..capacity as u32 {
            free.push(idx).expect("free queue sized to capacity");
        }
        AnonArena {
            slots: slots.into_boxed_slice(),
            free,
        }
    }

    /// Hands out a canonical-empty descriptor with `refcount == 1`, or
    /// `None` when the pool is exhausted.
    pub fn allocate(&self) -> Option<AnonHandle> {
        let idx = self.free.pop()?;
        let mut st = self.slots[idx as usize].lock();
        debug_assert!(!st.live);
        st.live = true;
        st.refcount = 1;
        st.lock = None;
        st.page = None;
        st.swap_slot = None;
        let handle = AnonHandle { idx, gen: st.gen };
        trace!("anon {:?} allocated", handle);
        Some(handle)
    }

    /// Returns a descriptor to the pool. The descriptor must already have
    /// passed through release: resurrecting one that still owns state would
    /// be a silent use-after-free, so this is fatal instead.
    pub(crate) fn recycle(&self, h: AnonHandle) {
        let mut st = self.lock_checked(h);
        assert!(
            st.refcount == 0 && st.lock.is_none() && st.page.is_none() && st.swap_slot.is_none(),
            "recycling a descriptor that still owns state: {:?}",
            *st
        );
        st.live = false;
        st.gen = st.gen.wrapping_add(1);
        drop(st);
        trace!("anon {:?} recycled", h);
        self.free.push(h.idx).expect("descriptor freed twice");
    }

    pub fn with<R>(&self, h: AnonHandle, f: impl FnOnce(&AnonState) -> R) -> R {
        let st = self.lock_checked(h);
        f(&st)
    }

    pub(crate) fn with_mut<R>(&self, h: AnonHandle, f: impl FnOnce(&mut AnonState) -> R) -> R {
        let mut st = self.lock_checked(h);
        f(&mut st)
    }

    fn lock_checked(&self, h: AnonHandle) -> MutexGuard<'_, AnonState> {
        let st = self.slots[h.idx as usize].lock();
        assert!(st.live && st.gen == h.gen, "stale anon handle {:?}", h);
        st
    }

    pub fn free_descriptors(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<S: SwapBackend, P: PagePolicy> AnonVm<S, P> {
    /// Pool allocation; see [`AnonArena::allocate`].
    pub fn alloc_anon(&self) -> Option<AnonHandle> {
        self.anons.allocate()
    }

    /// Binds a fresh descriptor to its container's shared lock. A bound
    /// descriptor stays bound until `release`.
    pub fn bind_lock(&self, anon: AnonHandle, lock: &AmapLock) {
        self.anons.with_mut(anon, |a| {
            assert!(a.lock.is_none(), "descriptor already bound to a lock");
            a.lock = Some(lock.clone());
        });
    }

    /// Takes an additional reference. Caller must hold the descriptor's lock.
    pub fn add_ref(&self, anon: AnonHandle, guard: &mut AmapGuard<'_>) {
        self.anons.with_mut(anon, |a| {
            let lock = a.lock.as_ref().expect("descriptor has no lock bound");
            assert!(guard.owns(lock), "caller must hold the descriptor's lock");
            a.refcount += 1;
        });
    }

    /// Drops one reference and returns the remaining count. At zero the
    /// caller owns the descriptor exclusively and must call `release`.
    pub fn dec_ref(&self, anon: AnonHandle, guard: &mut AmapGuard<'_>) -> u32 {
        self.anons.with_mut(anon, |a| {
            let lock = a.lock.as_ref().expect("descriptor has no lock bound");
            assert!(guard.owns(lock), "caller must hold the descriptor's lock");
            assert!(a.refcount > 0, "reference count underflow on {:?}", anon);
            a.refcount -= 1;
            a.refcount
        })
    }

    /// Attaches a fresh, unowned page as solely anon-owned.
    ///
    /// If the descriptor held a swap slot and no resident page, its data is
    /// no longer resident only in swap; the global counter drops here. This
    /// is the decrement the fault-in primitive is contractually responsible
    /// for on its success path.
    pub fn attach_page(&self, anon: AnonHandle, page: PageHandle, guard: &mut AmapGuard<'_>) {
        let was_swap_only = self.anons.with(anon, |a| {
            let lock = a.lock.as_ref().expect("descriptor has no lock bound");
            assert!(guard.owns(lock), "caller must hold the descriptor's lock");
            assert!(a.page.is_none(), "descriptor already has a resident page");
            a.swap_slot.is_some()
        });
        {
            let mut pg = self.pages.lock(page);
            assert_eq!(pg.owner, PageOwner::Unowned, "attaching an owned page");
            assert_eq!(pg.loan_count, 0, "attaching a loaned page");
            pg.owner = PageOwner::Anon(anon);
            pg.anon = Some(anon);
        }
        self.anons.with_mut(anon, |a| a.page = Some(page));
        if was_swap_only {
            let prev = self.swap_only.fetch_sub(1, Ordering::Relaxed);
            assert!(prev > 0, "swap-only page counter underflow");
        }
        trace!("page {:?} attached to {:?}", page, anon);
    }

    /// Records a reserved swap slot for the descriptor's data. With no page
    /// resident the data now lives only in swap, which the global counter
    /// tracks.
    pub fn set_swap_slot(&self, anon: AnonHandle, slot: SwapSlot, guard: &mut AmapGuard<'_>) {
        let page = self.anons.with_mut(anon, |a| {
            let lock = a.lock.as_ref().expect("descriptor has no lock bound");
            assert!(guard.owns(lock), "caller must hold the descriptor's lock");
            assert!(a.swap_slot.is_none(), "descriptor already holds a swap slot");
            a.swap_slot = Some(slot);
            a.page
        });
        if page.is_none() {
            self.swap_only.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Releases any swap slot still attributed to the descriptor.
    ///
    /// Touches only the descriptor's own field and the swap allocator, so
    /// it is callable either with the descriptor's lock held or on an
    /// unreferenced descriptor during teardown.
    pub fn drop_swap(&self, anon: AnonHandle) {
        let (slot, page) = self.anons.with_mut(anon, |a| (a.swap_slot.take(), a.page));
        if let Some(slot) = slot {
            self.swap.slot_free(slot, 1);
            if page.is_none() {
                // The data existed only in swap until now.
                let prev = self.swap_only.fetch_sub(1, Ordering::Relaxed);
                assert!(prev > 0, "swap-only page counter underflow");
            }
            debug!("anon {:?} dropped swap slot {:?}", anon, slot);
        }
    }

    /// Tears down a descriptor whose refcount has reached zero. Caller must
    /// hold the descriptor's container lock exclusively.
    ///
    /// If the page turns out to be loaned, ownership is resolved first; a
    /// page that reverted to its backing object is left alone. A busy page
    /// is only marked for deferred reclamation: the descriptor then stays
    /// bound to its lock and out of the pool until `finish_release` runs.
    pub fn release(&self, anon: AnonHandle, guard: &mut AmapGuard<'_>) {
        let (lock, page) = self.anons.with(anon, |a| {
            assert_eq!(a.refcount, 0, "release of a referenced descriptor {:?}", anon);
            (a.lock.clone(), a.page)
        });
        let lock = lock.expect("release of a descriptor with no lock bound");
        assert!(guard.owns(&lock), "caller must hold the descriptor's lock");

        let mut page = page;
        let mut object_lock = None;
        if let Some(ph) = page {
            let loaned = self.pages.lock(ph).loan_count > 0;
            if loaned {
                let (resolved, og) = self.resolve_loan(anon, guard);
                page = resolved;
                object_lock = og;
            }
        }

        if let Some(ph) = page {
            let mut pg = self.pages.lock(ph);
            match pg.owner {
                PageOwner::Object(obj) => {
                    // Ownership reverts fully to the object; the page lives on.
                    debug_assert!(object_lock.is_some());
                    assert!(pg.loan_count > 0, "object-owned page without a loan");
                    pg.loan_count -= 1;
                    pg.anon = None;
                    drop(pg);
                    drop(object_lock);
                    debug!("anon {:?} dropped loan, page {:?} stays with {:?}", anon, ph, obj);
                }
                PageOwner::Anon(owner) => {
                    assert_eq!(owner, anon, "page owned by a different descriptor");
                    debug_assert!(object_lock.is_none());
                    self.policy.unmap_page(ph);
                    if pg.flags.contains(PageFlags::BUSY) {
                        pg.owner = PageOwner::PendingFree(anon);
                        debug!("anon {:?} deferred: page {:?} busy", anon, ph);
                        return;
                    }
                    self.pages.free_locked(ph, &mut pg);
                }
                PageOwner::Unowned | PageOwner::PendingFree(_) => {
                    panic!("release found page {:?} in state {:?}", ph, pg.owner)
                }
            }
        }

        self.finish_teardown(anon);
    }

    /// Completes the teardown of a descriptor whose page was marked for
    /// deferred reclamation, once the busy holder has cleared the busy mark.
    /// Consumes the guard: the container lock is released on exit, and the
    /// caller's own handle to it is the last thing keeping it alive.
    pub fn finish_release(&self, anon: AnonHandle, guard: AmapGuard<'_>) {
        let (lock, page) = self.anons.with(anon, |a| {
            assert_eq!(a.refcount, 0, "busy-release of a referenced descriptor");
            (a.lock.clone(), a.page)
        });
        let lock = lock.expect("busy-release of an unbound descriptor");
        assert!(guard.owns(&lock), "caller must hold the descriptor's lock");
        let ph = page.expect("busy-release without a pending page");

        {
            let mut pg = self.pages.lock(ph);
            assert!(
                matches!(pg.owner, PageOwner::PendingFree(a) if a == anon),
                "page {:?} not pending reclamation for {:?}",
                ph,
                anon
            );
            assert_eq!(pg.loan_count, 0, "pending-free page still loaned");
            assert!(
                !pg.flags.contains(PageFlags::BUSY),
                "busy mark must be cleared before finish_release"
            );
            // Writeback bookkeeping dies with the page.
            pg.flags.remove(PageFlags::DIRTY);
            self.pages.free_locked(ph, &mut pg);
        }

        self.finish_teardown(anon);
        drop(guard);
    }

    /// Release tail: unbind the lock, reclaim swap, notify, recycle.
    ///
    /// The page field is cleared only after `drop_swap`, which consults it
    /// to tell "data was resident" apart from "data lived only in swap".
    fn finish_teardown(&self, anon: AnonHandle) {
        self.anons.with_mut(anon, |a| a.lock = None);
        self.drop_swap(anon);
        self.anons.with_mut(anon, |a| a.page = None);
        self.policy.notify_freed(anon);
        self.anons.recycle(anon);
    }
}
