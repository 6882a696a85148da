//! Backing objects
//!
//! The object side of a loan: an object may own a page while an anon
//! descriptor uses it. This layer only needs the object's lock (blocking
//! and non-blocking acquisition) and the handful of object-side moves that
//! create and retire loans.

use alloc::{boxed::Box, vec::Vec};
use log::debug;
use spin::{Mutex, MutexGuard};

use crate::anon::AnonHandle;
use crate::lock::AmapGuard;
use crate::page::{PageHandle, PageOwner};
use crate::pager::{PagePolicy, SwapBackend};
use crate::AnonVm;

/// Index of a backing object; objects are fixed at construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ObjectHandle(pub(crate) u32);

/// A held backing-object lock.
pub type ObjectGuard<'a> = MutexGuard<'a, ObjectState>;

#[derive(Debug)]
pub struct ObjectState {
    /// Pages this object authoritatively owns.
    pub(crate) owned_pages: u32,
}

impl ObjectState {
    pub fn owned_pages(&self) -> u32 {
        self.owned_pages
    }
}

pub struct ObjectArena {
    slots: Box<[Mutex<ObjectState>]>,
}

impl ObjectArena {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Mutex::new(ObjectState { owned_pages: 0 }));
        }
        ObjectArena {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn handle(&self, idx: usize) -> ObjectHandle {
        assert!(idx < self.slots.len(), "no such object");
        ObjectHandle(idx as u32)
    }

    /// Blocking lock acquisition.
    pub fn lock(&self, o: ObjectHandle) -> ObjectGuard<'_> {
        self.slots[o.0 as usize].lock()
    }

    /// Non-blocking acquisition; loan resolution must never block here.
    pub fn try_lock(&self, o: ObjectHandle) -> Option<ObjectGuard<'_>> {
        self.slots[o.0 as usize].try_lock()
    }
}

impl<S: SwapBackend, P: PagePolicy> AnonVm<S, P> {
    /// An object takes authoritative ownership of a fresh page.
    pub fn adopt(&self, obj: ObjectHandle, page: PageHandle) {
        let mut og = self.objects.lock(obj);
        let mut pg = self.pages.lock(page);
        assert_eq!(pg.owner, PageOwner::Unowned, "page already owned");
        assert_eq!(pg.loan_count, 0, "fresh page cannot be loaned");
        pg.owner = PageOwner::Object(obj);
        og.owned_pages += 1;
    }

    /// The object lends `page` to `anon` without giving up ownership; the
    /// page becomes the descriptor's resident page with the loan counted.
    pub fn loan(
        &self,
        obj: ObjectHandle,
        page: PageHandle,
        anon: AnonHandle,
        guard: &mut AmapGuard<'_>,
    ) {
        let _og = self.objects.lock(obj);
        {
            let mut pg = self.pages.lock(page);
            assert_eq!(
                pg.owner,
                PageOwner::Object(obj),
                "loaning a page the object does not own"
            );
            pg.loan_count += 1;
            pg.anon = Some(anon);
        }
        self.anons.with_mut(anon, |a| {
            let lock = a.lock.as_ref().expect("loan target has no lock bound");
            assert!(guard.owns(lock), "caller must hold the descriptor's lock");
            assert!(a.page.is_none(), "descriptor already has a resident page");
            a.page = Some(page);
        });
        debug!("page {:?} loaned from {:?} to {:?}", page, obj, anon);
    }

    /// The object walks away from a loaned page without reclaiming it. The
    /// outstanding loan keeps the page alive; the anon side picks up
    /// ownership the next time it resolves the loan.
    pub fn disown(&self, obj: ObjectHandle, page: PageHandle) {
        let mut og = self.objects.lock(obj);
        let mut pg = self.pages.lock(page);
        assert_eq!(
            pg.owner,
            PageOwner::Object(obj),
            "disowning a page the object does not own"
        );
        assert!(pg.loan_count > 0, "disowning an unloaned page would leak it");
        pg.owner = PageOwner::Unowned;
        og.owned_pages -= 1;
        debug!("page {:?} disowned by {:?}", page, obj);
    }
}
