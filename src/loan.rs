//! Loan resolution
//!
//! A page with a nonzero loan count has an owner that can change out from
//! under a naive reader: the backing object may reclaim it, walk away from
//! it, or be busy taking the anon lock in the opposite order. This loop
//! pins down the current authoritative owner, holding the object's lock on
//! return when ownership resolved to an object.

use log::{debug, trace};

use crate::anon::AnonHandle;
use crate::lock::AmapGuard;
use crate::object::ObjectGuard;
use crate::page::{PageHandle, PageOwner};
use crate::pager::{PagePolicy, SwapBackend};
use crate::AnonVm;

impl<S: SwapBackend, P: PagePolicy> AnonVm<S, P> {
    /// Resolves ownership of the descriptor's resident page.
    ///
    /// Caller holds the descriptor's lock and still does on return. If the
    /// page resolved to an object, that object's lock is held on return.
    /// The returned page reflects the state at return time; it may be
    /// absent if the page went away across a retry.
    ///
    /// The loan count read before taking the interlock is a hint: a stale
    /// "looks loaned" observation costs one harmless extra iteration.
    pub(crate) fn resolve_loan<'a>(
        &'a self,
        anon: AnonHandle,
        guard: &mut AmapGuard<'_>,
    ) -> (Option<PageHandle>, Option<ObjectGuard<'a>>) {
        loop {
            let Some(ph) = self.anons.with(anon, |a| a.page) else {
                return (None, None);
            };
            let Some(mut pg) = self.pages.lock_live(ph) else {
                // Freed elsewhere while we were backing off.
                return (None, None);
            };
            if pg.loan_count == 0 {
                return (Some(ph), None);
            }
            match pg.owner {
                PageOwner::Object(obj) => {
                    // Natural order is anon lock before object lock, but the
                    // object side may hold its lock while waiting for ours.
                    // Never block here; back off and retry instead.
                    match self.objects.try_lock(obj) {
                        Some(og) => {
                            drop(pg);
                            return (Some(ph), Some(og));
                        }
                        None => {
                            drop(pg);
                            trace!("object {:?} lock contended, backing off", obj);
                            guard.backoff();
                        }
                    }
                }
                PageOwner::Unowned => {
                    // The object disowned the page with loans outstanding;
                    // claim it for this descriptor.
                    pg.owner = PageOwner::Anon(anon);
                    pg.loan_count -= 1;
                    debug_assert_eq!(pg.anon, Some(anon));
                    debug!("anon {:?} claimed disowned page {:?}", anon, ph);
                    return (Some(ph), None);
                }
                PageOwner::Anon(_) => {
                    // Loaned out from the anon side; no object lock involved.
                    return (Some(ph), None);
                }
                PageOwner::PendingFree(_) => {
                    panic!("loan resolution found page {:?} pending free", ph)
                }
            }
        }
    }
}
