//! Pagein
//!
//! Brings a descriptor's swapped-out data back to residency on behalf of
//! the fault handler. The actual fetch is delegated to the fault-in
//! primitive; this layer interprets its outcome and finishes the
//! transition to a dirty, owned, swap-slot-free page.

use log::debug;

use crate::anon::AnonHandle;
use crate::lock::AmapGuard;
use crate::object::ObjectGuard;
use crate::page::PageHandle;
use crate::pager::{PagePolicy, SwapBackend};
use crate::AnonVm;

/// Terminal outcome of a pagein request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageinOutcome {
    Success,
    /// The request failed (I/O error, memory pressure) or became moot
    /// because the descriptor was destroyed concurrently. Retry policy is
    /// the caller's.
    Aborted,
}

/// What the fault-in primitive reports back. Being a closed set, a status
/// outside the contract is unrepresentable rather than a runtime panic.
pub enum FaultInStatus<'a> {
    /// The page is resident and attached; the descriptor lock is still
    /// held, plus a backing-object lock if one was taken along the way.
    Fetched {
        page: PageHandle,
        object_lock: Option<ObjectGuard<'a>>,
    },
    /// The backing store failed. Descriptor untouched, lock released.
    IoError,
    /// The descriptor was destroyed during the fetch; there is nothing
    /// left to mutate. Lock released.
    Restart,
    /// Transient resource shortage (e.g. no free pages). Descriptor
    /// untouched, lock released; the caller decides whether to retry.
    Again,
}

/// The external fault-in primitive. May internally drop and reacquire the
/// descriptor's lock; each status documents whether the lock is held on
/// return, and only `Fetched` returns with it held.
pub trait FaultIn<S: SwapBackend, P: PagePolicy> {
    fn fault_in<'a>(
        &self,
        vm: &'a AnonVm<S, P>,
        anon: AnonHandle,
        guard: &mut AmapGuard<'_>,
    ) -> FaultInStatus<'a>;
}

impl<S: SwapBackend, P: PagePolicy> AnonVm<S, P> {
    /// Faults the descriptor's data back into residency.
    ///
    /// Caller holds the descriptor's lock exclusively, and that lock must
    /// be the container's lock instance. On `Success` the lock has been
    /// released, the stale swap slot reclaimed, and the page left dirty and
    /// parked with the replacement policy. On `Aborted` nothing further is
    /// owed; the resolver already released the lock.
    pub fn pagein<F: FaultIn<S, P>>(
        &self,
        resolver: &F,
        anon: AnonHandle,
        guard: &mut AmapGuard<'_>,
    ) -> PageinOutcome {
        {
            let lock = self.anons.with(anon, |a| a.lock.clone());
            let lock = lock.expect("pagein on a descriptor with no lock bound");
            assert!(guard.owns(&lock), "pagein caller must hold the container lock");
        }

        match resolver.fault_in(self, anon, guard) {
            FaultInStatus::Fetched { page, object_lock } => {
                // The swap copy is stale the moment the page can be written
                // to; drop the slot and keep the page dirty so eviction
                // writes it back instead of discarding it.
                self.drop_swap(anon);
                self.pages.mark_dirty(page);
                self.policy.deactivate(page);
                guard.unlock();
                drop(object_lock);
                debug!("pagein {:?} complete, page {:?}", anon, page);
                PageinOutcome::Success
            }
            FaultInStatus::IoError | FaultInStatus::Restart | FaultInStatus::Again => {
                debug_assert!(!guard.held(), "resolver must release the lock on failure");
                PageinOutcome::Aborted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anon::SwapSlot;
    use crate::lock::{new_amap_lock, AmapGuard};
    use crate::page::PageFlags;
    use crate::pager::mock::{test_vm, CountingPolicy, CountingSwap};
    use std::sync::atomic::Ordering;

    type TestVm = AnonVm<CountingSwap, CountingPolicy>;

    /// Happy-path resolver: grabs a free page and attaches it, the way the
    /// real fault path does after swap I/O completes.
    struct SwapFetch;

    impl FaultIn<CountingSwap, CountingPolicy> for SwapFetch {
        fn fault_in<'a>(
            &self,
            vm: &'a TestVm,
            anon: crate::anon::AnonHandle,
            guard: &mut AmapGuard<'_>,
        ) -> FaultInStatus<'a> {
            match vm.pages.alloc() {
                Some(page) => {
                    vm.attach_page(anon, page, guard);
                    FaultInStatus::Fetched {
                        page,
                        object_lock: None,
                    }
                }
                None => {
                    guard.unlock();
                    FaultInStatus::Again
                }
            }
        }
    }

    /// Resolver that fails the backing-store read.
    struct FailingFetch;

    impl FaultIn<CountingSwap, CountingPolicy> for FailingFetch {
        fn fault_in<'a>(
            &self,
            _vm: &'a TestVm,
            _anon: crate::anon::AnonHandle,
            guard: &mut AmapGuard<'_>,
        ) -> FaultInStatus<'a> {
            guard.unlock();
            FaultInStatus::IoError
        }
    }

    /// Resolver observing the descriptor destroyed mid-fetch.
    struct RestartedFetch;

    impl FaultIn<CountingSwap, CountingPolicy> for RestartedFetch {
        fn fault_in<'a>(
            &self,
            _vm: &'a TestVm,
            _anon: crate::anon::AnonHandle,
            guard: &mut AmapGuard<'_>,
        ) -> FaultInStatus<'a> {
            guard.unlock();
            FaultInStatus::Restart
        }
    }

    fn swapped_out_anon(vm: &TestVm, amap: &crate::lock::AmapLock, slot: u32) -> crate::anon::AnonHandle {
        let anon = vm.alloc_anon().unwrap();
        vm.bind_lock(anon, amap);
        let mut guard = AmapGuard::acquire(amap);
        vm.set_swap_slot(anon, SwapSlot(slot), &mut guard);
        anon
    }

    /// Successful pagein: slot reclaimed, page dirty and deactivated, lock
    /// released, swap-only counter back down.
    #[test]
    fn test_pagein_success() {
        let vm = test_vm(1, 0, 1);
        let amap = new_amap_lock();
        let anon = swapped_out_anon(&vm, &amap, 11);
        assert_eq!(vm.swap_only_pages(), 1);

        let mut guard = AmapGuard::acquire(&amap);
        assert_eq!(vm.pagein(&SwapFetch, anon, &mut guard), PageinOutcome::Success);

        assert!(!guard.held(), "lock released on success");
        assert_eq!(vm.swap_only_pages(), 0);
        assert_eq!(vm.swap.freed_slots.load(Ordering::Relaxed), 1);
        assert_eq!(vm.policy.deactivated.load(Ordering::Relaxed), 1);
        let page = vm.anons.with(anon, |a| a.resident_page()).unwrap();
        assert!(vm.pages.lock(page).flags().contains(PageFlags::DIRTY));
        assert_eq!(vm.anons.with(anon, |a| a.swap_slot()), None);
    }

    /// Paging in N swapped-out descriptors drops the swap-only counter by
    /// exactly N.
    #[test]
    fn test_pagein_counter_accounting() {
        const N: usize = 4;
        let vm = test_vm(N, 0, N);
        let amap = new_amap_lock();
        let anons: Vec<_> = (0..N)
            .map(|i| swapped_out_anon(&vm, &amap, i as u32))
            .collect();
        assert_eq!(vm.swap_only_pages(), N);

        for (i, &anon) in anons.iter().enumerate() {
            let mut guard = AmapGuard::acquire(&amap);
            assert_eq!(vm.pagein(&SwapFetch, anon, &mut guard), PageinOutcome::Success);
            assert_eq!(vm.swap_only_pages(), N - i - 1);
        }
    }

    /// I/O failure aborts and leaves the descriptor exactly as it was.
    #[test]
    fn test_pagein_io_error_leaves_state() {
        let vm = test_vm(1, 0, 1);
        let amap = new_amap_lock();
        let anon = swapped_out_anon(&vm, &amap, 5);

        let mut guard = AmapGuard::acquire(&amap);
        assert_eq!(vm.pagein(&FailingFetch, anon, &mut guard), PageinOutcome::Aborted);

        assert_eq!(vm.anons.with(anon, |a| a.swap_slot()), Some(SwapSlot(5)));
        assert_eq!(vm.anons.with(anon, |a| a.resident_page()), None);
        assert_eq!(vm.swap_only_pages(), 1);
        assert_eq!(vm.swap.freed_slots.load(Ordering::Relaxed), 0);
    }

    /// Transient shortage: `Again` surfaces as `Aborted` with nothing
    /// retried internally.
    #[test]
    fn test_pagein_transient_shortage_aborts() {
        let vm = test_vm(1, 0, 2);
        let amap = new_amap_lock();
        // Occupy the only page so the resolver hits allocation failure.
        let hog = vm.pages.alloc().unwrap();
        let anon = swapped_out_anon(&vm, &amap, 2);

        let mut guard = AmapGuard::acquire(&amap);
        assert_eq!(vm.pagein(&SwapFetch, anon, &mut guard), PageinOutcome::Aborted);
        assert_eq!(vm.anons.with(anon, |a| a.swap_slot()), Some(SwapSlot(2)));

        // Pressure gone, the same request goes through.
        vm.pages.free(hog);
        let mut guard = AmapGuard::acquire(&amap);
        assert_eq!(vm.pagein(&SwapFetch, anon, &mut guard), PageinOutcome::Success);
    }

    /// A restarted fetch must not poison later pageins: a fresh descriptor
    /// bearing the same swap slot identifier succeeds normally.
    #[test]
    fn test_pagein_restart_then_fresh_descriptor_succeeds() {
        let vm = test_vm(1, 0, 2);
        let amap = new_amap_lock();
        let doomed = swapped_out_anon(&vm, &amap, 8);

        let mut guard = AmapGuard::acquire(&amap);
        assert_eq!(
            vm.pagein(&RestartedFetch, doomed, &mut guard),
            PageinOutcome::Aborted
        );
        // The concurrent destroyer owns the descriptor's fate; model its
        // teardown so the slot identifier is free to reuse.
        let mut guard = AmapGuard::acquire(&amap);
        vm.dec_ref(doomed, &mut guard);
        vm.release(doomed, &mut guard);
        drop(guard);

        let fresh = swapped_out_anon(&vm, &amap, 8);
        let mut guard = AmapGuard::acquire(&amap);
        assert_eq!(vm.pagein(&SwapFetch, fresh, &mut guard), PageinOutcome::Success);
    }

    #[test]
    #[should_panic(expected = "pagein on a descriptor with no lock bound")]
    fn test_pagein_unbound_descriptor_panics() {
        let vm = test_vm(1, 0, 1);
        let amap = new_amap_lock();
        let anon = vm.alloc_anon().unwrap();
        let mut guard = AmapGuard::acquire(&amap);
        vm.pagein(&SwapFetch, anon, &mut guard);
    }
}
