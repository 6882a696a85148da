//! Anonymous-memory ownership and reclamation
//!
//! Tracks, for every privately mapped swap-backed page, which anon
//! descriptor currently owns it and how to give it back safely
//! - The descriptor pool hands out canonical-empty descriptors and recycles them
//! - The release path resolves loaned pages against their backing object
//! - Pagein brings swapped-out data back to residency for the fault path
//! - Busy pages are torn down lazily once their holder clears the busy mark

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod anon;
mod loan;
pub mod lock;
pub mod object;
pub mod page;
pub mod pagein;
pub mod pager;

use core::sync::atomic::{AtomicUsize, Ordering};

use anon::AnonArena;
use object::ObjectArena;
use page::PageArena;
use pager::{PagePolicy, SwapBackend};

pub use anon::{AnonHandle, SwapSlot};
pub use lock::{AmapGuard, AmapLock};
pub use object::ObjectHandle;
pub use page::{PageFlags, PageHandle, PageOwner};
pub use pagein::{FaultIn, FaultInStatus, PageinOutcome};

/// The anonymous-memory layer: the page and descriptor arenas plus the
/// collaborating services the ownership protocols call out to.
///
/// All public operations may block on contended locks; none are safe from
/// a non-blocking context.
pub struct AnonVm<S: SwapBackend, P: PagePolicy> {
    pub pages: PageArena,
    pub objects: ObjectArena,
    pub anons: AnonArena,
    pub(crate) swap: S,
    pub(crate) policy: P,
    /// Pages resident only in swap. Touched in exactly three places:
    /// `set_swap_slot` (increment, no page resident), `attach_page`
    /// (decrement, stale swap slot present) and `drop_swap` (decrement,
    /// no page resident).
    pub(crate) swap_only: AtomicUsize,
}

impl<S: SwapBackend, P: PagePolicy> AnonVm<S, P> {
    /// Creates the layer with fixed arena capacities.
    ///
    /// # Arguments
    /// * `pages` - number of physical page slots
    /// * `objects` - number of backing objects
    /// * `anons` - descriptor pool capacity
    pub fn new(pages: usize, objects: usize, anons: usize, swap: S, policy: P) -> Self {
        AnonVm {
            pages: PageArena::new(pages),
            objects: ObjectArena::new(objects),
            anons: AnonArena::new(anons),
            swap,
            policy,
            swap_only: AtomicUsize::new(0),
        }
    }

    /// Current count of pages whose only copy lives in swap.
    pub fn swap_only_pages(&self) -> usize {
        self.swap_only.load(Ordering::Relaxed)
    }
}
