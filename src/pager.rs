//! Collaborator interfaces
//!
//! Services this layer consumes but does not implement: the swap
//! backing-store allocator and the page-replacement policy (which also
//! fronts mapping revocation for us). Both are expected to be thread-safe;
//! the hooks return nothing this layer consults.

use crate::anon::{AnonHandle, SwapSlot};
use crate::page::PageHandle;

/// Swap backing-store allocator.
pub trait SwapBackend {
    /// Returns `count` slots starting at `slot` to the backing store.
    fn slot_free(&self, slot: SwapSlot, count: usize);
}

/// Page-replacement policy and mapping revocation hooks.
pub trait PagePolicy {
    /// Revokes every outstanding address-space mapping of the page. Called
    /// before a solely anon-owned page is reclaimed.
    fn unmap_page(&self, page: PageHandle);

    /// Offers the page as a deactivation candidate after pagein.
    fn deactivate(&self, page: PageHandle);

    /// Accounting notification that a descriptor is gone.
    fn notify_freed(&self, anon: AnonHandle);
}
