//! Shared container lock
//!
//! Many descriptors grouped under one container share a single lock
//! instance. The descriptor stores a handle to that lock, never the lock
//! itself, so the lock outlives the last descriptor using it; deferred
//! busy-release relies on exactly that.

use alloc::sync::Arc;
use spin::{RwLock, RwLockWriteGuard};

/// Reference-counted handle to a container's serialization lock.
pub type AmapLock = Arc<RwLock<()>>;

/// Creates a fresh container lock instance.
pub fn new_amap_lock() -> AmapLock {
    Arc::new(RwLock::new(()))
}

/// A held container lock, coupled to the lock's identity so operations can
/// assert that the caller holds the lock a given descriptor is bound to.
///
/// The guard can be dropped and retaken (`backoff`) or released for good
/// (`unlock`); both exist so the lock-order exception in loan resolution
/// stays in one auditable place.
pub struct AmapGuard<'a> {
    lock: &'a AmapLock,
    guard: Option<RwLockWriteGuard<'a, ()>>,
}

impl<'a> AmapGuard<'a> {
    /// Blocks until the container lock is held exclusively.
    pub fn acquire(lock: &'a AmapLock) -> Self {
        AmapGuard {
            lock,
            guard: Some(lock.write()),
        }
    }

    /// Whether this guard holds the very lock instance `other` refers to.
    pub fn owns(&self, other: &AmapLock) -> bool {
        Arc::ptr_eq(self.lock, other)
    }

    pub fn held(&self) -> bool {
        self.guard.is_some()
    }

    /// Releases the lock without consuming the guard. Used on return paths
    /// whose contract is "lock not held on exit".
    pub fn unlock(&mut self) {
        assert!(self.guard.take().is_some(), "container lock already released");
    }

    /// Drops the lock, yields the processor briefly, and retakes it.
    ///
    /// The natural order is descriptor lock before object lock; when the
    /// object side is walking the opposite direction the only safe move is
    /// to back off and let it finish.
    pub(crate) fn backoff(&mut self) {
        assert!(self.guard.take().is_some(), "backoff without the lock held");
        #[cfg(test)]
        std::thread::yield_now();
        core::hint::spin_loop();
        self.guard = Some(self.lock.write());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `owns` tracks lock identity, not lock state.
    #[test]
    fn test_guard_identity() {
        let a = new_amap_lock();
        let b = new_amap_lock();
        let guard = AmapGuard::acquire(&a);
        assert!(guard.owns(&a));
        assert!(guard.owns(&a.clone()));
        assert!(!guard.owns(&b));
    }

    /// Backoff hands the lock back and retakes it; unlock leaves it free
    /// for good.
    #[test]
    fn test_backoff_releases_and_retakes() {
        let lock = new_amap_lock();
        let mut guard = AmapGuard::acquire(&lock);
        assert!(guard.held());
        guard.backoff();
        assert!(guard.held());
        guard.unlock();
        assert!(!guard.held());
        // Lock is free again.
        drop(lock.write());
    }

    #[test]
    #[should_panic(expected = "container lock already released")]
    fn test_double_unlock_panics() {
        let lock = new_amap_lock();
        let mut guard = AmapGuard::acquire(&lock);
        guard.unlock();
        guard.unlock();
    }
}
