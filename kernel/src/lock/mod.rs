//! Locks.
//!
//! A `Lock<R, T>` owns its raw lock and the data it protects; a `Guard`
//! borrows the lock and derefs to the data. Spinlocks serialize short
//! critical sections with interrupts pushed off; sleep locks protect disk
//! contents held across I/O; sleepable locks are spinlocks whose guard can
//! park the process on the lock's own wait channel.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{SleepableLock, SleepableLockGuard};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};

/// Raw locks that can be acquired and released.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
}

/// A lock that owns its raw lock and `data: T`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// SAFETY: the raw lock serializes access to the data.
unsafe impl<R: RawLock, T: Send> Sync for Lock<R, T> {}
unsafe impl<R: RawLock, T: Send> Send for Lock<R, T> {}

/// Guard of a `Lock<R, T>`. Derefs to the protected data.
///
/// # Safety
///
/// While a `Guard` exists, its lock is held by the current thread.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Lock<R, T> {
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Returns a raw pointer to the inner data. The caller must ensure the
    /// access does not race; typically the lock is held via a forgotten
    /// guard.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current thread with its guard
    /// forgotten.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }

    pub(crate) fn raw(&self) -> &R {
        &self.lock
    }
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock while running `f`, then re-acquires
    /// it. The data must not be accessed inside `f` through this guard.
    pub fn reacquire_after<F: FnOnce() -> U, U>(&mut self, f: F) -> U {
        self.lock.lock.release();
        let r = f();
        self.lock.lock.acquire();
        r
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held and the guard is borrowed uniquely.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
