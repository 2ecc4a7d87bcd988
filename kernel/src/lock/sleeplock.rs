//! Long-term locks for the contents of disk structures.
//!
//! A sleep lock yields the CPU while waiting to acquire, so it may be held
//! across disk I/O. The busy flag itself is protected by an inner
//! spinlock; the lock's own address is the wait channel.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::SpinLock;
use crate::kernel::Kernel;
use crate::proc::KernelCtx;

pub struct SleepLock<T> {
    /// Is the lock held? Protected by the inner spinlock.
    locked: SpinLock<bool>,

    data: UnsafeCell<T>,
}

// SAFETY: the busy flag serializes access to the data.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

/// Guard of a `SleepLock<T>`.
///
/// # Safety
///
/// While the guard exists the lock is held by the current process.
pub struct SleepLockGuard<'s, T> {
    lock: &'s SleepLock<T>,
    kernel: &'s Kernel,
}

impl<T> SleepLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: SpinLock::new("sleeplock", false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, sleeping while another process holds it.
    pub fn lock<'s>(&'s self, ctx: &KernelCtx<'s>) -> SleepLockGuard<'s, T> {
        let mut guard = self.locked.lock();
        while *guard {
            ctx.kernel()
                .procs()
                .sleep(self as *const _ as usize, &mut guard, ctx);
        }
        *guard = true;
        drop(guard);
        SleepLockGuard {
            lock: self,
            kernel: ctx.kernel(),
        }
    }

    /// Returns a raw pointer to the inner data. The caller must ensure the
    /// access does not race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> SleepLockGuard<'_, T> {
    /// Wait channel of this lock.
    fn chan(&self) -> usize {
        self.lock as *const _ as usize
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held and the guard is borrowed uniquely.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        let chan = self.chan();
        let mut guard = self.lock.locked.lock();
        *guard = false;
        drop(guard);
        self.kernel.procs().wakeup(chan);
    }
}
