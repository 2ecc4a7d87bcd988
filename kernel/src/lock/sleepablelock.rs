//! Spinlocks whose guard can sleep.
//!
//! Used where the protected state doubles as a rendezvous: the log waits
//! for the in-flight transaction, `sys_sleep` waits on the ticks counter.
//! The raw lock's address is the wait channel.

use core::cell::UnsafeCell;

use super::{Guard, Lock, RawLock, RawSpinLock};
use crate::kernel::Kernel;
use crate::proc::KernelCtx;

/// A spinlock whose guards can `sleep()` on the lock and be woken by
/// `wakeup()`.
pub struct RawSleepableLock {
    lock: RawSpinLock,
}

pub type SleepableLock<T> = Lock<RawSleepableLock, T>;
pub type SleepableLockGuard<'s, T> = Guard<'s, RawSleepableLock, T>;

impl RawSleepableLock {
    const fn new(name: &'static str) -> Self {
        Self {
            lock: RawSpinLock::new(name),
        }
    }
}

impl RawLock for RawSleepableLock {
    fn acquire(&self) {
        self.lock.acquire();
    }

    fn release(&self) {
        self.lock.release();
    }
}

impl<T> SleepableLock<T> {
    /// Returns a new `SleepableLock` with name `name` holding `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleepableLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    fn chan(&self) -> usize {
        self.raw() as *const _ as usize
    }
}

impl<T> SleepableLockGuard<'_, T> {
    /// Releases the lock and sleeps on its channel; re-acquires when woken.
    pub fn sleep(&mut self, ctx: &KernelCtx<'_>) {
        let chan = self.lock.chan();
        ctx.kernel().procs().sleep(chan, self, ctx);
    }

    /// Wakes every process sleeping on this lock.
    pub fn wakeup(&self, kernel: &Kernel) {
        kernel.procs().wakeup(self.lock.chan());
    }
}
