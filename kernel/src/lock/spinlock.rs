//! Spin locks.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use super::{Guard, Lock, RawLock};
use crate::arch::intr::{pop_off, push_off};

/// Mutual exclusion lock that busy-waits (spins) with interrupts pushed
/// off.
pub struct RawSpinLock {
    /// Name of the lock, for diagnostics.
    name: &'static str,

    locked: AtomicBool,
}

/// Locks that busy-wait (spin).
pub type SpinLock<T> = Lock<RawSpinLock, T>;
/// Guards of `SpinLock<T>`.
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinLock, T>;

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl RawLock for RawSpinLock {
    /// Acquires the lock, spinning until it is free.
    ///
    /// The `Acquire` exchange pairs with the `Release` store in
    /// `release()`, so every store made inside one critical section is
    /// visible to the loads of the next.
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock with interrupt handlers.
        push_off();
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
        pop_off();
    }
}

impl<T> SpinLock<T> {
    /// Returns a new `SpinLock` with name `name` holding `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinLock::new(name),
            data: UnsafeCell::new(data),
        }
    }
}
