//! Interrupt enable/disable discipline.
//!
//! `push_off`/`pop_off` are like `cli`/`sti` except that they are matched:
//! it takes two `pop_off`s to undo two `push_off`s, and if interrupts were
//! initially off, the pair leaves them off. Spinlock acquisition always
//! runs under `push_off` so an interrupt handler can never spin on a lock
//! its own CPU already holds.

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod imp {
    use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    use crate::param::NCPU;

    struct IntrState {
        /// Depth of push_off nesting.
        noff: AtomicI32,
        /// Were interrupts enabled before the outermost push_off?
        intena: AtomicBool,
    }

    #[allow(clippy::declare_interior_mutable_const)]
    const INTR_STATE_INIT: IntrState = IntrState {
        noff: AtomicI32::new(0),
        intena: AtomicBool::new(false),
    };

    static STATES: [IntrState; NCPU] = [INTR_STATE_INIT; NCPU];

    /// Local APIC id of the executing CPU. Supplied by the (external)
    /// interrupt controller driver.
    extern "C" {
        fn cpunum() -> u32;
    }

    fn intr_get() -> bool {
        let eflags: usize;
        unsafe { core::arch::asm!("pushfd; pop {}", out(reg) eflags) };
        eflags & crate::arch::trap::FL_IF as usize != 0
    }

    pub fn push_off() {
        let old = intr_get();
        unsafe { core::arch::asm!("cli") };
        let state = &STATES[unsafe { cpunum() } as usize];
        if state.noff.load(Ordering::Relaxed) == 0 {
            state.intena.store(old, Ordering::Relaxed);
        }
        state.noff.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop_off() {
        assert!(!intr_get(), "pop_off - interruptible");
        let state = &STATES[unsafe { cpunum() } as usize];
        let noff = state.noff.fetch_sub(1, Ordering::Relaxed);
        assert!(noff >= 1, "pop_off");
        if noff == 1 && state.intena.load(Ordering::Relaxed) {
            unsafe { core::arch::asm!("sti") };
        }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod imp {
    // Hosted builds never take kernel interrupts.
    pub fn push_off() {}
    pub fn pop_off() {}
}

pub use imp::{pop_off, push_off};
