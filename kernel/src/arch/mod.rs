//! x86 architecture seams.
//!
//! Everything the kernel core needs from the machine lives here: page-table
//! entry layout, the trap frame, the saved kernel context and the `swtch`
//! contract, and the interrupt enable/disable discipline. The boot loader,
//! descriptor tables, interrupt vectors and the context-switch assembly
//! itself are external collaborators; on a hosted build (unit tests) the
//! privileged pieces compile to stubs that must never be reached.

pub mod context;
pub mod intr;
pub mod memlayout;
pub mod mmu;
pub mod trap;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        extern "C" {
            // lapic.c
            fn cpunum() -> u32;
            // trapasm.S: return-to-user path targeted by a new process's
            // first kernel stack frame.
            fn trapret();
        }

        /// Index of the executing CPU.
        pub fn cpu_id() -> usize {
            unsafe { cpunum() as usize }
        }

        /// Address of the assembly return-to-user stub.
        pub fn trapret_addr() -> usize {
            trapret as usize
        }
    } else {
        pub fn cpu_id() -> usize {
            0
        }

        pub fn trapret_addr() -> usize {
            0
        }
    }
}
