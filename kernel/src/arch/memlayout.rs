//! Physical/virtual memory layout of the 32-bit kernel.

use super::mmu::PGSIZE;

/// First kernel virtual address. User memory occupies `[0, KERNBASE)`.
pub const KERNBASE: usize = 0x8000_0000;

/// Top of usable physical memory.
pub const PHYSTOP: usize = 0x0E00_0000;

/// Size of a per-process kernel stack.
pub const KSTACKSIZE: usize = PGSIZE;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        /// Kernel virtual address for a physical address.
        pub const fn pa2kva(pa: usize) -> usize {
            pa + KERNBASE
        }

        /// Physical address behind a kernel virtual address.
        pub const fn kva2pa(kva: usize) -> usize {
            kva - KERNBASE
        }
    } else {
        // Hosted builds run with the process's own flat address space, so
        // "physical" frame addresses are ordinary pointers.
        pub const fn pa2kva(pa: usize) -> usize {
            pa
        }

        pub const fn kva2pa(kva: usize) -> usize {
            kva
        }
    }
}
