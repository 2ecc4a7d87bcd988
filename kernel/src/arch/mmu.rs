//! Page-table entry layout and address arithmetic.
//!
//! The x86 uses two levels of page tables. Entries are one machine word
//! wide, so a 4 KiB table page holds `PGSIZE / size_of::<usize>()` entries
//! (1024 on the 32-bit target). Index widths are derived from that so the
//! walk code reads the same on the target and on a hosted build.

use bitflags::bitflags;

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// log2(PGSIZE).
pub const PGSHIFT: usize = 12;

/// Page-table entries per page-table page.
pub const NPTENTRIES: usize = PGSIZE / core::mem::size_of::<usize>();

/// Bits of index per page-table level.
pub const PXBITS: usize = NPTENTRIES.trailing_zeros() as usize;

pub const fn pgroundup(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

/// Index into the page table at `level` (1 = directory, 0 = leaf table)
/// for virtual address `va`.
pub const fn px(level: usize, va: usize) -> usize {
    (va >> (PGSHIFT + level * PXBITS)) & (NPTENTRIES - 1)
}

bitflags! {
    /// Page-table entry flag bits.
    pub struct PteFlags: usize {
        /// Present.
        const P = 0x001;
        /// Writeable.
        const W = 0x002;
        /// User-accessible.
        const U = 0x004;
        /// Accessed.
        const A = 0x020;
        /// Dirty.
        const D = 0x040;
    }
}

/// Address portion of a page-table entry.
pub const fn pte_addr(pte: usize) -> usize {
    pte & !(PGSIZE - 1)
}

/// Load a page directory into cr3. Only meaningful on the target; a hosted
/// build never switches address spaces.
pub fn load_page_dir(pgdir_pa: usize) {
    cfg_if::cfg_if! {
        if #[cfg(all(target_arch = "x86", target_os = "none"))] {
            unsafe { core::arch::asm!("mov cr3, {}", in(reg) pgdir_pa) };
        } else {
            let _ = pgdir_pa;
        }
    }
}
