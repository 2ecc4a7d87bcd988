//! Virtual memory: page tables, per-process user memory, and `mmap`.
//!
//! The process image is the contiguous region `[0, size)` managed by
//! `UserMemory`. `mmap` regions overlay pages of that image (growing it
//! when the kernel picks the address); each region is described by an
//! `MmapRegion` on the owning `Mm`'s region list. Shared regions are
//! reference counted and their frames are aliased into every sharer's
//! page table.
//!
//! The `Mm` itself is shared between `CLONE_VM` threads and carries two
//! locks: one for the page table and size, one for the region list.

use core::cmp;
use core::ptr::NonNull;

use crate::arch::memlayout::{kva2pa, pa2kva, KERNBASE};
use crate::arch::mmu::{pgrounddown, pgroundup, pte_addr, px, PteFlags, NPTENTRIES, PGSIZE};
use crate::error::{KernelError, Result};
use crate::fs::InodeGuard;
use crate::kalloc::Kmem;
use crate::kernel::Kernel;
use crate::list::ListEntry;
use crate::list_entry;
use crate::lock::SpinLock;
use crate::page::Page;
use crate::proc::{KernelCtx, RcFile};

/// Memory-protection bits for `mmap`.
pub const PROT_NONE: u32 = 0;
pub const PROT_READ: u32 = 1;
pub const PROT_WRITE: u32 = 2;
pub const PROT_EXEC: u32 = 4;

bitflags::bitflags! {
    pub struct MapFlags: u32 {
        const SHARED = 1;
        const PRIVATE = 2;
        const ANONYMOUS = 4;
    }
}

/// A user virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UVAddr(usize);

/// Entry point for the trap handler's page-fault path: admit the fault
/// through the region list or mark the process killed (an access
/// violation terminates it on return to user space).
pub fn user_page_fault(addr: usize, err: u32, ctx: &KernelCtx<'_>) {
    let is_write = err & crate::arch::trap::FEC_WR != 0;
    if ctx.mm().handle_page_fault(addr, is_write).is_err() {
        log::warn!(
            "pid {}: segmentation fault at {:#x} (err {:#x})",
            ctx.pid(),
            addr,
            err
        );
        ctx.proc().kill();
    }
}

impl UVAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn into_usize(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PGSIZE == 0
    }
}

impl core::ops::Add<usize> for UVAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// One page-table entry.
#[derive(Default)]
#[repr(transparent)]
struct Pte(usize);

impl Pte {
    fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    fn addr(&self) -> usize {
        pte_addr(self.0)
    }

    fn set(&mut self, pa: usize, flags: PteFlags) {
        debug_assert_eq!(pa % PGSIZE, 0);
        self.0 = pa | flags.bits();
    }

    /// Replaces only the permission bits, keeping the frame address.
    fn set_flags(&mut self, flags: PteFlags) {
        self.0 = self.addr() | flags.bits();
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

#[repr(C, align(4096))]
struct RawPageTable {
    inner: [Pte; NPTENTRIES],
}

/// A two-level x86 page table for one address space.
///
/// # Safety
///
/// `dir` uniquely refers to a page directory whose present user entries
/// point at valid leaf-table pages, all allocated from the page
/// allocator.
pub struct PageTable {
    dir: *mut RawPageTable,
}

// SAFETY: PageTable is always reached under its owner's lock.
unsafe impl Send for PageTable {}

impl PageTable {
    /// Allocates an empty page directory and applies the externally
    /// provided kernel-half mappings.
    fn new(kmem: &SpinLock<Kmem>) -> Result<Self> {
        let mut page = kmem.lock().alloc().ok_or(KernelError::ENOMEM)?;
        page.write_bytes(0);
        let dir = page.into_usize() as *mut RawPageTable;
        let pt = Self { dir };
        pt.install_kernel_half();
        Ok(pt)
    }

    /// Maps the kernel half of the address space. The mappings come from
    /// the boot code; a hosted build has none.
    fn install_kernel_half(&self) {
        cfg_if::cfg_if! {
            if #[cfg(all(target_arch = "x86", target_os = "none"))] {
                extern "C" {
                    // vm bootstrap: copy the kernel PDEs into a new
                    // directory.
                    fn kvm_install(dir: usize);
                }
                unsafe { kvm_install(self.dir as usize) };
            }
        }
    }

    fn dir_addr(&self) -> usize {
        self.dir as usize
    }

    /// The PTE for `va`, if its leaf table exists.
    fn walk_lookup(&mut self, va: usize) -> Option<&mut Pte> {
        // SAFETY: dir is a valid directory page per the invariant.
        let dir = unsafe { &mut *self.dir };
        let pde = &dir.inner[px(1, va)];
        if !pde.is_present() {
            return None;
        }
        // SAFETY: present directory entries point at valid leaf tables.
        let table = unsafe { &mut *(pa2kva(pde.addr()) as *mut RawPageTable) };
        Some(&mut table.inner[px(0, va)])
    }

    /// The PTE for `va`, allocating the leaf table if needed.
    fn walk_alloc(&mut self, va: usize, kmem: &SpinLock<Kmem>) -> Option<&mut Pte> {
        // SAFETY: dir is a valid directory page per the invariant.
        let dir = unsafe { &mut *self.dir };
        let pde = &mut dir.inner[px(1, va)];
        if !pde.is_present() {
            let mut page = kmem.lock().alloc()?;
            page.write_bytes(0);
            let table = page.into_usize();
            pde.set(kva2pa(table), PteFlags::P | PteFlags::W | PteFlags::U);
        }
        // SAFETY: present directory entries point at valid leaf tables.
        let table = unsafe { &mut *(pa2kva(pde.addr()) as *mut RawPageTable) };
        Some(&mut table.inner[px(0, va)])
    }

    /// Creates the PTE for the page at `va` referring to frame `pa`.
    fn map_page(
        &mut self,
        va: usize,
        pa: usize,
        perm: PteFlags,
        kmem: &SpinLock<Kmem>,
    ) -> Result<()> {
        debug_assert_eq!(va % PGSIZE, 0);
        let pte = self.walk_alloc(va, kmem).ok_or(KernelError::ENOMEM)?;
        assert!(!pte.is_present(), "remap");
        pte.set(pa, perm | PteFlags::P);
        Ok(())
    }

    /// Frees every present user frame and then the paging structures
    /// themselves.
    fn free(mut self, kmem: &SpinLock<Kmem>) {
        // SAFETY: exclusive ownership of the whole tree.
        unsafe {
            let dir = &mut *self.dir;
            for (i, pde) in dir.inner.iter_mut().enumerate() {
                if !pde.is_present() {
                    continue;
                }
                // Kernel-half mappings are shared with every address
                // space, not owned by this one.
                if cfg!(all(target_arch = "x86", target_os = "none"))
                    && i * NPTENTRIES * PGSIZE >= KERNBASE
                {
                    continue;
                }
                let table = &mut *(pa2kva(pde.addr()) as *mut RawPageTable);
                for pte in table.inner.iter_mut() {
                    if pte.is_present() {
                        kmem.lock().free(Page::from_usize(pa2kva(pte.addr())));
                        pte.clear();
                    }
                }
                kmem.lock()
                    .free(Page::from_usize(table as *mut _ as usize));
                pde.clear();
            }
            kmem.lock().free(Page::from_usize(self.dir as usize));
        }
        self.dir = core::ptr::null_mut();
        core::mem::forget(self);
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        if !self.dir.is_null() {
            panic!("PageTable leaked; free it through its owner");
        }
    }
}

/// The contiguous process image plus its page table.
pub struct UserMemory {
    pt: PageTable,
    /// Size of the image region starting at address 0.
    size: usize,
}

impl UserMemory {
    /// An empty address space; if `src` is given, its bytes land at
    /// address 0 (the initcode image).
    pub fn new(src: Option<&[u8]>, kmem: &SpinLock<Kmem>) -> Result<Self> {
        let pt = PageTable::new(kmem)?;
        let mut mem = Self { pt, size: 0 };
        if let Some(src) = src {
            assert!(src.len() <= PGSIZE, "initcode larger than a page");
            if let Err(e) = mem
                .grow_to(PGSIZE, kmem)
                .and_then(|_| mem.copy_out_bytes(UVAddr::new(0), src))
            {
                mem.free(kmem);
                return Err(e);
            }
        }
        Ok(mem)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_dir_addr(&self) -> usize {
        self.pt.dir_addr()
    }

    /// Grows the image to `newsz`, allocating zeroed, user-writable
    /// pages. Returns the new size.
    pub fn grow_to(&mut self, newsz: usize, kmem: &SpinLock<Kmem>) -> Result<usize> {
        if newsz <= self.size {
            return Ok(self.size);
        }
        let oldsz = self.size;
        let mut a = pgroundup(self.size);
        while a < newsz {
            let mut page = match kmem.lock().alloc() {
                Some(p) => p,
                None => {
                    self.shrink_to(oldsz, kmem);
                    return Err(KernelError::ENOMEM);
                }
            };
            page.write_bytes(0);
            let pa = kva2pa(page.into_usize());
            if self
                .pt
                .map_page(a, pa, PteFlags::W | PteFlags::U, kmem)
                .is_err()
            {
                // SAFETY: the frame was never mapped; we still own it.
                kmem.lock().free(unsafe { Page::from_usize(pa2kva(pa)) });
                self.shrink_to(oldsz, kmem);
                return Err(KernelError::ENOMEM);
            }
            a += PGSIZE;
        }
        self.size = newsz;
        Ok(newsz)
    }

    /// Shrinks the image to `newsz`, freeing whole pages past it.
    pub fn shrink_to(&mut self, newsz: usize, kmem: &SpinLock<Kmem>) -> usize {
        if newsz >= self.size {
            return self.size;
        }
        let mut a = pgroundup(newsz);
        while a < pgroundup(self.size) {
            if let Some(pte) = self.pt.walk_lookup(a) {
                if pte.is_present() {
                    let pa = pte.addr();
                    pte.clear();
                    // SAFETY: the frame was owned by this image.
                    kmem.lock().free(unsafe { Page::from_usize(pa2kva(pa)) });
                }
            }
            a += PGSIZE;
        }
        self.size = newsz;
        newsz
    }

    /// Grow or shrink by `n` bytes; returns the old size (the `sbrk`
    /// contract).
    pub fn resize(&mut self, n: i32, kmem: &SpinLock<Kmem>) -> Result<usize> {
        let old = self.size;
        if n > 0 {
            self.grow_to(old + n as usize, kmem)?;
        } else if n < 0 {
            let shrink = -(n as isize) as usize;
            if shrink > old {
                return Err(KernelError::EINVAL);
            }
            self.shrink_to(old - shrink, kmem);
        }
        Ok(old)
    }

    /// Strips the user bit from the page holding `va`; exec uses it to
    /// plant an inaccessible guard page below the stack.
    pub fn clear_user(&mut self, va: UVAddr) {
        let pte = self
            .pt
            .walk_lookup(va.into_usize())
            .expect("clear_user: unmapped");
        let flags = pte.flags() - PteFlags::U;
        pte.set_flags(flags);
    }

    /// The kernel-addressable bytes of the frame mapped at page-aligned
    /// `va`.
    fn page_slice(&mut self, va: usize) -> Option<&mut [u8; PGSIZE]> {
        debug_assert_eq!(va % PGSIZE, 0);
        let pte = self.pt.walk_lookup(va)?;
        if !pte.is_present() {
            return None;
        }
        // SAFETY: present user PTEs point at live frames.
        Some(unsafe { &mut *(pa2kva(pte.addr()) as *mut [u8; PGSIZE]) })
    }

    pub fn copy_out_bytes(&mut self, dst: UVAddr, src: &[u8]) -> Result<()> {
        let mut va = dst.into_usize();
        let mut off = 0;
        while off < src.len() {
            let base = pgrounddown(va);
            let page = self.page_slice(base).ok_or(KernelError::EFAULT)?;
            let poff = va - base;
            let n = cmp::min(PGSIZE - poff, src.len() - off);
            page[poff..poff + n].copy_from_slice(&src[off..off + n]);
            va += n;
            off += n;
        }
        Ok(())
    }

    pub fn copy_in_bytes(&mut self, dst: &mut [u8], src: UVAddr) -> Result<()> {
        let mut va = src.into_usize();
        let mut off = 0;
        while off < dst.len() {
            let base = pgrounddown(va);
            let page = self.page_slice(base).ok_or(KernelError::EFAULT)?;
            let poff = va - base;
            let n = cmp::min(PGSIZE - poff, dst.len() - off);
            dst[off..off + n].copy_from_slice(&page[poff..poff + n]);
            va += n;
            off += n;
        }
        Ok(())
    }

    /// Loads `sz` bytes of an inode at `offset` into memory at `va`.
    /// The pages must already be mapped.
    pub fn load_file(
        &mut self,
        va: UVAddr,
        ip: &mut InodeGuard<'_>,
        offset: u32,
        sz: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<()> {
        assert!(va.is_page_aligned(), "load_file: unaligned va");
        let mut done = 0;
        while done < sz {
            let n = cmp::min(sz - done, PGSIZE as u32);
            let page = self
                .page_slice(va.into_usize() + done as usize)
                .expect("load_file: unmapped page");
            let read = ip.read_bytes_kernel(&mut page[..n as usize], offset + done, ctx)?;
            if read != n as usize {
                return Err(KernelError::EIO);
            }
            done += n;
        }
        Ok(())
    }

    /// Copies the whole image (page table and frames) for `fork`.
    pub fn clone_image(&mut self, kmem: &SpinLock<Kmem>) -> Result<Self> {
        let mut new = UserMemory::new(None, kmem)?;
        let mut a = 0;
        while a < self.size {
            let (pa, flags) = {
                let pte = self.pt.walk_lookup(a).expect("clone_image: hole");
                assert!(pte.is_present(), "clone_image: page not present");
                (pte.addr(), pte.flags())
            };
            let mut page = match kmem.lock().alloc() {
                Some(p) => p,
                None => {
                    new.free(kmem);
                    return Err(KernelError::ENOMEM);
                }
            };
            // SAFETY: pa is a frame of this image.
            page.copy_from_slice(unsafe { &*(pa2kva(pa) as *const [u8; PGSIZE]) });
            let new_pa = kva2pa(page.into_usize());
            if new.pt.map_page(a, new_pa, flags - PteFlags::P, kmem).is_err() {
                // SAFETY: the copy was never mapped; we still own it.
                kmem.lock().free(unsafe { Page::from_usize(pa2kva(new_pa)) });
                new.free(kmem);
                return Err(KernelError::ENOMEM);
            }
            a += PGSIZE;
        }
        new.size = self.size;
        Ok(new)
    }

    /// Frees every frame and paging structure.
    pub fn free(self, kmem: &SpinLock<Kmem>) {
        self.pt.free(kmem);
    }
}

/// A mapped region created by `mmap`.
pub struct MmapRegion {
    pub start: usize,
    pub length: usize,
    pub prot: u32,
    pub flags: MapFlags,
    pub offset: u32,
    inner: SpinLock<RegionInner>,
}

struct RegionInner {
    users: i32,
    file: Option<RcFile>,
}

impl MmapRegion {
    fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.start + pgroundup(self.length)
    }
}

/// Node linking a region into one `Mm`'s region list.
pub struct RegionNode {
    link: ListEntry,
    region: NonNull<MmapRegion>,
}

// SAFETY: nodes are only reached under their list's lock.
unsafe impl Send for RegionNode {}

/// A process address space: page table, image size, `mmap` regions.
/// Shared between `CLONE_VM` threads.
pub struct Mm {
    inner: SpinLock<MmInner>,
    regions: SpinLock<RegionList>,
}

struct MmInner {
    users: i32,
    mem: Option<UserMemory>,
}

struct RegionList {
    head: ListEntry,
    initialized: bool,
}

// SAFETY: all mutation happens under the two inner locks.
unsafe impl Send for Mm {}
unsafe impl Sync for Mm {}

impl Mm {
    /// Allocates an `Mm` with a fresh, empty address space.
    pub fn new(kernel: &Kernel) -> Result<NonNull<Mm>> {
        let mem = UserMemory::new(None, &kernel.kmem)?;
        Self::from_memory(kernel, mem)
    }

    /// Wraps an already-built `UserMemory` (exec's fresh image).
    pub fn from_memory(kernel: &Kernel, mem: UserMemory) -> Result<NonNull<Mm>> {
        let mm = Mm {
            inner: SpinLock::new(
                "mm",
                MmInner {
                    users: 1,
                    mem: Some(mem),
                },
            ),
            regions: SpinLock::new(
                "mmap_list",
                RegionList {
                    head: ListEntry::new(),
                    initialized: false,
                },
            ),
        };
        let ptr = match kernel.caches().mm.alloc(&kernel.slab, &kernel.kmem, mm) {
            Ok(p) => p,
            Err(mut mm) => {
                // Reclaim the memory we were handed.
                if let Some(mem) = mm.inner.get_mut().mem.take() {
                    mem.free(&kernel.kmem);
                }
                return Err(KernelError::ENOMEM);
            }
        };
        // SAFETY: freshly placed; the list head now has a stable address.
        unsafe {
            let r = ptr.as_ref();
            let mut guard = r.regions.lock();
            guard.head.init();
            guard.initialized = true;
        }
        Ok(ptr)
    }

    pub fn incref(&self) {
        self.inner.lock().users += 1;
    }

    pub fn size(&self) -> usize {
        let guard = self.inner.lock();
        guard.mem.as_ref().map(|m| m.size()).unwrap_or(0)
    }

    pub fn page_dir_addr(&self) -> usize {
        let guard = self.inner.lock();
        guard.mem.as_ref().expect("mm torn down").page_dir_addr()
    }

    /// Runs `f` with the locked `UserMemory`.
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut UserMemory) -> R) -> R {
        let mut guard = self.inner.lock();
        f(guard.mem.as_mut().expect("mm torn down"))
    }

    /// Swaps in a fresh image (exec), returning the old one.
    pub fn replace_memory(&self, mem: UserMemory) -> UserMemory {
        let mut guard = self.inner.lock();
        core::mem::replace(&mut guard.mem, Some(mem)).expect("mm torn down")
    }

    pub fn copy_out_bytes(&self, dst: UVAddr, src: &[u8]) -> Result<()> {
        self.with_memory(|mem| mem.copy_out_bytes(dst, src))
    }

    pub fn copy_in_bytes(&self, dst: &mut [u8], src: UVAddr) -> Result<()> {
        self.with_memory(|mem| mem.copy_in_bytes(dst, src))
    }

    /// Copies a NUL-terminated string in from user space. Fails with
    /// `EFAULT` if no NUL shows up within `buf`.
    pub fn copy_in_str(&self, buf: &mut [u8], src: UVAddr) -> Result<()> {
        self.with_memory(|mem| {
            for i in 0..buf.len() {
                let mut byte = [0u8; 1];
                mem.copy_in_bytes(&mut byte, src + i)?;
                buf[i] = byte[0];
                if byte[0] == 0 {
                    return Ok(());
                }
            }
            Err(KernelError::EFAULT)
        })
    }

    /// The `sbrk` work horse; returns the old size.
    pub fn resize(&self, n: i32, kernel: &Kernel) -> Result<usize> {
        self.with_memory(|mem| mem.resize(n, &kernel.kmem))
    }

    /// Creates a new mapping. With a null `addr` the kernel places the
    /// region at the top of the image and grows it; otherwise `addr`
    /// must be page-aligned (typically inside memory the caller already
    /// allocated). The region is pre-faulted: pages are mapped writable
    /// for the kernel, zeroed, filled from the backing file, then
    /// dropped to the requested protection.
    pub fn mmap(
        &self,
        addr: usize,
        length: usize,
        prot: u32,
        flags: MapFlags,
        file: Option<RcFile>,
        offset: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize> {
        let kernel = ctx.kernel();
        let free_file = |file: Option<RcFile>| {
            if let Some(f) = file {
                crate::file::fileclose(f, ctx);
            }
        };
        if length == 0 || !flags.intersects(MapFlags::SHARED | MapFlags::PRIVATE) {
            free_file(file);
            return Err(KernelError::EINVAL);
        }
        if addr % PGSIZE != 0 {
            free_file(file);
            return Err(KernelError::EINVAL);
        }
        if !flags.contains(MapFlags::ANONYMOUS) {
            let ok = match file.as_ref() {
                None => false,
                Some(f) => {
                    f.is_regular_inode()
                        && (prot & PROT_READ == 0 || f.readable())
                        && (prot & PROT_WRITE == 0
                            || f.writable()
                            || !flags.contains(MapFlags::SHARED))
                }
            };
            if !ok {
                free_file(file);
                return Err(KernelError::EACCES);
            }
        }

        // Phase 1: pick the range and pre-fault it writable and zeroed.
        let start = {
            let mut guard = self.inner.lock();
            let mem = guard.mem.as_mut().expect("mm torn down");
            let start = if addr == 0 {
                pgroundup(mem.size())
            } else {
                addr
            };
            let end = start + pgroundup(length);
            // An explicit address must overlay memory the process
            // already owns; a gap below the region would leave holes in
            // the image that fork cannot copy.
            if addr != 0 && end > pgroundup(mem.size()) {
                drop(guard);
                free_file(file);
                return Err(KernelError::EINVAL);
            }
            let mut a = start;
            let mut failed = false;
            while a < end {
                let mapped = mem
                    .pt
                    .walk_lookup(a)
                    .map(|pte| pte.is_present())
                    .unwrap_or(false);
                if mapped {
                    let pte = mem.pt.walk_lookup(a).unwrap();
                    pte.set_flags(PteFlags::P | PteFlags::W);
                    mem.page_slice(a).unwrap().fill(0);
                } else {
                    let page = kernel.kmem.lock().alloc();
                    let mut page = match page {
                        Some(p) => p,
                        None => {
                            failed = true;
                            break;
                        }
                    };
                    page.write_bytes(0);
                    let pa = kva2pa(page.into_usize());
                    if mem.pt.map_page(a, pa, PteFlags::W, &kernel.kmem).is_err() {
                        // SAFETY: never mapped, still ours.
                        kernel.kmem.lock().free(unsafe { Page::from_usize(pa2kva(pa)) });
                        failed = true;
                        break;
                    }
                }
                a += PGSIZE;
            }
            if failed {
                drop(guard);
                free_file(file);
                return Err(KernelError::ENOMEM);
            }
            if end > mem.size() {
                mem.size = end;
            }
            start
        };

        // Phase 2: populate from the backing file, inode locked, the mm
        // lock taken only per-page (the inode read may sleep on disk).
        if !flags.contains(MapFlags::ANONYMOUS) {
            let f = file.as_ref().expect("checked above");
            if let Err(e) = self.populate_from_file(f, start, length, offset, ctx) {
                free_file(file);
                return Err(e);
            }
        }

        // Phase 3: drop to the requested protection. User-visible iff
        // readable or executable; writable only when asked.
        {
            let mut perm = PteFlags::P;
            if prot & (PROT_READ | PROT_EXEC) != 0 {
                perm |= PteFlags::U;
            }
            if prot & PROT_WRITE != 0 {
                perm |= PteFlags::W;
            }
            let mut guard = self.inner.lock();
            let mem = guard.mem.as_mut().expect("mm torn down");
            let mut a = start;
            while a < start + pgroundup(length) {
                mem.pt.walk_lookup(a).unwrap().set_flags(perm);
                a += PGSIZE;
            }
        }

        // Record the region.
        let region = MmapRegion {
            start,
            length,
            prot,
            flags,
            offset,
            inner: SpinLock::new("mmap", RegionInner { users: 1, file }),
        };
        let region = match kernel
            .caches()
            .region
            .alloc(&kernel.slab, &kernel.kmem, region)
        {
            Ok(r) => r,
            Err(mut region) => {
                free_file(region.inner.get_mut().file.take());
                return Err(KernelError::ENOMEM);
            }
        };
        if let Err(e) = self.push_region(region, kernel) {
            // SAFETY: the region was never linked anywhere.
            unsafe {
                let file = region.as_ref().inner.lock().file.take();
                free_file(file);
                kernel
                    .caches()
                    .region
                    .free(&kernel.slab, &kernel.kmem, region);
            }
            return Err(e);
        }
        Ok(start)
    }

    /// Reads the backing file into the freshly mapped range.
    fn populate_from_file(
        &self,
        file: &RcFile,
        start: usize,
        length: usize,
        offset: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<()> {
        let ip = file.inode().ok_or(KernelError::EACCES)?;
        let mut guard = ip.lock(ctx);
        let mut a = start;
        while a < start + length {
            let pa = {
                let mut inner = self.inner.lock();
                let mem = inner.mem.as_mut().expect("mm torn down");
                mem.pt.walk_lookup(a).expect("populate: unmapped").addr()
            };
            // SAFETY: the frame was just mapped for this region and is
            // not yet visible to user space.
            let page = unsafe { &mut *(pa2kva(pa) as *mut [u8; PGSIZE]) };
            let n = cmp::min(PGSIZE, start + length - a);
            let off = offset + (a - start) as u32;
            let read = guard.read_bytes_kernel(&mut page[..n], off, ctx)?;
            if read < n {
                break; // EOF: the rest stays zero.
            }
            a += PGSIZE;
        }
        drop(guard);
        Ok(())
    }

    fn push_region(&self, region: NonNull<MmapRegion>, kernel: &Kernel) -> Result<()> {
        let node = RegionNode {
            link: ListEntry::new(),
            region,
        };
        let node = kernel
            .caches()
            .region_node
            .alloc(&kernel.slab, &kernel.kmem, node)
            .map_err(|_| KernelError::ENOMEM)?;
        let guard = self.regions.lock();
        assert!(guard.initialized, "mm regions used before init");
        // SAFETY: the node was just placed and the list lock is held.
        unsafe {
            node.as_ref().link.init();
            guard.head.push_back(&node.as_ref().link);
        }
        drop(guard);
        Ok(())
    }

    /// Duplicates this address space for a no-`CLONE_VM` clone: the
    /// image (regions included) is deep-copied; then PRIVATE regions get
    /// their own descriptor and file reference, while SHARED regions are
    /// re-shared by walking the parent's PTEs and aliasing the same
    /// frames over the child's copies.
    pub fn clone_for_fork(&self, ctx: &KernelCtx<'_>) -> Result<NonNull<Mm>> {
        let kernel = ctx.kernel();
        let new_mm = {
            let mut guard = self.inner.lock();
            let mem = guard.mem.as_mut().expect("mm torn down");
            let new_mem = mem.clone_image(&kernel.kmem)?;
            Mm::from_memory(kernel, new_mem)?
        };

        let result = (|| {
            let regions = self.regions.lock();
            for e in regions.head.iter() {
                // SAFETY: only RegionNode links are on this list.
                let node = unsafe { list_entry!(e, RegionNode, link) };
                // SAFETY: the node holds a count on the region.
                let region = unsafe { node.region.as_ref() };
                // SAFETY: new_mm is exclusively ours until returned.
                unsafe { new_mm.as_ref() }.adopt_region(region, self, ctx)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(new_mm),
            Err(e) => {
                Mm::put(new_mm, ctx);
                Err(e)
            }
        }
    }

    /// Makes `region` (from the parent address space) visible in this
    /// freshly cloned one.
    fn adopt_region(
        &self,
        region: &MmapRegion,
        parent: &Mm,
        ctx: &KernelCtx<'_>,
    ) -> Result<()> {
        let kernel = ctx.kernel();
        if region.flags.contains(MapFlags::SHARED) {
            region.inner.lock().users += 1;
            // Replace our copied frames with aliases of the parent's.
            let mut guard = self.inner.lock();
            let mem = guard.mem.as_mut().expect("mm torn down");
            let mut parent_guard = parent.inner.lock();
            let parent_mem = parent_guard.mem.as_mut().expect("mm torn down");
            let mut a = region.start;
            while a < region.start + pgroundup(region.length) {
                let (pa, flags) = {
                    let pte = parent_mem
                        .pt
                        .walk_lookup(a)
                        .expect("adopt_region: parent hole");
                    (pte.addr(), pte.flags())
                };
                let pte = mem.pt.walk_lookup(a).expect("adopt_region: child hole");
                if pte.is_present() {
                    // SAFETY: the copy belongs to the child alone.
                    kernel
                        .kmem
                        .lock()
                        .free(unsafe { Page::from_usize(pa2kva(pte.addr())) });
                }
                pte.set(pa, flags);
                a += PGSIZE;
            }
            drop(parent_guard);
            drop(guard);
            self.push_region(NonNull::from(region), kernel)
        } else {
            // Private: the image copy already duplicated the frames; the
            // child just needs its own descriptor and file reference.
            let file = {
                let rguard = region.inner.lock();
                rguard.file.as_ref().map(crate::file::dup_file)
            };
            let copy = MmapRegion {
                start: region.start,
                length: region.length,
                prot: region.prot,
                flags: region.flags,
                offset: region.offset,
                inner: SpinLock::new("mmap", RegionInner { users: 1, file }),
            };
            let copy = match kernel
                .caches()
                .region
                .alloc(&kernel.slab, &kernel.kmem, copy)
            {
                Ok(c) => c,
                Err(mut copy) => {
                    if let Some(f) = copy.inner.get_mut().file.take() {
                        crate::file::fileclose(f, ctx);
                    }
                    return Err(KernelError::ENOMEM);
                }
            };
            self.push_region(copy, kernel)
        }
    }

    /// Tears down the region list when the last thread of the group
    /// exits: un-shares shared regions, writes back dirty shared
    /// file-backed pages, releases descriptors. Earlier-exiting threads
    /// of a live group leave everything in place.
    pub fn drop_regions(&self, ctx: &KernelCtx<'_>) {
        if self.inner.lock().users > 1 {
            return;
        }
        let kernel = ctx.kernel();
        loop {
            let node = {
                let guard = self.regions.lock();
                if !guard.initialized || guard.head.is_empty() {
                    break;
                }
                let first = guard.head.next();
                // SAFETY: only RegionNode links are on this list.
                let node = unsafe { list_entry!(first, RegionNode, link) };
                first.remove();
                NonNull::from(node)
            };
            // SAFETY: the node is now unlinked and exclusively ours.
            let region = unsafe { node.as_ref() }.region;
            let still_shared = {
                // SAFETY: we hold a count on the region.
                let mut rguard = unsafe { region.as_ref() }.inner.lock();
                rguard.users -= 1;
                rguard.users > 0
            };
            // SAFETY: live until freed below.
            let r = unsafe { region.as_ref() };
            if still_shared {
                // Clear our aliases so freeing the page table does not
                // free frames other sharers still map.
                let mut guard = self.inner.lock();
                let mem = guard.mem.as_mut().expect("mm torn down");
                let mut a = r.start;
                while a < r.start + pgroundup(r.length) {
                    if let Some(pte) = mem.pt.walk_lookup(a) {
                        pte.clear();
                    }
                    a += PGSIZE;
                }
            } else {
                self.write_back_region(r, ctx);
                let file = r.inner.lock().file.take();
                if let Some(f) = file {
                    crate::file::fileclose(f, ctx);
                }
                // SAFETY: the last user frees the region; its frames are
                // freed with the page table.
                unsafe {
                    kernel
                        .caches()
                        .region
                        .free(&kernel.slab, &kernel.kmem, region)
                };
            }
            // SAFETY: the node is unlinked.
            unsafe {
                kernel
                    .caches()
                    .region_node
                    .free(&kernel.slab, &kernel.kmem, node)
            };
        }
    }

    /// Writes dirty pages of a SHARED, file-backed region back to its
    /// file.
    fn write_back_region(&self, region: &MmapRegion, ctx: &KernelCtx<'_>) {
        if !region.flags.contains(MapFlags::SHARED) || region.flags.contains(MapFlags::ANONYMOUS)
        {
            return;
        }
        let file = {
            let rguard = region.inner.lock();
            match rguard.file.as_ref() {
                Some(f) => crate::file::dup_file(f),
                None => return,
            }
        };
        let mut a = region.start;
        while a < region.start + pgroundup(region.length) {
            let dirty_pa = {
                let mut guard = self.inner.lock();
                let mem = guard.mem.as_mut().expect("mm torn down");
                match mem.pt.walk_lookup(a) {
                    Some(pte) if pte.is_present() && pte.flags().contains(PteFlags::D) => {
                        Some(pte.addr())
                    }
                    _ => None,
                }
            };
            if let Some(pa) = dirty_pa {
                let off_in_region = a - region.start;
                let n = cmp::min(PGSIZE, region.length - off_in_region);
                // SAFETY: pa is a live frame of this region; no user task
                // of this mm can run anymore.
                let bytes = unsafe { &(*(pa2kva(pa) as *const [u8; PGSIZE]))[..n] };
                let _ = file.write_at_from_kernel(bytes, region.offset + off_in_region as u32, ctx);
            }
            a += PGSIZE;
        }
        crate::file::fileclose(file, ctx);
    }

    /// Handles a user page fault. Only write faults into a readable and
    /// writable region are admitted; the touched page becomes
    /// user-writable and dirty.
    pub fn handle_page_fault(&self, addr: usize, is_write: bool) -> Result<()> {
        if !is_write {
            return Err(KernelError::EFAULT);
        }
        // Find the region first and release the list lock before taking
        // the page-table lock (mmap nests them the other way around).
        let admitted = {
            let guard = self.regions.lock();
            let mut found = None;
            for e in guard.head.iter() {
                // SAFETY: only RegionNode links are on this list.
                let node = unsafe { list_entry!(e, RegionNode, link) };
                // SAFETY: the node holds a count on the region.
                let r = unsafe { node.region.as_ref() };
                if r.contains(addr) {
                    found = Some(r.prot & PROT_WRITE != 0 && r.prot & PROT_READ != 0);
                    break;
                }
            }
            found
        };
        match admitted {
            Some(true) => {}
            _ => return Err(KernelError::EFAULT),
        }
        let mut inner = self.inner.lock();
        let mem = inner.mem.as_mut().expect("mm torn down");
        let pte = mem
            .pt
            .walk_lookup(pgrounddown(addr))
            .ok_or(KernelError::EFAULT)?;
        if !pte.is_present() {
            return Err(KernelError::EFAULT);
        }
        pte.set_flags(PteFlags::P | PteFlags::U | PteFlags::W | PteFlags::D);
        Ok(())
    }

    /// Drops one user. The last user tears down regions, frames and
    /// paging structures.
    pub fn put(this: NonNull<Mm>, ctx: &KernelCtx<'_>) {
        // SAFETY: this is a live counted Mm.
        let me = unsafe { this.as_ref() };
        {
            let mut guard = me.inner.lock();
            guard.users -= 1;
            if guard.users > 0 {
                return;
            }
            // Keep users at 0; drop_regions below must see no co-users.
        }
        me.drop_regions(ctx);
        Self::release(this, ctx.kernel());
    }

    /// Reaper-side put: the exiting task already dropped the regions.
    pub fn put_reaped(this: NonNull<Mm>, kernel: &Kernel) {
        // SAFETY: this is a live counted Mm.
        let me = unsafe { this.as_ref() };
        {
            let mut guard = me.inner.lock();
            guard.users -= 1;
            if guard.users > 0 {
                return;
            }
        }
        debug_assert!(me.regions.lock().head.is_empty(), "regions leak at reap");
        Self::release(this, kernel);
    }

    fn release(this: NonNull<Mm>, kernel: &Kernel) {
        // SAFETY: the count reached zero; we are the only owner.
        let mem = unsafe { this.as_ref() }.inner.lock().mem.take();
        if let Some(mem) = mem {
            mem.free(&kernel.kmem);
        }
        // SAFETY: nothing refers to the Mm anymore.
        unsafe { kernel.caches().mm.free(&kernel.slab, &kernel.kmem, this) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::tests::new_kmem;

    fn kmem() -> &'static SpinLock<Kmem> {
        Box::leak(Box::new(new_kmem(64)))
    }

    #[test]
    fn grow_zeroes_and_copy_round_trips() {
        let kmem = kmem();
        let mut mem = UserMemory::new(None, kmem).unwrap();
        assert_eq!(mem.grow_to(2 * PGSIZE + 17, kmem).unwrap(), 2 * PGSIZE + 17);
        let mut buf = [0xAAu8; 64];
        mem.copy_in_bytes(&mut buf, UVAddr::new(100)).unwrap();
        assert!(buf.iter().all(|&b| b == 0), "fresh pages are zeroed");

        let msg = b"crossing a page boundary here";
        let at = UVAddr::new(PGSIZE - 7);
        mem.copy_out_bytes(at, msg).unwrap();
        let mut back = [0u8; 29];
        mem.copy_in_bytes(&mut back, at).unwrap();
        assert_eq!(&back, msg);
        mem.free(kmem);
    }

    #[test]
    fn copy_past_end_faults() {
        let kmem = kmem();
        let mut mem = UserMemory::new(None, kmem).unwrap();
        mem.grow_to(PGSIZE, kmem).unwrap();
        let err = mem.copy_out_bytes(UVAddr::new(PGSIZE - 2), &[1, 2, 3, 4]);
        assert_eq!(err, Err(KernelError::EFAULT));
        mem.free(kmem);
    }

    #[test]
    fn resize_follows_sbrk_contract() {
        let kmem = kmem();
        let free0 = kmem.lock().nfree();
        let mut mem = UserMemory::new(None, kmem).unwrap();
        assert_eq!(mem.resize(8192, kmem).unwrap(), 0);
        assert_eq!(mem.resize(-4096, kmem).unwrap(), 8192);
        assert_eq!(mem.size(), 4096);
        mem.free(kmem);
        assert_eq!(kmem.lock().nfree(), free0, "all pages returned");
    }

    #[test]
    fn clone_image_is_a_deep_copy() {
        let kmem = kmem();
        let mut mem = UserMemory::new(Some(b"original"), kmem).unwrap();
        let mut copy = mem.clone_image(kmem).unwrap();
        mem.copy_out_bytes(UVAddr::new(0), b"mutated!").unwrap();
        let mut buf = [0u8; 8];
        copy.copy_in_bytes(&mut buf, UVAddr::new(0)).unwrap();
        assert_eq!(&buf, b"original");
        mem.free(kmem);
        copy.free(kmem);
    }

    #[test]
    fn clear_user_strips_the_user_bit() {
        let kmem = kmem();
        let mut mem = UserMemory::new(None, kmem).unwrap();
        mem.grow_to(2 * PGSIZE, kmem).unwrap();
        mem.clear_user(UVAddr::new(0));
        let pte = mem.pt.walk_lookup(0).unwrap();
        assert!(!pte.flags().contains(PteFlags::U));
        assert!(pte.flags().contains(PteFlags::P));
        mem.free(kmem);
    }
}
