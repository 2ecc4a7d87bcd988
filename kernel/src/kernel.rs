//! The kernel aggregate.
//!
//! One `Kernel` owns every global subsystem: allocators, the buffer
//! cache, the filesystem registry, the inode and file tables and the
//! process table. The boot path builds a static instance and installs it
//! as the boot kernel (trap entry and `forkret` need an anchor); tests
//! build private instances and drive them through explicit contexts.

use spin::Once;

use crate::bio::{Bcache, BufEntry};
use crate::file::{Devsw, FTable, File};
use crate::fs::{DiskFs, FsTable, Inode, Itable, RcInode};
use crate::hal::BlockDevices;
use crate::kalloc::Kmem;
use crate::lock::{SleepableLock, SpinLock};
use crate::param::{NBUF, NDEV, NFILE, NINODE};
use crate::proc::{FilesStruct, FsInfo, Proc, Procs};
use crate::slab::{SlabAllocator, TypedCache};
use crate::vm::{Mm, MmapRegion, RegionNode};
use crate::{array_arena, mru_arena};

/// Slab caches for the process-lifecycle objects.
pub struct Caches {
    pub proc: TypedCache<Proc>,
    pub mm: TypedCache<Mm>,
    pub files: TypedCache<FilesStruct>,
    pub fs_info: TypedCache<FsInfo>,
    pub region: TypedCache<MmapRegion>,
    pub region_node: TypedCache<RegionNode>,
}

pub struct Kernel {
    /// Timer ticks since boot; its lock doubles as the sleep channel of
    /// `sys_sleep`.
    pub ticks: SleepableLock<u32>,

    pub kmem: SpinLock<Kmem>,
    pub slab: SlabAllocator,
    caches: Once<Caches>,

    pub bdevs: BlockDevices,
    devsw: [Once<Devsw>; NDEV],

    bcache: Bcache,

    fstab: FsTable,
    diskfs: DiskFs,
    itable: Itable,
    ftable: FTable,

    procs: Procs,

    /// Keeps the grafted /proc inode and the canonical procfs root in
    /// the cache forever.
    procfs_pins: Once<(RcInode, RcInode)>,
}

impl Kernel {
    pub const fn zero() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const DEVSW_NONE: Once<Devsw> = Once::new();
        Self {
            ticks: SleepableLock::new("time", 0),
            kmem: SpinLock::new("kmem", Kmem::new()),
            slab: SlabAllocator::new(),
            caches: Once::new(),
            bdevs: BlockDevices::new(),
            devsw: [DEVSW_NONE; NDEV],
            bcache: SpinLock::new("bcache", mru_arena!(BufEntry::zero(); NBUF)),
            fstab: FsTable::new(),
            diskfs: DiskFs::new(),
            itable: SpinLock::new("itable", array_arena!(Inode::zero(); NINODE)),
            ftable: SpinLock::new("ftable", array_arena!(File::zero(); NFILE)),
            procs: Procs::new(),
            procfs_pins: Once::new(),
        }
    }

    /// One-time initialization: hand the physical range to the page
    /// allocator, bootstrap the slab, link up the arenas, register the
    /// standard filesystems.
    ///
    /// # Safety
    ///
    /// `[pa_start, pa_end)` must be unused memory; call once, before
    /// anything else uses this kernel.
    pub unsafe fn init(&'static self, pa_start: usize, pa_end: usize) {
        // SAFETY: per the contract.
        unsafe {
            let kmem = &mut *self.kmem.get_mut_raw();
            kmem.init(pa_start, pa_end);
        }
        self.slab.init();
        let caches = Caches {
            proc: TypedCache::create(&self.slab).expect("proc cache"),
            mm: TypedCache::create(&self.slab).expect("mm cache"),
            files: TypedCache::create(&self.slab).expect("files cache"),
            fs_info: TypedCache::create(&self.slab).expect("fs_info cache"),
            region: TypedCache::create(&self.slab).expect("mmap cache"),
            region_node: TypedCache::create(&self.slab).expect("mmap list cache"),
        };
        let _ = self.caches.call_once(|| caches);
        self.bcache.lock().init();
        self.procs.init();
        crate::logger::init();
        crate::fs::register_basic_filesystems(self);
    }

    pub fn caches(&self) -> &Caches {
        self.caches.get().expect("kernel caches not initialized")
    }

    pub fn procs(&self) -> &Procs {
        &self.procs
    }

    pub fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub fn itable(&self) -> &Itable {
        &self.itable
    }

    pub fn ftable(&self) -> &FTable {
        &self.ftable
    }

    pub fn fs(&self) -> &DiskFs {
        &self.diskfs
    }

    pub fn fstab(&self) -> &FsTable {
        &self.fstab
    }

    /// The device-switch entry for a major number.
    pub fn devsw(&self, major: usize) -> Devsw {
        self.devsw
            .get(major)
            .and_then(|s| s.get())
            .copied()
            .unwrap_or(Devsw {
                read: None,
                write: None,
            })
    }

    /// Registers a character-device driver.
    pub fn register_devsw(&self, major: usize, devsw: Devsw) {
        let _ = self.devsw[major].call_once(|| devsw);
    }

    /// Advances the tick counter and wakes `sys_sleep`ers. The timer
    /// interrupt handler calls this.
    pub fn tick(&self) {
        let mut guard = self.ticks.lock();
        *guard += 1;
        guard.wakeup(self);
    }

    pub fn pin_procfs(&self, grafted: RcInode, root: RcInode) {
        let mut pair = Some((grafted, root));
        let _ = self.procfs_pins.call_once(|| pair.take().expect("pins"));
        if let Some((a, b)) = pair {
            // A second mount: the references are simply forgotten into
            // the cache, which pins them like the first pair.
            core::mem::forget(a);
            core::mem::forget(b);
        }
    }
}

/// The kernel the machine booted. Trap entry and `forkret` need this
/// anchor; everything else receives the kernel through a context.
static BOOT_KERNEL: Once<&'static Kernel> = Once::new();

pub fn install_boot_kernel(kernel: &'static Kernel) {
    let _ = BOOT_KERNEL.call_once(|| kernel);
}

pub fn boot_kernel() -> &'static Kernel {
    BOOT_KERNEL.get().expect("boot kernel not installed")
}

#[cfg(test)]
pub mod testing {
    //! A hosted kernel instance over a RAM disk, driven through an
    //! explicit context for a fabricated current process.

    use core::ptr::NonNull;

    use super::*;
    use crate::arch::mmu::PGSIZE;
    use crate::fs::{DiskFsOps, FsOps, ROOTINO};
    use crate::hal::testing::MemDisk;
    use crate::kalloc::tests::leak_arena;
    use crate::param::ROOTDEV;
    use crate::proc::{KernelCtx, ProcState};

    pub struct TestEnv {
        pub kernel: &'static Kernel,
        pub disk: &'static MemDisk,
        proc: NonNull<Proc>,
    }

    impl TestEnv {
        /// The context of the fabricated current process.
        pub fn ctx(&self) -> KernelCtx<'static> {
            // SAFETY: the fabricated process never runs concurrently
            // with the test body.
            unsafe { KernelCtx::new(self.kernel, &*self.proc.as_ptr()) }
        }
    }

    /// Boots a kernel over the given disk image (512-byte blocks).
    pub fn boot_with_image(image: &[u8]) -> TestEnv {
        boot_with_image_and_pages(image, 1024)
    }

    pub fn boot_with_image_and_pages(image: &[u8], pages: usize) -> TestEnv {
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::zero()));
        let (start, end) = leak_arena(pages);
        // SAFETY: the arena is leaked, unused memory; init runs once.
        unsafe { kernel.init(start, end) };

        let disk: &'static MemDisk = Box::leak(Box::new(MemDisk::from_image(image)));
        kernel.bdevs.register(ROOTDEV, disk);

        // Fabricate the "current" process.
        let proc = kernel.procs().allocproc(kernel).expect("allocproc");
        {
            let _guard = kernel.procs().table();
            // SAFETY: the table lock is held.
            let shared = unsafe { proc.as_ref().shared_mut() };
            shared.state = ProcState::Running;
            shared.group_leader = proc.as_ptr();
            shared.tgid = shared.pid;
        }
        kernel.procs().set_init_proc(proc);

        let env = TestEnv { kernel, disk, proc };
        let ctx = env.ctx();

        // Mount the root filesystem and give the process an address
        // space, files and filesystem state.
        kernel.fs().init(ROOTDEV, &ctx);
        let mm = Mm::new(kernel).expect("mm");
        let files = FilesStruct::new(kernel).expect("files");
        let root = DiskFsOps.get_inode(ROOTDEV, ROOTINO, &ctx);
        let cwd = root.clone();
        let fs_info = FsInfo::new(&ctx, root, cwd, 0).expect("fs_info");
        // SAFETY: the fabricated process cannot run.
        unsafe {
            let data = proc.as_ref().data_mut();
            data.mm = Some(mm);
            data.files = Some(files);
            data.fs = Some(fs_info);
        }
        // Give it some user memory for copy_in/copy_out tests.
        ctx.mm()
            .with_memory(|mem| mem.grow_to(4 * PGSIZE, &kernel.kmem))
            .expect("user pages");
        env
    }

    /// A second fabricated process sharing nothing with the first; used
    /// by tests that need two distinct identities.
    pub fn second_proc(env: &TestEnv) -> KernelCtx<'static> {
        let kernel = env.kernel;
        let ctx = env.ctx();
        let proc = kernel.procs().allocproc(kernel).expect("allocproc");
        {
            let _guard = kernel.procs().table();
            // SAFETY: the table lock is held.
            let shared = unsafe { proc.as_ref().shared_mut() };
            shared.state = ProcState::Running;
            shared.group_leader = proc.as_ptr();
            shared.tgid = shared.pid;
        }
        let mm = Mm::new(kernel).expect("mm");
        let files = FilesStruct::new(kernel).expect("files");
        let root = ctx.fs_info().root();
        let cwd = ctx.fs_info().cwd();
        let fs_info = FsInfo::new(&ctx, root, cwd, 0).expect("fs_info");
        // SAFETY: the fabricated process cannot run.
        unsafe {
            let data = proc.as_ref().data_mut();
            data.mm = Some(mm);
            data.files = Some(files);
            data.fs = Some(fs_info);
            let kernel_ref: &'static Kernel = kernel;
            let ctx2 = KernelCtx::new(kernel_ref, &*proc.as_ptr());
            ctx2.mm()
                .with_memory(|mem| mem.grow_to(4 * PGSIZE, &kernel.kmem))
                .expect("user pages");
            ctx2
        }
    }
}
