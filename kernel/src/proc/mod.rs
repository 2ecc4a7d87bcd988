//! Processes.
//!
//! A `Proc` is slab-allocated and linked into the process table, its
//! parent's children list and (for threads) a thread group. Fields split
//! three ways: `ProcShared` is guarded by the process-table lock,
//! `ProcData` is private to the running task, and the credentials carry
//! their own small lock because `kill`, procfs and `chown` read them from
//! the outside.
//!
//! The `mm`, files table and fs-info hang off the process as separately
//! reference-counted objects so `clone` can share or copy each one
//! independently.

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::arch::context::Context;
use crate::arch::trap::TrapFrame;
use crate::arena::Rc as ArenaRc;
use crate::file::FTable;
use crate::fs::RcInode;
use crate::kernel::Kernel;
use crate::list::ListEntry;
use crate::lock::{SpinLock, SpinLockGuard};
use crate::param::{MAXPROCNAME, NCPU, NGROUPS_MAX, NOFILE};
use crate::vm::Mm;

mod kernel_ctx;
mod procs;

pub use kernel_ctx::KernelCtx;
pub use procs::{ProcTable, Procs};

pub type Pid = i32;

bitflags::bitflags! {
    /// `clone` flags. `CLONE_SIGHAND` is reserved: no signal handlers
    /// exist yet.
    pub struct CloneFlags: u32 {
        const VM = 0x0000_0100;
        const FS = 0x0000_0200;
        const FILES = 0x0000_0400;
        const SIGHAND = 0x0000_0800;
        const PARENT = 0x0000_8000;
        const THREAD = 0x0001_0000;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleeping",
            ProcState::Runnable => "runnable",
            ProcState::Running => "running",
            ProcState::Zombie => "zombie",
        }
    }
}

/// User and group identity of a process.
#[derive(Clone)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub suid: u32,
    pub gid: u32,
    pub egid: u32,
    pub sgid: u32,
    pub ngroups: usize,
    pub groups: [u32; NGROUPS_MAX],
}

impl Credentials {
    pub const fn root() -> Self {
        Self {
            uid: 0,
            euid: 0,
            suid: 0,
            gid: 0,
            egid: 0,
            sgid: 0,
            ngroups: 0,
            groups: [0; NGROUPS_MAX],
        }
    }

    /// Is `gid` one of the supplementary groups?
    pub fn in_groups(&self, gid: u32) -> bool {
        self.groups[..self.ngroups].contains(&gid)
    }

    /// The effective rwx triple this identity gets on an object owned by
    /// `(uid, gid)` with the given mode. Root is all-powerful.
    pub fn permissions_for(&self, uid: u32, gid: u32, mode: u32) -> u32 {
        if self.euid == 0 {
            7
        } else if self.euid == uid {
            (mode >> 6) & 7
        } else if self.egid == gid || self.in_groups(gid) {
            (mode >> 3) & 7
        } else {
            mode & 7
        }
    }
}

/// State guarded by the process-table lock.
pub struct ProcShared {
    pub state: ProcState,
    pub pid: Pid,
    /// If non-zero, sleeping on this channel.
    pub chan: usize,
    pub parent: *const Proc,
    pub tgid: Pid,
    pub group_leader: *const Proc,
    /// A detached task never becomes a zombie; its slot is reclaimed by
    /// the scheduler.
    pub detached: bool,
    /// Link in the process table.
    pub ptable: ListEntry,
    /// Head of this process's children.
    pub children: ListEntry,
    /// Link in the parent's children list.
    pub siblings: ListEntry,
    /// Link in (or head of) the thread group.
    pub thread_group: ListEntry,
}

/// State private to the running task; no lock needed.
pub struct ProcData {
    /// Bottom of the kernel stack page, 0 if none.
    pub kstack: usize,
    /// Trap frame for the current syscall, placed at the top of kstack.
    pub tf: *mut TrapFrame,
    /// swtch() here to run the process.
    pub context: *mut Context,
    pub name: [u8; MAXPROCNAME],
    pub mm: Option<NonNull<Mm>>,
    pub files: Option<NonNull<FilesStruct>>,
    pub fs: Option<NonNull<FsInfo>>,
}

pub struct Proc {
    shared: UnsafeCell<ProcShared>,
    data: UnsafeCell<ProcData>,
    killed: AtomicBool,
    pub cred: SpinLock<Credentials>,
}

// SAFETY: ProcShared is guarded by the process-table lock, ProcData by
// the "only the running task touches its own data" discipline.
unsafe impl Sync for Proc {}
unsafe impl Send for Proc {}

impl Proc {
    pub fn new() -> Self {
        Self {
            shared: UnsafeCell::new(ProcShared {
                state: ProcState::Unused,
                pid: 0,
                chan: 0,
                parent: ptr::null(),
                tgid: 0,
                group_leader: ptr::null(),
                detached: false,
                ptable: ListEntry::new(),
                children: ListEntry::new(),
                siblings: ListEntry::new(),
                thread_group: ListEntry::new(),
            }),
            data: UnsafeCell::new(ProcData {
                kstack: 0,
                tf: ptr::null_mut(),
                context: ptr::null_mut(),
                name: [0; MAXPROCNAME],
                mm: None,
                files: None,
                fs: None,
            }),
            killed: AtomicBool::new(false),
            cred: SpinLock::new("cred", Credentials::root()),
        }
    }

    /// Shared state. Caller must hold the process-table lock.
    pub unsafe fn shared(&self) -> &ProcShared {
        // SAFETY: per the contract.
        unsafe { &*self.shared.get() }
    }

    /// Shared state, mutable. Caller must hold the process-table lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn shared_mut(&self) -> &mut ProcShared {
        // SAFETY: per the contract.
        unsafe { &mut *self.shared.get() }
    }

    /// Private state. Caller must be the task itself, or know the task
    /// cannot run (embryo being set up, zombie being reaped).
    pub unsafe fn data(&self) -> &ProcData {
        // SAFETY: per the contract.
        unsafe { &*self.data.get() }
    }

    /// Private state, mutable. Same contract as `data`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        // SAFETY: per the contract.
        unsafe { &mut *self.data.get() }
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn clear_killed(&self) {
        self.killed.store(false, Ordering::Release);
    }

    /// Copies `name` (NUL-padded) into the process name.
    pub unsafe fn set_name(&self, name: &[u8]) {
        // SAFETY: same contract as `data_mut`.
        let data = unsafe { self.data_mut() };
        let n = name.len().min(MAXPROCNAME - 1);
        data.name[..n].copy_from_slice(&name[..n]);
        data.name[n..].fill(0);
    }
}

impl Default for Proc {
    fn default() -> Self {
        Self::new()
    }
}

/// Open-file table of a process, shared between threads. The descriptor
/// array lives in its own page, per the classical layout.
pub struct FilesStruct {
    inner: SpinLock<FilesInner>,
}

struct FilesInner {
    users: i32,
    /// Page holding `[Option<RcFile>; NOFILE]`; 0 after teardown.
    fd_page: usize,
}

pub type RcFile = ArenaRc<FTable>;

type FdSlots = [Option<RcFile>; NOFILE];

impl FilesStruct {
    /// Allocates a files table with an empty descriptor page.
    /// Returns the slab pointer, or `None` on memory exhaustion.
    pub fn new(kernel: &Kernel) -> Option<NonNull<FilesStruct>> {
        let mut page = kernel.kmem.lock().alloc()?;
        let slots: &mut core::mem::MaybeUninit<FdSlots> = page.as_uninit_mut();
        slots.write([const { None }; NOFILE]);
        let fd_page = page.into_usize();
        let this = FilesStruct {
            inner: SpinLock::new("files", FilesInner { users: 1, fd_page }),
        };
        match kernel.caches().files.alloc(&kernel.slab, &kernel.kmem, this) {
            Ok(p) => Some(p),
            Err(_) => {
                // SAFETY: the page was just carved out above and holds
                // only `None`s, which need no drop.
                kernel
                    .kmem
                    .lock()
                    .free(unsafe { crate::page::Page::from_usize(fd_page) });
                None
            }
        }
    }

    fn slots<'a>(guard: &'a SpinLockGuard<'_, FilesInner>) -> &'a mut FdSlots {
        assert_ne!(guard.fd_page, 0, "files table already torn down");
        // SAFETY: the fd page is exclusively owned by this table and the
        // lock is held.
        unsafe { &mut *(guard.fd_page as *mut FdSlots) }
    }

    pub fn incref(&self) {
        self.inner.lock().users += 1;
    }

    /// Clones the handle for descriptor `fd`.
    pub fn get(&self, fd: i32) -> Option<RcFile> {
        let guard = self.inner.lock();
        let slots = Self::slots(&guard);
        slots.get(fd as usize)?.as_ref().cloned()
    }

    /// Installs `file` in the lowest free slot.
    pub fn alloc_fd(&self, file: RcFile) -> core::result::Result<i32, RcFile> {
        let guard = self.inner.lock();
        let slots = Self::slots(&guard);
        for (fd, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(fd as i32);
            }
        }
        Err(file)
    }

    /// Installs `file` at exactly `fd`, which must be free.
    pub fn set_fd(&self, fd: i32, file: RcFile) -> core::result::Result<(), RcFile> {
        let guard = self.inner.lock();
        let slots = Self::slots(&guard);
        match slots.get_mut(fd as usize) {
            Some(slot) if slot.is_none() => {
                *slot = Some(file);
                Ok(())
            }
            _ => Err(file),
        }
    }

    /// Removes and returns the handle for `fd`.
    pub fn take(&self, fd: i32) -> Option<RcFile> {
        let guard = self.inner.lock();
        let slots = Self::slots(&guard);
        slots.get_mut(fd as usize)?.take()
    }

    /// Drains every descriptor, returning the handles so the caller can
    /// close them without holding the table lock.
    fn drain(&self) -> arrayvec::ArrayVec<RcFile, NOFILE> {
        let guard = self.inner.lock();
        let slots = Self::slots(&guard);
        let mut out = arrayvec::ArrayVec::new();
        for slot in slots.iter_mut() {
            if let Some(f) = slot.take() {
                out.push(f);
            }
        }
        out
    }

    /// Drops one user. The last user closes every file and frees the
    /// table.
    pub fn put(this: NonNull<FilesStruct>, ctx: &KernelCtx<'_>) {
        // SAFETY: this points at a live slab-allocated table.
        let me = unsafe { this.as_ref() };
        let last = {
            let mut guard = me.inner.lock();
            guard.users -= 1;
            guard.users == 0
        };
        if !last {
            return;
        }
        for f in me.drain() {
            crate::file::fileclose(f, ctx);
        }
        let fd_page = {
            let mut guard = me.inner.lock();
            core::mem::replace(&mut guard.fd_page, 0)
        };
        // SAFETY: the slots were drained; the page holds only `None`s.
        ctx.kernel()
            .kmem
            .lock()
            .free(unsafe { crate::page::Page::from_usize(fd_page) });
        let caches = ctx.kernel().caches();
        // SAFETY: the last user frees the slab object.
        unsafe { caches.files.free(&ctx.kernel().slab, &ctx.kernel().kmem, this) };
    }
}

/// Filesystem view of a process: root, working directory and umask.
/// Shared between threads cloned with `CLONE_FS`.
pub struct FsInfo {
    inner: SpinLock<FsInfoInner>,
}

pub struct FsInfoInner {
    users: i32,
    pub root: Option<RcInode>,
    pub cwd: Option<RcInode>,
    pub umask: u32,
}

impl FsInfo {
    pub fn new(ctx: &KernelCtx<'_>, root: RcInode, cwd: RcInode, umask: u32) -> Option<NonNull<FsInfo>> {
        let kernel = ctx.kernel();
        let this = FsInfo {
            inner: SpinLock::new(
                "fs_info",
                FsInfoInner {
                    users: 1,
                    root: Some(root),
                    cwd: Some(cwd),
                    umask,
                },
            ),
        };
        match kernel.caches().fs_info.alloc(&kernel.slab, &kernel.kmem, this) {
            Ok(p) => Some(p),
            Err(mut this) => {
                let inner = this.inner.get_mut();
                let root = inner.root.take();
                let cwd = inner.cwd.take();
                let tx = kernel.fs().begin_tx(ctx);
                if let Some(ip) = root {
                    ip.free((&tx, ctx));
                }
                if let Some(ip) = cwd {
                    ip.free((&tx, ctx));
                }
                drop(tx);
                None
            }
        }
    }

    pub fn incref(&self) {
        self.inner.lock().users += 1;
    }

    pub fn lock(&self) -> SpinLockGuard<'_, FsInfoInner> {
        self.inner.lock()
    }

    pub fn root(&self) -> RcInode {
        self.inner.lock().root.as_ref().expect("fs_info root").clone()
    }

    pub fn cwd(&self) -> RcInode {
        self.inner.lock().cwd.as_ref().expect("fs_info cwd").clone()
    }

    pub fn umask(&self) -> u32 {
        self.inner.lock().umask
    }

    /// Swaps the working directory, returning the old one.
    pub fn set_cwd(&self, cwd: RcInode) -> RcInode {
        let mut guard = self.inner.lock();
        core::mem::replace(&mut guard.cwd, Some(cwd)).expect("fs_info cwd")
    }

    /// Swaps the root, returning the old one.
    pub fn set_root(&self, root: RcInode) -> RcInode {
        let mut guard = self.inner.lock();
        core::mem::replace(&mut guard.root, Some(root)).expect("fs_info root")
    }

    pub fn set_umask(&self, umask: u32) -> u32 {
        let mut guard = self.inner.lock();
        core::mem::replace(&mut guard.umask, umask)
    }

    /// Drops one user. The last user releases root and cwd inside a
    /// transaction and frees the slab object.
    pub fn put(this: NonNull<FsInfo>, ctx: &KernelCtx<'_>) {
        // SAFETY: this points at a live slab-allocated fs-info.
        let me = unsafe { this.as_ref() };
        let (root, cwd) = {
            let mut guard = me.inner.lock();
            guard.users -= 1;
            if guard.users > 0 {
                return;
            }
            (guard.root.take(), guard.cwd.take())
        };
        let tx = ctx.kernel().fs().begin_tx(ctx);
        if let Some(ip) = cwd {
            ip.free((&tx, ctx));
        }
        if let Some(ip) = root {
            ip.free((&tx, ctx));
        }
        drop(tx);
        let caches = ctx.kernel().caches();
        // SAFETY: the last user frees the slab object.
        unsafe { caches.fs_info.free(&ctx.kernel().slab, &ctx.kernel().kmem, this) };
    }
}

/// Per-CPU state. The scheduler context is written by `swtch`; `proc` is
/// the task currently running on the CPU (null inside the scheduler).
pub struct Cpu {
    pub scheduler: UnsafeCell<*mut Context>,
    pub proc: AtomicPtr<Proc>,
}

// SAFETY: each Cpu is only mutated from the CPU it describes.
unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new() -> Self {
        Self {
            scheduler: UnsafeCell::new(ptr::null_mut()),
            proc: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

pub static CPUS: [Cpu; NCPU] = array_macro::array![_ => Cpu::new(); NCPU];

pub fn current_cpu() -> &'static Cpu {
    &CPUS[crate::arch::cpu_id()]
}
