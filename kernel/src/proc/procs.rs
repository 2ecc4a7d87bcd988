//! The process table and scheduler.
//!
//! One spinlock serializes every scheduling decision: state transitions,
//! sleep/wakeup, sibling and thread-group list surgery, and reaping. A
//! process that will sleep must already hold the channel's lock when it
//! calls `sleep`, which takes the table lock before releasing it, so no
//! wakeup can be lost.
//!
//! Processes are slab-allocated; the scheduler garbage-collects `Unused`
//! entries (freeing kernel stack, memory map and the slab slot), which is
//! how detached threads disappear without a `wait`.

use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::arch::context::{swtch, Context};
use crate::arch::memlayout::kva2pa;
use crate::arch::mmu::{load_page_dir, PGSIZE};
use crate::arch::trap::TrapFrame;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::list::ListEntry;
use crate::list_entry;
use crate::lock::{Guard, RawLock, SpinLock, SpinLockGuard};
use crate::page::Page;
use crate::param::ROOTDEV;
use crate::proc::{
    current_cpu, CloneFlags, FilesStruct, FsInfo, KernelCtx, Pid, Proc, ProcShared, ProcState,
};
use crate::vm::Mm;

/// List-structured process table. All of it is guarded by `Procs::table`.
pub struct ProcTable {
    /// Head of the process list, in round-robin order.
    list: ListEntry,
    nextpid: Pid,
}

impl ProcTable {
    /// Iterates the table. The caller owns the table lock and must not
    /// unlink entries while iterating.
    pub fn iter<'a>(&'a self) -> impl Iterator<Item = &'a Proc> + 'a {
        self.list.iter().map(|e| {
            // SAFETY: only ptable links of live procs are on this list.
            unsafe { proc_of_shared(list_entry!(e, ProcShared, ptable)) }
        })
    }
}

/// Recovers the `Proc` owning a `ProcShared`.
///
/// # Safety
///
/// `shared` must be the shared state of a live `Proc`.
unsafe fn proc_of_shared(shared: &ProcShared) -> &Proc {
    // UnsafeCell is repr(transparent), so the shared state sits exactly
    // at the `shared` field's offset.
    // SAFETY: per the contract.
    unsafe {
        &*((shared as *const ProcShared as *const u8).sub(mem::offset_of!(Proc, shared))
            as *const Proc)
    }
}

pub struct Procs {
    table: SpinLock<ProcTable>,
    init_proc: AtomicPtr<Proc>,
}

impl Procs {
    pub const fn new() -> Self {
        Self {
            table: SpinLock::new(
                "ptable",
                ProcTable {
                    list: ListEntry::new(),
                    nextpid: 1,
                },
            ),
            init_proc: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Must run once before the first `allocproc`.
    pub fn init(&self) {
        self.table.lock().list.init();
    }

    pub fn table(&self) -> SpinLockGuard<'_, ProcTable> {
        self.table.lock()
    }

    /// Releases the table lock left held across the very first switch
    /// into a new process.
    ///
    /// # Safety
    ///
    /// Only `forkret` may call this, exactly once per switch.
    pub unsafe fn release_table_after_switch(&self) {
        // SAFETY: the scheduler acquired the lock before switching here.
        unsafe { self.table.unlock() };
    }

    fn init_proc(&self) -> *const Proc {
        self.init_proc.load(Ordering::Acquire)
    }

    /// Registers `p` as the initial process.
    pub fn set_init_proc(&self, p: NonNull<Proc>) {
        self.init_proc.store(p.as_ptr(), Ordering::Release);
    }

    /// Looks for a free slab slot, links a fresh `Embryo` process into
    /// the table and builds its initial kernel stack so that the first
    /// scheduler entry returns through `forkret` into the trap-return
    /// path.
    pub fn allocproc(&self, kernel: &Kernel) -> Result<NonNull<Proc>> {
        let caches = kernel.caches();
        let p = caches
            .proc
            .alloc(&kernel.slab, &kernel.kmem, Proc::new())
            .map_err(|_| KernelError::ENOMEM)?;
        // SAFETY: the fresh Proc is not yet visible to anyone.
        let proc = unsafe { p.as_ref() };

        {
            let mut guard = self.table.lock();
            // SAFETY: the table lock is held.
            let shared = unsafe { proc.shared_mut() };
            shared.ptable.init();
            shared.children.init();
            shared.siblings.init();
            shared.thread_group.init();
            shared.state = ProcState::Embryo;
            shared.pid = guard.nextpid;
            guard.nextpid += 1;
            guard.list.push_back(&shared.ptable);
        }

        // Allocate the kernel stack.
        let kstack = match kernel.kmem.lock().alloc() {
            Some(page) => page.into_usize(),
            None => {
                {
                    let _guard = self.table.lock();
                    // SAFETY: the table lock is held and the embryo is
                    // ours.
                    let shared = unsafe { proc.shared_mut() };
                    shared.state = ProcState::Unused;
                    shared.ptable.remove();
                }
                // SAFETY: no one else can refer to the embryo.
                unsafe { caches.proc.free(&kernel.slab, &kernel.kmem, p) };
                return Err(KernelError::ENOMEM);
            }
        };

        // Carve the stack: trap frame on top, then the address of the
        // trap-return stub, then the context that makes the first swtch
        // "return" into forkret.
        let mut sp = kstack + PGSIZE;
        sp -= mem::size_of::<TrapFrame>();
        let tf = sp as *mut TrapFrame;
        sp -= mem::size_of::<usize>();
        // SAFETY: sp stays inside the fresh stack page.
        unsafe { *(sp as *mut usize) = crate::arch::trapret_addr() };
        sp -= mem::size_of::<Context>();
        let context = sp as *mut Context;
        // SAFETY: the frame addresses are inside the fresh stack page,
        // and the embryo is not running yet.
        unsafe {
            *tf = TrapFrame::default();
            *context = Context::zero();
            (*context).eip = forkret as usize;
            let data = proc.data_mut();
            data.kstack = kstack;
            data.tf = tf;
            data.context = context;
        }
        Ok(p)
    }

    /// Sets up the first user process around the boot-provided initcode
    /// image (which calls `exec("/init")`). Its filesystem state points
    /// at the image root; the root filesystem itself is mounted by
    /// `forkret` once this process first runs.
    pub fn user_init(&self, initcode: &[u8], kernel: &'static Kernel) -> Result<()> {
        use crate::fs::{FsOps as _, ROOTINO};
        use crate::vm::UserMemory;

        let p = self.allocproc(kernel)?;
        // SAFETY: the embryo cannot run yet.
        let proc = unsafe { p.as_ref() };
        // SAFETY: the embryo cannot run concurrently with its setup.
        let ctx = unsafe { KernelCtx::new(kernel, proc) };

        let mem = UserMemory::new(Some(initcode), &kernel.kmem)?;
        let mm = Mm::from_memory(kernel, mem)?;
        let files = FilesStruct::new(kernel).ok_or(KernelError::ENOMEM)?;
        let fs = kernel.fstab().find(ROOTDEV).expect("root fs unregistered");
        let root = fs.ops.get_inode(ROOTDEV, ROOTINO, &ctx);
        let cwd = root.clone();
        let fs_info = FsInfo::new(&ctx, root, cwd, 0).ok_or(KernelError::ENOMEM)?;

        // SAFETY: the embryo cannot run yet.
        unsafe {
            let data = proc.data_mut();
            data.mm = Some(mm);
            data.files = Some(files);
            data.fs = Some(fs_info);
            let tf = &mut *data.tf;
            tf.eflags = crate::arch::trap::FL_IF;
            tf.esp = PGSIZE as u32;
            tf.eip = 0; // start of initcode
            proc.set_name(b"initcode");
        }

        self.set_init_proc(p);
        {
            let _guard = self.table.lock();
            // SAFETY: the table lock is held.
            let shared = unsafe { proc.shared_mut() };
            shared.group_leader = p.as_ptr();
            shared.tgid = shared.pid;
            shared.state = ProcState::Runnable;
        }
        Ok(())
    }

    /// Atomically releases `guard`'s lock and sleeps on `chan`.
    /// Re-acquires the lock when awakened. The channel's lock must not be
    /// the process-table lock (`wait` has its own path).
    pub fn sleep<R: RawLock, T>(
        &self,
        chan: usize,
        guard: &mut Guard<'_, R, T>,
        ctx: &KernelCtx<'_>,
    ) {
        // Take the table lock before releasing the channel's lock: any
        // wakeup must take the table lock too, so it cannot run between
        // our release and our transition to Sleeping.
        let mut table = self.table.lock();
        guard.reacquire_after(move || {
            self.sleep_in_table(chan, &mut table, ctx);
            drop(table);
        });
    }

    /// Sleeps on `chan` with the table lock already held. Returns with it
    /// re-held.
    pub fn sleep_in_table(
        &self,
        chan: usize,
        _table: &mut SpinLockGuard<'_, ProcTable>,
        ctx: &KernelCtx<'_>,
    ) {
        let proc = ctx.proc();
        {
            // SAFETY: the table lock is held.
            let shared = unsafe { proc.shared_mut() };
            shared.chan = chan;
            shared.state = ProcState::Sleeping;
        }
        // SAFETY: the table lock is held and the state was changed.
        unsafe { self.sched(ctx) };
        // SAFETY: back from the scheduler, the table lock is held again.
        unsafe { proc.shared_mut() }.chan = 0;
    }

    /// Wakes every process sleeping on `chan`.
    pub fn wakeup(&self, chan: usize) {
        let guard = self.table.lock();
        self.wakeup_in_table(chan, &guard);
    }

    /// `wakeup` with the table lock already held.
    pub fn wakeup_in_table(&self, chan: usize, guard: &SpinLockGuard<'_, ProcTable>) {
        for p in guard.iter() {
            // SAFETY: the table lock is held.
            let shared = unsafe { p.shared_mut() };
            if shared.state == ProcState::Sleeping && shared.chan == chan {
                shared.state = ProcState::Runnable;
            }
        }
    }

    /// Runs `f` on the process with the given pid, under the table lock.
    pub fn with_pid<R>(&self, pid: Pid, f: impl FnOnce(&Proc) -> R) -> Option<R> {
        let guard = self.table.lock();
        for p in guard.iter() {
            // SAFETY: the table lock is held.
            let shared = unsafe { p.shared() };
            if shared.pid == pid && shared.state != ProcState::Unused {
                return Some(f(p));
            }
        }
        None
    }

    /// Kill the process with the given pid. A non-root caller must own
    /// the target: its real or effective uid must match the target's
    /// real or saved uid. The victim exits the next time it returns to
    /// user space.
    pub fn kill(&self, pid: Pid, ctx: &KernelCtx<'_>) -> Result<()> {
        let guard = self.table.lock();
        for p in guard.iter() {
            // SAFETY: the table lock is held.
            let shared = unsafe { p.shared_mut() };
            if shared.pid != pid || shared.state == ProcState::Unused {
                continue;
            }
            {
                let caller = ctx.cred();
                let target = p.cred.lock();
                if caller.euid != 0
                    && caller.uid != target.uid
                    && caller.uid != target.suid
                    && caller.euid != target.uid
                    && caller.euid != target.suid
                {
                    return Err(KernelError::EPERM);
                }
            }
            p.kill();
            if shared.state == ProcState::Sleeping {
                shared.state = ProcState::Runnable;
            }
            return Ok(());
        }
        Err(KernelError::ESRCH)
    }

    /// Creates a new task. Flag semantics:
    /// - `VM`/`FILES`/`FS`: share the respective resource, else copy it.
    /// - `THREAD`: join the caller's thread group, detached.
    /// - `THREAD | PARENT`: the child's parent is the caller's parent.
    /// - A non-null `child_stack` overrides the child's user stack
    ///   pointer.
    pub fn clone_proc(
        &self,
        child_stack: usize,
        flags: CloneFlags,
        ctx: &KernelCtx<'_>,
    ) -> Result<Pid> {
        let kernel = ctx.kernel();
        let np = self.allocproc(kernel)?;
        // SAFETY: the embryo cannot run yet.
        let child = unsafe { np.as_ref() };
        let child_data = unsafe { child.data_mut() };

        // Memory map.
        let mm = if flags.contains(CloneFlags::VM) {
            let mm = ctx.mm();
            mm.incref();
            NonNull::from(mm)
        } else {
            match ctx.mm().clone_for_fork(ctx) {
                Ok(mm) => mm,
                Err(e) => {
                    self.discard_embryo(np, kernel);
                    return Err(e);
                }
            }
        };
        child_data.mm = Some(mm);

        // Open files.
        let files = if flags.contains(CloneFlags::FILES) {
            let files = ctx.files();
            files.incref();
            NonNull::from(files)
        } else {
            match crate::file::dup_files_table(ctx) {
                Ok(files) => files,
                Err(e) => {
                    child_data.mm = None;
                    Mm::put(mm, ctx);
                    self.discard_embryo(np, kernel);
                    return Err(e);
                }
            }
        };
        child_data.files = Some(files);

        // Filesystem info.
        let fs = if flags.contains(CloneFlags::FS) {
            let fs = ctx.fs_info();
            fs.incref();
            NonNull::from(fs)
        } else {
            let src = ctx.fs_info();
            let (root, cwd, umask) = {
                let guard = src.lock();
                (
                    guard.root.as_ref().expect("fs root").clone(),
                    guard.cwd.as_ref().expect("fs cwd").clone(),
                    guard.umask,
                )
            };
            match FsInfo::new(ctx, root, cwd, umask) {
                Some(fs) => fs,
                None => {
                    child_data.files = None;
                    FilesStruct::put(files, ctx);
                    child_data.mm = None;
                    Mm::put(mm, ctx);
                    self.discard_embryo(np, kernel);
                    return Err(KernelError::ENOMEM);
                }
            }
        };
        child_data.fs = Some(fs);

        // The child returns from the same trap, with eax = 0.
        // SAFETY: both trap frames are private to their tasks.
        unsafe {
            *child_data.tf = *ctx.data().tf;
            (*child_data.tf).eax = 0;
            if child_stack != 0 {
                (*child_data.tf).esp = child_stack as u32;
            }
        }

        *child.cred.lock() = ctx.cred().clone();
        child_data.name = ctx.data().name;

        let guard = self.table.lock();
        let pid;
        {
            // SAFETY: the table lock is held; child and caller are
            // distinct processes.
            let shared = unsafe { child.shared_mut() };
            let my_shared = unsafe { ctx.proc().shared_mut() };
            pid = shared.pid;
            shared.parent = if flags.intersects(CloneFlags::THREAD | CloneFlags::PARENT) {
                my_shared.parent
            } else {
                ctx.proc() as *const Proc
            };
            if flags.contains(CloneFlags::THREAD) {
                shared.detached = true;
                shared.group_leader = my_shared.group_leader;
                shared.tgid = my_shared.tgid;
                my_shared.thread_group.push_back(&shared.thread_group);
            } else {
                shared.detached = false;
                shared.group_leader = child as *const Proc;
                shared.tgid = shared.pid;
            }
            // SAFETY: the parent is live while the table lock is held.
            unsafe { (*shared.parent).shared_mut() }
                .children
                .push_back(&shared.siblings);
            shared.state = ProcState::Runnable;
        }
        drop(guard);
        Ok(pid)
    }

    /// `fork` is a clone that copies everything.
    pub fn fork(&self, ctx: &KernelCtx<'_>) -> Result<Pid> {
        self.clone_proc(0, CloneFlags::empty(), ctx)
    }

    /// Frees a half-built embryo that never became runnable.
    fn discard_embryo(&self, p: NonNull<Proc>, kernel: &Kernel) {
        // SAFETY: the embryo is invisible to the scheduler and owned by
        // us.
        let proc = unsafe { p.as_ref() };
        let kstack = {
            let data = unsafe { proc.data_mut() };
            mem::replace(&mut data.kstack, 0)
        };
        if kstack != 0 {
            // SAFETY: the kstack page is exclusively the embryo's.
            kernel.kmem.lock().free(unsafe { Page::from_usize(kstack) });
        }
        {
            let _guard = self.table.lock();
            // SAFETY: the table lock is held.
            let shared = unsafe { proc.shared_mut() };
            shared.state = ProcState::Unused;
            shared.ptable.remove();
            shared.siblings.remove();
            shared.thread_group.remove();
        }
        // SAFETY: the embryo is unlinked and unreferenced.
        unsafe { kernel.caches().proc.free(&kernel.slab, &kernel.kmem, p) };
    }

    /// Marks every other member of the caller's thread group killed,
    /// waking sleepers so they notice.
    pub fn kill_group_siblings(&self, ctx: &KernelCtx<'_>) {
        let _guard = self.table.lock();
        // SAFETY: the table lock is held; the group list holds
        // thread_group links of live procs.
        unsafe {
            let my_shared = ctx.proc().shared();
            for e in my_shared.thread_group.iter() {
                let p = proc_of_shared(list_entry!(e, ProcShared, thread_group));
                p.kill();
                let shared = p.shared_mut();
                if shared.state == ProcState::Sleeping {
                    shared.state = ProcState::Runnable;
                }
            }
        }
    }

    /// Exits every thread in the group, then the caller.
    pub fn exit_group(&self, ctx: &KernelCtx<'_>) -> ! {
        self.kill_group_siblings(ctx);
        self.exit_current(ctx)
    }

    /// Releases the caller's resources and jumps into the scheduler for
    /// the last time. A detached task goes straight to `Unused`; others
    /// linger as zombies for `wait`.
    pub fn exit_current(&self, ctx: &KernelCtx<'_>) -> ! {
        let proc = ctx.proc();
        assert!(proc as *const Proc != self.init_proc(), "init exiting");

        // SAFETY: we are the task; nothing else touches our data.
        let data = unsafe { proc.data_mut() };
        if let Some(files) = data.files.take() {
            FilesStruct::put(files, ctx);
        }
        if let Some(fs) = data.fs.take() {
            FsInfo::put(fs, ctx);
        }
        // Write back and drop the address-space regions now: doing it at
        // reap time would mean file writes under the table lock.
        if let Some(mm) = data.mm {
            // SAFETY: mm is live while we hold our count on it.
            unsafe { mm.as_ref() }.drop_regions(ctx);
        }

        let guard = self.table.lock();
        let (parent, detached) = {
            // SAFETY: the table lock is held.
            let shared = unsafe { proc.shared() };
            (shared.parent, shared.detached)
        };

        if !detached {
            self.wakeup_in_table(parent as usize, &guard);
        }

        // Pass abandoned children to init.
        let init = self.init_proc();
        assert!(!init.is_null(), "exit before init exists");
        let mut wake_init = false;
        loop {
            // SAFETY: the table lock is held; children holds sibling
            // links of live procs.
            let moved = unsafe {
                let children = &proc.shared().children;
                let first = children.next();
                if ptr::eq(first, children) {
                    None
                } else {
                    let child = proc_of_shared(list_entry!(first, ProcShared, siblings));
                    first.remove();
                    let child_shared = child.shared_mut();
                    child_shared.parent = init;
                    (*init)
                        .shared_mut()
                        .children
                        .push_back(&child_shared.siblings);
                    Some(child_shared.state == ProcState::Zombie && !child_shared.detached)
                }
            };
            match moved {
                None => break,
                Some(zombie) => wake_init |= zombie,
            }
        }
        if wake_init {
            self.wakeup_in_table(init as usize, &guard);
        }

        // SAFETY: the table lock is held.
        unsafe {
            proc.shared_mut().state = if detached {
                ProcState::Unused
            } else {
                ProcState::Zombie
            };
        }

        // Jump into the scheduler, never to return.
        // SAFETY: the table lock is held and our state changed.
        unsafe { self.sched(ctx) };
        drop(guard);
        unreachable!("zombie exit");
    }

    /// Waits for a non-detached child to exit and reaps it.
    /// Returns `ECHILD` if there are none.
    pub fn wait(&self, ctx: &KernelCtx<'_>) -> Result<Pid> {
        let proc = ctx.proc();
        let mut guard = self.table.lock();
        loop {
            // Scan our children for zombies.
            let mut havekids = false;
            let mut zombie: *const Proc = ptr::null();
            {
                // SAFETY: the table lock is held; children holds sibling
                // links of live procs.
                unsafe {
                    for e in proc.shared().children.iter() {
                        let child = proc_of_shared(list_entry!(e, ProcShared, siblings));
                        let child_shared = child.shared();
                        if child_shared.detached || child_shared.state == ProcState::Unused {
                            continue;
                        }
                        havekids = true;
                        if child_shared.state == ProcState::Zombie {
                            zombie = child;
                            break;
                        }
                    }
                }
            }

            if !zombie.is_null() {
                // SAFETY: a zombie cannot run; its data is ours to free.
                let child = unsafe { &*zombie };
                let pid = unsafe { child.shared() }.pid;
                let (kstack, mm) = {
                    let data = unsafe { child.data_mut() };
                    (mem::replace(&mut data.kstack, 0), data.mm.take())
                };
                guard.reacquire_after(|| {
                    if kstack != 0 {
                        // SAFETY: the zombie's stack page is now ours.
                        ctx.kernel()
                            .kmem
                            .lock()
                            .free(unsafe { Page::from_usize(kstack) });
                    }
                    if let Some(mm) = mm {
                        Mm::put(mm, ctx);
                    }
                });
                // SAFETY: the table lock is held again.
                unsafe {
                    let child_shared = child.shared_mut();
                    child_shared.pid = 0;
                    child_shared.parent = ptr::null();
                    child_shared.siblings.remove();
                    child_shared.state = ProcState::Unused;
                    child.data_mut().name[0] = 0;
                }
                child.clear_killed();
                return Ok(pid);
            }

            if !havekids || proc.killed() {
                return Err(KernelError::ECHILD);
            }

            // Sleep on our own address until a child exits.
            self.sleep_in_table(proc as *const Proc as usize, &mut guard, ctx);
        }
    }

    /// Gives up the CPU for one scheduling round.
    pub fn yield_cpu(&self, ctx: &KernelCtx<'_>) {
        let guard = self.table.lock();
        // SAFETY: the table lock is held.
        unsafe { ctx.proc().shared_mut() }.state = ProcState::Runnable;
        // SAFETY: the table lock is held and the state was changed.
        unsafe { self.sched(ctx) };
        drop(guard);
    }

    /// Switches to the per-CPU scheduler. The caller must hold the table
    /// lock and have changed the process state.
    unsafe fn sched(&self, ctx: &KernelCtx<'_>) {
        debug_assert_ne!(
            // SAFETY: the table lock is held.
            unsafe { ctx.proc().shared() }.state,
            ProcState::Running,
            "sched running"
        );
        // SAFETY: we are the running task.
        let data = unsafe { ctx.proc().data_mut() };
        let cpu = current_cpu();
        // SAFETY: cpu.scheduler was set by the scheduler loop before it
        // switched to us.
        unsafe { swtch(&mut data.context, *cpu.scheduler.get()) };
    }

    /// Per-CPU scheduler loop: pick the first runnable process, switch to
    /// it, garbage-collect dead slots along the way. Never returns.
    ///
    /// # Safety
    ///
    /// Must be called once per CPU on its own stack, with the kernel
    /// installed as the boot kernel.
    pub unsafe fn scheduler(&self, kernel: &Kernel) -> ! {
        let cpu = current_cpu();
        loop {
            let guard = self.table.lock();
            let head: *const ListEntry = &guard.list;
            // SAFETY: the table lock is held; the cursor is advanced
            // before any unlink.
            unsafe {
                let mut e = (*head).next() as *const ListEntry;
                while !ptr::eq(e, head) {
                    let next = (*e).next() as *const ListEntry;
                    let p = proc_of_shared(list_entry!(&*e, ProcShared, ptable));
                    match p.shared().state {
                        ProcState::Unused => {
                            // Reclaim the slot of an exited detached (or
                            // reaped) task.
                            self.collect_dead(p, kernel);
                        }
                        ProcState::Runnable => {
                            // Switch to the chosen process. It releases
                            // the table lock and re-acquires it before
                            // switching back.
                            p.shared_mut().state = ProcState::Running;
                            cpu.proc
                                .store(p as *const Proc as *mut Proc, Ordering::Release);
                            let data = p.data_mut();
                            if let Some(mm) = data.mm {
                                load_page_dir(kva2pa(mm.as_ref().page_dir_addr()));
                            }
                            swtch(cpu.scheduler.get(), data.context);
                            // The process is done running for now.
                            cpu.proc.store(ptr::null_mut(), Ordering::Release);
                        }
                        _ => {}
                    }
                    e = next;
                }
            }
            drop(guard);
        }
    }

    /// Frees an `Unused` table entry: kernel stack, memory map, all list
    /// links and the slab slot.
    ///
    /// # Safety
    ///
    /// The table lock must be held; `p` must be `Unused` and off every
    /// CPU.
    unsafe fn collect_dead(&self, p: &Proc, kernel: &Kernel) {
        // SAFETY: an Unused process cannot run; its data is ours.
        unsafe {
            let data = p.data_mut();
            if data.kstack != 0 {
                kernel.kmem.lock().free(Page::from_usize(data.kstack));
                data.kstack = 0;
            }
            if let Some(mm) = data.mm.take() {
                Mm::put_reaped(mm, kernel);
            }
            let shared = p.shared_mut();
            shared.thread_group.remove();
            shared.siblings.remove();
            shared.ptable.remove();
            kernel
                .caches()
                .proc
                .free(&kernel.slab, &kernel.kmem, NonNull::from(p));
        }
    }

    /// Writes a process listing to the kernel log. Runs when the user
    /// types ^P on the console.
    pub fn dump(&self) {
        let guard = self.table.lock();
        for p in guard.iter() {
            // SAFETY: the table lock is held.
            let shared = unsafe { p.shared() };
            if shared.state == ProcState::Unused {
                continue;
            }
            let cred = p.cred.lock();
            // SAFETY: the name is only ever replaced wholesale; a torn
            // read yields garbage bytes, not UB, and this is diagnostics.
            let name = unsafe { p.data() }.name;
            let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            log::info!(
                "{} {} {} {} {}",
                shared.pid,
                shared.state.as_str(),
                core::str::from_utf8(&name[..len]).unwrap_or("???"),
                cred.uid,
                cred.gid,
            );
        }
    }
}

/// A fork child's very first scheduling by the scheduler switches here.
/// Releases the table lock the scheduler was holding, finishes file
/// system setup that must run in process context, and returns into the
/// trap-return stub whose address `allocproc` planted on the stack.
unsafe extern "C" fn forkret() {
    let kernel = crate::kernel::boot_kernel();
    // SAFETY: the scheduler switched to us with the table lock held.
    unsafe { kernel.procs().release_table_after_switch() };

    let proc = current_cpu().proc.load(Ordering::Acquire);
    // SAFETY: the scheduler set cpu.proc to the task now running.
    let ctx = unsafe { KernelCtx::new(kernel, &*proc) };
    // First process only: mount the root file system. This cannot run in
    // kernel_main because reading the superblock may sleep.
    kernel.fs().init(ROOTDEV, &ctx);
}
