//! Execution context of a task running in the kernel.
//!
//! A `KernelCtx` pairs the kernel with the current process. It is passed
//! explicitly down every code path that may sleep, touch the current
//! task's private data, or access user memory, instead of being fished
//! out of a per-CPU segment register.

use cstr_core::CStr;

use crate::error::{KernelError, Result};
use crate::file::FTable;
use crate::kernel::Kernel;
use crate::lock::SpinLockGuard;
use crate::proc::{Credentials, FilesStruct, FsInfo, Proc, ProcData, RcFile};
use crate::vm::{Mm, UVAddr};

#[derive(Clone, Copy)]
pub struct KernelCtx<'s> {
    kernel: &'s Kernel,
    proc: &'s Proc,
}

impl<'s> KernelCtx<'s> {
    /// Builds a context for `proc`.
    ///
    /// # Safety
    ///
    /// `proc` must be the task executing this code (or a task that cannot
    /// run concurrently, e.g. one being constructed in a test harness).
    pub unsafe fn new(kernel: &'s Kernel, proc: &'s Proc) -> Self {
        Self { kernel, proc }
    }

    pub fn kernel(&self) -> &'s Kernel {
        self.kernel
    }

    pub fn proc(&self) -> &'s Proc {
        self.proc
    }

    /// The task's private data.
    pub fn data(&self) -> &'s ProcData {
        // SAFETY: only the task itself mutates its data, and `self`
        // witnesses that we are that task.
        unsafe { self.proc.data() }
    }

    /// The task's private data, mutable.
    ///
    /// # Safety
    ///
    /// The caller must not hold another reference obtained from `data`
    /// or `data_mut` across this call.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &'s mut ProcData {
        // SAFETY: per the contract.
        unsafe { self.proc.data_mut() }
    }

    pub fn cred(&self) -> SpinLockGuard<'s, Credentials> {
        self.proc.cred.lock()
    }

    /// The task's memory map. Panics if it has none (kernel-only task).
    pub fn mm(&self) -> &'s Mm {
        // SAFETY: mm points at a live, counted Mm while this task exists.
        unsafe { self.data().mm.expect("task has no mm").as_ref() }
    }

    pub fn files(&self) -> &'s FilesStruct {
        // SAFETY: files points at a live, counted table.
        unsafe { self.data().files.expect("task has no files").as_ref() }
    }

    pub fn fs_info(&self) -> &'s FsInfo {
        // SAFETY: fs points at a live, counted fs-info.
        unsafe { self.data().fs.expect("task has no fs info").as_ref() }
    }

    /// The file behind descriptor `fd`, with a fresh reference.
    pub fn file(&self, fd: i32) -> Result<RcFile> {
        self.files().get(fd).ok_or(KernelError::EBADF)
    }

    /// Installs `file` into a free descriptor slot. The reference is
    /// closed if the table is full.
    pub fn fdalloc(&self, file: RcFile) -> Result<i32> {
        match self.files().alloc_fd(file) {
            Ok(fd) => Ok(fd),
            Err(file) => {
                crate::file::fileclose(file, self);
                Err(KernelError::EMFILE)
            }
        }
    }

    /// Copies `src` out to `dst` in the task's user memory.
    pub fn copy_out_bytes(&self, dst: UVAddr, src: &[u8]) -> Result<()> {
        self.mm().copy_out_bytes(dst, src)
    }

    /// Copies `dst.len()` bytes in from `src` in the task's user memory.
    pub fn copy_in_bytes(&self, dst: &mut [u8], src: UVAddr) -> Result<()> {
        self.mm().copy_in_bytes(dst, src)
    }

    /// Copies in a NUL-terminated user string, at most `buf.len()` bytes.
    pub fn copy_in_str<'a>(&self, buf: &'a mut [u8], src: UVAddr) -> Result<&'a CStr> {
        self.mm().copy_in_str(buf, src)?;
        // SAFETY: copy_in_str guarantees a NUL within buf.
        Ok(unsafe { CStr::from_ptr(buf.as_ptr()) })
    }

    /// Fetches a 32-bit word from user memory.
    pub fn fetch_u32(&self, addr: UVAddr) -> Result<u32> {
        let mut word = [0u8; 4];
        self.copy_in_bytes(&mut word, addr)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn ftable(&self) -> &'s FTable {
        self.kernel.ftable()
    }

    /// The current process id. Stable while the task runs.
    pub fn pid(&self) -> crate::proc::Pid {
        // SAFETY: a live task's pid only changes at reap time, which
        // cannot race with the task reading it.
        unsafe { self.proc.shared() }.pid
    }

    /// The task's trap frame.
    pub fn trap_frame(&self) -> &'s crate::arch::trap::TrapFrame {
        // SAFETY: the trap frame is private to the task.
        unsafe { &*self.data().tf }
    }

    /// The task's trap frame, mutable.
    ///
    /// # Safety
    ///
    /// No other reference to the trap frame may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn trap_frame_mut(&self) -> &'s mut crate::arch::trap::TrapFrame {
        // SAFETY: per the contract.
        unsafe { &mut *self.data().tf }
    }
}
