//! Pipes and FIFOs.
//!
//! A pipe is a bounded ring buffer with monotone read/write counters and
//! one lock covering both. The counters' addresses double as the wait
//! channels: readers sleep on `nread`, writers on `nwrite`.
//!
//! Anonymous pipes are created with both ends open; a FIFO's pipe starts
//! with both open counts at zero and every handle reference moves them.
//! Unlinking an open FIFO marks the pipe deleted and wakes both
//! channels so blocked opens abort.

use core::ptr::NonNull;

use crate::error::{KernelError, Result};
use crate::file::{file_alloc, FileType, RcFile};
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::page::Page;
use crate::proc::KernelCtx;
use crate::vm::UVAddr;

pub const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],
    /// Bytes read so far.
    nread: u32,
    /// Bytes written so far.
    nwrite: u32,
    /// Open references per direction.
    readopen: i32,
    writeopen: i32,
    /// The backing FIFO was unlinked; abort blocked opens.
    is_deleted: bool,
}

pub struct Pipe {
    inner: SpinLock<PipeInner>,
}

impl Pipe {
    /// Wait channel of readers: the address of `nread`.
    fn read_chan(&self) -> usize {
        // SAFETY: address-of only; the field is never dereferenced here.
        unsafe { &(*self.inner.get_mut_raw()).nread as *const _ as usize }
    }

    /// Wait channel of writers: the address of `nwrite`.
    fn write_chan(&self) -> usize {
        // SAFETY: address-of only.
        unsafe { &(*self.inner.get_mut_raw()).nwrite as *const _ as usize }
    }

    /// Writes up to `n` bytes from user memory, sleeping while the ring
    /// is full. Returns the bytes actually copied, or an error if the
    /// read side is gone or the caller was killed.
    pub fn write(&self, addr: UVAddr, n: usize, ctx: &KernelCtx<'_>) -> Result<usize> {
        let procs = ctx.kernel().procs();
        let mut guard = self.inner.lock();
        for i in 0..n {
            loop {
                if guard.readopen <= 0 || ctx.proc().killed() {
                    drop(guard);
                    return Err(KernelError::EPIPE);
                }
                if guard.nwrite != guard.nread.wrapping_add(PIPESIZE as u32) {
                    break;
                }
                // Ring full: let readers drain, then wait on nwrite.
                procs.wakeup(self.read_chan());
                procs.sleep(self.write_chan(), &mut guard, ctx);
            }
            let mut byte = [0u8; 1];
            if ctx.copy_in_bytes(&mut byte, addr + i).is_err() {
                procs.wakeup(self.read_chan());
                drop(guard);
                return Ok(i);
            }
            let slot = guard.nwrite as usize % PIPESIZE;
            guard.data[slot] = byte[0];
            guard.nwrite = guard.nwrite.wrapping_add(1);
        }
        procs.wakeup(self.read_chan());
        drop(guard);
        Ok(n)
    }

    /// Reads up to `n` bytes into user memory, sleeping while the ring
    /// is empty and a writer remains. Returns 0 at end of file.
    pub fn read(&self, addr: UVAddr, n: usize, ctx: &KernelCtx<'_>) -> Result<usize> {
        let procs = ctx.kernel().procs();
        let mut guard = self.inner.lock();
        while guard.nread == guard.nwrite && guard.writeopen > 0 {
            if ctx.proc().killed() {
                drop(guard);
                return Err(KernelError::EINTR);
            }
            procs.wakeup(self.write_chan());
            procs.sleep(self.read_chan(), &mut guard, ctx);
        }
        let mut i = 0;
        while i < n && guard.nread != guard.nwrite {
            let slot = guard.nread as usize % PIPESIZE;
            let byte = [guard.data[slot]];
            guard.nread = guard.nread.wrapping_add(1);
            if ctx.copy_out_bytes(addr + i, &byte).is_err() {
                break;
            }
            i += 1;
        }
        procs.wakeup(self.write_chan());
        drop(guard);
        Ok(i)
    }

    /// Raises the open count for one direction (FIFO open or dup).
    pub fn open_end(&self, readable: bool, writable: bool) {
        let mut guard = self.inner.lock();
        if readable {
            guard.readopen += 1;
        }
        if writable {
            guard.writeopen += 1;
        }
    }

    /// Drops the open count for one direction, waking the other side.
    /// Returns true when both directions reached zero.
    pub fn release_end(&self, readable: bool, writable: bool, kernel: &Kernel) -> bool {
        let mut guard = self.inner.lock();
        if readable {
            guard.readopen -= 1;
            if guard.readopen <= 0 {
                guard.readopen = 0;
                kernel.procs().wakeup(self.write_chan());
            }
        }
        if writable {
            guard.writeopen -= 1;
            if guard.writeopen <= 0 {
                guard.writeopen = 0;
                kernel.procs().wakeup(self.read_chan());
            }
        }
        guard.readopen == 0 && guard.writeopen == 0
    }

    /// Closes one whole direction (anonymous pipe end going away).
    /// Returns true when both are closed.
    pub fn close_end(&self, writable: bool, kernel: &Kernel) -> bool {
        let mut guard = self.inner.lock();
        if writable {
            guard.writeopen = 0;
            kernel.procs().wakeup(self.read_chan());
        } else {
            guard.readopen = 0;
            kernel.procs().wakeup(self.write_chan());
        }
        guard.readopen == 0 && guard.writeopen == 0
    }

    /// Marks the backing FIFO unlinked and wakes both channels so
    /// blocked opens see it.
    pub fn set_deleted(&self, kernel: &Kernel) {
        let mut guard = self.inner.lock();
        guard.is_deleted = true;
        drop(guard);
        kernel.procs().wakeup(self.read_chan());
        kernel.procs().wakeup(self.write_chan());
    }

    /// True if a reader end is currently open (`O_NONBLOCK` writer
    /// check).
    pub fn has_reader(&self) -> bool {
        self.inner.lock().readopen > 0
    }

    /// Wakes the side opposite to `writable` (a fresh open announcing
    /// itself).
    pub fn announce(&self, writable: bool, kernel: &Kernel) {
        if writable {
            kernel.procs().wakeup(self.read_chan());
        } else {
            kernel.procs().wakeup(self.write_chan());
        }
    }

    /// Blocks a FIFO open until the opposite direction opens, per
    /// POSIX. The caller already counted itself in; on kill or unlink
    /// the open fails and the caller's `fileclose` rolls that back.
    pub fn wait_for_peer(&self, writable: bool, ctx: &KernelCtx<'_>) -> Result<()> {
        let procs = ctx.kernel().procs();
        let mut guard = self.inner.lock();
        loop {
            let other = if writable {
                guard.readopen
            } else {
                guard.writeopen
            };
            if other > 0 {
                break;
            }
            if ctx.proc().killed() || guard.is_deleted {
                drop(guard);
                self.announce(writable, ctx.kernel());
                return Err(KernelError::ENOENT);
            }
            self.announce(writable, ctx.kernel());
            let chan = if writable {
                self.write_chan()
            } else {
                self.read_chan()
            };
            procs.sleep(chan, &mut guard, ctx);
        }
        drop(guard);
        self.announce(writable, ctx.kernel());
        Ok(())
    }
}

/// An owning pointer to a `Pipe` living in its own page.
///
/// # Safety
///
/// `ptr` refers to a `Pipe` placed in a page from the page allocator.
/// The page outlives every `AllocatedPipe` pointing at it; the open
/// counts govern when `free_page` may run.
pub struct AllocatedPipe {
    ptr: NonNull<Pipe>,
}

// SAFETY: the pipe's spinlock serializes all access.
unsafe impl Send for AllocatedPipe {}
unsafe impl Sync for AllocatedPipe {}

impl Clone for AllocatedPipe {
    fn clone(&self) -> Self {
        Self { ptr: self.ptr }
    }
}

impl core::ops::Deref for AllocatedPipe {
    type Target = Pipe;

    fn deref(&self) -> &Pipe {
        // SAFETY: the invariant.
        unsafe { self.ptr.as_ref() }
    }
}

impl AllocatedPipe {
    /// Places a new pipe in a fresh page. `readopen`/`writeopen` start
    /// at the given counts (1/1 for anonymous pipes, 0/0 for FIFOs).
    pub fn alloc(kernel: &Kernel, readopen: i32, writeopen: i32) -> Result<AllocatedPipe> {
        let mut page = kernel.kmem.lock().alloc().ok_or(KernelError::ENOMEM)?;
        let slot = page.as_uninit_mut::<Pipe>();
        let ptr = NonNull::from(slot.write(Pipe {
            inner: SpinLock::new(
                "pipe",
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen,
                    writeopen,
                    is_deleted: false,
                },
            ),
        }));
        // The page now belongs to the pipe until free_page.
        let _ = page.into_usize();
        Ok(AllocatedPipe { ptr })
    }

    /// Returns the pipe's page to the allocator.
    ///
    /// The caller must know that no other reference will touch the pipe
    /// again (both open counts zero and every handle dropped or about
    /// to drop without using it).
    pub fn free_page(&self, kernel: &Kernel) {
        // SAFETY: per the method contract, the placement page is ours.
        let page = unsafe { Page::from_usize(self.ptr.as_ptr() as usize) };
        kernel.kmem.lock().free(page);
    }
}

/// Creates an anonymous pipe and its two file handles (read end, write
/// end).
pub fn create_pipe_pair(ctx: &KernelCtx<'_>) -> Result<(RcFile, RcFile)> {
    let pipe = AllocatedPipe::alloc(ctx.kernel(), 1, 1)?;
    let rf = match file_alloc(ctx, FileType::Pipe { pipe: pipe.clone() }, true, false) {
        Ok(f) => f,
        Err(e) => {
            pipe.free_page(ctx.kernel());
            return Err(e);
        }
    };
    let wf = match file_alloc(ctx, FileType::Pipe { pipe: pipe.clone() }, false, true) {
        Ok(f) => f,
        Err(e) => {
            // Closing the read end frees the page once the write side is
            // marked closed too.
            pipe.close_end(true, ctx.kernel());
            rf.free(ctx);
            return Err(e);
        }
    };
    Ok((rf, wf))
}
