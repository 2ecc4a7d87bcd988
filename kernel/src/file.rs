//! File handles.
//!
//! A `File` is a tagged union over anonymous pipe ends, inodes (regular
//! files, directories and devices) and FIFO ends. Handles are counted by
//! the file-table arena; `fileclose` is the one true way to release a
//! reference, because FIFO ends keep per-direction open counts on their
//! pipe that must fall with every reference, not just the last.

use crate::arena::{Arena, ArenaObject, ArrayArena, Rc};
use crate::error::{KernelError, Result};
use crate::fs::{max_op_bytes, InodeOps as _, RcInode, ReadDst, WriteSrc};
use crate::lock::SpinLock;
use crate::param::NFILE;
use crate::pipe::AllocatedPipe;
use crate::proc::{FilesStruct, KernelCtx};
use crate::vm::UVAddr;

/// Character-device switch: maps a major device number to driver entry
/// points. Drivers (console) register themselves at boot.
#[derive(Clone, Copy)]
pub struct Devsw {
    pub read: Option<fn(ReadDst<'_>, u32, &KernelCtx<'_>) -> Result<usize>>,
    pub write: Option<fn(WriteSrc<'_>, u32, &KernelCtx<'_>) -> Result<usize>>,
}

pub enum FileType {
    None,
    Pipe { pipe: AllocatedPipe },
    Inode { ip: RcInode },
    Fifo { pipe: AllocatedPipe, ip: RcInode },
}

pub struct File {
    pub typ: FileType,
    readable: bool,
    writable: bool,
    /// Byte offset for inode-backed files.
    off: SpinLock<u32>,
}

impl File {
    pub const fn zero() -> Self {
        Self {
            typ: FileType::None,
            readable: false,
            writable: false,
            off: SpinLock::new("file", 0),
        }
    }

    pub fn typ(&self) -> &FileType {
        &self.typ
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn inode(&self) -> Option<&RcInode> {
        match &self.typ {
            FileType::Inode { ip } | FileType::Fifo { ip, .. } => Some(ip),
            _ => None,
        }
    }

    pub fn is_regular_inode(&self) -> bool {
        matches!(self.typ, FileType::Inode { .. })
    }

    /// Current offset (inode files).
    pub fn offset(&self) -> u32 {
        *self.off.lock()
    }

    pub fn set_offset(&self, off: u32) {
        *self.off.lock() = off;
    }

    /// Reads up to `n` bytes into user memory at `addr`.
    pub fn read(&self, addr: UVAddr, n: u32, ctx: &KernelCtx<'_>) -> Result<usize> {
        if !self.readable {
            return Err(KernelError::EBADF);
        }
        match &self.typ {
            FileType::Pipe { pipe } | FileType::Fifo { pipe, .. } => pipe.read(addr, n as usize, ctx),
            FileType::Inode { ip } => {
                let mut guard = ip.lock(ctx);
                let off = self.offset();
                let ops = guard.ops;
                let r = ops.read(&mut guard, ReadDst::User(addr), off, n, ctx);
                if let Ok(read) = r {
                    self.set_offset(off.wrapping_add(read as u32));
                }
                drop(guard);
                r
            }
            FileType::None => panic!("File::read on empty slot"),
        }
    }

    /// Writes up to `n` bytes from user memory at `addr`.
    pub fn write(&self, addr: UVAddr, n: u32, ctx: &KernelCtx<'_>) -> Result<usize> {
        if !self.writable {
            return Err(KernelError::EBADF);
        }
        match &self.typ {
            FileType::Pipe { pipe } | FileType::Fifo { pipe, .. } => {
                pipe.write(addr, n as usize, ctx)
            }
            FileType::Inode { ip } => {
                // Chunk the write so one chunk's transaction fits the
                // log: inode, indirect block, bitmap blocks and slop.
                let max = max_op_bytes() as u32;
                let mut written = 0u32;
                while written < n {
                    let n1 = core::cmp::min(n - written, max);
                    let tx = ctx.kernel().fs().begin_tx(ctx);
                    let mut guard = ip.lock(ctx);
                    let off = self.offset();
                    let ops = guard.ops;
                    let r = ops.write(
                        &mut guard,
                        WriteSrc::User(addr + written as usize),
                        off,
                        n1,
                        &tx,
                        ctx,
                    );
                    drop(guard);
                    drop(tx);
                    match r {
                        Ok(w) => {
                            self.set_offset(off.wrapping_add(w as u32));
                            if w as u32 != n1 {
                                return Err(KernelError::EIO);
                            }
                            written += n1;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(n as usize)
            }
            FileType::None => panic!("File::write on empty slot"),
        }
    }

    /// Writes `bytes` at absolute offset `off`, bypassing the handle's
    /// own offset. The mmap writeback path uses this.
    pub fn write_at_from_kernel(&self, bytes: &[u8], off: u32, ctx: &KernelCtx<'_>) -> Result<usize> {
        let ip = match &self.typ {
            FileType::Inode { ip } => ip,
            _ => return Err(KernelError::EBADF),
        };
        let max = max_op_bytes();
        let mut written = 0usize;
        while written < bytes.len() {
            let n1 = core::cmp::min(bytes.len() - written, max);
            let tx = ctx.kernel().fs().begin_tx(ctx);
            let mut guard = ip.lock(ctx);
            let ops = guard.ops;
            let r = ops.write(
                &mut guard,
                WriteSrc::Kernel(&bytes[written..written + n1]),
                off + written as u32,
                n1 as u32,
                &tx,
                ctx,
            );
            drop(guard);
            drop(tx);
            written += r?;
        }
        Ok(written)
    }

    /// Copies stat information for the backing inode out to user memory.
    pub fn stat(&self, addr: UVAddr, ctx: &KernelCtx<'_>) -> Result<()> {
        use zerocopy::AsBytes;
        match &self.typ {
            FileType::Inode { ip } | FileType::Fifo { ip, .. } => {
                let st = ip.stat(ctx);
                ctx.copy_out_bytes(addr, st.as_bytes())
            }
            _ => Err(KernelError::EBADF),
        }
    }
}

impl ArenaObject for File {
    type FreeCtx<'a> = &'a KernelCtx<'a>;

    /// Runs when the last reference disappears. The per-reference FIFO
    /// bookkeeping already happened in `fileclose`.
    fn finalize(&mut self, ctx: &KernelCtx<'_>) {
        let typ = core::mem::replace(&mut self.typ, FileType::None);
        match typ {
            FileType::None => {}
            FileType::Pipe { pipe } => {
                if pipe.close_end(self.writable, ctx.kernel()) {
                    pipe.free_page(ctx.kernel());
                }
            }
            FileType::Inode { ip } => {
                let tx = ctx.kernel().fs().begin_tx(ctx);
                ip.free((&tx, ctx));
                drop(tx);
            }
            FileType::Fifo { pipe: _, ip } => {
                // The pipe's page was torn down when both open counts
                // reached zero; only the inode reference remains.
                let tx = ctx.kernel().fs().begin_tx(ctx);
                ip.free((&tx, ctx));
                drop(tx);
            }
        }
        *self.off.get_mut() = 0;
        self.readable = false;
        self.writable = false;
    }
}

pub type FTable = SpinLock<ArrayArena<File, NFILE>>;
pub type RcFile = Rc<FTable>;

/// Allocates a file handle.
pub fn file_alloc(
    ctx: &KernelCtx<'_>,
    typ: FileType,
    readable: bool,
    writable: bool,
) -> Result<RcFile> {
    ctx.kernel()
        .ftable()
        .alloc(|f| {
            f.typ = typ;
            f.readable = readable;
            f.writable = writable;
            *f.off.get_mut() = 0;
        })
        .ok_or(KernelError::ENFILE)
}

/// Duplicates a file reference. A FIFO end's duplicate also raises the
/// pipe's open count for its direction, mirroring `fileclose`.
pub fn dup_file(f: &RcFile) -> RcFile {
    let copy = f.clone();
    if let FileType::Fifo { pipe, .. } = &copy.typ {
        pipe.open_end(copy.readable, copy.writable);
    }
    copy
}

/// Releases one file reference. For FIFO ends, drops the pipe's open
/// count for this direction and tears the pipe down when both sides
/// reach zero, so a later open recreates it.
pub fn fileclose(f: RcFile, ctx: &KernelCtx<'_>) {
    if let FileType::Fifo { pipe, ip } = &f.typ {
        let both_zero = pipe.release_end(f.readable, f.writable, ctx.kernel());
        if both_zero {
            // Drop the inode's cached ends; the next open builds a new
            // pipe. Taking them may drop the last references.
            let pipe = pipe.clone();
            let (rf, wf) = {
                let mut guard = ip.lock(ctx);
                let inner = guard.deref_inner_mut();
                (inner.read_file.take(), inner.write_file.take())
            };
            if let Some(rf) = rf {
                rf.free(ctx);
            }
            if let Some(wf) = wf {
                wf.free(ctx);
            }
            pipe.free_page(ctx.kernel());
        }
    }
    f.free(ctx);
}

/// Builds a private copy of the caller's descriptor table (`clone`
/// without `CLONE_FILES`).
pub fn dup_files_table(
    ctx: &KernelCtx<'_>,
) -> core::result::Result<core::ptr::NonNull<FilesStruct>, KernelError> {
    let new = FilesStruct::new(ctx.kernel()).ok_or(KernelError::ENOMEM)?;
    // SAFETY: the fresh table is invisible to other tasks.
    let table = unsafe { new.as_ref() };
    for fd in 0..crate::param::NOFILE as i32 {
        if let Some(f) = ctx.files().get(fd) {
            let dup = dup_file(&f);
            f.free(ctx);
            if let Err(dup) = table.set_fd(fd, dup) {
                fileclose(dup, ctx);
                panic!("dup_files_table: fresh table has a filled slot");
            }
        }
    }
    Ok(new)
}
