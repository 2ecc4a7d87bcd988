//! File system: registration, VFS dispatch, transactions.
//!
//! Two filesystems exist: the on-disk root filesystem (`DiskFs`) and the
//! synthetic procfs. Every inode-touching operation dispatches through
//! the inode's `InodeOps` vtable; filesystem-level allocation and cache
//! management dispatch through `FsOps`. The default implementations are
//! the on-disk ones; procfs overrides what it must.
//!
//! Every path that may drop an inode runs inside a transaction (`Tx`),
//! because releasing the last reference to an unlinked inode writes to
//! disk; the transaction commits when the `Tx` drops.

use spin::Once;

use crate::bio::{BcacheExt, Buf};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::lock::SleepableLock;
use crate::param::{BSIZE, PROCDEV, ROOTDEV};
use crate::proc::{Credentials, KernelCtx, Proc};
use crate::vm::UVAddr;

mod inode;
mod log;
mod path;
pub mod procfs;
mod stat;
mod superblock;

pub use inode::{
    create, Dinode, Dirent, DiskFsOps, DiskInodeOps, Inode, InodeGuard, InodeInner, Itable,
    ItableExt, RcInode, DINODE_SIZE, DIRENT_SIZE, DIRSIZ, MAXFILE, NDIRECT, NINDIRECT, ROOTINO,
};
pub use log::Log;
pub use path::{namei, nameiparent, FileName, Path};
pub use stat::*;
pub use superblock::{Superblock, BPB, IPB};

/// Destination of an inode read.
pub enum ReadDst<'a> {
    Kernel(&'a mut [u8]),
    User(UVAddr),
}

/// Source of an inode write.
pub enum WriteSrc<'a> {
    Kernel(&'a [u8]),
    User(UVAddr),
}

/// Per-inode operations. The default methods are the on-disk behavior;
/// procfs installs its own vtable at lookup time.
pub trait InodeOps: Sync {
    fn read(
        &self,
        ip: &mut InodeGuard<'_>,
        dst: ReadDst<'_>,
        off: u32,
        n: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize>;

    fn write(
        &self,
        ip: &mut InodeGuard<'_>,
        src: WriteSrc<'_>,
        off: u32,
        n: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize>;

    /// Directory entry lookup; returns the entry's inode and byte
    /// offset. `dp` must be a locked directory.
    fn lookup(
        &self,
        dp: &mut InodeGuard<'_>,
        name: &FileName,
        ctx: &KernelCtx<'_>,
    ) -> Result<(RcInode, u32)>;

    /// Appends the entry `(name, inum)` to directory `dp`.
    fn link(
        &self,
        dp: &mut InodeGuard<'_>,
        name: &FileName,
        inum: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<()>;

    /// Erases the directory entry at byte offset `off`.
    fn unlink(
        &self,
        dp: &mut InodeGuard<'_>,
        off: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<()>;

    /// Writes the in-memory inode back to its filesystem.
    fn update(&self, ip: &InodeGuard<'_>, tx: &Tx<'_>, ctx: &KernelCtx<'_>);

    /// The caller's effective rwx triple on this inode.
    fn permissions(&self, ip: &InodeGuard<'_>, cred: &Credentials) -> u32 {
        cred.permissions_for(ip.uid, ip.gid, ip.mode)
    }
}

/// Filesystem-level operations: inode allocation and cache management.
pub trait FsOps: Sync {
    /// Allocates a fresh inode of legacy type `typ`.
    fn alloc_inode(&self, dev: u32, typ: i16, tx: &Tx<'_>, ctx: &KernelCtx<'_>) -> Result<RcInode>;

    /// Finds or creates the cache entry for `(dev, inum)`.
    fn get_inode(&self, dev: u32, inum: u32, ctx: &KernelCtx<'_>) -> RcInode;

    /// Called when the last in-memory reference goes away.
    fn drop_inode(&self, ip: &mut Inode, tx: &Tx<'_>, ctx: &KernelCtx<'_>);
}

/// A registered filesystem: `(index, dev, ops)`.
pub struct Filesystem {
    pub index: u32,
    pub dev: u32,
    pub ops: &'static dyn FsOps,
}

const NFS: usize = 4;

/// The registration table. Indexed by scanning; device numbers double as
/// filesystem indices.
pub struct FsTable {
    entries: [Once<Filesystem>; NFS],
}

impl FsTable {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const NONE: Once<Filesystem> = Once::new();
        Self {
            entries: [NONE; NFS],
        }
    }

    pub fn register(&self, fs: Filesystem) {
        for slot in &self.entries {
            if slot.get().is_none() {
                let _ = slot.call_once(|| fs);
                return;
            }
        }
        panic!("filesystem table full");
    }

    pub fn find(&self, index: u32) -> Option<&Filesystem> {
        self.entries
            .iter()
            .filter_map(|s| s.get())
            .find(|fs| fs.index == index)
    }
}

/// Installs the two standard filesystems.
pub fn register_basic_filesystems(kernel: &Kernel) {
    kernel.fstab().register(Filesystem {
        index: ROOTDEV,
        dev: ROOTDEV,
        ops: &inode::DiskFsOps,
    });
    kernel.fstab().register(Filesystem {
        index: PROCDEV,
        dev: PROCDEV,
        ops: &procfs::ProcFsOps,
    });
}

/// The on-disk root filesystem: superblock plus write-ahead log.
pub struct DiskFs {
    dev: Once<u32>,
    superblock: Once<Superblock>,
    log: Once<SleepableLock<Log>>,
}

impl DiskFs {
    pub const fn new() -> Self {
        Self {
            dev: Once::new(),
            superblock: Once::new(),
            log: Once::new(),
        }
    }

    /// Mounts the filesystem on `dev`: reads the superblock and replays
    /// the log. Runs once; later calls are no-ops.
    pub fn init(&self, dev: u32, ctx: &KernelCtx<'_>) {
        if self.superblock.get().is_some() {
            return;
        }
        let _ = self.dev.call_once(|| dev);
        let superblock = {
            let buf = ctx.kernel().bcache().read(dev, 1, ctx);
            Superblock::from_buf(&buf)
        };
        let logstart = superblock.logstart();
        let nlog = superblock.nlog;
        let _ = self.superblock.call_once(|| superblock);
        let _ = self
            .log
            .call_once(|| SleepableLock::new("log", Log::new(dev, logstart, nlog, ctx)));
    }

    pub fn dev(&self) -> u32 {
        *self.dev.get().expect("fs not mounted")
    }

    pub fn superblock(&self) -> &Superblock {
        self.superblock.get().expect("fs not mounted")
    }

    fn log(&self) -> &SleepableLock<Log> {
        self.log.get().expect("fs not mounted")
    }

    /// Opens a transaction. It commits when the returned `Tx` drops.
    pub fn begin_tx<'s>(&self, ctx: &KernelCtx<'s>) -> Tx<'s> {
        Log::begin_op(self.log(), ctx);
        Tx {
            kernel: ctx.kernel(),
            proc: ctx.proc(),
        }
    }
}

/// An open transaction. All block writes between creation and drop are
/// committed atomically.
pub struct Tx<'s> {
    kernel: &'s Kernel,
    proc: &'s Proc,
}

impl<'s> Tx<'s> {
    fn ctx(&self) -> KernelCtx<'s> {
        // SAFETY: the Tx was created from a valid context for this task.
        unsafe { KernelCtx::new(self.kernel, self.proc) }
    }

    /// Queues a modified buffer for the commit.
    pub fn write(&self, buf: Buf<'_>) {
        Log::log_write(self.kernel.fs().log(), buf);
    }

    /// Zeroes a block and queues it.
    fn bzero(&self, dev: u32, bno: u32, ctx: &KernelCtx<'_>) {
        let buf = self.kernel.bcache().zeroed(dev, bno, ctx);
        self.write(buf);
    }

    /// Allocates a zeroed disk block.
    pub fn balloc(&self, dev: u32, ctx: &KernelCtx<'_>) -> Result<u32> {
        let sb = self.kernel.fs().superblock();
        let mut b = 0;
        while b < sb.size {
            let mut bp = self.kernel.bcache().read(dev, sb.bblock(b), ctx);
            let mut bi = 0;
            while bi < BPB && b + bi < sb.size {
                let m = 1u8 << (bi % 8);
                if bp.data().inner[(bi / 8) as usize] & m == 0 {
                    // The block is free: take it.
                    bp.data_mut().inner[(bi / 8) as usize] |= m;
                    self.write(bp);
                    self.bzero(dev, b + bi, ctx);
                    return Ok(b + bi);
                }
                bi += 1;
            }
            drop(bp);
            b += BPB;
        }
        ::log::warn!("balloc: out of blocks");
        Err(KernelError::ENOSPC)
    }

    /// Frees a disk block.
    pub fn bfree(&self, dev: u32, b: u32, ctx: &KernelCtx<'_>) {
        let sb = self.kernel.fs().superblock();
        let mut bp = self.kernel.bcache().read(dev, sb.bblock(b), ctx);
        let bi = (b % BPB) as usize;
        let m = 1u8 << (bi % 8);
        assert_ne!(bp.data().inner[bi / 8] & m, 0, "freeing free block");
        bp.data_mut().inner[bi / 8] &= !m;
        self.write(bp);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        let ctx = self.ctx();
        Log::end_op(self.kernel.fs().log(), &ctx);
    }
}

/// Blocks a file write may touch: one inode block, one indirect block,
/// up to two bitmap blocks, two blocks of slop, and the data itself.
/// `filewrite` chunks writes so one chunk's transaction fits the log.
pub const fn max_op_bytes() -> usize {
    ((crate::param::LOGSIZE - 1 - 1 - 2) / 2) * BSIZE
}
