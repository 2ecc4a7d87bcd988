//! Inodes and the inode cache.
//!
//! An inode describes a single unnamed file: type, mode, ownership, link
//! count, size and the block addresses of its content. The on-disk form
//! is `Dinode`; the cache keeps an in-memory mirror per `(dev, inum)`
//! with at most one entry per pair.
//!
//! Life cycle: `alloc` makes the on-disk type nonzero; `get_inode` finds
//! or creates a cache entry (a reference); `lock` loads the mirror and
//! grants exclusive access to the fields; dropping the last reference of
//! an unlinked inode truncates and frees it on disk. Every call that can
//! drop a reference therefore runs inside a transaction.
//!
//! Lock order: inode locks strictly precede buffer locks; the cache's
//! own spinlock is only held for reference-count surgery.

use core::mem::{self, ManuallyDrop};
use core::ops::Deref;

use zerocopy::{AsBytes, FromBytes};

use crate::arena::{Arena, ArenaObject, ArrayArena, Rc};
use crate::bio::BcacheExt;
use crate::error::{KernelError, Result};
use crate::lock::{SleepLock, SleepLockGuard, SpinLock};
use crate::param::{BSIZE, NDEV, NINODE};
use crate::proc::{KernelCtx, RcFile};

use super::path::nameiparent;
use super::stat::{s_ischr, s_isdir, s_isfifo, s_isreg, type_to_mode, Stat, T_DIR, T_FILE};
use super::{FileName, FsOps, InodeOps, Path, ReadDst, Tx, WriteSrc, IPB};

/// Direct block addresses per inode. Chosen so the 64-byte `Dinode`
/// divides `BSIZE` exactly.
pub const NDIRECT: usize = 9;

/// Block addresses in the single indirect block.
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();

/// Largest file, in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// Inode number of the filesystem root directory.
pub const ROOTINO: u32 = 1;

/// Maximum length of a directory entry name.
pub const DIRSIZ: usize = 14;

/// The on-disk inode. `typ` is the legacy discriminator; `mode` carries
/// the authoritative POSIX bits.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct Dinode {
    pub typ: i16,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

pub const DINODE_SIZE: usize = mem::size_of::<Dinode>();

/// A directory entry; a directory is a file holding a sequence of these.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct Dirent {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

impl Dirent {
    /// Fills in the name, NUL-padded.
    pub fn set_name(&mut self, name: &FileName) {
        let bytes = name.as_bytes();
        self.name = [0; DIRSIZ];
        self.name[..bytes.len()].copy_from_slice(bytes);
    }

    /// The entry's name, terminated at the first NUL.
    pub fn get_name(&self) -> &FileName {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);
        // SAFETY: the slice contains no NUL and is at most DIRSIZ long.
        unsafe { FileName::from_bytes(&self.name[..len]) }
    }
}

/// The in-memory mirror of an inode, guarded by the inode's sleep lock.
pub struct InodeInner {
    /// Loaded from disk?
    pub valid: bool,
    pub typ: i16,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Operation vtable; the on-disk implementation unless a synthetic
    /// filesystem installed its own.
    pub ops: &'static dyn InodeOps,
    /// `(dev, inum)` of the directory a mount covers; used by the
    /// procfs root's `..`.
    pub mount_parent: (u32, u32),
    /// The two ends of a FIFO's pipe, present while the FIFO is open.
    pub read_file: Option<RcFile>,
    pub write_file: Option<RcFile>,
}

impl InodeInner {
    const fn zero() -> Self {
        Self {
            valid: false,
            typ: 0,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
            uid: 0,
            gid: 0,
            mode: 0,
            ops: &DiskInodeOps,
            mount_parent: (0, 0),
            read_file: None,
            write_file: None,
        }
    }
}

/// An in-memory inode: identity outside the lock, everything else
/// inside.
pub struct Inode {
    pub dev: u32,
    pub inum: u32,
    pub inner: SleepLock<InodeInner>,
}

impl Inode {
    pub const fn zero() -> Self {
        Self {
            dev: 0,
            inum: 0,
            inner: SleepLock::new(InodeInner::zero()),
        }
    }

    /// Locks the inode, loading it from disk on first use.
    pub fn lock<'s>(&'s self, ctx: &KernelCtx<'s>) -> InodeGuard<'s> {
        let mut guard = self.inner.lock(ctx);
        if !guard.valid {
            // Only on-disk inodes are ever locked before initialization;
            // synthetic filesystems fill their inodes at lookup.
            let sb = ctx.kernel().fs().superblock();
            let buf = ctx.kernel().bcache().read(self.dev, sb.iblock(self.inum), ctx);
            let off = (self.inum % IPB) as usize * DINODE_SIZE;
            let dip = Dinode::read_from(&buf.data().inner[off..off + DINODE_SIZE])
                .expect("inode read");
            drop(buf);
            guard.typ = dip.typ;
            guard.major = dip.major;
            guard.minor = dip.minor;
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addrs = dip.addrs;
            guard.uid = dip.uid;
            guard.gid = dip.gid;
            guard.mode = dip.mode;
            guard.ops = &DiskInodeOps;
            guard.valid = true;
            assert_ne!(guard.typ, 0, "Inode::lock: no type");
        }
        InodeGuard {
            inode: self,
            guard: ManuallyDrop::new(guard),
        }
    }

    /// Copies out stat information.
    pub fn stat(&self, ctx: &KernelCtx<'_>) -> Stat {
        let guard = self.lock(ctx);
        let st = Stat {
            dev: self.dev as i32,
            ino: self.inum,
            nlink: guard.nlink as u16,
            _padding: 0,
            size: guard.size,
            uid: guard.uid,
            gid: guard.gid,
            mode: guard.mode,
        };
        drop(guard);
        st
    }
}

impl ArenaObject for Inode {
    type FreeCtx<'a> = (&'a Tx<'a>, &'a KernelCtx<'a>);

    fn finalize(&mut self, (tx, ctx): (&Tx<'_>, &KernelCtx<'_>)) {
        let fs = ctx
            .kernel()
            .fstab()
            .find(self.dev)
            .expect("inode of unregistered fs");
        fs.ops.drop_inode(self, tx, ctx);
    }
}

/// The inode cache.
pub type Itable = SpinLock<ArrayArena<Inode, NINODE>>;

/// A counted handle to a cached inode.
pub type RcInode = Rc<Itable>;

/// Exclusive, loaded access to an inode's fields and content.
pub struct InodeGuard<'s> {
    pub inode: &'s Inode,
    guard: ManuallyDrop<SleepLockGuard<'s, InodeInner>>,
}

impl Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &InodeInner {
        &self.guard
    }
}

impl InodeGuard<'_> {
    pub fn deref_inner_mut(&mut self) -> &mut InodeInner {
        &mut self.guard
    }

    pub fn dev(&self) -> u32 {
        self.inode.dev
    }

    pub fn inum(&self) -> u32 {
        self.inode.inum
    }

    /// Dispatched read into kernel memory; shorthand used all over.
    pub fn read_bytes_kernel(
        &mut self,
        dst: &mut [u8],
        off: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize> {
        let n = dst.len() as u32;
        let ops = self.ops;
        ops.read(self, ReadDst::Kernel(dst), off, n, ctx)
    }

    /// Reads a `T` exactly, or fails.
    pub fn read_kernel<T: AsBytes + FromBytes + Default>(
        &mut self,
        off: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<T> {
        let mut val = T::default();
        let n = self.read_bytes_kernel(val.as_bytes_mut(), off, ctx)?;
        if n != mem::size_of::<T>() {
            return Err(KernelError::EIO);
        }
        Ok(val)
    }

    /// Dispatched write from kernel memory.
    pub fn write_bytes_kernel(
        &mut self,
        src: &[u8],
        off: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize> {
        let n = src.len() as u32;
        let ops = self.ops;
        ops.write(self, WriteSrc::Kernel(src), off, n, tx, ctx)
    }

    /// Writes a `T` exactly, or fails.
    pub fn write_kernel<T: AsBytes>(
        &mut self,
        val: &T,
        off: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<()> {
        let n = self.write_bytes_kernel(val.as_bytes(), off, tx, ctx)?;
        if n != mem::size_of::<T>() {
            return Err(KernelError::EIO);
        }
        Ok(())
    }

    /// Dispatched directory lookup.
    pub fn dirlookup(
        &mut self,
        name: &FileName,
        ctx: &KernelCtx<'_>,
    ) -> Result<(RcInode, u32)> {
        let ops = self.ops;
        ops.lookup(self, name, ctx)
    }

    /// Dispatched directory entry insertion.
    pub fn dirlink(
        &mut self,
        name: &FileName,
        inum: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<()> {
        let ops = self.ops;
        ops.link(self, name, inum, tx, ctx)
    }

    /// Dispatched update of the persistent fields.
    pub fn update(&mut self, tx: &Tx<'_>, ctx: &KernelCtx<'_>) {
        let ops = self.ops;
        ops.update(self, tx, ctx)
    }

    /// The caller's effective rwx triple on this inode.
    pub fn permissions(&mut self, ctx: &KernelCtx<'_>) -> u32 {
        let cred = ctx.cred().clone();
        self.ops.permissions(self, &cred)
    }

    /// Is the directory empty except for `.` and `..`?
    pub fn is_dir_empty(&mut self, ctx: &KernelCtx<'_>) -> bool {
        let mut off = (2 * DIRENT_SIZE) as u32;
        while off < self.size {
            let de: Dirent = self.read_kernel(off, ctx).expect("is_dir_empty: read");
            if de.inum != 0 {
                return false;
            }
            off += DIRENT_SIZE as u32;
        }
        true
    }

    /// Truncates the content to zero length, freeing every data block.
    pub fn trunc(&mut self, tx: &Tx<'_>, ctx: &KernelCtx<'_>) {
        let dev = self.dev();
        for i in 0..NDIRECT {
            let addr = self.addrs[i];
            if addr != 0 {
                tx.bfree(dev, addr, ctx);
                self.deref_inner_mut().addrs[i] = 0;
            }
        }

        let indirect = self.addrs[NDIRECT];
        if indirect != 0 {
            {
                let bp = ctx.kernel().bcache().read(dev, indirect, ctx);
                for j in 0..NINDIRECT {
                    let a = bp.data().read_u32(j);
                    if a != 0 {
                        tx.bfree(dev, a, ctx);
                    }
                }
            }
            tx.bfree(dev, indirect, ctx);
            self.deref_inner_mut().addrs[NDIRECT] = 0;
        }

        self.deref_inner_mut().size = 0;
        self.update(tx, ctx);
    }

    /// Disk address of the `bn`th content block, allocating (direct or
    /// through the indirect block) when a transaction is supplied.
    fn bmap(&mut self, bn: usize, tx: Option<&Tx<'_>>, ctx: &KernelCtx<'_>) -> Result<u32> {
        let dev = self.dev();
        if bn < NDIRECT {
            let mut addr = self.addrs[bn];
            if addr == 0 {
                let tx = tx.ok_or(KernelError::EIO)?;
                addr = tx.balloc(dev, ctx)?;
                self.deref_inner_mut().addrs[bn] = addr;
            }
            return Ok(addr);
        }

        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");
        let mut indirect = self.addrs[NDIRECT];
        if indirect == 0 {
            let tx = tx.ok_or(KernelError::EIO)?;
            indirect = tx.balloc(dev, ctx)?;
            self.deref_inner_mut().addrs[NDIRECT] = indirect;
        }
        let mut bp = ctx.kernel().bcache().read(dev, indirect, ctx);
        let mut addr = bp.data().read_u32(bn);
        if addr == 0 {
            let tx = tx.ok_or(KernelError::EIO)?;
            addr = tx.balloc(dev, ctx)?;
            bp.data_mut().write_u32(bn, addr);
            tx.write(bp);
        }
        Ok(addr)
    }
}

impl Drop for InodeGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: drop runs once.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
    }
}

/// Cache-level helpers of the inode table.
pub trait ItableExt {
    /// Finds or creates the cache entry for `(dev, inum)`. Installs
    /// `ops` on a fresh entry; `init` may fill synthetic fields.
    fn get_inode(
        &self,
        dev: u32,
        inum: u32,
        ops: &'static dyn InodeOps,
        init: Option<&dyn Fn(&mut InodeInner)>,
    ) -> RcInode;
}

impl ItableExt for Itable {
    fn get_inode(
        &self,
        dev: u32,
        inum: u32,
        ops: &'static dyn InodeOps,
        init: Option<&dyn Fn(&mut InodeInner)>,
    ) -> RcInode {
        self.find_or_alloc(
            |ip| ip.dev == dev && ip.inum == inum,
            |ip| {
                ip.dev = dev;
                ip.inum = inum;
                let inner = ip.inner.get_mut();
                *inner = InodeInner::zero();
                inner.ops = ops;
                if let Some(init) = init {
                    init(inner);
                }
            },
        )
        .expect("iget: no inodes")
    }
}

/// The default, on-disk filesystem operations.
pub struct DiskFsOps;

impl FsOps for DiskFsOps {
    fn alloc_inode(&self, dev: u32, typ: i16, tx: &Tx<'_>, ctx: &KernelCtx<'_>) -> Result<RcInode> {
        let sb = *ctx.kernel().fs().superblock();
        for inum in 1..sb.ninodes {
            let mut bp = ctx.kernel().bcache().read(dev, sb.iblock(inum), ctx);
            let off = (inum % IPB) as usize * DINODE_SIZE;
            let dip = Dinode::read_from(&bp.data().inner[off..off + DINODE_SIZE])
                .expect("dinode read");
            if dip.typ == 0 {
                // A free inode: claim it on disk.
                let mut fresh = Dinode::default();
                fresh.typ = typ;
                bp.data_mut().inner[off..off + DINODE_SIZE].copy_from_slice(fresh.as_bytes());
                tx.write(bp);
                return Ok(ctx
                    .kernel()
                    .itable()
                    .get_inode(dev, inum, &DiskInodeOps, None));
            }
            drop(bp);
        }
        log::warn!("ialloc: no free inodes");
        Err(KernelError::ENOSPC)
    }

    fn get_inode(&self, dev: u32, inum: u32, ctx: &KernelCtx<'_>) -> RcInode {
        ctx.kernel()
            .itable()
            .get_inode(dev, inum, &DiskInodeOps, None)
    }

    fn drop_inode(&self, ip: &mut Inode, tx: &Tx<'_>, ctx: &KernelCtx<'_>) {
        let inner = ip.inner.get_mut();
        if inner.valid && inner.nlink == 0 {
            // No links and no other references: truncate and free on
            // disk. refcnt == 1 means nobody can hold the sleep lock, so
            // locking cannot block.
            let mut guard = ip.lock(ctx);
            guard.trunc(tx, ctx);
            guard.deref_inner_mut().typ = 0;
            guard.deref_inner_mut().mode = 0;
            guard.update(tx, ctx);
            guard.deref_inner_mut().valid = false;
            drop(guard);
        }
    }
}

/// The default, on-disk inode operations.
pub struct DiskInodeOps;

impl InodeOps for DiskInodeOps {
    fn read(
        &self,
        ip: &mut InodeGuard<'_>,
        dst: ReadDst<'_>,
        mut off: u32,
        mut n: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize> {
        if s_ischr(ip.mode) {
            let major = ip.major;
            if major < 0 || major as usize >= NDEV {
                return Err(KernelError::ENXIO);
            }
            let dev = ctx.kernel().devsw(major as usize);
            return match dev.read {
                Some(read) => read(dst, n, ctx),
                None => Err(KernelError::ENXIO),
            };
        }

        if off > ip.size || off.checked_add(n).is_none() {
            return Ok(0);
        }
        if off + n > ip.size {
            n = ip.size - off;
        }
        let mut tot = 0u32;
        let mut user_dst = match dst {
            ReadDst::Kernel(slice) => Err(slice),
            ReadDst::User(addr) => Ok(addr),
        };
        while tot < n {
            let bno = ip.bmap(off as usize / BSIZE, None, ctx)?;
            let bp = ctx.kernel().bcache().read(ip.dev(), bno, ctx);
            let m = core::cmp::min(n - tot, (BSIZE as u32) - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            let chunk = &bp.data().inner[begin..begin + m as usize];
            match &mut user_dst {
                Ok(addr) => ctx.copy_out_bytes(*addr + tot as usize, chunk)?,
                Err(slice) => {
                    slice[tot as usize..(tot + m) as usize].copy_from_slice(chunk)
                }
            }
            drop(bp);
            tot += m;
            off += m;
        }
        Ok(tot as usize)
    }

    fn write(
        &self,
        ip: &mut InodeGuard<'_>,
        src: WriteSrc<'_>,
        mut off: u32,
        n: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize> {
        if s_ischr(ip.mode) {
            let major = ip.major;
            if major < 0 || major as usize >= NDEV {
                return Err(KernelError::ENXIO);
            }
            let dev = ctx.kernel().devsw(major as usize);
            return match dev.write {
                Some(write) => write(src, n, ctx),
                None => Err(KernelError::ENXIO),
            };
        }

        if off > ip.size || off.checked_add(n).is_none() {
            return Err(KernelError::EINVAL);
        }
        if (off + n) as usize > MAXFILE * BSIZE {
            return Err(KernelError::EFBIG);
        }
        let mut tot = 0u32;
        let user_src = match src {
            WriteSrc::Kernel(slice) => Err(slice),
            WriteSrc::User(addr) => Ok(addr),
        };
        while tot < n {
            let bno = ip.bmap(off as usize / BSIZE, Some(tx), ctx)?;
            let mut bp = ctx.kernel().bcache().read(ip.dev(), bno, ctx);
            let m = core::cmp::min(n - tot, (BSIZE as u32) - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            let chunk = &mut bp.data_mut().inner[begin..begin + m as usize];
            let res = match &user_src {
                Ok(addr) => {
                    let mut tmp = [0u8; BSIZE];
                    let r = ctx.copy_in_bytes(&mut tmp[..m as usize], *addr + tot as usize);
                    if r.is_ok() {
                        chunk.copy_from_slice(&tmp[..m as usize]);
                    }
                    r
                }
                Err(slice) => {
                    chunk.copy_from_slice(&slice[tot as usize..(tot + m) as usize]);
                    Ok(())
                }
            };
            if res.is_err() {
                drop(bp);
                break;
            }
            tx.write(bp);
            tot += m;
            off += m;
        }

        if off > ip.size {
            ip.deref_inner_mut().size = off;
        }
        // Write the inode back even if the size is unchanged: bmap may
        // have added a block address.
        ip.update(tx, ctx);
        Ok(tot as usize)
    }

    fn lookup(
        &self,
        dp: &mut InodeGuard<'_>,
        name: &FileName,
        ctx: &KernelCtx<'_>,
    ) -> Result<(RcInode, u32)> {
        assert!(s_isdir(dp.mode), "dirlookup not DIR");
        {
            let cred = ctx.cred();
            if cred.euid != 0
                && cred.permissions_for(dp.uid, dp.gid, dp.mode) & 1 == 0
            {
                return Err(KernelError::EPERM);
            }
        }
        let size = dp.size;
        let mut off = 0u32;
        while off < size {
            let de: Dirent = dp.read_kernel(off, ctx)?;
            if de.inum != 0 && de.get_name() == name {
                let fs = ctx
                    .kernel()
                    .fstab()
                    .find(dp.dev())
                    .expect("lookup on unregistered fs");
                let ip = fs.ops.get_inode(dp.dev(), de.inum as u32, ctx);
                return Ok((ip, off));
            }
            off += DIRENT_SIZE as u32;
        }
        Err(KernelError::ENOENT)
    }

    fn link(
        &self,
        dp: &mut InodeGuard<'_>,
        name: &FileName,
        inum: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<()> {
        // The name must not be present yet.
        match dp.dirlookup(name, ctx) {
            Ok((ip, _)) => {
                ip.free((tx, ctx));
                return Err(KernelError::EEXIST);
            }
            Err(KernelError::ENOENT) => {}
            Err(e) => return Err(e),
        }

        // Modifying a directory takes write and search permission.
        {
            let cred = ctx.cred();
            if cred.euid != 0
                && cred.permissions_for(dp.uid, dp.gid, dp.mode) & 3 != 3
            {
                return Err(KernelError::EPERM);
            }
        }

        // Find an empty slot, or append.
        let size = dp.size;
        let mut off = 0u32;
        while off < size {
            let de: Dirent = dp.read_kernel(off, ctx)?;
            if de.inum == 0 {
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        let mut de = Dirent {
            inum: inum as u16,
            name: [0; DIRSIZ],
        };
        de.set_name(name);
        dp.write_kernel(&de, off, tx, ctx)
    }

    fn unlink(
        &self,
        dp: &mut InodeGuard<'_>,
        off: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<()> {
        let de = Dirent::default();
        dp.write_kernel(&de, off, tx, ctx)
    }

    fn update(&self, ip: &InodeGuard<'_>, tx: &Tx<'_>, ctx: &KernelCtx<'_>) {
        let sb = ctx.kernel().fs().superblock();
        let mut bp = ctx
            .kernel()
            .bcache()
            .read(ip.dev(), sb.iblock(ip.inum()), ctx);
        let off = (ip.inum() % IPB) as usize * DINODE_SIZE;
        let dip = Dinode {
            typ: ip.typ,
            major: ip.major,
            minor: ip.minor,
            nlink: ip.nlink,
            size: ip.size,
            addrs: ip.addrs,
            uid: ip.uid,
            gid: ip.gid,
            mode: ip.mode,
        };
        bp.data_mut().inner[off..off + DINODE_SIZE].copy_from_slice(dip.as_bytes());
        tx.write(bp);
    }
}

/// Creates an inode at `path`. Credentials stamp the owner; the mode is
/// masked by the caller's umask and completed with the type bits. On
/// directory creation the `.`/`..` entries go in and the parent's link
/// count rises. All inside the caller's transaction.
pub fn create(
    path: &Path,
    typ: i16,
    major: i16,
    minor: i16,
    mode: u32,
    tx: &Tx<'_>,
    ctx: &KernelCtx<'_>,
) -> Result<RcInode> {
    let (dp_rc, name) = nameiparent(path, tx, ctx)?;
    let dp_rc = scopeguard::guard(dp_rc, |ip| ip.free((tx, ctx)));
    let mut dp = dp_rc.lock(ctx);

    // An existing regular file or FIFO satisfies an O_CREATE open.
    match dp.dirlookup(name, ctx) {
        Ok((ip, _)) => {
            drop(dp);
            let existing = scopeguard::guard(ip, |ip| ip.free((tx, ctx)));
            let guard = existing.lock(ctx);
            let ok = typ == T_FILE && (s_isreg(guard.mode) || s_isfifo(guard.mode));
            drop(guard);
            if ok {
                return Ok(scopeguard::ScopeGuard::into_inner(existing));
            }
            return Err(KernelError::EEXIST);
        }
        Err(KernelError::ENOENT) => {}
        Err(e) => return Err(e),
    }

    // Creating in this directory takes write permission.
    if dp.permissions(ctx) & 2 == 0 {
        return Err(KernelError::EPERM);
    }

    let (euid, egid, umask) = {
        let cred = ctx.cred();
        (cred.euid, cred.egid, ctx.fs_info().umask())
    };

    let fs = ctx
        .kernel()
        .fstab()
        .find(dp.dev())
        .expect("create on unregistered fs");
    let ip_rc = fs.ops.alloc_inode(dp.dev(), typ, tx, ctx)?;
    let ip_rc = scopeguard::guard(ip_rc, |ip| ip.free((tx, ctx)));
    let mut ip = ip_rc.lock(ctx);
    {
        let inner = ip.deref_inner_mut();
        inner.major = major;
        inner.minor = minor;
        inner.nlink = 1;
        inner.uid = euid;
        inner.gid = egid;
        inner.mode = (mode & !umask & 0o7777) | type_to_mode(typ);
    }
    ip.update(tx, ctx);

    if typ == T_DIR {
        // `..` references the parent.
        dp.deref_inner_mut().nlink += 1;
        dp.update(tx, ctx);

        // Insert the dot entries with the mode temporarily opened up, so
        // a restrictive umask cannot make the kernel's own links fail.
        let real_mode = ip.mode;
        ip.deref_inner_mut().mode |= 0o333;
        let inum = ip.inum();
        // SAFETY: neither name contains NUL.
        let dot = unsafe { FileName::from_bytes(b".") };
        let dotdot = unsafe { FileName::from_bytes(b"..") };
        ip.dirlink(dot, inum, tx, ctx)
            .and_then(|_| ip.dirlink(dotdot, dp.inum(), tx, ctx))
            .expect("create dots");
        ip.deref_inner_mut().mode = real_mode;
        ip.update(tx, ctx);
    }

    dp.dirlink(name, ip.inum(), tx, ctx)?;
    drop(ip);
    drop(dp);
    Ok(scopeguard::ScopeGuard::into_inner(ip_rc))
}
