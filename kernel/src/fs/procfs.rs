//! procfs: a read-only synthetic filesystem over the process table.
//!
//! Inode numbers encode everything: the root is 1, the directory of
//! process `pid` is `pid * N_PROC_ENTRIES`, and its files follow at
//! `pid * N_PROC_ENTRIES + i - 1` for table index `i`. Nothing is ever
//! persisted; `lookup` (re)initializes every inode it hands out, so
//! cache eviction is harmless.
//!
//! `mount` grafts the procfs root onto an existing directory inode by
//! swapping that inode's operation vtable; the grafted inode and the
//! canonical `(PROCDEV, 1)` root are pinned in the cache for the life of
//! the system.

use crate::error::{KernelError, Result};
use crate::param::{MAXPROCNAME, PROCDEV};
use crate::proc::{KernelCtx, Proc};

use super::inode::{Dirent, Inode, InodeGuard, InodeInner, RcInode, DIRENT_SIZE};
use super::stat::{S_IFDIR, S_IFREG};
use super::{FileName, FsOps, InodeOps, ItableExt, Path, ReadDst, Tx, WriteSrc};

/// Directory slots per process: `.`, `..`, `parent`, then the files.
const PROC_FILES: [&[u8]; 5] = [b"name", b"state", b"memory", b"pid", b"uid"];
pub const N_PROC_ENTRIES: u32 = PROC_FILES.len() as u32 + 2;

#[derive(Clone, Copy, PartialEq)]
enum Node {
    Root,
    Dir(i32),
    File(i32, usize),
}

/// Classifies an inode number. A procfs vtable on a foreign-device
/// inode is always the grafted root.
fn classify(dev: u32, inum: u32) -> Node {
    if dev != PROCDEV || inum == 1 {
        return Node::Root;
    }
    let pid = (inum / N_PROC_ENTRIES) as i32;
    match inum % N_PROC_ENTRIES {
        0 => Node::Dir(pid),
        // File inums are pid * N + idx + 2, so idx = inum % N - 2.
        r => Node::File(pid, r as usize - 2),
    }
}

/// File inode number for process `pid` and file-table index `idx`
/// (0-based into `PROC_FILES`).
fn file_inum(pid: i32, idx: usize) -> u32 {
    pid as u32 * N_PROC_ENTRIES + idx as u32 + 2
}

fn dir_inum(pid: i32) -> u32 {
    pid as u32 * N_PROC_ENTRIES
}

pub struct ProcFsOps;

impl FsOps for ProcFsOps {
    fn alloc_inode(&self, _dev: u32, _typ: i16, _tx: &Tx<'_>, _ctx: &KernelCtx<'_>) -> Result<RcInode> {
        // Nothing can be created under /proc.
        Err(KernelError::EROFS)
    }

    fn get_inode(&self, dev: u32, inum: u32, ctx: &KernelCtx<'_>) -> RcInode {
        ctx.kernel()
            .itable()
            .get_inode(dev, inum, &ProcInodeOps, None)
    }

    fn drop_inode(&self, _ip: &mut Inode, _tx: &Tx<'_>, _ctx: &KernelCtx<'_>) {
        // Synthetic inodes just become reusable cache slots.
    }
}

fn init_dir(inner: &mut InodeInner) {
    inner.valid = true;
    inner.typ = super::stat::T_DIR;
    inner.mode = 0o555 | S_IFDIR;
    inner.nlink = 1;
    inner.size = 0;
    inner.uid = 0;
    inner.gid = 0;
    inner.ops = &ProcInodeOps;
}

fn init_file(inner: &mut InodeInner) {
    inner.valid = true;
    inner.typ = super::stat::T_FILE;
    inner.mode = 0o444 | S_IFREG;
    inner.nlink = 1;
    inner.size = 0;
    inner.uid = 0;
    inner.gid = 0;
    inner.ops = &ProcInodeOps;
}

fn get_dir(pid: i32, ctx: &KernelCtx<'_>) -> RcInode {
    ctx.kernel()
        .itable()
        .get_inode(PROCDEV, dir_inum(pid), &ProcInodeOps, Some(&init_dir))
}

fn get_file(pid: i32, idx: usize, ctx: &KernelCtx<'_>) -> RcInode {
    ctx.kernel()
        .itable()
        .get_inode(PROCDEV, file_inum(pid, idx), &ProcInodeOps, Some(&init_file))
}

/// Writes the decimal form of `v` into `buf`, returning the used prefix.
fn format_u32(mut v: u32, buf: &mut [u8]) -> usize {
    let mut digits = [0u8; 10];
    let mut n = 0;
    loop {
        digits[n] = b'0' + (v % 10) as u8;
        v /= 10;
        n += 1;
        if v == 0 {
            break;
        }
    }
    for i in 0..n {
        buf[i] = digits[n - 1 - i];
    }
    n
}

/// Copies `bytes` (a whole synthetic object) through the read window
/// `[off, off + n)` into `dst`. Returns bytes delivered.
fn deliver(
    dst: &mut ReadDst<'_>,
    bytes: &[u8],
    off: u32,
    n: u32,
    ctx: &KernelCtx<'_>,
) -> Result<usize> {
    let off = off as usize;
    if off >= bytes.len() {
        return Ok(0);
    }
    let take = core::cmp::min(bytes.len() - off, n as usize);
    let chunk = &bytes[off..off + take];
    match dst {
        ReadDst::Kernel(slice) => slice[..take].copy_from_slice(chunk),
        ReadDst::User(addr) => ctx.copy_out_bytes(*addr, chunk)?,
    }
    Ok(take)
}

/// Streams directory entries: each closure call appends one dirent at
/// the next position; only the slice overlapping `[off, off + n)` is
/// copied out.
struct DirentStream<'a, 'b, 'c> {
    dst: &'a mut ReadDst<'b>,
    ctx: &'a KernelCtx<'c>,
    off: u32,
    n: u32,
    pos: u32,
    written: usize,
    failed: bool,
}

impl DirentStream<'_, '_, '_> {
    fn push(&mut self, name: &[u8], inum: u32) {
        if self.failed {
            return;
        }
        let mut de = Dirent {
            inum: inum as u16,
            name: [0; super::DIRSIZ],
        };
        let n = core::cmp::min(name.len(), super::DIRSIZ);
        de.name[..n].copy_from_slice(&name[..n]);

        let start = self.pos;
        let end = self.pos + DIRENT_SIZE as u32;
        self.pos = end;

        let win_start = core::cmp::max(start, self.off);
        let win_end = core::cmp::min(end, self.off + self.n);
        if win_start >= win_end {
            return;
        }
        use zerocopy::AsBytes;
        let bytes = de.as_bytes();
        let chunk = &bytes[(win_start - start) as usize..(win_end - start) as usize];
        let at = (win_start - self.off) as usize;
        let res = match self.dst {
            ReadDst::Kernel(slice) => {
                slice[at..at + chunk.len()].copy_from_slice(chunk);
                Ok(())
            }
            ReadDst::User(addr) => self.ctx.copy_out_bytes(*addr + at, chunk),
        };
        match res {
            Ok(()) => self.written += chunk.len(),
            Err(_) => self.failed = true,
        }
    }
}

pub struct ProcInodeOps;

impl InodeOps for ProcInodeOps {
    fn read(
        &self,
        ip: &mut InodeGuard<'_>,
        mut dst: ReadDst<'_>,
        off: u32,
        n: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize> {
        match classify(ip.dev(), ip.inum()) {
            Node::Root => {
                let mut stream = DirentStream {
                    dst: &mut dst,
                    ctx,
                    off,
                    n,
                    pos: 0,
                    written: 0,
                    failed: false,
                };
                stream.push(b".", ip.inum());
                let (_, parent_inum) = ip.mount_parent;
                stream.push(b"..", parent_inum);
                {
                    let table = ctx.kernel().procs().table();
                    for p in table.iter() {
                        // SAFETY: the table lock is held.
                        let shared = unsafe { p.shared() };
                        if shared.state == crate::proc::ProcState::Unused {
                            continue;
                        }
                        let mut name = [0u8; 10];
                        let len = format_u32(shared.pid as u32, &mut name);
                        stream.push(&name[..len], dir_inum(shared.pid));
                    }
                }
                stream.push(b"self", dir_inum(ctx.pid()));
                if stream.failed {
                    return Err(KernelError::EFAULT);
                }
                Ok(stream.written)
            }
            Node::Dir(pid) => {
                let parent_pid = ctx
                    .kernel()
                    .procs()
                    .with_pid(pid, |p| parent_pid_of(p))
                    .ok_or(KernelError::ENOENT)?;
                let mut stream = DirentStream {
                    dst: &mut dst,
                    ctx,
                    off,
                    n,
                    pos: 0,
                    written: 0,
                    failed: false,
                };
                stream.push(b".", ip.inum());
                stream.push(b"..", 1);
                if let Some(ppid) = parent_pid {
                    stream.push(b"parent", dir_inum(ppid));
                }
                for (i, name) in PROC_FILES.iter().enumerate() {
                    stream.push(name, file_inum(pid, i));
                }
                if stream.failed {
                    return Err(KernelError::EFAULT);
                }
                Ok(stream.written)
            }
            Node::File(pid, table_idx) => {
                // Render the value as ASCII followed by a newline.
                let mut buf = [0u8; MAXPROCNAME + 16];
                let len = render_proc_file(pid, table_idx, &mut buf, ctx)?;
                deliver(&mut dst, &buf[..len], off, n, ctx)
            }
        }
    }

    fn write(
        &self,
        _ip: &mut InodeGuard<'_>,
        _src: WriteSrc<'_>,
        _off: u32,
        _n: u32,
        _tx: &Tx<'_>,
        _ctx: &KernelCtx<'_>,
    ) -> Result<usize> {
        Err(KernelError::EROFS)
    }

    fn lookup(
        &self,
        dp: &mut InodeGuard<'_>,
        name: &FileName,
        ctx: &KernelCtx<'_>,
    ) -> Result<(RcInode, u32)> {
        let name = name.as_bytes();
        match classify(dp.dev(), dp.inum()) {
            Node::Root => {
                if name == b"." {
                    let ip = ctx.kernel().itable().get_inode(
                        dp.dev(),
                        dp.inum(),
                        &ProcInodeOps,
                        None,
                    );
                    return Ok((ip, 0));
                }
                if name == b".." {
                    let (pdev, pinum) = dp.mount_parent;
                    let fs = ctx
                        .kernel()
                        .fstab()
                        .find(pdev)
                        .ok_or(KernelError::ENOENT)?;
                    return Ok((fs.ops.get_inode(pdev, pinum, ctx), 0));
                }
                let pid = if name == b"self" {
                    ctx.pid()
                } else {
                    parse_pid(name).ok_or(KernelError::ENOENT)?
                };
                ctx.kernel()
                    .procs()
                    .with_pid(pid, |_| ())
                    .ok_or(KernelError::ENOENT)?;
                Ok((get_dir(pid, ctx), 0))
            }
            Node::Dir(pid) => {
                if name == b"." {
                    return Ok((get_dir(pid, ctx), 0));
                }
                if name == b".." {
                    return Ok((procfs_root(ctx), 0));
                }
                if name == b"parent" {
                    let ppid = ctx
                        .kernel()
                        .procs()
                        .with_pid(pid, |p| parent_pid_of(p))
                        .ok_or(KernelError::ENOENT)?
                        .ok_or(KernelError::ENOENT)?;
                    return Ok((get_dir(ppid, ctx), 0));
                }
                for (i, file) in PROC_FILES.iter().enumerate() {
                    if name == *file {
                        return Ok((get_file(pid, i, ctx), 0));
                    }
                }
                Err(KernelError::ENOENT)
            }
            Node::File(..) => Err(KernelError::ENOTDIR),
        }
    }

    fn link(
        &self,
        _dp: &mut InodeGuard<'_>,
        _name: &FileName,
        _inum: u32,
        _tx: &Tx<'_>,
        _ctx: &KernelCtx<'_>,
    ) -> Result<()> {
        Err(KernelError::EROFS)
    }

    fn unlink(
        &self,
        _dp: &mut InodeGuard<'_>,
        _off: u32,
        _tx: &Tx<'_>,
        _ctx: &KernelCtx<'_>,
    ) -> Result<()> {
        Err(KernelError::EROFS)
    }

    fn update(&self, _ip: &InodeGuard<'_>, _tx: &Tx<'_>, _ctx: &KernelCtx<'_>) {
        // Synthetic inodes have no persistent form.
    }
}

/// The canonical procfs root inode, `(PROCDEV, 1)`.
fn procfs_root(ctx: &KernelCtx<'_>) -> RcInode {
    ctx.kernel()
        .itable()
        .get_inode(PROCDEV, 1, &ProcInodeOps, Some(&init_dir))
}

/// The parent's pid, or `None` for the initial process. Called under
/// the table lock.
fn parent_pid_of(p: &Proc) -> Option<i32> {
    // SAFETY: with_pid holds the table lock.
    let shared = unsafe { p.shared() };
    if shared.parent.is_null() {
        return None;
    }
    // SAFETY: a non-null parent is live while the table lock is held.
    Some(unsafe { (*shared.parent).shared() }.pid)
}

fn parse_pid(name: &[u8]) -> Option<i32> {
    if name.is_empty() || name.len() > 10 {
        return None;
    }
    let mut v: i64 = 0;
    for &c in name {
        if !c.is_ascii_digit() {
            return None;
        }
        v = v * 10 + (c - b'0') as i64;
    }
    if v == 0 || v > i32::MAX as i64 {
        return None;
    }
    Some(v as i32)
}

/// Renders one per-process file into `buf`.
fn render_proc_file(
    pid: i32,
    table_idx: usize,
    buf: &mut [u8],
    ctx: &KernelCtx<'_>,
) -> Result<usize> {
    let len = ctx
        .kernel()
        .procs()
        .with_pid(pid, |p| {
            // SAFETY: with_pid holds the table lock; the target cannot
            // be reaped under us.
            let shared = unsafe { p.shared() };
            match table_idx {
                0 => {
                    // name
                    let name = unsafe { p.data() }.name;
                    let n = name.iter().position(|&c| c == 0).unwrap_or(name.len());
                    buf[..n].copy_from_slice(&name[..n]);
                    n
                }
                1 => {
                    // state
                    let s = shared.state.as_str().as_bytes();
                    buf[..s.len()].copy_from_slice(s);
                    s.len()
                }
                2 => {
                    // memory
                    let sz = unsafe { p.data() }
                        .mm
                        .map(|mm| unsafe { mm.as_ref() }.size())
                        .unwrap_or(0);
                    format_u32(sz as u32, buf)
                }
                3 => format_u32(shared.pid as u32, buf),
                4 => format_u32(p.cred.lock().uid, buf),
                _ => 0,
            }
        })
        .ok_or(KernelError::ENOENT)?;
    buf[len] = b'\n';
    Ok(len + 1)
}

/// Grafts procfs over the directory at `path` (the `mount` syscall with
/// fstype `"proc"`). The covered inode and the canonical procfs root
/// stay pinned in the inode cache.
pub fn mount(path: &Path, tx: &Tx<'_>, ctx: &KernelCtx<'_>) -> Result<()> {
    let (parent, _name) = super::path::nameiparent(path, tx, ctx)?;
    let parent_id = (parent.dev, parent.inum);
    parent.free((tx, ctx));

    let ip = super::path::namei(path, tx, ctx)?;
    {
        let mut guard = ip.lock(ctx);
        if !super::stat::s_isdir(guard.mode) {
            drop(guard);
            ip.free((tx, ctx));
            return Err(KernelError::ENOTDIR);
        }
        let inner = guard.deref_inner_mut();
        inner.ops = &ProcInodeOps;
        inner.mount_parent = parent_id;
        inner.mode = 0o555 | S_IFDIR;
    }

    let root = procfs_root(ctx);
    {
        let mut guard = root.lock(ctx);
        guard.deref_inner_mut().mount_parent = parent_id;
    }

    ctx.kernel().pin_procfs(ip, root);
    Ok(())
}
