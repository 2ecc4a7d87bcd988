//! File-system system calls. Mostly argument checking; the real work
//! happens in `fs`, `file` and `pipe`.

use zerocopy::AsBytes;

use crate::error::{KernelError, Result};
use crate::exec::{exec, free_args, ArgPages};
use crate::file::{dup_file, file_alloc, fileclose, FileType};
use crate::fs::{
    self, create, namei, nameiparent, s_isdir, s_isfifo, s_isreg, InodeOps as _, Path, RcInode,
    S_ISGID, S_ISUID, S_IXUGO, T_DEV, T_DIR, T_FIFO, T_FILE,
};
use crate::param::{MAXARG, MAXPATH};
use crate::pipe::{create_pipe_pair, AllocatedPipe};
use crate::proc::KernelCtx;
use crate::vm::{MapFlags, UVAddr};

use super::{argaddr, argfd, argint, argptr, argstr};

bitflags::bitflags! {
    /// `open` flags.
    pub struct OpenFlags: u32 {
        const O_RDONLY = 0x000;
        const O_WRONLY = 0x001;
        const O_RDWR = 0x002;
        const O_CREATE = 0x200;
        const O_APPEND = 0x400;
        const O_NONBLOCK = 0x800;
    }
}

pub fn sys_dup(ctx: &KernelCtx<'_>) -> Result<usize> {
    let (_, f) = argfd(0, ctx)?;
    let copy = dup_file(&f);
    f.free(ctx);
    let fd = ctx.fdalloc(copy)?;
    Ok(fd as usize)
}

pub fn sys_read(ctx: &KernelCtx<'_>) -> Result<usize> {
    let (_, f) = argfd(0, ctx)?;
    let n = argint(2, ctx)?;
    let addr = argaddr(1, ctx)?;
    if n < 0 {
        f.free(ctx);
        return Err(KernelError::EINVAL);
    }
    let r = f.read(addr, n as u32, ctx);
    f.free(ctx);
    r
}

pub fn sys_write(ctx: &KernelCtx<'_>) -> Result<usize> {
    let (_, f) = argfd(0, ctx)?;
    let n = argint(2, ctx)?;
    let addr = argaddr(1, ctx)?;
    if n < 0 {
        f.free(ctx);
        return Err(KernelError::EINVAL);
    }
    let r = f.write(addr, n as u32, ctx);
    f.free(ctx);
    r
}

pub fn sys_close(ctx: &KernelCtx<'_>) -> Result<usize> {
    let fd = argint(0, ctx)?;
    let f = ctx.files().take(fd).ok_or(KernelError::EBADF)?;
    fileclose(f, ctx);
    Ok(0)
}

pub fn sys_fstat(ctx: &KernelCtx<'_>) -> Result<usize> {
    let (_, f) = argfd(0, ctx)?;
    let addr = argptr(1, core::mem::size_of::<fs::Stat>(), ctx);
    let addr = match addr {
        Ok(a) => a,
        Err(e) => {
            f.free(ctx);
            return Err(e);
        }
    };
    let r = f.stat(addr, ctx);
    f.free(ctx);
    r.map(|_| 0)
}

/// Creates `new` as another link to the inode named by `old`.
pub fn sys_link(ctx: &KernelCtx<'_>) -> Result<usize> {
    let mut old_buf = [0u8; MAXPATH];
    let mut new_buf = [0u8; MAXPATH];
    let old = Path::new(argstr(0, &mut old_buf, ctx)?);
    let new = Path::new(argstr(1, &mut new_buf, ctx)?);

    let tx = ctx.kernel().fs().begin_tx(ctx);
    let ip = namei(old, &tx, ctx)?;

    {
        let mut guard = ip.lock(ctx);
        if s_isdir(guard.mode) {
            drop(guard);
            ip.free((&tx, ctx));
            return Err(KernelError::EPERM);
        }
        guard.deref_inner_mut().nlink += 1;
        guard.update(&tx, ctx);
    }

    let linked = (|| -> Result<()> {
        let (dp, name) = nameiparent(new, &tx, ctx)?;
        let dp = scopeguard::guard(dp, |dp| dp.free((&tx, ctx)));
        if dp.dev != ip.dev {
            return Err(KernelError::EXDEV);
        }
        let mut dguard = dp.lock(ctx);
        dguard.dirlink(name, ip.inum, &tx, ctx)
    })();

    match linked {
        Ok(()) => {
            ip.free((&tx, ctx));
            Ok(0)
        }
        Err(e) => {
            // Roll the link count back inside the same transaction so a
            // crash cannot leave it inflated.
            let mut guard = ip.lock(ctx);
            guard.deref_inner_mut().nlink -= 1;
            guard.update(&tx, ctx);
            drop(guard);
            ip.free((&tx, ctx));
            Err(e)
        }
    }
}

pub fn sys_unlink(ctx: &KernelCtx<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = Path::new(argstr(0, &mut path_buf, ctx)?);

    let tx = ctx.kernel().fs().begin_tx(ctx);
    let (dp, name) = nameiparent(path, &tx, ctx)?;
    let dp = scopeguard::guard(dp, |dp| dp.free((&tx, ctx)));
    let mut dguard = dp.lock(ctx);

    if name.as_bytes() == b"." || name.as_bytes() == b".." {
        return Err(KernelError::ENOTDIR);
    }
    if dguard.permissions(ctx) & 3 != 3 {
        return Err(KernelError::EPERM);
    }

    let (ip, off) = dguard.dirlookup(name, ctx)?;
    let ip = scopeguard::guard(ip, |ip| ip.free((&tx, ctx)));
    let mut iguard = ip.lock(ctx);
    assert!(iguard.nlink >= 1, "unlink: nlink < 1");

    if s_isdir(iguard.mode) && !iguard.is_dir_empty(ctx) {
        return Err(KernelError::ENOTEMPTY);
    }

    // An open FIFO aborts its blocked openers.
    if s_isfifo(iguard.mode) {
        if let Some(rf) = &iguard.read_file {
            if let FileType::Fifo { pipe, .. } = rf.typ() {
                pipe.set_deleted(ctx.kernel());
            }
        }
    }

    let dops = dguard.ops;
    dops.unlink(&mut dguard, off, &tx, ctx)?;
    if s_isdir(iguard.mode) {
        dguard.deref_inner_mut().nlink -= 1;
        dguard.update(&tx, ctx);
    }
    drop(dguard);

    iguard.deref_inner_mut().nlink -= 1;
    iguard.update(&tx, ctx);
    drop(iguard);
    Ok(0)
}

pub fn sys_open(ctx: &KernelCtx<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = Path::new(argstr(0, &mut path_buf, ctx)?);
    let mut omode = OpenFlags::from_bits_truncate(argint(1, ctx)? as u32);

    // The inode work runs inside a transaction; everything that can
    // block (FIFO peer wait) or close files (descriptor exhaustion)
    // happens after it commits, or the log would be wedged.
    let opened: Opened = {
        let tx = ctx.kernel().fs().begin_tx(ctx);
        let ip: RcInode = if omode.contains(OpenFlags::O_CREATE) {
            let mode = argint(2, ctx)? as u32;
            create(path, T_FILE, 0, 0, mode, &tx, ctx)?
        } else {
            namei(path, &tx, ctx)?
        };
        let ip = scopeguard::guard(ip, |ip| ip.free((&tx, ctx)));
        let mut guard = ip.lock(ctx);

        // O_NONBLOCK only means something for FIFOs.
        if !s_isfifo(guard.mode) {
            omode -= OpenFlags::O_NONBLOCK;
        }
        if s_isdir(guard.mode) && omode != OpenFlags::O_RDONLY {
            return Err(KernelError::EISDIR);
        }

        let writing = omode.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR);
        let reading = omode.contains(OpenFlags::O_RDWR) || !omode.contains(OpenFlags::O_WRONLY);
        {
            let access = guard.permissions(ctx);
            if writing && access & 2 == 0 {
                return Err(KernelError::EACCES);
            }
            if reading && access & 4 == 0 {
                return Err(KernelError::EACCES);
            }
        }

        if s_isfifo(guard.mode) {
            if omode.contains(OpenFlags::O_RDWR) {
                // POSIX leaves O_RDWR on a FIFO undefined; reject it.
                return Err(KernelError::EINVAL);
            }
            let f = fifo_handle(&mut guard, &ip, !writing, ctx)?;
            Opened::Fifo(f)
        } else {
            let size = guard.size;
            drop(guard);
            let f = file_alloc(
                ctx,
                FileType::Inode {
                    ip: (*ip).clone(),
                },
                reading,
                writing,
            )?;
            if omode.contains(OpenFlags::O_APPEND) {
                f.set_offset(size);
            }
            Opened::Plain(f)
        }
    };

    // The transaction is committed; blocking is safe now.
    let f = match opened {
        Opened::Plain(f) => f,
        Opened::Fifo(f) => {
            let writable = f.writable();
            let pipe = match f.typ() {
                FileType::Fifo { pipe, .. } => pipe.clone(),
                _ => unreachable!("fifo end has fifo type"),
            };
            if omode.contains(OpenFlags::O_NONBLOCK) {
                // A reader may proceed alone (POSIX); a writer without
                // any reader fails.
                if writable && !pipe.has_reader() {
                    fileclose(f, ctx);
                    return Err(KernelError::ENXIO);
                }
                pipe.announce(writable, ctx.kernel());
            } else if let Err(e) = pipe.wait_for_peer(writable, ctx) {
                fileclose(f, ctx);
                return Err(e);
            }
            f
        }
    };

    let fd = ctx.fdalloc(f)?;
    Ok(fd as usize)
}

enum Opened {
    Plain(crate::proc::RcFile),
    Fifo(crate::proc::RcFile),
}

/// FIFO open, transactional part: lazily builds the pipe and its two
/// cached end handles, then duplicates the wanted end (which counts the
/// opener into the pipe).
fn fifo_handle(
    guard: &mut fs::InodeGuard<'_>,
    ip: &RcInode,
    readable: bool,
    ctx: &KernelCtx<'_>,
) -> Result<crate::proc::RcFile> {
    if guard.read_file.is_none() {
        let pipe = AllocatedPipe::alloc(ctx.kernel(), 0, 0)?;
        let rf = file_alloc(
            ctx,
            FileType::Fifo {
                pipe: pipe.clone(),
                ip: ip.clone(),
            },
            true,
            false,
        );
        let rf = match rf {
            Ok(rf) => rf,
            Err(e) => {
                pipe.free_page(ctx.kernel());
                return Err(e);
            }
        };
        let wf = file_alloc(
            ctx,
            FileType::Fifo {
                pipe: pipe.clone(),
                ip: ip.clone(),
            },
            false,
            true,
        );
        let wf = match wf {
            Ok(wf) => wf,
            Err(e) => {
                // The read end never reached the inode; release its
                // inode reference through the normal path.
                rf.free(ctx);
                pipe.free_page(ctx.kernel());
                return Err(e);
            }
        };
        let inner = guard.deref_inner_mut();
        inner.read_file = Some(rf);
        inner.write_file = Some(wf);
    }

    let cached = if readable {
        guard.read_file.as_ref().expect("fifo read end")
    } else {
        guard.write_file.as_ref().expect("fifo write end")
    };
    Ok(dup_file(cached))
}

pub fn sys_mkdir(ctx: &KernelCtx<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = Path::new(argstr(0, &mut path_buf, ctx)?);
    let mode = argint(1, ctx)? as u32;
    let tx = ctx.kernel().fs().begin_tx(ctx);
    let ip = create(path, T_DIR, 0, 0, mode, &tx, ctx)?;
    ip.free((&tx, ctx));
    Ok(0)
}

pub fn sys_mknod(ctx: &KernelCtx<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = Path::new(argstr(0, &mut path_buf, ctx)?);
    let major = argint(1, ctx)? as i16;
    let minor = argint(2, ctx)? as i16;
    let mode = argint(3, ctx)? as u32;
    let tx = ctx.kernel().fs().begin_tx(ctx);
    let ip = create(path, T_DEV, major, minor, mode, &tx, ctx)?;
    ip.free((&tx, ctx));
    Ok(0)
}

pub fn sys_mkfifo(ctx: &KernelCtx<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = Path::new(argstr(0, &mut path_buf, ctx)?);
    let mode = argint(1, ctx)? as u32;
    let tx = ctx.kernel().fs().begin_tx(ctx);
    let ip = create(path, T_FIFO, 0, 0, mode, &tx, ctx)?;
    ip.free((&tx, ctx));
    Ok(0)
}

pub fn sys_chdir(ctx: &KernelCtx<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = Path::new(argstr(0, &mut path_buf, ctx)?);
    let tx = ctx.kernel().fs().begin_tx(ctx);
    let ip = namei(path, &tx, ctx)?;
    {
        let guard = ip.lock(ctx);
        if !s_isdir(guard.mode) {
            drop(guard);
            ip.free((&tx, ctx));
            return Err(KernelError::ENOTDIR);
        }
    }
    let old = ctx.fs_info().set_cwd(ip);
    old.free((&tx, ctx));
    Ok(0)
}

/// Changes the process root; the classic jail. Root only.
pub fn sys_chroot(ctx: &KernelCtx<'_>) -> Result<usize> {
    if ctx.cred().euid != 0 {
        return Err(KernelError::EPERM);
    }
    let mut path_buf = [0u8; MAXPATH];
    let path = Path::new(argstr(0, &mut path_buf, ctx)?);
    let tx = ctx.kernel().fs().begin_tx(ctx);
    let ip = namei(path, &tx, ctx)?;
    {
        let guard = ip.lock(ctx);
        if !s_isdir(guard.mode) {
            drop(guard);
            ip.free((&tx, ctx));
            return Err(KernelError::ENOTDIR);
        }
    }
    let old = ctx.fs_info().set_root(ip);
    old.free((&tx, ctx));
    Ok(0)
}

pub fn sys_execve(ctx: &KernelCtx<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = Path::new(argstr(0, &mut path_buf, ctx)?);
    let uargv = argaddr(1, ctx)?;
    let uenvp = argaddr(2, ctx)?;

    let argv = fetch_arg_pages(uargv, ctx)?;
    let envp = match fetch_arg_pages(uenvp, ctx) {
        Ok(envp) => envp,
        Err(e) => {
            free_args(argv, ctx);
            return Err(e);
        }
    };

    let r = exec(path, argv, &envp, ctx);
    free_args(envp, ctx);
    r
}

/// Copies a NUL-terminated user pointer vector of strings into kernel
/// pages.
fn fetch_arg_pages(uvec: UVAddr, ctx: &KernelCtx<'_>) -> Result<ArgPages> {
    let mut pages = ArgPages::new();
    let fail = |pages: ArgPages, e: KernelError, ctx: &KernelCtx<'_>| {
        free_args(pages, ctx);
        Err(e)
    };
    for i in 0..=MAXARG {
        if i == MAXARG {
            return fail(pages, KernelError::E2BIG, ctx);
        }
        let uarg = match ctx.fetch_u32(uvec + 4 * i) {
            Ok(v) => v,
            Err(e) => return fail(pages, e, ctx),
        };
        if uarg == 0 {
            break;
        }
        let mut page = match ctx.kernel().kmem.lock().alloc() {
            Some(p) => p,
            None => return fail(pages, KernelError::ENOMEM, ctx),
        };
        if let Err(e) = ctx.copy_in_str(&mut page[..], UVAddr::new(uarg as usize)) {
            ctx.kernel().kmem.lock().free(page);
            return fail(pages, e, ctx);
        }
        pages.push(page);
    }
    Ok(pages)
}

pub fn sys_pipe(ctx: &KernelCtx<'_>) -> Result<usize> {
    let fdarray = argptr(0, 2 * core::mem::size_of::<i32>(), ctx)?;
    let (rf, wf) = create_pipe_pair(ctx)?;

    let fd0 = match ctx.fdalloc(rf) {
        Ok(fd) => fd,
        Err(e) => {
            fileclose(wf, ctx);
            return Err(e);
        }
    };
    let fd1 = match ctx.fdalloc(wf) {
        Ok(fd) => fd,
        Err(e) => {
            if let Some(f) = ctx.files().take(fd0) {
                fileclose(f, ctx);
            }
            return Err(e);
        }
    };
    let fds = [fd0, fd1];
    ctx.copy_out_bytes(fdarray, fds.as_bytes())?;
    Ok(0)
}

pub fn sys_umask(ctx: &KernelCtx<'_>) -> Result<usize> {
    let new = argint(0, ctx)? as u32;
    let old = ctx.fs_info().set_umask(new);
    Ok((old & 0o777) as usize)
}

pub fn sys_chmod(ctx: &KernelCtx<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = Path::new(argstr(0, &mut path_buf, ctx)?);
    let mode = argint(1, ctx)? as u32;

    let tx = ctx.kernel().fs().begin_tx(ctx);
    let ip = namei(path, &tx, ctx)?;
    let ip = scopeguard::guard(ip, |ip| ip.free((&tx, ctx)));
    let mut guard = ip.lock(ctx);
    {
        let cred = ctx.cred();
        if cred.euid != 0 && guard.uid != cred.euid {
            return Err(KernelError::EPERM);
        }
    }
    let inner = guard.deref_inner_mut();
    inner.mode = (inner.mode & !0o7777) | (mode & 0o7777);
    guard.update(&tx, ctx);
    drop(guard);
    Ok(0)
}

pub fn sys_chown(ctx: &KernelCtx<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = Path::new(argstr(0, &mut path_buf, ctx)?);
    let owner = argint(1, ctx)?;
    let group = argint(2, ctx)?;

    let tx = ctx.kernel().fs().begin_tx(ctx);
    let ip = namei(path, &tx, ctx)?;
    let ip = scopeguard::guard(ip, |ip| ip.free((&tx, ctx)));
    let mut guard = ip.lock(ctx);

    let euid = {
        let cred = ctx.cred();
        if cred.euid != 0 {
            // A non-root caller must own the file, may not change the
            // uid, and may only move the gid into a group it belongs
            // to.
            let owns = guard.uid == cred.euid;
            let uid_ok = owner == -1 || owner as u32 == guard.uid;
            let gid_ok =
                group == -1 || group as u32 == cred.egid || cred.in_groups(group as u32);
            if !owns || !uid_ok || !gid_ok {
                return Err(KernelError::EPERM);
            }
        }
        cred.euid
    };

    let inner = guard.deref_inner_mut();
    if owner != -1 {
        inner.uid = owner as u32;
    }
    if group != -1 {
        inner.gid = group as u32;
    }
    if s_isreg(inner.mode) && euid != 0 && inner.mode & S_IXUGO != 0 {
        // POSIX: changing ownership of an executable strips set-id.
        inner.mode &= !(S_ISUID | S_ISGID);
    }
    guard.update(&tx, ctx);
    drop(guard);
    Ok(0)
}

/// Mounts a filesystem. The only supported type is `"proc"`.
pub fn sys_mount(ctx: &KernelCtx<'_>) -> Result<usize> {
    if ctx.cred().euid != 0 {
        return Err(KernelError::EPERM);
    }
    let mut fstype_buf = [0u8; 16];
    let mut path_buf = [0u8; MAXPATH];
    let fstype = argstr(0, &mut fstype_buf, ctx)?;
    let path = Path::new(argstr(1, &mut path_buf, ctx)?);
    if fstype.to_bytes() != b"proc" {
        return Err(KernelError::ENODEV);
    }
    let tx = ctx.kernel().fs().begin_tx(ctx);
    fs::procfs::mount(path, &tx, ctx)?;
    Ok(0)
}

pub fn sys_mmap(ctx: &KernelCtx<'_>) -> Result<usize> {
    let addr = argaddr(0, ctx)?.into_usize();
    let length = argint(1, ctx)?;
    let prot = argint(2, ctx)? as u32;
    let flags = MapFlags::from_bits_truncate(argint(3, ctx)? as u32);
    let fd = argint(4, ctx)?;
    let offset = argint(5, ctx)?;
    if length <= 0 || offset < 0 {
        return Err(KernelError::EINVAL);
    }

    let file = if flags.contains(MapFlags::ANONYMOUS) || fd < 0 {
        None
    } else {
        Some(ctx.file(fd)?)
    };
    ctx.mm()
        .mmap(addr, length as usize, prot, flags, file, offset as u32, ctx)
}
