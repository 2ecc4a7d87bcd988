//! System-call dispatch and argument marshalling.
//!
//! On the 32-bit x86, the syscall number arrives in `eax` and the
//! arguments sit on the user stack above the saved `esp`. The helpers
//! here fetch and validate them; each returns an error on a bad
//! address, which the dispatcher turns into a negative errno in `eax`
//! (the user-space stubs translate that into `errno` and `-1`).

use cstr_core::CStr;

use crate::error::{KernelError, Result};
use crate::proc::KernelCtx;
use crate::vm::UVAddr;

mod file;
mod proc;

pub use file::*;
pub use proc::*;

// System call numbers.
pub const SYS_FORK: u32 = 1;
pub const SYS_EXIT: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_PIPE: u32 = 4;
pub const SYS_READ: u32 = 5;
pub const SYS_KILL: u32 = 6;
pub const SYS_EXECVE: u32 = 7;
pub const SYS_FSTAT: u32 = 8;
pub const SYS_CHDIR: u32 = 9;
pub const SYS_DUP: u32 = 10;
pub const SYS_GETPID: u32 = 11;
pub const SYS_SBRK: u32 = 12;
pub const SYS_SLEEP: u32 = 13;
pub const SYS_UPTIME: u32 = 14;
pub const SYS_OPEN: u32 = 15;
pub const SYS_WRITE: u32 = 16;
pub const SYS_MKNOD: u32 = 17;
pub const SYS_UNLINK: u32 = 18;
pub const SYS_LINK: u32 = 19;
pub const SYS_MKDIR: u32 = 20;
pub const SYS_CLOSE: u32 = 21;
pub const SYS_CLONE: u32 = 22;
pub const SYS_MKFIFO: u32 = 23;
pub const SYS_UMASK: u32 = 24;
pub const SYS_SETREUID: u32 = 25;
pub const SYS_SETREGID: u32 = 26;
pub const SYS_GETUID: u32 = 27;
pub const SYS_GETEUID: u32 = 28;
pub const SYS_GETGID: u32 = 29;
pub const SYS_GETEGID: u32 = 30;
pub const SYS_GETGROUPS: u32 = 31;
pub const SYS_SETGROUPS: u32 = 32;
pub const SYS_CHMOD: u32 = 33;
pub const SYS_CHOWN: u32 = 34;
pub const SYS_CHROOT: u32 = 35;
pub const SYS_MOUNT: u32 = 36;
pub const SYS_MMAP: u32 = 37;
pub const SYS_SCHED_YIELD: u32 = 38;
pub const SYS_EXIT_GROUP: u32 = 39;

/// Entered from the trap handler on `T_SYSCALL`. Leaves the result (or
/// `-errno`) in the trap frame's `eax`.
pub fn syscall(ctx: &KernelCtx<'_>) {
    let num = ctx.trap_frame().eax;
    let ret = dispatch(num, ctx);
    let eax = match ret {
        Ok(v) => v as u32,
        Err(e) => e.to_ret() as u32,
    };
    // SAFETY: the syscall path holds the only trap-frame reference.
    unsafe { ctx.trap_frame_mut() }.eax = eax;
}

fn dispatch(num: u32, ctx: &KernelCtx<'_>) -> Result<usize> {
    match num {
        SYS_FORK => sys_fork(ctx),
        SYS_EXIT => sys_exit(ctx),
        SYS_WAIT => sys_wait(ctx),
        SYS_PIPE => sys_pipe(ctx),
        SYS_READ => sys_read(ctx),
        SYS_KILL => sys_kill(ctx),
        SYS_EXECVE => sys_execve(ctx),
        SYS_FSTAT => sys_fstat(ctx),
        SYS_CHDIR => sys_chdir(ctx),
        SYS_DUP => sys_dup(ctx),
        SYS_GETPID => sys_getpid(ctx),
        SYS_SBRK => sys_sbrk(ctx),
        SYS_SLEEP => sys_sleep(ctx),
        SYS_UPTIME => sys_uptime(ctx),
        SYS_OPEN => sys_open(ctx),
        SYS_WRITE => sys_write(ctx),
        SYS_MKNOD => sys_mknod(ctx),
        SYS_UNLINK => sys_unlink(ctx),
        SYS_LINK => sys_link(ctx),
        SYS_MKDIR => sys_mkdir(ctx),
        SYS_CLOSE => sys_close(ctx),
        SYS_CLONE => sys_clone(ctx),
        SYS_MKFIFO => sys_mkfifo(ctx),
        SYS_UMASK => sys_umask(ctx),
        SYS_SETREUID => sys_setreuid(ctx),
        SYS_SETREGID => sys_setregid(ctx),
        SYS_GETUID => sys_getuid(ctx),
        SYS_GETEUID => sys_geteuid(ctx),
        SYS_GETGID => sys_getgid(ctx),
        SYS_GETEGID => sys_getegid(ctx),
        SYS_GETGROUPS => sys_getgroups(ctx),
        SYS_SETGROUPS => sys_setgroups(ctx),
        SYS_CHMOD => sys_chmod(ctx),
        SYS_CHOWN => sys_chown(ctx),
        SYS_CHROOT => sys_chroot(ctx),
        SYS_MOUNT => sys_mount(ctx),
        SYS_MMAP => sys_mmap(ctx),
        SYS_SCHED_YIELD => sys_sched_yield(ctx),
        SYS_EXIT_GROUP => sys_exit_group(ctx),
        _ => {
            log::warn!("pid {}: unknown syscall {}", ctx.pid(), num);
            Err(KernelError::ENOSYS)
        }
    }
}

/// Raw n-th 32-bit argument: the x86 convention puts syscall arguments
/// on the user stack above the saved return slot.
fn argraw(n: usize, ctx: &KernelCtx<'_>) -> Result<u32> {
    let esp = ctx.trap_frame().esp as usize;
    ctx.fetch_u32(UVAddr::new(esp + 4 + 4 * n))
}

/// Fetches the n-th argument as a signed integer.
pub fn argint(n: usize, ctx: &KernelCtx<'_>) -> Result<i32> {
    Ok(argraw(n, ctx)? as i32)
}

/// Fetches the n-th argument as a user pointer to `size` readable
/// bytes. The copy routines re-validate every page they touch; this
/// rejects only pointers outside the image outright.
pub fn argptr(n: usize, size: usize, ctx: &KernelCtx<'_>) -> Result<UVAddr> {
    let addr = argraw(n, ctx)? as usize;
    let top = ctx.mm().size();
    if addr >= top || addr + size > top {
        return Err(KernelError::EFAULT);
    }
    Ok(UVAddr::new(addr))
}

/// Fetches the n-th argument as a user address without bounds demands
/// (the copy routines will fault it).
pub fn argaddr(n: usize, ctx: &KernelCtx<'_>) -> Result<UVAddr> {
    Ok(UVAddr::new(argraw(n, ctx)? as usize))
}

/// Fetches the n-th argument as a NUL-terminated string into `buf`.
pub fn argstr<'a>(n: usize, buf: &'a mut [u8], ctx: &KernelCtx<'_>) -> Result<&'a CStr> {
    let addr = argaddr(n, ctx)?;
    ctx.copy_in_str(buf, addr)
}

/// Fetches the n-th argument as a file descriptor, returning the number
/// and a fresh reference to the open file.
pub fn argfd(n: usize, ctx: &KernelCtx<'_>) -> Result<(i32, crate::proc::RcFile)> {
    let fd = argint(n, ctx)?;
    let f = ctx.file(fd)?;
    Ok((fd, f))
}
