//! Process and identity system calls.

use crate::error::{KernelError, Result};
use crate::param::NGROUPS_MAX;
use crate::proc::{CloneFlags, KernelCtx};

use super::{argaddr, argint, argptr};

pub fn sys_fork(ctx: &KernelCtx<'_>) -> Result<usize> {
    ctx.kernel().procs().fork(ctx).map(|pid| pid as usize)
}

pub fn sys_clone(ctx: &KernelCtx<'_>) -> Result<usize> {
    let stack = argaddr(0, ctx)?.into_usize();
    let flags = CloneFlags::from_bits_truncate(argint(1, ctx)? as u32);
    ctx.kernel()
        .procs()
        .clone_proc(stack, flags, ctx)
        .map(|pid| pid as usize)
}

pub fn sys_exit(ctx: &KernelCtx<'_>) -> Result<usize> {
    ctx.kernel().procs().exit_current(ctx)
}

pub fn sys_exit_group(ctx: &KernelCtx<'_>) -> Result<usize> {
    ctx.kernel().procs().exit_group(ctx)
}

pub fn sys_wait(ctx: &KernelCtx<'_>) -> Result<usize> {
    ctx.kernel().procs().wait(ctx).map(|pid| pid as usize)
}

pub fn sys_kill(ctx: &KernelCtx<'_>) -> Result<usize> {
    let pid = argint(0, ctx)?;
    ctx.kernel().procs().kill(pid, ctx).map(|_| 0)
}

pub fn sys_getpid(ctx: &KernelCtx<'_>) -> Result<usize> {
    Ok(ctx.pid() as usize)
}

pub fn sys_sched_yield(ctx: &KernelCtx<'_>) -> Result<usize> {
    ctx.kernel().procs().yield_cpu(ctx);
    Ok(0)
}

pub fn sys_sbrk(ctx: &KernelCtx<'_>) -> Result<usize> {
    let n = argint(0, ctx)?;
    let old = ctx.mm().resize(n, ctx.kernel())?;
    Ok(old)
}

/// Sleeps for `n` ticks.
pub fn sys_sleep(ctx: &KernelCtx<'_>) -> Result<usize> {
    let n = argint(0, ctx)?;
    if n < 0 {
        return Err(KernelError::EINVAL);
    }
    let kernel = ctx.kernel();
    let mut guard = kernel.ticks.lock();
    let start = *guard;
    while guard.wrapping_sub(start) < n as u32 {
        if ctx.proc().killed() {
            return Err(KernelError::EINTR);
        }
        guard.sleep(ctx);
    }
    Ok(0)
}

/// Ticks since boot.
pub fn sys_uptime(ctx: &KernelCtx<'_>) -> Result<usize> {
    Ok(*ctx.kernel().ticks.lock() as usize)
}

/// Sets the real and/or effective user id; −1 leaves a field alone.
/// Changing the effective id refreshes the saved id.
pub fn sys_setreuid(ctx: &KernelCtx<'_>) -> Result<usize> {
    let ruid = argint(0, ctx)?;
    let euid = argint(1, ctx)?;
    let mut cred = ctx.cred();

    let mut update_saved = false;
    let mut new_uid = cred.uid;
    let mut new_euid = cred.euid;
    if ruid != -1 {
        let ruid = ruid as u32;
        if ruid != cred.euid && ruid != cred.uid && cred.euid != 0 {
            return Err(KernelError::EPERM);
        }
        new_uid = ruid;
        update_saved = true;
    }
    if euid != -1 {
        let euid = euid as u32;
        if euid != cred.euid && euid != cred.uid && euid != cred.suid && cred.euid != 0 {
            return Err(KernelError::EPERM);
        }
        if cred.euid != euid {
            update_saved = true;
        }
        new_euid = euid;
    }
    cred.uid = new_uid;
    cred.euid = new_euid;
    if update_saved {
        cred.suid = cred.euid;
    }
    Ok(0)
}

/// `setreuid`, for group ids.
pub fn sys_setregid(ctx: &KernelCtx<'_>) -> Result<usize> {
    let rgid = argint(0, ctx)?;
    let egid = argint(1, ctx)?;
    let mut cred = ctx.cred();

    let mut update_saved = false;
    let mut new_gid = cred.gid;
    let mut new_egid = cred.egid;
    if rgid != -1 {
        let rgid = rgid as u32;
        if rgid != cred.egid && rgid != cred.gid && cred.egid != 0 {
            return Err(KernelError::EPERM);
        }
        new_gid = rgid;
        update_saved = true;
    }
    if egid != -1 {
        let egid = egid as u32;
        if egid != cred.egid && egid != cred.gid && egid != cred.sgid && cred.egid != 0 {
            return Err(KernelError::EPERM);
        }
        if cred.egid != egid {
            update_saved = true;
        }
        new_egid = egid;
    }
    cred.gid = new_gid;
    cred.egid = new_egid;
    if update_saved {
        cred.sgid = cred.egid;
    }
    Ok(0)
}

pub fn sys_getuid(ctx: &KernelCtx<'_>) -> Result<usize> {
    Ok(ctx.cred().uid as usize)
}

pub fn sys_geteuid(ctx: &KernelCtx<'_>) -> Result<usize> {
    Ok(ctx.cred().euid as usize)
}

pub fn sys_getgid(ctx: &KernelCtx<'_>) -> Result<usize> {
    Ok(ctx.cred().gid as usize)
}

pub fn sys_getegid(ctx: &KernelCtx<'_>) -> Result<usize> {
    Ok(ctx.cred().egid as usize)
}

/// With size 0 reports the count; otherwise copies the supplementary
/// groups out.
pub fn sys_getgroups(ctx: &KernelCtx<'_>) -> Result<usize> {
    let size = argint(0, ctx)?;
    let ngroups = ctx.cred().ngroups;
    if size == 0 {
        return Ok(ngroups);
    }
    if (size as usize) < ngroups {
        return Err(KernelError::EINVAL);
    }
    let addr = argptr(1, ngroups * 4, ctx)?;
    let groups = {
        let cred = ctx.cred();
        cred.groups
    };
    for (i, g) in groups[..ngroups].iter().enumerate() {
        ctx.copy_out_bytes(addr + i * 4, &g.to_le_bytes())?;
    }
    Ok(ngroups)
}

/// Replaces the supplementary group list. Root only.
pub fn sys_setgroups(ctx: &KernelCtx<'_>) -> Result<usize> {
    let count = argint(0, ctx)?;
    if count < 0 || count as usize > NGROUPS_MAX {
        return Err(KernelError::EINVAL);
    }
    let count = count as usize;
    let addr = argptr(1, count * 4, ctx)?;
    if ctx.cred().euid != 0 {
        return Err(KernelError::EPERM);
    }
    let mut groups = [0u32; NGROUPS_MAX];
    for (i, g) in groups[..count].iter_mut().enumerate() {
        *g = ctx.fetch_u32(addr + i * 4)?;
    }
    let mut cred = ctx.cred();
    cred.groups[..count].copy_from_slice(&groups[..count]);
    cred.ngroups = count;
    Ok(0)
}
