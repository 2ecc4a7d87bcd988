//! The `exec` program loader.
//!
//! Resolves the path, peeks for `#!` and rewrites the argument vector
//! through a bounded interpreter loop, then loads the ELF image into a
//! fresh address space, builds the user stack (argv and envp strings,
//! then the `[argc, argv..., 0, envp..., 0]` block), applies set-uid/
//! set-gid, kills sibling threads and commits. On any failure the
//! caller's image is left untouched.

use arrayvec::ArrayVec;
use zerocopy::{AsBytes, FromBytes};

use crate::arch::mmu::{pgroundup, PGSIZE};
use crate::error::{KernelError, Result};
use crate::fs::{namei, Path, S_ISGID, S_ISUID};
use crate::page::Page;
use crate::param::{MAXARG, MAXSHEBANG};
use crate::proc::KernelCtx;
use crate::vm::{Mm, UVAddr, UserMemory};

/// "\x7FELF" in little endian.
const ELF_MAGIC: u32 = 0x464c_457f;

/// Loadable program segment.
const ELF_PROG_LOAD: u32 = 1;

/// ELF32 file header.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
struct ElfHdr {
    magic: u32,
    elf: [u8; 12],
    typ: u16,
    machine: u16,
    version: u32,
    entry: u32,
    phoff: u32,
    shoff: u32,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

/// ELF32 program header.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
struct ProgHdr {
    typ: u32,
    off: u32,
    vaddr: u32,
    paddr: u32,
    filesz: u32,
    memsz: u32,
    flags: u32,
    align: u32,
}

/// An argument vector: every element is a page holding one
/// NUL-terminated string.
pub type ArgPages = ArrayVec<Page, MAXARG>;

/// Frees a whole argument vector.
pub fn free_args(args: ArgPages, ctx: &KernelCtx<'_>) {
    let mut kmem = ctx.kernel().kmem.lock();
    for page in args {
        kmem.free(page);
    }
}

/// Copies `bytes` plus a terminating NUL into a fresh page.
fn page_with_str(bytes: &[u8], ctx: &KernelCtx<'_>) -> Result<Page> {
    if bytes.len() + 1 > PGSIZE {
        return Err(KernelError::E2BIG);
    }
    let mut page = ctx.kernel().kmem.lock().alloc().ok_or(KernelError::ENOMEM)?;
    page[..bytes.len()].copy_from_slice(bytes);
    page[bytes.len()] = 0;
    Ok(page)
}

/// The NUL-terminated string in an argument page.
fn page_str(page: &Page) -> &[u8] {
    let len = page.iter().position(|&c| c == 0).expect("unterminated arg");
    &page[..len]
}

/// Replaces the calling process's image with the program at `path`.
/// Consumes `argv`; on success returns argc (delivered in `eax`).
pub fn exec(path: &Path, argv: ArgPages, envp: &ArgPages, ctx: &KernelCtx<'_>) -> Result<usize> {
    let mut argv = argv;
    // The current path lives in its own page so the shebang loop can
    // rewrite it.
    let mut path_page = match page_with_str(path.as_bytes(), ctx) {
        Ok(p) => p,
        Err(e) => {
            free_args(argv, ctx);
            return Err(e);
        }
    };

    // Set-id bits are honored at every level: a set-uid script grants
    // its owner's identity even though the interpreter ends up running.
    let mut setid = SetId {
        euid: None,
        egid: None,
    };
    let mut depth = MAXSHEBANG;
    let result = loop {
        // SAFETY: the page holds a NUL-terminated string; page_str cuts
        // it before the NUL.
        let cur_path = unsafe { Path::from_bytes(page_str(&path_page)) };
        match exec_step(cur_path, &mut argv, envp, &mut setid, ctx) {
            Ok(Step::Done(argc)) => break Ok(argc),
            Ok(Step::Interpreter(new_path)) => {
                if depth == 0 {
                    ctx.kernel().kmem.lock().free(new_path);
                    break Err(KernelError::ELOOP);
                }
                depth -= 1;
                ctx.kernel().kmem.lock().free(path_page);
                path_page = new_path;
            }
            Err(e) => break Err(e),
        }
    };
    ctx.kernel().kmem.lock().free(path_page);
    free_args(argv, ctx);
    result
}

enum Step {
    /// The image was replaced; the value is argc.
    Done(usize),
    /// The target was a `#!` script; run this interpreter next. The
    /// argument vector has been rewritten in place.
    Interpreter(Page),
}

/// Effective ids granted by set-id bits along the exec chain.
struct SetId {
    euid: Option<u32>,
    egid: Option<u32>,
}

fn exec_step(
    path: &Path,
    argv: &mut ArgPages,
    envp: &ArgPages,
    setid: &mut SetId,
    ctx: &KernelCtx<'_>,
) -> Result<Step> {
    let kernel = ctx.kernel();
    let tx = kernel.fs().begin_tx(ctx);

    let (mem, entry, shebang) = {
        let ip = namei(path, &tx, ctx)?;
        let ip = scopeguard::guard(ip, |ip| ip.free((&tx, ctx)));
        let mut guard = ip.lock(ctx);

        // Executing takes the execute bit unless the caller is root.
        if guard.permissions(ctx) & 1 == 0 {
            return Err(KernelError::EACCES);
        }

        // Set-id decisions come from this level's inode.
        if guard.mode & S_ISUID != 0 {
            setid.euid = Some(guard.uid);
        }
        if guard.mode & S_ISGID != 0 {
            setid.egid = Some(guard.gid);
        }

        // Peek for a shebang.
        let mut magic2 = [0u8; 2];
        if guard.read_bytes_kernel(&mut magic2, 0, ctx)? < 2 {
            return Err(KernelError::EACCES);
        }
        if &magic2 == b"#!" {
            let interp = rewrite_for_interpreter(&mut guard, path, argv, ctx)?;
            (None, 0, Some(interp))
        } else {
            // ELF header.
            let elf: ElfHdr = guard.read_kernel(0, ctx).map_err(|_| KernelError::ENOEXEC)?;
            if elf.magic != ELF_MAGIC {
                return Err(KernelError::ENOEXEC);
            }

            // Load every PT_LOAD segment into a fresh image.
            let mut mem = UserMemory::new(None, &kernel.kmem)?;
            let loaded = (|| -> Result<()> {
                for i in 0..elf.phnum as u32 {
                    let off = elf.phoff + i * core::mem::size_of::<ProgHdr>() as u32;
                    let ph: ProgHdr =
                        guard.read_kernel(off, ctx).map_err(|_| KernelError::EIO)?;
                    if ph.typ != ELF_PROG_LOAD {
                        continue;
                    }
                    if ph.memsz < ph.filesz || ph.vaddr % PGSIZE as u32 != 0 {
                        return Err(KernelError::ENOEXEC);
                    }
                    let end = ph
                        .vaddr
                        .checked_add(ph.memsz)
                        .ok_or(KernelError::ENOEXEC)? as usize;
                    mem.grow_to(end, &kernel.kmem)?;
                    mem.load_file(UVAddr::new(ph.vaddr as usize), &mut guard, ph.off, ph.filesz, ctx)?;
                }
                Ok(())
            })();
            if let Err(e) = loaded {
                mem.free(&kernel.kmem);
                return Err(e);
            }
            (Some(mem), elf.entry as usize, None)
        }
    };
    drop(tx);

    if let Some(interp) = shebang {
        return Ok(Step::Interpreter(interp));
    }
    let mut mem = mem.expect("exec: no image");

    // Two pages at the next boundary: the lower is the inaccessible
    // guard page, the upper is the user stack.
    let stack = (|mem: &mut UserMemory| -> Result<usize> {
        let base = pgroundup(mem.size());
        let sz = mem.grow_to(base + 2 * PGSIZE, &kernel.kmem)?;
        mem.clear_user(UVAddr::new(sz - 2 * PGSIZE));
        let mut sp = sz;
        let stackbase = sz - PGSIZE;

        // Argument and environment strings, descending, word-aligned.
        let mut ustack = [0u32; 3 + 2 * MAXARG];
        let argc = argv.len();
        for (i, arg) in argv.iter().enumerate() {
            let s = page_str(arg);
            sp = (sp - (s.len() + 1)) & !3;
            if sp < stackbase {
                return Err(KernelError::E2BIG);
            }
            mem.copy_out_bytes(UVAddr::new(sp), s)?;
            mem.copy_out_bytes(UVAddr::new(sp + s.len()), &[0])?;
            ustack[1 + i] = sp as u32;
        }
        ustack[1 + argc] = 0;

        let mut nenv = 0;
        for (j, env) in envp.iter().enumerate() {
            let s = page_str(env);
            sp = (sp - (s.len() + 1)) & !3;
            if sp < stackbase {
                return Err(KernelError::E2BIG);
            }
            mem.copy_out_bytes(UVAddr::new(sp), s)?;
            mem.copy_out_bytes(UVAddr::new(sp + s.len()), &[0])?;
            ustack[2 + argc + j] = sp as u32;
            nenv += 1;
        }
        ustack[2 + argc + nenv] = 0;
        ustack[0] = argc as u32;

        // The [argc, argv..., 0, envp..., 0] block right below the
        // strings.
        let words = 1 + argc + 1 + nenv + 1;
        sp -= words * 4;
        if sp < stackbase {
            return Err(KernelError::E2BIG);
        }
        let mut block = [0u8; (3 + 2 * MAXARG) * 4];
        for (w, v) in ustack[..words].iter().enumerate() {
            block[w * 4..w * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        mem.copy_out_bytes(UVAddr::new(sp), &block[..words * 4])?;
        Ok(sp)
    })(&mut mem);

    let sp = match stack {
        Ok(sp) => sp,
        Err(e) => {
            mem.free(&kernel.kmem);
            return Err(e);
        }
    };

    // Wrap the image before the point of no return so failure leaves
    // the caller intact.
    let new_mm = Mm::from_memory(kernel, mem)?;

    // Point of no return: commit credentials, thread group, name,
    // registers and image.
    {
        let mut cred = ctx.cred();
        let new_euid = setid.euid.unwrap_or(cred.euid);
        let new_egid = setid.egid.unwrap_or(cred.egid);
        cred.suid = cred.euid;
        cred.sgid = cred.egid;
        if cred.euid != new_euid {
            cred.euid = new_euid;
            cred.ngroups = 0;
        }
        if cred.egid != new_egid {
            cred.egid = new_egid;
            cred.ngroups = 0;
        }
    }

    // Terminate the other threads and become a group of one.
    kernel.procs().kill_group_siblings(ctx);
    {
        let _guard = kernel.procs().table();
        // SAFETY: the table lock is held.
        let shared = unsafe { ctx.proc().shared_mut() };
        shared.thread_group.remove();
        shared.group_leader = ctx.proc() as *const _;
        shared.tgid = shared.pid;
    }

    // SAFETY: only the task itself touches its name and trap frame.
    unsafe {
        ctx.proc().set_name(path.file_name());
        let tf = &mut *ctx.data().tf;
        tf.eip = entry as u32;
        tf.esp = sp as u32;
    }

    let old_mm = {
        // SAFETY: only the task itself replaces its mm.
        let data = unsafe { ctx.data_mut() };
        core::mem::replace(&mut data.mm, Some(new_mm))
    };
    // SAFETY: new_mm is live; we hold its count through data.mm.
    crate::arch::mmu::load_page_dir(crate::arch::memlayout::kva2pa(unsafe {
        new_mm.as_ref().page_dir_addr()
    }));
    if let Some(old) = old_mm {
        // The old address space fully goes away once every sharer (the
        // killed siblings) is reaped.
        Mm::put(old, ctx);
    }

    Ok(argv.len())
}

/// Parses the interpreter line of a `#!` script and rewrites `argv` to
/// `[interpreter, interp_args..., script_path, original_argv[1..]]`.
/// Returns the interpreter path in a fresh page.
fn rewrite_for_interpreter(
    guard: &mut crate::fs::InodeGuard<'_>,
    script_path: &Path,
    argv: &mut ArgPages,
    ctx: &KernelCtx<'_>,
) -> Result<Page> {
    let kernel = ctx.kernel();
    let mut line_page = kernel.kmem.lock().alloc().ok_or(KernelError::ENOMEM)?;
    let n = match guard.read_bytes_kernel(&mut line_page[..], 2, ctx) {
        Ok(n) => n,
        Err(e) => {
            kernel.kmem.lock().free(line_page);
            return Err(e);
        }
    };

    let result = build_interp_argv(&line_page[..n], script_path, argv, ctx);
    kernel.kmem.lock().free(line_page);
    result
}

fn build_interp_argv(
    line: &[u8],
    script_path: &Path,
    argv: &mut ArgPages,
    ctx: &KernelCtx<'_>,
) -> Result<Page> {
    let end = line
        .iter()
        .position(|&c| c == b'\n')
        .ok_or(KernelError::ENOEXEC)?;
    let line = &line[..end];

    let mut tokens = line
        .split(|&c| c == b' ' || c == b'\t')
        .filter(|t| !t.is_empty() && !t.contains(&0));
    let interp = tokens.next().ok_or(KernelError::ENOEXEC)?;
    let ntokens = 1 + tokens.clone().count();

    // interpreter + its args + script path + original argv[1..]
    let tail = argv.len().saturating_sub(1);
    if ntokens + 1 + tail > MAXARG {
        return Err(KernelError::E2BIG);
    }

    let mut new_argv: ArgPages = ArrayVec::new();
    let build = (|| -> Result<()> {
        new_argv.push(page_with_str(interp, ctx)?);
        for t in tokens {
            new_argv.push(page_with_str(t, ctx)?);
        }
        new_argv.push(page_with_str(script_path.as_bytes(), ctx)?);
        Ok(())
    })();
    if let Err(e) = build {
        free_args(new_argv, ctx);
        return Err(e);
    }

    let interp_page = match page_with_str(interp, ctx) {
        Ok(p) => p,
        Err(e) => {
            free_args(new_argv, ctx);
            return Err(e);
        }
    };

    // Move the original tail over; capacity was checked above.
    let mut old = core::mem::take(argv);
    let mut first = true;
    for page in old.drain(..) {
        if first {
            kernel_free(page, ctx);
            first = false;
        } else {
            new_argv.push(page);
        }
    }
    *argv = new_argv;
    Ok(interp_page)
}

fn kernel_free(page: Page, ctx: &KernelCtx<'_>) {
    ctx.kernel().kmem.lock().free(page);
}
