//! Kernel-wide tests: a hosted kernel instance over a RAM disk built by
//! mkfs, driven through a fabricated process context.

use crate::arch::mmu::PGSIZE;
use crate::bio::BcacheExt;
use crate::error::KernelError;
use crate::fs::{create, namei, Dirent, Path, NDIRECT, S_IFREG, S_ISUID, T_FILE};
use crate::kernel::testing::{boot_with_image, TestEnv};
use crate::param::{BSIZE, LOGSIZE, ROOTDEV};
use crate::proc::{CloneFlags, KernelCtx, ProcState};
use crate::syscall::{self, OpenFlags};
use crate::vm::{MapFlags, UVAddr, PROT_READ, PROT_WRITE};
use ox6_mkfs::{basic_image, ImageBuilder};

fn path(bytes: &[u8]) -> &Path {
    // SAFETY: test paths contain no NUL.
    unsafe { Path::from_bytes(bytes) }
}

/// Writes `data` to a fresh file at `p`, through the inode layer.
fn write_file(env: &TestEnv, p: &[u8], data: &[u8], mode: u32) {
    let ctx = env.ctx();
    let tx = ctx.kernel().fs().begin_tx(&ctx);
    let ip = create(path(p), T_FILE, 0, 0, mode, &tx, &ctx).expect("create");
    {
        let mut guard = ip.lock(&ctx);
        let n = guard
            .write_bytes_kernel(data, 0, &tx, &ctx)
            .expect("write");
        assert_eq!(n, data.len());
    }
    ip.free((&tx, &ctx));
}

/// Reads the content at `p`. Works for synthetic files too, whose
/// nominal size is 0.
fn read_file(env: &TestEnv, p: &[u8]) -> Vec<u8> {
    let ctx = env.ctx();
    let tx = ctx.kernel().fs().begin_tx(&ctx);
    let ip = namei(path(p), &tx, &ctx).expect("namei");
    let mut out;
    {
        let mut guard = ip.lock(&ctx);
        out = vec![0u8; core::cmp::max(guard.size as usize, 4096)];
        let n = guard
            .read_bytes_kernel(&mut out, 0, &ctx)
            .expect("read");
        out.truncate(n);
    }
    ip.free((&tx, &ctx));
    out
}

mod mount_and_paths {
    use super::*;

    #[test]
    fn namei_finds_seeded_files() {
        let env = boot_with_image(&basic_image());
        assert_eq!(
            read_file(&env, b"/etc/passwd"),
            b"root:x:0:0:root:/:/bin/sh\n"
        );
    }

    #[test]
    fn namei_reports_enoent_and_enotdir() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        let tx = ctx.kernel().fs().begin_tx(&ctx);
        assert!(matches!(
            namei(path(b"/etc/shadow"), &tx, &ctx),
            Err(KernelError::ENOENT)
        ));
        assert!(matches!(
            namei(path(b"/etc/passwd/impossible"), &tx, &ctx),
            Err(KernelError::ENOTDIR)
        ));
    }

    #[test]
    fn dotdot_at_root_stays_at_root() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        let tx = ctx.kernel().fs().begin_tx(&ctx);
        let ip = namei(path(b"/../../etc/group"), &tx, &ctx).expect("walk");
        ip.free((&tx, &ctx));
    }

    #[test]
    fn search_permission_is_required() {
        let env = boot_with_image(
            &ImageBuilder::new()
                .dir("/locked", 0o700, 42, 42)
                .file("/locked/secret", b"no", 0o644, 42, 42)
                .build(),
        );
        let ctx = env.ctx();
        {
            let mut cred = ctx.cred();
            cred.uid = 7;
            cred.euid = 7;
            cred.gid = 7;
            cred.egid = 7;
        }
        let tx = ctx.kernel().fs().begin_tx(&ctx);
        assert!(matches!(
            namei(path(b"/locked/secret"), &tx, &ctx),
            Err(KernelError::EPERM)
        ));
    }
}

mod rw_roundtrip {
    use super::*;

    #[test]
    fn small_file_round_trips() {
        let env = boot_with_image(&basic_image());
        write_file(&env, b"/tmp/x", b"hello, disk", 0o644);
        assert_eq!(read_file(&env, b"/tmp/x"), b"hello, disk");
    }

    #[test]
    fn large_file_uses_the_indirect_block() {
        let env = boot_with_image(&basic_image());
        // Cross the direct-block boundary by a good margin.
        let data: Vec<u8> = (0..(NDIRECT + 4) * BSIZE + 123)
            .map(|i| (i % 251) as u8)
            .collect();
        write_file(&env, b"/tmp/big", &data, 0o644);
        assert_eq!(read_file(&env, b"/tmp/big"), data);
    }

    #[test]
    fn write_at_offset_reads_back() {
        let env = boot_with_image(&basic_image());
        write_file(&env, b"/tmp/o", b"0123456789", 0o644);
        let ctx = env.ctx();
        let tx = ctx.kernel().fs().begin_tx(&ctx);
        let ip = namei(path(b"/tmp/o"), &tx, &ctx).unwrap();
        {
            let mut guard = ip.lock(&ctx);
            guard.write_bytes_kernel(b"ABC", 4, &tx, &ctx).unwrap();
            let mut buf = [0u8; 10];
            guard.read_bytes_kernel(&mut buf, 0, &ctx).unwrap();
            assert_eq!(&buf, b"0123ABC789");
        }
        ip.free((&tx, &ctx));
    }

    #[test]
    fn unlinked_file_disappears_and_frees_blocks() {
        let env = boot_with_image(&basic_image());
        write_file(&env, b"/tmp/gone", &vec![7u8; 3 * BSIZE], 0o644);
        let ctx = env.ctx();
        sys(&ctx, &[ustr(&ctx, b"/tmp/gone", 0x3000)]);
        assert_eq!(syscall::sys_unlink(&ctx), Ok(0));
        let tx = ctx.kernel().fs().begin_tx(&ctx);
        assert!(matches!(
            namei(path(b"/tmp/gone"), &tx, &ctx),
            Err(KernelError::ENOENT)
        ));
    }
}

/// Plants syscall arguments in user memory: `args` become the words the
/// marshalling code reads above `esp`.
fn sys(ctx: &KernelCtx<'_>, args: &[u32]) {
    let esp = 0x2000u32;
    // SAFETY: the fabricated task owns its trap frame.
    unsafe { ctx.trap_frame_mut() }.esp = esp;
    for (i, v) in args.iter().enumerate() {
        ctx.copy_out_bytes(
            UVAddr::new(esp as usize + 4 + 4 * i),
            &v.to_le_bytes(),
        )
        .expect("arg setup");
    }
}

/// Copies a NUL-terminated string into user memory at `at`, returning
/// the user address for syscall arguments.
fn ustr(ctx: &KernelCtx<'_>, s: &[u8], at: usize) -> u32 {
    let mut buf = s.to_vec();
    buf.push(0);
    ctx.copy_out_bytes(UVAddr::new(at), &buf).expect("ustr");
    at as u32
}

mod syscalls {
    use super::*;

    #[test]
    fn open_write_read_close() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();

        sys(
            &ctx,
            &[
                ustr(&ctx, b"/tmp/f", 0x3000),
                (OpenFlags::O_CREATE | OpenFlags::O_RDWR).bits(),
                0o644,
            ],
        );
        let fd = syscall::sys_open(&ctx).expect("open") as u32;

        // write(fd, buf, n)
        let buf = ustr(&ctx, b"written through fds", 0x3100);
        sys(&ctx, &[fd, buf, 19]);
        assert_eq!(syscall::sys_write(&ctx), Ok(19));

        // Rewind by reopening, then read.
        sys(
            &ctx,
            &[ustr(&ctx, b"/tmp/f", 0x3000), OpenFlags::O_RDONLY.bits()],
        );
        let fd2 = syscall::sys_open(&ctx).expect("reopen") as u32;
        sys(&ctx, &[fd2, 0x3200, 64]);
        assert_eq!(syscall::sys_read(&ctx), Ok(19));
        let mut back = [0u8; 19];
        ctx.copy_in_bytes(&mut back, UVAddr::new(0x3200)).unwrap();
        assert_eq!(&back, b"written through fds");

        // A second read hits EOF.
        sys(&ctx, &[fd2, 0x3200, 64]);
        assert_eq!(syscall::sys_read(&ctx), Ok(0));

        sys(&ctx, &[fd]);
        assert_eq!(syscall::sys_close(&ctx), Ok(0));
        sys(&ctx, &[fd]);
        assert!(matches!(syscall::sys_close(&ctx), Err(KernelError::EBADF)));
    }

    #[test]
    fn open_append_positions_at_end() {
        let env = boot_with_image(&basic_image());
        write_file(&env, b"/tmp/log", b"head:", 0o644);
        let ctx = env.ctx();
        sys(
            &ctx,
            &[
                ustr(&ctx, b"/tmp/log", 0x3000),
                (OpenFlags::O_WRONLY | OpenFlags::O_APPEND).bits(),
            ],
        );
        let fd = syscall::sys_open(&ctx).expect("open") as u32;
        let buf = ustr(&ctx, b"tail", 0x3100);
        sys(&ctx, &[fd, buf, 4]);
        assert_eq!(syscall::sys_write(&ctx), Ok(4));
        assert_eq!(read_file(&env, b"/tmp/log"), b"head:tail");
    }

    #[test]
    fn umask_masks_creation_mode() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        sys(&ctx, &[0o022]);
        assert_eq!(syscall::sys_umask(&ctx), Ok(0));
        write_file(&env, b"/tmp/masked", b"x", 0o666);
        let tx = ctx.kernel().fs().begin_tx(&ctx);
        let ip = namei(path(b"/tmp/masked"), &tx, &ctx).unwrap();
        {
            let guard = ip.lock(&ctx);
            assert_eq!(guard.mode, S_IFREG | 0o644);
            assert_eq!(guard.uid, 0);
        }
        ip.free((&tx, &ctx));
    }

    #[test]
    fn mkdir_and_link_and_unlink() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();

        sys(&ctx, &[ustr(&ctx, b"/tmp/d", 0x3000), 0o755]);
        assert_eq!(syscall::sys_mkdir(&ctx), Ok(0));

        write_file(&env, b"/tmp/d/a", b"payload", 0o644);
        sys(
            &ctx,
            &[
                ustr(&ctx, b"/tmp/d/a", 0x3000),
                ustr(&ctx, b"/tmp/d/b", 0x3080),
            ],
        );
        assert_eq!(syscall::sys_link(&ctx), Ok(0));
        assert_eq!(read_file(&env, b"/tmp/d/b"), b"payload");

        // A directory with entries refuses to go.
        sys(&ctx, &[ustr(&ctx, b"/tmp/d", 0x3000)]);
        assert!(matches!(
            syscall::sys_unlink(&ctx),
            Err(KernelError::ENOTEMPTY)
        ));

        // Drop both names; the content survives until the last one.
        sys(&ctx, &[ustr(&ctx, b"/tmp/d/a", 0x3000)]);
        assert_eq!(syscall::sys_unlink(&ctx), Ok(0));
        assert_eq!(read_file(&env, b"/tmp/d/b"), b"payload");
        sys(&ctx, &[ustr(&ctx, b"/tmp/d/b", 0x3000)]);
        assert_eq!(syscall::sys_unlink(&ctx), Ok(0));

        sys(&ctx, &[ustr(&ctx, b"/tmp/d", 0x3000)]);
        assert_eq!(syscall::sys_unlink(&ctx), Ok(0));
    }

    #[test]
    fn link_rejects_cross_checks() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        sys(
            &ctx,
            &[
                ustr(&ctx, b"/tmp", 0x3000),
                ustr(&ctx, b"/tmp2", 0x3080),
            ],
        );
        assert!(matches!(syscall::sys_link(&ctx), Err(KernelError::EPERM)));
    }

    #[test]
    fn chdir_changes_relative_walks() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        sys(&ctx, &[ustr(&ctx, b"/etc", 0x3000)]);
        assert_eq!(syscall::sys_chdir(&ctx), Ok(0));
        assert_eq!(
            read_file(&env, b"group"),
            b"root:x:0:root\n",
            "relative path resolves from the new cwd"
        );
    }

    #[test]
    fn chmod_and_chown_enforce_ownership() {
        let env = boot_with_image(&basic_image());
        write_file(&env, b"/tmp/t", b"", 0o755);
        let ctx = env.ctx();

        // Root chmod works.
        sys(&ctx, &[ustr(&ctx, b"/tmp/t", 0x3000), 0o4755]);
        assert_eq!(syscall::sys_chmod(&ctx), Ok(0));

        // A stranger cannot chmod or chown.
        {
            let mut cred = ctx.cred();
            cred.uid = 9;
            cred.euid = 9;
        }
        sys(&ctx, &[ustr(&ctx, b"/tmp/t", 0x3000), 0o600]);
        assert!(matches!(syscall::sys_chmod(&ctx), Err(KernelError::EPERM)));
        sys(&ctx, &[ustr(&ctx, b"/tmp/t", 0x3000), 9u32, u32::MAX]);
        assert!(matches!(syscall::sys_chown(&ctx), Err(KernelError::EPERM)));

        // Root chown to another owner strips nothing (root), but a
        // non-root owner moving the gid strips set-id bits.
        {
            let mut cred = ctx.cred();
            cred.uid = 0;
            cred.euid = 0;
        }
        sys(&ctx, &[ustr(&ctx, b"/tmp/t", 0x3000), 5u32, u32::MAX]);
        assert_eq!(syscall::sys_chown(&ctx), Ok(0));
        {
            let mut cred = ctx.cred();
            cred.uid = 5;
            cred.euid = 5;
            cred.egid = 11;
        }
        sys(&ctx, &[ustr(&ctx, b"/tmp/t", 0x3000), u32::MAX, 11u32]);
        assert_eq!(syscall::sys_chown(&ctx), Ok(0));
        let tx = ctx.kernel().fs().begin_tx(&ctx);
        let ip = namei(path(b"/tmp/t"), &tx, &ctx).unwrap();
        {
            let guard = ip.lock(&ctx);
            assert_eq!(guard.gid, 11);
            assert_eq!(guard.mode & S_ISUID, 0, "set-uid stripped");
        }
        ip.free((&tx, &ctx));
    }

    #[test]
    fn identity_syscalls_follow_saved_id_rules() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();

        // Root drops to uid 5 with saved id 5.
        sys(&ctx, &[5u32, 5u32]);
        assert_eq!(syscall::sys_setreuid(&ctx), Ok(0));
        assert_eq!(syscall::sys_getuid(&ctx), Ok(5));
        assert_eq!(syscall::sys_geteuid(&ctx), Ok(5));

        // Now it cannot become someone else.
        sys(&ctx, &[3u32, u32::MAX]);
        assert!(matches!(
            syscall::sys_setreuid(&ctx),
            Err(KernelError::EPERM)
        ));

        // But it can swap back to a saved euid.
        {
            let mut cred = ctx.cred();
            cred.suid = 0;
        }
        sys(&ctx, &[u32::MAX, 0u32]);
        assert_eq!(syscall::sys_setreuid(&ctx), Ok(0));
        assert_eq!(syscall::sys_geteuid(&ctx), Ok(0));
    }

    #[test]
    fn groups_round_trip_and_gate() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        // setgroups([2, 7]) as root.
        ctx.copy_out_bytes(UVAddr::new(0x3300), &[2, 0, 0, 0, 7, 0, 0, 0])
            .unwrap();
        sys(&ctx, &[2, 0x3300]);
        assert_eq!(syscall::sys_setgroups(&ctx), Ok(0));

        // getgroups(0) reports the count; a short buffer is EINVAL.
        sys(&ctx, &[0]);
        assert_eq!(syscall::sys_getgroups(&ctx), Ok(2));
        sys(&ctx, &[1, 0x3400]);
        assert!(matches!(
            syscall::sys_getgroups(&ctx),
            Err(KernelError::EINVAL)
        ));
        sys(&ctx, &[2, 0x3400]);
        assert_eq!(syscall::sys_getgroups(&ctx), Ok(2));
        let mut out = [0u8; 8];
        ctx.copy_in_bytes(&mut out, UVAddr::new(0x3400)).unwrap();
        assert_eq!(out, [2, 0, 0, 0, 7, 0, 0, 0]);

        // Non-root may not set groups.
        {
            let mut cred = ctx.cred();
            cred.euid = 5;
        }
        sys(&ctx, &[1, 0x3300]);
        assert!(matches!(
            syscall::sys_setgroups(&ctx),
            Err(KernelError::EPERM)
        ));
    }

    #[test]
    fn sbrk_returns_old_break() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        let old = ctx.mm().size();
        sys(&ctx, &[PGSIZE as u32]);
        assert_eq!(syscall::sys_sbrk(&ctx), Ok(old));
        assert_eq!(ctx.mm().size(), old + PGSIZE);
    }
}

mod dac {
    use super::*;

    /// Scenario S5: mode 0640, uid 1, gid 2 under three identities.
    #[test]
    fn access_follows_the_triples() {
        let env = boot_with_image(
            &ImageBuilder::new()
                .file("/t", b"guarded", 0o640, 1, 2)
                .build(),
        );
        let ctx = env.ctx();

        let open_with = |uid: u32, gid: u32, flags: OpenFlags| {
            {
                let mut cred = ctx.cred();
                cred.uid = uid;
                cred.euid = uid;
                cred.gid = gid;
                cred.egid = gid;
                cred.ngroups = 0;
            }
            sys(&ctx, &[ustr(&ctx, b"/t", 0x3000), flags.bits()]);
            syscall::sys_open(&ctx)
        };

        // (euid 3, egid 2): group member reads, cannot write.
        assert!(open_with(3, 2, OpenFlags::O_RDONLY).is_ok());
        assert!(matches!(
            open_with(3, 2, OpenFlags::O_WRONLY),
            Err(KernelError::EACCES)
        ));

        // (euid 3, egid 4): other, nothing.
        assert!(matches!(
            open_with(3, 4, OpenFlags::O_RDONLY),
            Err(KernelError::EACCES)
        ));
        assert!(matches!(
            open_with(3, 4, OpenFlags::O_WRONLY),
            Err(KernelError::EACCES)
        ));

        // Root does anything.
        assert!(open_with(0, 4, OpenFlags::O_RDWR).is_ok());
    }

    #[test]
    fn supplementary_groups_grant_group_bits() {
        let env = boot_with_image(
            &ImageBuilder::new()
                .file("/t", b"guarded", 0o640, 1, 2)
                .build(),
        );
        let ctx = env.ctx();
        {
            let mut cred = ctx.cred();
            cred.uid = 3;
            cred.euid = 3;
            cred.gid = 9;
            cred.egid = 9;
            cred.ngroups = 1;
            cred.groups[0] = 2;
        }
        sys(&ctx, &[ustr(&ctx, b"/t", 0x3000), OpenFlags::O_RDONLY.bits()]);
        assert!(syscall::sys_open(&ctx).is_ok());
    }
}

mod buffer_cache {
    use super::*;

    /// Property P2: one buffer per (dev, blockno).
    #[test]
    fn one_buffer_per_block() {
        let env = boot_with_image(&basic_image());
        let a = env.kernel.bcache().get_buf(ROOTDEV, 100);
        let b = env.kernel.bcache().get_buf(ROOTDEV, 100);
        let c = env.kernel.bcache().get_buf(ROOTDEV, 101);
        assert!(a.is_same(&b));
        assert!(!a.is_same(&c));
        a.free(());
        b.free(());
        c.free(());
    }

    #[test]
    fn read_caches_device_contents() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        let before = env.disk.peek(1);
        let buf = env.kernel.bcache().read(ROOTDEV, 1, &ctx);
        assert_eq!(&buf.data().inner[..], &before[..]);
        drop(buf);
    }
}

mod log_recovery {
    use super::*;
    use zerocopy::FromBytes;

    /// Builds the on-disk state "crashed after the commit point":
    /// log data written, header says n=1, home block untouched.
    fn plant_committed_log(env: &TestEnv, home: u32, content: &[u8; BSIZE]) {
        let sb_block = env.disk.peek(1);
        let sb = crate::fs::Superblock::read_from(
            &sb_block[..core::mem::size_of::<crate::fs::Superblock>()],
        )
        .unwrap();
        let logstart = sb.logstart();

        env.disk.poke(logstart + 1, content);
        let mut header = [0u8; BSIZE];
        header[..4].copy_from_slice(&1u32.to_le_bytes());
        header[4..8].copy_from_slice(&home.to_le_bytes());
        env.disk.poke(logstart, &header);
    }

    /// Property P1 / scenario S2: after a crash past the commit point,
    /// boot replays the transaction.
    #[test]
    fn committed_transaction_is_replayed_at_boot() {
        // Stage the crash state on a fresh image, then boot a second
        // kernel over the same bytes.
        let staging = boot_with_image(&basic_image());
        let sb_block = staging.disk.peek(1);
        let sb = crate::fs::Superblock::read_from(
            &sb_block[..core::mem::size_of::<crate::fs::Superblock>()],
        )
        .unwrap();
        let home = sb.datastart() + 500;
        let mut content = [0u8; BSIZE];
        content[..7].copy_from_slice(b"replay!");
        plant_committed_log(&staging, home, &content);

        let image: Vec<u8> = staging.disk.snapshot().concat();
        let reboot = boot_with_image(&image);
        // fs().init ran during boot; recovery must have installed the
        // block and released the log.
        assert_eq!(&reboot.disk.peek(home)[..7], b"replay!");
        let logstart = sb.logstart();
        assert_eq!(&reboot.disk.peek(logstart)[..4], &[0, 0, 0, 0]);
    }

    /// The flip side: a crash before the commit point loses the
    /// transaction entirely.
    #[test]
    fn uncommitted_log_data_is_ignored() {
        let staging = boot_with_image(&basic_image());
        let sb_block = staging.disk.peek(1);
        let sb = crate::fs::Superblock::read_from(
            &sb_block[..core::mem::size_of::<crate::fs::Superblock>()],
        )
        .unwrap();
        let home = sb.datastart() + 500;
        let mut junk = [0u8; BSIZE];
        junk[..4].copy_from_slice(b"junk");
        // Log data present but the header still says n = 0.
        staging.disk.poke(sb.logstart() + 1, &junk);

        let image: Vec<u8> = staging.disk.snapshot().concat();
        let reboot = boot_with_image(&image);
        assert_eq!(reboot.disk.peek(home), [0u8; BSIZE]);
    }

    /// A committed write survives "power loss" (reboot over the same
    /// bytes) even though the buffer cache is gone.
    #[test]
    fn committed_writes_are_durable() {
        let env = boot_with_image(&basic_image());
        write_file(&env, b"/tmp/durable", b"survives reboot", 0o644);
        let image: Vec<u8> = env.disk.snapshot().concat();
        let reboot = boot_with_image(&image);
        assert_eq!(read_file(&reboot, b"/tmp/durable"), b"survives reboot");
    }

    #[test]
    fn log_header_fits_a_block() {
        assert!(4 + 4 * LOGSIZE <= BSIZE);
    }
}

mod pipes {
    use super::*;

    /// Property P7: bytes emerge in write order.
    #[test]
    fn fifo_order_and_eof() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        sys(&ctx, &[0x3000]);
        assert_eq!(syscall::sys_pipe(&ctx), Ok(0));
        let mut fds = [0u8; 8];
        ctx.copy_in_bytes(&mut fds, UVAddr::new(0x3000)).unwrap();
        let rfd = i32::from_le_bytes(fds[..4].try_into().unwrap()) as u32;
        let wfd = i32::from_le_bytes(fds[4..].try_into().unwrap()) as u32;

        let msg = b"in order, byte by byte";
        let buf = ustr(&ctx, msg, 0x3100);
        sys(&ctx, &[wfd, buf, msg.len() as u32]);
        assert_eq!(syscall::sys_write(&ctx), Ok(msg.len()));

        sys(&ctx, &[rfd, 0x3200, 8]);
        assert_eq!(syscall::sys_read(&ctx), Ok(8));
        sys(&ctx, &[rfd, 0x3208, 64]);
        assert_eq!(syscall::sys_read(&ctx), Ok(msg.len() - 8));
        let mut back = vec![0u8; msg.len()];
        ctx.copy_in_bytes(&mut back, UVAddr::new(0x3200)).unwrap();
        assert_eq!(&back, msg);

        // Close the writer: EOF on the reader.
        sys(&ctx, &[wfd]);
        assert_eq!(syscall::sys_close(&ctx), Ok(0));
        sys(&ctx, &[rfd, 0x3200, 16]);
        assert_eq!(syscall::sys_read(&ctx), Ok(0));

        // Close the reader: writes fail.
        sys(&ctx, &[rfd]);
        assert_eq!(syscall::sys_close(&ctx), Ok(0));
    }

    #[test]
    fn write_to_closed_reader_fails() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        sys(&ctx, &[0x3000]);
        assert_eq!(syscall::sys_pipe(&ctx), Ok(0));
        let mut fds = [0u8; 8];
        ctx.copy_in_bytes(&mut fds, UVAddr::new(0x3000)).unwrap();
        let rfd = i32::from_le_bytes(fds[..4].try_into().unwrap()) as u32;
        let wfd = i32::from_le_bytes(fds[4..].try_into().unwrap()) as u32;

        sys(&ctx, &[rfd]);
        assert_eq!(syscall::sys_close(&ctx), Ok(0));
        let buf = ustr(&ctx, b"x", 0x3100);
        sys(&ctx, &[wfd, buf, 1]);
        assert!(matches!(syscall::sys_write(&ctx), Err(KernelError::EPIPE)));
    }
}

mod fifos {
    use super::*;

    #[test]
    fn nonblocking_reader_succeeds_writer_needs_reader() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        sys(&ctx, &[ustr(&ctx, b"/tmp/p", 0x3000), 0o666]);
        assert_eq!(syscall::sys_mkfifo(&ctx), Ok(0));

        // A writer with no reader: ENXIO under O_NONBLOCK.
        sys(
            &ctx,
            &[
                ustr(&ctx, b"/tmp/p", 0x3000),
                (OpenFlags::O_WRONLY | OpenFlags::O_NONBLOCK).bits(),
            ],
        );
        assert!(matches!(syscall::sys_open(&ctx), Err(KernelError::ENXIO)));

        // A reader alone is fine (POSIX).
        sys(
            &ctx,
            &[
                ustr(&ctx, b"/tmp/p", 0x3000),
                OpenFlags::O_NONBLOCK.bits(),
            ],
        );
        let rfd = syscall::sys_open(&ctx).expect("reader") as u32;

        // Now the writer can come in and data flows.
        sys(
            &ctx,
            &[
                ustr(&ctx, b"/tmp/p", 0x3000),
                (OpenFlags::O_WRONLY | OpenFlags::O_NONBLOCK).bits(),
            ],
        );
        let wfd = syscall::sys_open(&ctx).expect("writer") as u32;
        let buf = ustr(&ctx, b"through the fifo", 0x3100);
        sys(&ctx, &[wfd, buf, 16]);
        assert_eq!(syscall::sys_write(&ctx), Ok(16));
        sys(&ctx, &[rfd, 0x3200, 32]);
        assert_eq!(syscall::sys_read(&ctx), Ok(16));

        sys(&ctx, &[ustr(&ctx, b"/tmp/p", 0x3000)]);
        assert_eq!(syscall::sys_unlink(&ctx), Ok(0));
        sys(&ctx, &[rfd]);
        assert_eq!(syscall::sys_close(&ctx), Ok(0));
        sys(&ctx, &[wfd]);
        assert_eq!(syscall::sys_close(&ctx), Ok(0));
    }

    #[test]
    fn rdwr_is_rejected() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        sys(&ctx, &[ustr(&ctx, b"/tmp/p2", 0x3000), 0o666]);
        assert_eq!(syscall::sys_mkfifo(&ctx), Ok(0));
        sys(
            &ctx,
            &[ustr(&ctx, b"/tmp/p2", 0x3000), OpenFlags::O_RDWR.bits()],
        );
        assert!(matches!(syscall::sys_open(&ctx), Err(KernelError::EINVAL)));
    }
}

mod procfs_tests {
    use super::*;

    fn mount_proc(env: &TestEnv) {
        let ctx = env.ctx();
        sys(&ctx, &[ustr(&ctx, b"/proc", 0x3000), 0o555]);
        assert_eq!(syscall::sys_mkdir(&ctx), Ok(0));
        sys(
            &ctx,
            &[ustr(&ctx, b"proc", 0x3080), ustr(&ctx, b"/proc", 0x3000)],
        );
        assert_eq!(syscall::sys_mount(&ctx), Ok(0));
    }

    #[test]
    fn self_pid_file_renders_the_pid() {
        let env = boot_with_image(&basic_image());
        mount_proc(&env);
        let ctx = env.ctx();
        let expect = format!("{}\n", ctx.pid());
        assert_eq!(read_file(&env, b"/proc/self/pid"), expect.as_bytes());
    }

    #[test]
    fn state_and_name_files_render() {
        let env = boot_with_image(&basic_image());
        mount_proc(&env);
        let ctx = env.ctx();
        assert_eq!(read_file(&env, b"/proc/self/state"), b"running\n");
        // The fabricated process has no name yet.
        assert_eq!(read_file(&env, b"/proc/self/name"), b"\n");
        let _ = ctx;
    }

    #[test]
    fn root_lists_processes_and_self() {
        let env = boot_with_image(&basic_image());
        mount_proc(&env);
        let ctx = env.ctx();
        let listing = read_file(&env, b"/proc");
        assert_eq!(listing.len() % core::mem::size_of::<Dirent>(), 0);
        let names: Vec<String> = listing
            .chunks(core::mem::size_of::<Dirent>())
            .map(|chunk| {
                use zerocopy::FromBytes;
                let de = Dirent::read_from(chunk).unwrap();
                String::from_utf8_lossy(de.get_name().as_bytes()).into_owned()
            })
            .collect();
        assert!(names.contains(&".".to_string()));
        assert!(names.contains(&"..".to_string()));
        assert!(names.contains(&"self".to_string()));
        assert!(names.contains(&format!("{}", ctx.pid())));
    }

    #[test]
    fn proc_files_refuse_writes() {
        let env = boot_with_image(&basic_image());
        mount_proc(&env);
        let ctx = env.ctx();
        let tx = ctx.kernel().fs().begin_tx(&ctx);
        let ip = namei(path(b"/proc/self/pid"), &tx, &ctx).unwrap();
        {
            let mut guard = ip.lock(&ctx);
            let r = guard.write_bytes_kernel(b"1", 0, &tx, &ctx);
            assert!(matches!(r, Err(KernelError::EROFS)));
        }
        ip.free((&tx, &ctx));
    }

    #[test]
    fn dotdot_leaves_the_mount() {
        let env = boot_with_image(&basic_image());
        mount_proc(&env);
        // Walking up from /proc lands back in the root filesystem.
        assert_eq!(
            read_file(&env, b"/proc/../etc/group"),
            b"root:x:0:root\n"
        );
    }

    #[test]
    fn nothing_can_be_created_under_proc() {
        let env = boot_with_image(&basic_image());
        mount_proc(&env);
        let ctx = env.ctx();
        sys(&ctx, &[ustr(&ctx, b"/proc/newdir", 0x3000), 0o755]);
        assert!(matches!(
            syscall::sys_mkdir(&ctx),
            Err(KernelError::EROFS) | Err(KernelError::EPERM)
        ));
    }
}

mod process_lifecycle {
    use super::*;

    /// Thread-group bookkeeping of `clone` (scenario S6's setup).
    #[test]
    fn clone_thread_shares_and_joins_the_group() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        let my_mm = ctx.data().mm.unwrap();

        let pid = env
            .kernel
            .procs()
            .clone_proc(
                0x7000,
                CloneFlags::VM | CloneFlags::FILES | CloneFlags::FS | CloneFlags::THREAD,
                &ctx,
            )
            .expect("clone");

        env.kernel
            .procs()
            .with_pid(pid, |p| {
                // SAFETY: the child cannot run (no scheduler in tests).
                let (shared, data) = unsafe { (p.shared(), p.data()) };
                assert_eq!(data.mm.unwrap(), my_mm, "CLONE_VM shares the mm");
                assert_eq!(shared.tgid, ctx.pid(), "thread joins the group");
                assert!(shared.detached);
                assert_eq!(shared.state, ProcState::Runnable);
                assert_eq!(
                    data.tf as usize % PGSIZE,
                    ctx.data().tf as usize % PGSIZE,
                    "trap frame sits at the same stack offset"
                );
                // The child stack override landed.
                assert_eq!(unsafe { (*data.tf).esp }, 0x7000);
            })
            .expect("child exists");
    }

    #[test]
    fn fork_copies_the_address_space() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        ctx.copy_out_bytes(UVAddr::new(0x1000), b"parent data")
            .unwrap();

        let pid = env.kernel.procs().fork(&ctx).expect("fork");
        // Mutate the parent after the fork.
        ctx.copy_out_bytes(UVAddr::new(0x1000), b"parent MUTAT")
            .unwrap();

        env.kernel
            .procs()
            .with_pid(pid, |p| {
                // SAFETY: the child cannot run.
                let data = unsafe { p.data() };
                let child_mm = data.mm.unwrap();
                assert_ne!(child_mm, ctx.data().mm.unwrap());
                let mut buf = [0u8; 11];
                // SAFETY: child_mm is live; the child is not running.
                unsafe { child_mm.as_ref() }
                    .copy_in_bytes(&mut buf, UVAddr::new(0x1000))
                    .unwrap();
                assert_eq!(&buf, b"parent data");
                assert!(!unsafe { p.shared() }.detached);
            })
            .expect("child exists");
    }

    /// Property P4 (wait half): a zombie child is reaped exactly once.
    #[test]
    fn wait_reaps_a_zombie_child() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        let pid = env.kernel.procs().fork(&ctx).expect("fork");

        // The child "exits": release its resources and mark it a
        // zombie, as exit_current would (it cannot run here). The
        // teardown happens outside the table lock, as in exit.
        let child = env
            .kernel
            .procs()
            .with_pid(pid, |p| p as *const crate::proc::Proc)
            .unwrap();
        // SAFETY: the child never runs and is not reaped until wait.
        unsafe {
            let child = &*child;
            let child_ctx = KernelCtx::new(env.kernel, child);
            let data = child.data_mut();
            if let Some(files) = data.files.take() {
                crate::proc::FilesStruct::put(files, &child_ctx);
            }
            if let Some(fs) = data.fs.take() {
                crate::proc::FsInfo::put(fs, &child_ctx);
            }
            if let Some(mm) = data.mm {
                mm.as_ref().drop_regions(&child_ctx);
            }
            let _guard = env.kernel.procs().table();
            child.shared_mut().state = ProcState::Zombie;
        }

        assert_eq!(env.kernel.procs().wait(&ctx), Ok(pid));
        // The pid is gone now.
        assert!(env.kernel.procs().with_pid(pid, |_| ()).is_none());
        // No more children: ECHILD.
        assert!(matches!(
            env.kernel.procs().wait(&ctx),
            Err(KernelError::ECHILD)
        ));
    }

    #[test]
    fn kill_checks_ownership() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        let pid = env.kernel.procs().fork(&ctx).expect("fork");
        env.kernel
            .procs()
            .with_pid(pid, |p| {
                let mut cred = p.cred.lock();
                cred.uid = 42;
                cred.suid = 42;
            })
            .unwrap();

        // A stranger may not kill it.
        {
            let mut cred = ctx.cred();
            cred.uid = 7;
            cred.euid = 7;
        }
        assert!(matches!(
            env.kernel.procs().kill(pid, &ctx),
            Err(KernelError::EPERM)
        ));

        // The owner may.
        {
            let mut cred = ctx.cred();
            cred.uid = 42;
            cred.euid = 42;
        }
        assert_eq!(env.kernel.procs().kill(pid, &ctx), Ok(()));
        env.kernel
            .procs()
            .with_pid(pid, |p| assert!(p.killed()))
            .unwrap();

        assert!(matches!(
            env.kernel.procs().kill(31337, &ctx),
            Err(KernelError::ESRCH)
        ));
    }

    #[test]
    fn kill_group_siblings_marks_the_others() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        let flags = CloneFlags::VM | CloneFlags::FILES | CloneFlags::FS | CloneFlags::THREAD;
        let t1 = env.kernel.procs().clone_proc(0, flags, &ctx).unwrap();
        let t2 = env.kernel.procs().clone_proc(0, flags, &ctx).unwrap();

        env.kernel.procs().kill_group_siblings(&ctx);
        assert!(!ctx.proc().killed(), "the caller is spared");
        for pid in [t1, t2] {
            env.kernel
                .procs()
                .with_pid(pid, |p| assert!(p.killed()))
                .unwrap();
        }
    }
}

mod mmap_tests {
    use super::*;

    fn open_rw(ctx: &KernelCtx<'_>, p: &[u8]) -> u32 {
        sys(ctx, &[ustr(ctx, p, 0x3000), OpenFlags::O_RDWR.bits()]);
        syscall::sys_open(ctx).expect("open") as u32
    }

    #[test]
    fn file_backed_mapping_sees_the_content() {
        let env = boot_with_image(&basic_image());
        write_file(&env, b"/tmp/m", b"mapped bytes here", 0o666);
        let ctx = env.ctx();
        let fd = open_rw(&ctx, b"/tmp/m");
        let f = ctx.file(fd as i32).unwrap();

        let addr = ctx
            .mm()
            .mmap(0, PGSIZE, PROT_READ | PROT_WRITE, MapFlags::SHARED, Some(f), 0, &ctx)
            .expect("mmap");
        let mut buf = [0u8; 17];
        ctx.copy_in_bytes(&mut buf, UVAddr::new(addr)).unwrap();
        assert_eq!(&buf, b"mapped bytes here");
        // Past EOF the page reads zero.
        let mut tail = [0xFFu8; 4];
        ctx.copy_in_bytes(&mut tail, UVAddr::new(addr + 20)).unwrap();
        assert_eq!(tail, [0, 0, 0, 0]);
    }

    /// Scenario S4, single-address-space edition: a dirty shared page
    /// is written back at teardown.
    #[test]
    fn dirty_shared_pages_write_back() {
        let env = boot_with_image(&basic_image());
        write_file(&env, b"/x", &vec![b'.'; PGSIZE], 0o666);
        let ctx = env.ctx();
        let fd = open_rw(&ctx, b"/x");
        let f = ctx.file(fd as i32).unwrap();

        let addr = ctx
            .mm()
            .mmap(0, PGSIZE, PROT_READ | PROT_WRITE, MapFlags::SHARED, Some(f), 0, &ctx)
            .expect("mmap");

        // A user write faults in the dirty bit, then stores.
        ctx.mm().handle_page_fault(addr, true).expect("fault");
        ctx.copy_out_bytes(UVAddr::new(addr), b"hi").unwrap();

        ctx.mm().drop_regions(&ctx);
        assert_eq!(&read_file(&env, b"/x")[..2], b"hi");
    }

    #[test]
    fn fork_shares_shared_regions() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        let addr = ctx
            .mm()
            .mmap(
                0,
                PGSIZE,
                PROT_READ | PROT_WRITE,
                MapFlags::SHARED | MapFlags::ANONYMOUS,
                None,
                0,
                &ctx,
            )
            .expect("mmap");

        let child_mm = ctx.mm().clone_for_fork(&ctx).expect("clone");
        ctx.copy_out_bytes(UVAddr::new(addr), b"ping").unwrap();
        let mut buf = [0u8; 4];
        // SAFETY: the cloned mm has no task; the test owns it.
        unsafe { child_mm.as_ref() }
            .copy_in_bytes(&mut buf, UVAddr::new(addr))
            .unwrap();
        assert_eq!(&buf, b"ping", "the child aliases the same frame");

        // The other way too.
        unsafe { child_mm.as_ref() }
            .copy_out_bytes(UVAddr::new(addr), b"pong")
            .unwrap();
        ctx.copy_in_bytes(&mut buf, UVAddr::new(addr)).unwrap();
        assert_eq!(&buf, b"pong");

        crate::vm::Mm::put(child_mm, &ctx);
    }

    #[test]
    fn fork_duplicates_private_regions() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        let addr = ctx
            .mm()
            .mmap(
                0,
                PGSIZE,
                PROT_READ | PROT_WRITE,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                None,
                0,
                &ctx,
            )
            .expect("mmap");
        ctx.copy_out_bytes(UVAddr::new(addr), b"mine").unwrap();

        let child_mm = ctx.mm().clone_for_fork(&ctx).expect("clone");
        ctx.copy_out_bytes(UVAddr::new(addr), b"MINE").unwrap();
        let mut buf = [0u8; 4];
        // SAFETY: the cloned mm has no task; the test owns it.
        unsafe { child_mm.as_ref() }
            .copy_in_bytes(&mut buf, UVAddr::new(addr))
            .unwrap();
        assert_eq!(&buf, b"mine", "the child kept its own copy");
        crate::vm::Mm::put(child_mm, &ctx);
    }

    #[test]
    fn page_fault_outside_regions_is_refused() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        assert!(ctx.mm().handle_page_fault(0x40_0000, true).is_err());
        // Read faults are never admitted.
        let addr = ctx
            .mm()
            .mmap(
                0,
                PGSIZE,
                PROT_READ | PROT_WRITE,
                MapFlags::SHARED | MapFlags::ANONYMOUS,
                None,
                0,
                &ctx,
            )
            .unwrap();
        assert!(ctx.mm().handle_page_fault(addr, false).is_err());
    }

    #[test]
    fn mmap_requires_shared_or_private() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        assert!(matches!(
            ctx.mm()
                .mmap(0, PGSIZE, PROT_READ, MapFlags::ANONYMOUS, None, 0, &ctx),
            Err(KernelError::EINVAL)
        ));
    }

    #[test]
    fn file_backed_mapping_demands_matching_access() {
        let env = boot_with_image(&basic_image());
        write_file(&env, b"/tmp/ro", b"read only", 0o644);
        let ctx = env.ctx();
        sys(
            &ctx,
            &[ustr(&ctx, b"/tmp/ro", 0x3000), OpenFlags::O_RDONLY.bits()],
        );
        let fd = syscall::sys_open(&ctx).unwrap() as i32;
        let f = ctx.file(fd).unwrap();
        assert!(matches!(
            ctx.mm().mmap(
                0,
                PGSIZE,
                PROT_READ | PROT_WRITE,
                MapFlags::SHARED,
                Some(f),
                0,
                &ctx
            ),
            Err(KernelError::EACCES)
        ));
    }
}

mod exec_tests {
    use super::*;

    /// A minimal ELF32 with one PT_LOAD segment of `code`.
    fn tiny_elf(code: &[u8], entry: u32) -> Vec<u8> {
        let ehsize = 52u32;
        let phsize = 32u32;
        let file_off = ehsize + phsize; // code right after the headers
        let mut elf = Vec::new();
        // ElfHdr
        elf.extend_from_slice(&0x464c_457fu32.to_le_bytes()); // magic
        elf.extend_from_slice(&[1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]); // ident tail
        elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        elf.extend_from_slice(&3u16.to_le_bytes()); // EM_386
        elf.extend_from_slice(&1u32.to_le_bytes()); // version
        elf.extend_from_slice(&entry.to_le_bytes());
        elf.extend_from_slice(&ehsize.to_le_bytes()); // phoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // shoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // flags
        elf.extend_from_slice(&(ehsize as u16).to_le_bytes());
        elf.extend_from_slice(&(phsize as u16).to_le_bytes());
        elf.extend_from_slice(&1u16.to_le_bytes()); // phnum
        elf.extend_from_slice(&0u16.to_le_bytes());
        elf.extend_from_slice(&0u16.to_le_bytes());
        elf.extend_from_slice(&0u16.to_le_bytes());
        assert_eq!(elf.len(), ehsize as usize);
        // ProgHdr: load `code` at vaddr 0. The file content below
        // file_off lands in the image too; that is fine.
        elf.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        elf.extend_from_slice(&0u32.to_le_bytes()); // off
        elf.extend_from_slice(&0u32.to_le_bytes()); // vaddr
        elf.extend_from_slice(&0u32.to_le_bytes()); // paddr
        let filesz = file_off + code.len() as u32;
        elf.extend_from_slice(&filesz.to_le_bytes()); // filesz
        elf.extend_from_slice(&filesz.to_le_bytes()); // memsz
        elf.extend_from_slice(&5u32.to_le_bytes()); // R+X
        elf.extend_from_slice(&(PGSIZE as u32).to_le_bytes()); // align
        elf.extend_from_slice(code);
        elf
    }

    /// Reads back `[argc, argv...]` words from the committed user
    /// stack.
    fn read_stack_words(ctx: &KernelCtx<'_>, n: usize) -> Vec<u32> {
        let esp = ctx.trap_frame().esp as usize;
        let mut words = Vec::new();
        for i in 0..n {
            let mut w = [0u8; 4];
            ctx.copy_in_bytes(&mut w, UVAddr::new(esp + 4 * i)).unwrap();
            words.push(u32::from_le_bytes(w));
        }
        words
    }

    fn read_ustr(ctx: &KernelCtx<'_>, at: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let mut addr = at as usize;
        loop {
            let mut b = [0u8; 1];
            ctx.copy_in_bytes(&mut b, UVAddr::new(addr)).unwrap();
            if b[0] == 0 {
                break;
            }
            out.push(b[0]);
            addr += 1;
        }
        out
    }

    #[test]
    fn execve_replaces_the_image_and_builds_the_stack() {
        let env = boot_with_image(
            &ImageBuilder::new()
                .dir("/bin", 0o755, 0, 0)
                .file("/bin/prog", &tiny_elf(b"\x90\x90", 0x54), 0o755, 0, 0)
                .build(),
        );
        let ctx = env.ctx();

        // execve("/bin/prog", ["prog", "a1"], ["K=V"]) with the vectors
        // in user memory.
        let p = ustr(&ctx, b"/bin/prog", 0x3000);
        let a0 = ustr(&ctx, b"prog", 0x3020);
        let a1 = ustr(&ctx, b"a1", 0x3030);
        let e0 = ustr(&ctx, b"K=V", 0x3040);
        for (at, v) in [(0x3100, a0), (0x3104, a1), (0x3108, 0)] {
            ctx.copy_out_bytes(UVAddr::new(at), &v.to_le_bytes()).unwrap();
        }
        for (at, v) in [(0x3200, e0), (0x3204, 0u32)] {
            ctx.copy_out_bytes(UVAddr::new(at), &v.to_le_bytes()).unwrap();
        }
        sys(&ctx, &[p, 0x3100, 0x3200]);
        assert_eq!(syscall::sys_execve(&ctx), Ok(2), "argc comes back");

        assert_eq!(ctx.trap_frame().eip, 0x54, "entry point installed");
        let words = read_stack_words(&ctx, 6);
        assert_eq!(words[0], 2, "argc");
        assert_eq!(read_ustr(&ctx, words[1]), b"prog");
        assert_eq!(read_ustr(&ctx, words[2]), b"a1");
        assert_eq!(words[3], 0, "argv terminator");
        assert_eq!(read_ustr(&ctx, words[4]), b"K=V");
        assert_eq!(words[5], 0, "envp terminator");

        // The old user memory is gone: the image now starts with the
        // ELF bytes.
        let mut head = [0u8; 4];
        ctx.copy_in_bytes(&mut head, UVAddr::new(0)).unwrap();
        assert_eq!(head, 0x464c_457fu32.to_le_bytes());

        // The process is named after the binary.
        assert_eq!(&ctx.data().name[..4], b"prog");
    }

    /// Scenario S1: a set-uid `#!` script runs its interpreter with the
    /// script owner's identity and the rewritten argv.
    #[test]
    fn setuid_shebang_script() {
        let env = boot_with_image(
            &ImageBuilder::new()
                .dir("/bin", 0o755, 0, 0)
                .file("/bin/sh", &tiny_elf(b"\x90", 0), 0o755, 0, 0)
                .entry(ox6_mkfs::Entry {
                    path: "/bin/foo".into(),
                    content: ox6_mkfs::Content::File(b"#!/bin/sh -x\necho hi\n".to_vec()),
                    mode: 0o4755,
                    uid: 0,
                    gid: 0,
                })
                .build(),
        );
        let ctx = env.ctx();
        {
            let mut cred = ctx.cred();
            cred.uid = 5;
            cred.euid = 5;
            cred.suid = 5;
        }

        let p = ustr(&ctx, b"/bin/foo", 0x3000);
        let a0 = ustr(&ctx, b"foo", 0x3020);
        let a1 = ustr(&ctx, b"a", 0x3028);
        for (at, v) in [(0x3100, a0), (0x3104, a1), (0x3108, 0)] {
            ctx.copy_out_bytes(UVAddr::new(at), &v.to_le_bytes()).unwrap();
        }
        ctx.copy_out_bytes(UVAddr::new(0x3200), &0u32.to_le_bytes())
            .unwrap();
        sys(&ctx, &[p, 0x3100, 0x3200]);
        assert_eq!(syscall::sys_execve(&ctx), Ok(4));

        let words = read_stack_words(&ctx, 5);
        assert_eq!(words[0], 4, "argc");
        assert_eq!(read_ustr(&ctx, words[1]), b"/bin/sh");
        assert_eq!(read_ustr(&ctx, words[2]), b"-x");
        assert_eq!(read_ustr(&ctx, words[3]), b"/bin/foo");
        assert_eq!(read_ustr(&ctx, words[4]), b"a");

        let cred = ctx.cred();
        assert_eq!(cred.euid, 0, "set-uid to the script owner");
        assert_eq!(cred.suid, 5, "saved id keeps the old euid");
        assert_eq!(cred.uid, 5, "real uid unchanged");
    }

    #[test]
    fn shebang_recursion_is_bounded() {
        let env = boot_with_image(
            &ImageBuilder::new()
                .file("/loop", b"#!/loop\n", 0o755, 0, 0)
                .build(),
        );
        let ctx = env.ctx();
        let p = ustr(&ctx, b"/loop", 0x3000);
        let a0 = ustr(&ctx, b"loop", 0x3020);
        for (at, v) in [(0x3100, a0), (0x3104, 0)] {
            ctx.copy_out_bytes(UVAddr::new(at), &v.to_le_bytes()).unwrap();
        }
        ctx.copy_out_bytes(UVAddr::new(0x3200), &0u32.to_le_bytes())
            .unwrap();
        sys(&ctx, &[p, 0x3100, 0x3200]);
        assert!(matches!(
            syscall::sys_execve(&ctx),
            Err(KernelError::ELOOP)
        ));
    }

    #[test]
    fn exec_needs_the_execute_bit() {
        let env = boot_with_image(
            &ImageBuilder::new()
                .file("/noexec", &tiny_elf(b"\x90", 0), 0o644, 0, 0)
                .build(),
        );
        let ctx = env.ctx();
        {
            let mut cred = ctx.cred();
            cred.uid = 5;
            cred.euid = 5;
        }
        let p = ustr(&ctx, b"/noexec", 0x3000);
        ctx.copy_out_bytes(UVAddr::new(0x3100), &0u32.to_le_bytes())
            .unwrap();
        ctx.copy_out_bytes(UVAddr::new(0x3200), &0u32.to_le_bytes())
            .unwrap();
        sys(&ctx, &[p, 0x3100, 0x3200]);
        assert!(matches!(
            syscall::sys_execve(&ctx),
            Err(KernelError::EACCES)
        ));
    }

    #[test]
    fn garbage_is_enoexec() {
        let env = boot_with_image(
            &ImageBuilder::new()
                .file("/garbage", b"this is not an executable", 0o755, 0, 0)
                .build(),
        );
        let ctx = env.ctx();
        let p = ustr(&ctx, b"/garbage", 0x3000);
        ctx.copy_out_bytes(UVAddr::new(0x3100), &0u32.to_le_bytes())
            .unwrap();
        ctx.copy_out_bytes(UVAddr::new(0x3200), &0u32.to_le_bytes())
            .unwrap();
        sys(&ctx, &[p, 0x3100, 0x3200]);
        assert!(matches!(
            syscall::sys_execve(&ctx),
            Err(KernelError::ENOEXEC)
        ));
    }
}

mod open_close_refcounts {
    use super::*;

    /// Property P4 (open/close half): reference counts return to their
    /// starting point.
    #[test]
    fn open_then_close_restores_counts() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();

        sys(
            &ctx,
            &[ustr(&ctx, b"/etc/passwd", 0x3000), OpenFlags::O_RDONLY.bits()],
        );
        let fd = syscall::sys_open(&ctx).unwrap() as u32;

        // dup and close twice: the inode reference drains fully.
        sys(&ctx, &[fd]);
        let fd2 = syscall::sys_dup(&ctx).unwrap() as u32;
        sys(&ctx, &[fd]);
        assert_eq!(syscall::sys_close(&ctx), Ok(0));
        sys(&ctx, &[fd2]);
        assert_eq!(syscall::sys_close(&ctx), Ok(0));

        // The file table slot is reusable: open NFILE times over.
        for _ in 0..3 {
            sys(
                &ctx,
                &[ustr(&ctx, b"/etc/passwd", 0x3000), OpenFlags::O_RDONLY.bits()],
            );
            let fd = syscall::sys_open(&ctx).unwrap() as u32;
            sys(&ctx, &[fd]);
            assert_eq!(syscall::sys_close(&ctx), Ok(0));
        }
    }

    #[test]
    fn fstat_reports_inode_metadata() {
        let env = boot_with_image(&basic_image());
        let ctx = env.ctx();
        sys(
            &ctx,
            &[ustr(&ctx, b"/etc/group", 0x3000), OpenFlags::O_RDONLY.bits()],
        );
        let fd = syscall::sys_open(&ctx).unwrap() as u32;
        sys(&ctx, &[fd, 0x3500]);
        assert_eq!(syscall::sys_fstat(&ctx), Ok(0));
        let mut raw = [0u8; core::mem::size_of::<crate::fs::Stat>()];
        ctx.copy_in_bytes(&mut raw, UVAddr::new(0x3500)).unwrap();
        use zerocopy::FromBytes;
        let st = crate::fs::Stat::read_from(&raw[..]).unwrap();
        assert_eq!(st.size as usize, b"root:x:0:root\n".len());
        assert_eq!(st.mode & 0o777, 0o644);
        assert_eq!(st.uid, 0);
    }
}
