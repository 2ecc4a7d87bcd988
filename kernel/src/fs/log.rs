//! Write-ahead log: atomic multi-block transactions with crash recovery.
//!
//! One transaction runs at a time, serialized by a busy flag; a second
//! `begin_op` sleeps until the first commits. Between `begin_op` and the
//! commit, modified buffers are pinned in the cache and only their block
//! numbers are recorded; nothing reaches the disk.
//!
//! The on-disk log region holds a header block `{n, block[0..n]}`
//! followed by `n` data blocks. Commit order is what makes this atomic:
//!
//! 1. copy the modified cache buffers into the log data blocks,
//! 2. write the header with `n > 0`  — the commit point,
//! 3. copy the log blocks to their home locations,
//! 4. write the header with `n = 0` — the release point.
//!
//! A crash before step 2 loses the whole transaction; a crash after it
//! is repaired at boot by re-running step 3 from the header.

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::{lock_entry, BcacheExt, BufUnlocked};
use crate::lock::SleepableLock;
use crate::param::{BSIZE, LOGSIZE};
use crate::proc::KernelCtx;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

// The header must fit in the first log block.
const_assert!(core::mem::size_of::<LogHeader>() <= BSIZE);

pub struct Log {
    dev: u32,
    /// First block of the log region (the header).
    start: u32,
    /// Log blocks available, header included.
    size: u32,
    /// A transaction is in flight; others wait.
    busy: bool,
    /// The task owning the transaction. A nested `begin_op` by the
    /// owner (a file close inside a running operation) deepens the
    /// same transaction instead of deadlocking on itself.
    owner: usize,
    depth: u32,
    /// Committing; used to assert against re-entry.
    committing: bool,
    /// Cache handles of the blocks the transaction modified, pinned so
    /// eviction cannot lose them before commit.
    lh: ArrayVec<BufUnlocked, LOGSIZE>,
}

impl Log {
    /// Sets up the log and performs crash recovery: a non-empty on-disk
    /// header means a committed transaction did not finish installing;
    /// re-run the install and release it.
    pub fn new(dev: u32, start: u32, size: u32, ctx: &KernelCtx<'_>) -> Self {
        let mut log = Self {
            dev,
            start,
            size,
            busy: false,
            owner: 0,
            depth: 0,
            committing: false,
            lh: ArrayVec::new(),
        };
        log.recover(ctx);
        log
    }

    fn recover(&mut self, ctx: &KernelCtx<'_>) {
        let head = read_head(self.dev, self.start, ctx);
        if head.n > 0 {
            log::info!("log: recovering {} blocks", head.n);
            // Re-run the copy-out: log data block i belongs at home
            // location block[i].
            for i in 0..head.n {
                let lbuf = ctx
                    .kernel()
                    .bcache()
                    .read(self.dev, self.start + 1 + i, ctx);
                let mut dbuf = ctx
                    .kernel()
                    .bcache()
                    .read(self.dev, head.block[i as usize], ctx);
                dbuf.data_mut().inner.copy_from_slice(&lbuf.data().inner);
                dbuf.write_to_disk(ctx.kernel());
            }
        }
        // Release the log.
        let empty = LogHeader {
            n: 0,
            block: [0; LOGSIZE],
        };
        write_head(self.dev, self.start, &empty, ctx);
    }

    /// Claims the log for a transaction, sleeping while another task's
    /// is in flight. Re-entry by the owner nests.
    pub fn begin_op(this: &SleepableLock<Log>, ctx: &KernelCtx<'_>) {
        let me = ctx.proc() as *const _ as usize;
        let mut guard = this.lock();
        while guard.busy {
            if guard.owner == me {
                guard.depth += 1;
                return;
            }
            guard.sleep(ctx);
        }
        guard.busy = true;
        guard.owner = me;
        guard.depth = 1;
    }

    /// Records that `buf`'s block belongs to the current transaction.
    /// The actual disk write is deferred until commit; a block written
    /// twice is absorbed into one slot.
    pub fn log_write(this: &SleepableLock<Log>, buf: crate::bio::Buf<'_>) {
        let mut guard = this.lock();
        assert!(guard.busy, "log_write outside of transaction");
        assert!(
            guard.lh.len() < LOGSIZE && (guard.lh.len() as u32) < guard.size - 1,
            "too big a transaction"
        );
        let blockno = buf.blockno();
        if guard.lh.iter().any(|b| b.blockno() == blockno) {
            // Absorption: already queued.
            return;
        }
        guard.lh.push(buf.unlock());
    }

    /// Commits the transaction and releases the log. Nested levels just
    /// unwind; the outermost end commits.
    pub fn end_op(this: &SleepableLock<Log>, ctx: &KernelCtx<'_>) {
        let pinned: ArrayVec<BufUnlocked, LOGSIZE> = {
            let mut guard = this.lock();
            assert!(guard.busy, "end_op outside of transaction");
            assert!(!guard.committing, "end_op while committing");
            guard.depth -= 1;
            if guard.depth > 0 {
                return;
            }
            guard.committing = true;
            let pinned = core::mem::take(&mut guard.lh);
            drop(guard);
            pinned
        };

        // Commit without the lock held: the busy flag keeps every other
        // transaction out, and the disk writes below may sleep.
        if !pinned.is_empty() {
            Self::commit(this, &pinned, ctx);
        }
        for b in pinned {
            b.free(());
        }

        let mut guard = this.lock();
        guard.committing = false;
        guard.busy = false;
        guard.owner = 0;
        guard.wakeup(ctx.kernel());
    }

    fn commit(this: &SleepableLock<Log>, pinned: &ArrayVec<BufUnlocked, LOGSIZE>, ctx: &KernelCtx<'_>) {
        let (dev, start) = {
            let guard = this.lock();
            (guard.dev, guard.start)
        };

        // Step 1: copy the modified buffers into the log data blocks.
        for (i, home) in pinned.iter().enumerate() {
            let mut lbuf = ctx.kernel().bcache().read(dev, start + 1 + i as u32, ctx);
            let hbuf = lock_entry(home.clone(), ctx);
            lbuf.data_mut().inner.copy_from_slice(&hbuf.data().inner);
            drop(hbuf);
            lbuf.write_to_disk(ctx.kernel());
        }

        // Step 2: the commit point.
        let mut head = LogHeader {
            n: pinned.len() as u32,
            block: [0; LOGSIZE],
        };
        for (slot, b) in izip!(&mut head.block, pinned) {
            *slot = b.blockno();
        }
        write_head(dev, start, &head, ctx);

        // Step 3: install the blocks in their home locations.
        for home in pinned {
            let mut hbuf = lock_entry(home.clone(), ctx);
            hbuf.write_to_disk(ctx.kernel());
        }

        // Step 4: the release point.
        head.n = 0;
        write_head(dev, start, &head, ctx);
    }
}

fn read_head(dev: u32, start: u32, ctx: &KernelCtx<'_>) -> LogHeader {
    let buf = ctx.kernel().bcache().read(dev, start, ctx);
    LogHeader::read_from(&buf.data().inner[..core::mem::size_of::<LogHeader>()])
        .expect("log header")
}

fn write_head(dev: u32, start: u32, head: &LogHeader, ctx: &KernelCtx<'_>) {
    let mut buf = ctx.kernel().bcache().read(dev, start, ctx);
    buf.data_mut().inner[..core::mem::size_of::<LogHeader>()].copy_from_slice(head.as_bytes());
    buf.write_to_disk(ctx.kernel());
}
