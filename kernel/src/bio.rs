//! Buffer cache.
//!
//! A bounded pool of block buffers in most-recently-used order, at most
//! one per `(dev, blockno)`. The pool metadata is guarded by one
//! spinlock; each buffer's contents sit behind a sleep lock so they can
//! be held across disk I/O.
//!
//! * `Bcache::read` returns a locked buffer with valid contents.
//! * Dropping a `Buf` releases it (the `brelse` of old) and advances its
//!   LRU position.
//! * `Buf::write_to_disk` issues the synchronous write; only the log
//!   calls it.

use core::mem::{self, ManuallyDrop};

use crate::arena::{Arena, ArenaObject, MruArena, Rc};
use crate::kernel::Kernel;
use crate::lock::{SleepLock, SleepLockGuard, SpinLock};
use crate::param::{BSIZE, NBUF};
use crate::proc::KernelCtx;

/// Block contents. The 4-byte alignment lets callers view the data as
/// little-endian words.
#[repr(align(4))]
pub struct BufData {
    pub inner: [u8; BSIZE],
}

impl BufData {
    pub const fn zero() -> Self {
        Self { inner: [0; BSIZE] }
    }

    /// Reads the little-endian u32 at word index `i`.
    pub fn read_u32(&self, i: usize) -> u32 {
        let b = &self.inner[i * 4..i * 4 + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Stores `v` as a little-endian u32 at word index `i`.
    pub fn write_u32(&mut self, i: usize, v: u32) {
        self.inner[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
}

impl core::ops::Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl core::ops::DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

pub struct BufInner {
    /// Has the data been read from disk?
    valid: bool,
    pub data: BufData,
}

pub struct BufEntry {
    dev: u32,
    blockno: u32,
    inner: SleepLock<BufInner>,
}

impl BufEntry {
    pub const fn zero() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            inner: SleepLock::new(BufInner {
                valid: false,
                data: BufData::zero(),
            }),
        }
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }
}

impl ArenaObject for BufEntry {
    type FreeCtx<'a> = ();

    fn finalize(&mut self, _: ()) {
        // The contents were written through the log if they mattered.
    }
}

pub type Bcache = SpinLock<MruArena<BufEntry, NBUF>>;

/// A counted, unlocked handle to a cache slot. The count pins the slot's
/// identity; the log holds these to pin blocks between `log_write` and
/// commit.
pub type BufUnlocked = Rc<Bcache>;

/// A locked buffer with valid ownership of its contents.
pub struct Buf<'s> {
    entry: ManuallyDrop<BufUnlocked>,
    guard: ManuallyDrop<SleepLockGuard<'s, BufInner>>,
}

impl<'s> Buf<'s> {
    pub fn blockno(&self) -> u32 {
        self.entry.blockno
    }

    pub fn dev(&self) -> u32 {
        self.entry.dev
    }

    pub fn data(&self) -> &BufData {
        &self.guard.data
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.guard.data
    }

    /// An extra unlocked handle to this buffer's slot.
    pub fn pin(&self) -> BufUnlocked {
        (*self.entry).clone()
    }

    /// Releases the content lock but keeps the slot pinned.
    pub fn unlock(mut self) -> BufUnlocked {
        // SAFETY: self is forgotten right after the fields are taken.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
            let entry = ManuallyDrop::take(&mut self.entry);
            mem::forget(self);
            entry
        }
    }

    /// Writes the contents to disk synchronously.
    pub fn write_to_disk(&mut self, kernel: &Kernel) {
        let dev = self.entry.dev;
        let bno = self.entry.blockno;
        kernel.bdevs.get(dev).write_block(bno, &self.guard.data.inner);
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // Unlock, then unpin; the arena moves the slot to the head of
        // the MRU list once the last handle is gone.
        // SAFETY: drop runs once; both fields are live here.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
            ManuallyDrop::take(&mut self.entry).free(());
        }
    }
}

/// Extension methods of the buffer cache.
pub trait BcacheExt {
    /// An unlocked handle to the slot caching `(dev, blockno)`.
    fn get_buf(&self, dev: u32, blockno: u32) -> BufUnlocked;

    /// A locked buffer holding the current contents of the block,
    /// reading from the device on a cache miss.
    fn read<'s>(&'s self, dev: u32, blockno: u32, ctx: &KernelCtx<'s>) -> Buf<'s>;

    /// A locked buffer whose contents are all zero, without touching the
    /// device.
    fn zeroed<'s>(&'s self, dev: u32, blockno: u32, ctx: &KernelCtx<'s>) -> Buf<'s>;
}

impl BcacheExt for Bcache {
    fn get_buf(&self, dev: u32, blockno: u32) -> BufUnlocked {
        self.find_or_alloc(
            |buf| buf.dev == dev && buf.blockno == blockno,
            |buf| {
                buf.dev = dev;
                buf.blockno = blockno;
                buf.inner.get_mut().valid = false;
            },
        )
        .expect("bread: no buffers")
    }

    fn read<'s>(&'s self, dev: u32, blockno: u32, ctx: &KernelCtx<'s>) -> Buf<'s> {
        let entry = self.get_buf(dev, blockno);
        let mut buf = lock_entry(entry, ctx);
        if !buf.guard.valid {
            ctx.kernel()
                .bdevs
                .get(dev)
                .read_block(blockno, &mut buf.guard.data.inner);
            buf.guard.valid = true;
        }
        buf
    }

    fn zeroed<'s>(&'s self, dev: u32, blockno: u32, ctx: &KernelCtx<'s>) -> Buf<'s> {
        let entry = self.get_buf(dev, blockno);
        let mut buf = lock_entry(entry, ctx);
        buf.guard.data.inner.fill(0);
        buf.guard.valid = true;
        buf
    }
}

/// Locks an unlocked handle, producing a `Buf`.
pub fn lock_entry<'s>(entry: BufUnlocked, ctx: &KernelCtx<'s>) -> Buf<'s> {
    // SAFETY: the handle pins its slot in the kernel's static cache, and
    // the returned Buf owns the handle, so the reference stays valid for
    // the Buf's whole life.
    let entry_ref: &'s BufEntry = unsafe { &*(&*entry as *const BufEntry) };
    let guard = entry_ref.inner.lock(ctx);
    Buf {
        entry: ManuallyDrop::new(entry),
        guard: ManuallyDrop::new(guard),
    }
}
