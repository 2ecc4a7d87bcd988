//! Homogeneous reference-counted object pools.
//!
//! An arena owns a fixed array of entries, each carrying a reference
//! count; `Rc` is a counted handle into an arena. The file table and the
//! inode cache use `ArrayArena`; the buffer cache uses `MruArena`, whose
//! entries additionally sit on an intrusive list kept in
//! most-recently-used order.
//!
//! Handles must be released explicitly with `Rc::free(ctx)`: finalizing an
//! object may need kernel context (dropping an inode can write to disk),
//! which a `Drop` impl cannot take. A leaked handle panics.

use core::mem;
use core::ops::Deref;
use core::ptr;

use crate::list::ListEntry;
use crate::lock::SpinLock;

/// Objects that live in an arena.
pub trait ArenaObject {
    /// Context `finalize` needs (e.g. an open transaction).
    type FreeCtx<'a>;

    /// Called with the last handle when the reference count drops to zero.
    /// The arena lock is *not* held during the call.
    fn finalize(&mut self, ctx: Self::FreeCtx<'_>);
}

pub struct Entry<T> {
    refcnt: usize,
    data: T,
}

impl<T> Entry<T> {
    pub const fn new(data: T) -> Self {
        Self { refcnt: 0, data }
    }

    pub fn data(&self) -> &T {
        &self.data
    }
}

/// A homogeneous pool allocating from a fixed array.
pub struct ArrayArena<T, const N: usize> {
    entries: [Entry<T>; N],
}

impl<T, const N: usize> ArrayArena<T, N> {
    pub const fn new(entries: [Entry<T>; N]) -> Self {
        Self { entries }
    }
}

/// Builds an `ArrayArena` from a const initializer expression.
#[macro_export]
macro_rules! array_arena {
    ($init:expr; $n:expr) => {
        $crate::arena::ArrayArena::new([const { $crate::arena::Entry::new($init) }; $n])
    };
}

/// A homogeneous pool whose entries are kept on a most-recently-used
/// list. Lookups scan from the most recent entry; free slots are taken
/// from the least recent end.
pub struct MruArena<T, const N: usize> {
    entries: [MruEntry<T>; N],
    head: ListEntry,
}

pub struct MruEntry<T> {
    link: ListEntry,
    entry: Entry<T>,
}

impl<T> MruEntry<T> {
    pub const fn new(data: T) -> Self {
        Self {
            link: ListEntry::new(),
            entry: Entry::new(data),
        }
    }
}

/// Builds an `MruArena` from a const initializer expression.
#[macro_export]
macro_rules! mru_arena {
    ($init:expr; $n:expr) => {
        $crate::arena::MruArena::new([const { $crate::arena::MruEntry::new($init) }; $n])
    };
}

impl<T, const N: usize> MruArena<T, N> {
    pub const fn new(entries: [MruEntry<T>; N]) -> Self {
        Self {
            entries,
            head: ListEntry::new(),
        }
    }

    /// Links every entry onto the MRU list. Must be called once, after the
    /// arena has reached its final address.
    pub fn init(&self) {
        assert!(self.head.is_unlinked(), "MruArena initialized twice");
        self.head.init();
        for e in &self.entries {
            self.head.push_back(&e.link);
        }
    }

    /// Entry containing a given link.
    ///
    /// # Safety
    ///
    /// `link` must be the `link` field of an `MruEntry<T>`.
    unsafe fn entry_of(link: *const ListEntry) -> *mut Entry<T> {
        // SAFETY: per the contract.
        unsafe {
            let mru = (link as *const u8).sub(mem::offset_of!(MruEntry<T>, link))
                as *mut MruEntry<T>;
            &mut (*mru).entry
        }
    }

    /// Link of a given entry.
    ///
    /// # Safety
    ///
    /// `entry` must be the `entry` field of an `MruEntry<T>`.
    unsafe fn link_of(entry: *mut Entry<T>) -> *const ListEntry {
        // SAFETY: per the contract.
        unsafe {
            let mru = (entry as *const u8).sub(mem::offset_of!(MruEntry<T>, entry))
                as *const MruEntry<T>;
            &(*mru).link
        }
    }
}

/// Arenas: pools that vend counted handles.
///
/// # Safety
///
/// Implementations must keep an entry's address stable while its count is
/// nonzero and must serialize count mutations.
pub unsafe trait Arena: Sized + Sync {
    type Data: ArenaObject;

    /// Returns a handle to an entry matching `c`, incrementing its count,
    /// or initializes a free entry with `n`. Returns `None` if the pool is
    /// exhausted.
    fn find_or_alloc(
        &self,
        c: impl Fn(&Self::Data) -> bool,
        n: impl FnOnce(&mut Self::Data),
    ) -> Option<Rc<Self>>;

    /// Returns a handle to a free entry initialized with `f`.
    fn alloc(&self, f: impl FnOnce(&mut Self::Data)) -> Option<Rc<Self>>;

    /// Increments the count of `entry`.
    ///
    /// # Safety
    ///
    /// `entry` must be an entry of this arena with a nonzero count.
    unsafe fn dup(&self, entry: *mut Entry<Self::Data>);

    /// Decrements the count of `entry`, finalizing the object when the
    /// last handle goes away.
    ///
    /// # Safety
    ///
    /// `entry` must be an entry of this arena; the caller gives up one
    /// count.
    unsafe fn dealloc(
        &self,
        entry: *mut Entry<Self::Data>,
        ctx: <Self::Data as ArenaObject>::FreeCtx<'_>,
    );
}

// SAFETY: entries live in a fixed array behind the spinlock; counts only
// change under the lock.
unsafe impl<T: ArenaObject + Send, const N: usize> Arena for SpinLock<ArrayArena<T, N>> {
    type Data = T;

    fn find_or_alloc(
        &self,
        c: impl Fn(&T) -> bool,
        n: impl FnOnce(&mut T),
    ) -> Option<Rc<Self>> {
        let mut guard = self.lock();
        let mut empty: Option<usize> = None;
        let mut found: Option<usize> = None;
        for (i, entry) in guard.entries.iter().enumerate() {
            if entry.refcnt == 0 {
                if empty.is_none() {
                    empty = Some(i);
                }
            } else if found.is_none() && c(&entry.data) {
                found = Some(i);
            }
        }
        let rc = if let Some(i) = found {
            let entry = &mut guard.entries[i];
            entry.refcnt += 1;
            let ptr: *mut Entry<T> = entry;
            // SAFETY: the count was just raised for this handle.
            unsafe { Rc::from_raw(self, ptr) }
        } else {
            let entry = &mut guard.entries[empty?];
            entry.refcnt = 1;
            n(&mut entry.data);
            let ptr: *mut Entry<T> = entry;
            // SAFETY: the count was just raised for this handle.
            unsafe { Rc::from_raw(self, ptr) }
        };
        Some(rc)
    }

    fn alloc(&self, f: impl FnOnce(&mut T)) -> Option<Rc<Self>> {
        let mut guard = self.lock();
        for i in 0..N {
            if guard.entries[i].refcnt == 0 {
                let entry = &mut guard.entries[i];
                entry.refcnt = 1;
                f(&mut entry.data);
                let ptr: *mut Entry<T> = entry;
                // SAFETY: the count was just raised for this handle.
                return Some(unsafe { Rc::from_raw(self, ptr) });
            }
        }
        None
    }

    unsafe fn dup(&self, entry: *mut Entry<T>) {
        let _guard = self.lock();
        // SAFETY: entry is in this arena and the lock is held.
        unsafe { (*entry).refcnt += 1 };
    }

    unsafe fn dealloc(&self, entry: *mut Entry<T>, ctx: T::FreeCtx<'_>) {
        let mut guard = self.lock();
        // SAFETY: entry is in this arena and the lock is held.
        unsafe {
            if (*entry).refcnt == 1 {
                // Finalize outside the arena lock: dropping an inode may
                // sleep on disk I/O. The count stays at 1 meanwhile so the
                // slot cannot be handed out again.
                guard.reacquire_after(|| (*entry).data.finalize(ctx));
                (*entry).refcnt = 0;
            } else {
                (*entry).refcnt -= 1;
            }
        }
    }
}

// SAFETY: entries live in a fixed array behind the spinlock; counts and
// list links only change under the lock.
unsafe impl<T: ArenaObject + Send, const N: usize> Arena for SpinLock<MruArena<T, N>> {
    type Data = T;

    fn find_or_alloc(
        &self,
        c: impl Fn(&T) -> bool,
        n: impl FnOnce(&mut T),
    ) -> Option<Rc<Self>> {
        let guard = self.lock();
        let head: *const ListEntry = &guard.head;

        // Scan from the most recently used entry.
        // SAFETY: the arena lock is held and only MruEntry links are on
        // this list.
        unsafe {
            let mut link = (*head).next() as *const ListEntry;
            while !ptr::eq(link, head) {
                let entry = MruArena::<T, N>::entry_of(link);
                if (*entry).refcnt > 0 && c(&(*entry).data) {
                    (*entry).refcnt += 1;
                    return Some(Rc::from_raw(self, entry));
                }
                link = (*link).next();
            }

            // Recycle the least recently used free entry.
            let mut link = (*head).prev() as *const ListEntry;
            while !ptr::eq(link, head) {
                let entry = MruArena::<T, N>::entry_of(link);
                if (*entry).refcnt == 0 {
                    (*entry).refcnt = 1;
                    n(&mut (*entry).data);
                    return Some(Rc::from_raw(self, entry));
                }
                link = (*link).prev();
            }
        }
        drop(guard);
        None
    }

    fn alloc(&self, f: impl FnOnce(&mut T)) -> Option<Rc<Self>> {
        self.find_or_alloc(|_| false, f)
    }

    unsafe fn dup(&self, entry: *mut Entry<T>) {
        let _guard = self.lock();
        // SAFETY: entry is in this arena and the lock is held.
        unsafe { (*entry).refcnt += 1 };
    }

    unsafe fn dealloc(&self, entry: *mut Entry<T>, ctx: T::FreeCtx<'_>) {
        let mut guard = self.lock();
        // SAFETY: entry is in this arena and the lock is held.
        unsafe {
            if (*entry).refcnt == 1 {
                guard.reacquire_after(|| (*entry).data.finalize(ctx));
                (*entry).refcnt = 0;
                // Freshly released: move to the front of the MRU list.
                let link = MruArena::<T, N>::link_of(entry);
                (*link).remove();
                guard.head.push_front(&*link);
            } else {
                (*entry).refcnt -= 1;
            }
        }
    }
}

/// A counted handle to an arena entry. Must be released with `free`;
/// dropping a live handle panics.
pub struct Rc<A: Arena> {
    arena: *const A,
    entry: *mut Entry<A::Data>,
}

// SAFETY: the handle only exposes &A::Data, and count updates go through
// the arena's lock.
unsafe impl<A: Arena> Send for Rc<A> where A::Data: Sync + Send {}
unsafe impl<A: Arena> Sync for Rc<A> where A::Data: Sync + Send {}

impl<A: Arena> Rc<A> {
    /// # Safety
    ///
    /// One count of `entry` is transferred to the new handle.
    pub unsafe fn from_raw(arena: &A, entry: *mut Entry<A::Data>) -> Self {
        Self { arena, entry }
    }

    fn arena(&self) -> &A {
        // SAFETY: arenas are static; the pointer stays valid.
        unsafe { &*self.arena }
    }

    /// Releases this handle, finalizing the object if it was the last one.
    pub fn free(self, ctx: <A::Data as ArenaObject>::FreeCtx<'_>) {
        // SAFETY: self owns one count and is consumed.
        unsafe { self.arena().dealloc(self.entry, ctx) };
        mem::forget(self);
    }

    /// True if both handles refer to the same entry.
    pub fn is_same(&self, other: &Self) -> bool {
        ptr::eq(self.entry, other.entry)
    }
}

impl<A: Arena> Clone for Rc<A> {
    fn clone(&self) -> Self {
        // SAFETY: self holds a count, so the entry is live.
        unsafe { self.arena().dup(self.entry) };
        Self {
            arena: self.arena,
            entry: self.entry,
        }
    }
}

impl<A: Arena> Deref for Rc<A> {
    type Target = A::Data;

    fn deref(&self) -> &A::Data {
        // SAFETY: self holds a count, so the entry is live and its data
        // may be shared.
        unsafe { (*self.entry).data() }
    }
}

impl<A: Arena> Drop for Rc<A> {
    fn drop(&mut self) {
        panic!("arena handle leaked; release it with Rc::free");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Obj {
        id: u32,
        finalized: bool,
    }

    impl ArenaObject for Obj {
        type FreeCtx<'a> = ();

        fn finalize(&mut self, _: ()) {
            self.finalized = true;
        }
    }

    type Pool = SpinLock<ArrayArena<Obj, 4>>;

    fn pool() -> &'static Pool {
        Box::leak(Box::new(SpinLock::new(
            "pool",
            array_arena!(Obj { id: 0, finalized: false }; 4),
        )))
    }

    #[test]
    fn find_or_alloc_dedups() {
        let p = pool();
        let a = p.find_or_alloc(|o| o.id == 7, |o| o.id = 7).unwrap();
        let b = p.find_or_alloc(|o| o.id == 7, |o| o.id = 99).unwrap();
        assert!(a.is_same(&b));
        assert_eq!(b.id, 7);
        a.free(());
        b.free(());
    }

    #[test]
    fn exhaustion_returns_none() {
        let p = pool();
        let handles: Vec<_> = (0..4).map(|i| p.alloc(|o| o.id = i).unwrap()).collect();
        assert!(p.alloc(|o| o.id = 9).is_none());
        for h in handles {
            h.free(());
        }
        let again = p.alloc(|o| o.id = 9).unwrap();
        again.free(());
    }

    #[test]
    fn finalize_runs_on_last_free() {
        let p = pool();
        let a = p.alloc(|o| o.id = 1).unwrap();
        let b = a.clone();
        a.free(());
        // Still referenced: not finalized.
        let c = p
            .find_or_alloc(|o| o.id == 1, |_| panic!("should find"))
            .unwrap();
        assert!(!c.finalized);
        b.free(());
        c.free(());
        let d = p.find_or_alloc(|o| o.id == 1, |o| o.id = 1).unwrap();
        assert!(d.finalized, "finalize ran when the count hit zero");
        d.free(());
    }

    #[test]
    fn mru_recycles_least_recent() {
        let arena: &'static SpinLock<MruArena<Obj, 2>> = Box::leak(Box::new(SpinLock::new(
            "mru",
            mru_arena!(Obj { id: 0, finalized: false }; 2),
        )));
        arena.lock().init();
        let a = arena.find_or_alloc(|o| o.id == 1, |o| o.id = 1).unwrap();
        let b = arena.find_or_alloc(|o| o.id == 2, |o| o.id = 2).unwrap();
        assert!(arena.find_or_alloc(|o| o.id == 3, |o| o.id = 3).is_none());
        a.free(());
        b.free(());
        // Both free now; a hit still works, and a miss recycles.
        let c = arena.find_or_alloc(|o| o.id == 1, |o| o.id = 1).unwrap();
        let d = arena.find_or_alloc(|o| o.id == 3, |o| o.id = 3).unwrap();
        assert_eq!(c.id, 1);
        assert_eq!(d.id, 3);
        c.free(());
        d.free(());
    }
}
