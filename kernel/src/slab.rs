//! Slab allocator: fixed-size object caches layered over the page
//! allocator.
//!
//! A cache is parameterized by an object size. Small caches (object * 8 <=
//! page) lay a `PageHeader` and the object array inside one page; large
//! caches use whole pages for objects and keep the header in a
//! `BigPageInfo` record found through a hash table keyed by page address.
//! Each cache keeps three lists: `partial`, `full` (no free blocks) and
//! `empty` (all free). A page whose last block is freed goes straight back
//! to the page allocator, so `empty` only ever holds pages that were just
//! created and not yet carved up.
//!
//! The allocator is serialized by a single lock. The page allocator's lock
//! nests inside it.

use core::mem;
use core::ptr::{self, NonNull};

use crate::arch::mmu::{pgrounddown, PGSIZE};
use crate::kalloc::Kmem;
use crate::list::ListEntry;
use crate::list_entry;
use crate::lock::SpinLock;
use crate::page::Page;

/// Hash buckets for large-object page headers.
const NHASH: usize = 1024;

/// Maximum number of caches.
const NCACHE: usize = 32;

/// Handle to a created cache.
#[derive(Clone, Copy)]
pub struct CacheId(usize);

#[repr(C)]
struct PageHeader {
    /// Index of the owning cache.
    cache: usize,
    /// Head of the free-block list threaded through the page.
    free_block: *mut u8,
    free_count: usize,
    link: ListEntry,
}

struct BigPageInfo {
    page: usize,
    header: PageHeader,
    next: *mut BigPageInfo,
}

struct CacheInfo {
    block_size: usize,
    partial: ListEntry,
    full: ListEntry,
    empty: ListEntry,
}

impl CacheInfo {
    const fn unused() -> Self {
        Self {
            block_size: 0,
            partial: ListEntry::new(),
            full: ListEntry::new(),
            empty: ListEntry::new(),
        }
    }

    /// Blocks a page of this cache can hold.
    fn blocks_per_page(&self) -> usize {
        if self.is_big() {
            PGSIZE / self.block_size
        } else {
            (PGSIZE - mem::size_of::<PageHeader>()) / self.block_size
        }
    }

    fn is_big(&self) -> bool {
        self.block_size * 8 > PGSIZE
    }
}

struct SlabInner {
    caches: [CacheInfo; NCACHE],
    ncaches: usize,
    hash: [*mut BigPageInfo; NHASH],
    /// Bootstrap cache holding `BigPageInfo` records.
    info_cache: usize,
}

// SAFETY: all raw pointers are reached only under the allocator lock.
unsafe impl Send for SlabInner {}

pub struct SlabAllocator {
    inner: SpinLock<SlabInner>,
}

impl SlabAllocator {
    pub const fn new() -> Self {
        const UNUSED: CacheInfo = CacheInfo::unused();
        Self {
            inner: SpinLock::new(
                "slab",
                SlabInner {
                    caches: [UNUSED; NCACHE],
                    ncaches: 0,
                    hash: [ptr::null_mut(); NHASH],
                    info_cache: 0,
                },
            ),
        }
    }

    /// Creates the bootstrap cache. Must run once before any
    /// `cache_create`.
    pub fn init(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.ncaches, 0, "slab already initialized");
        let id = inner
            .create(mem::size_of::<BigPageInfo>())
            .expect("slab: bootstrap cache");
        inner.info_cache = id;
    }

    /// Creates a new cache of `block_size`-byte objects.
    /// Returns `None` when the object cannot fit a page or the cache table
    /// is full.
    pub fn cache_create(&self, block_size: usize) -> Option<CacheId> {
        self.inner.lock().create(block_size).map(CacheId)
    }

    /// Allocates one block from `cache`. Returns `None` when the page
    /// allocator is exhausted.
    pub fn alloc(&self, cache: CacheId, kmem: &SpinLock<Kmem>) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        inner.get_empty_block(cache.0, kmem)
    }

    /// Returns `block` to the cache it was allocated from.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by `alloc` on this allocator and
    /// not freed since.
    pub unsafe fn free(&self, block: NonNull<u8>, kmem: &SpinLock<Kmem>) {
        let mut inner = self.inner.lock();
        // SAFETY: per this method's contract.
        unsafe { inner.free_block(block.as_ptr(), kmem) };
    }
}

impl SlabInner {
    fn create(&mut self, block_size: usize) -> Option<usize> {
        if block_size > PGSIZE || self.ncaches >= NCACHE {
            return None;
        }
        // Every free block carries a next pointer, and objects must stay
        // word-aligned.
        let align = mem::align_of::<usize>();
        let block_size = block_size.max(mem::size_of::<*mut u8>());
        let block_size = (block_size + align - 1) & !(align - 1);
        let id = self.ncaches;
        self.caches[id].block_size = block_size;
        self.caches[id].partial.init();
        self.caches[id].full.init();
        self.caches[id].empty.init();
        self.ncaches += 1;
        Some(id)
    }

    /// Picks a page with a free block, creating one if necessary, and pops
    /// a block from it.
    fn get_empty_block(&mut self, cache: usize, kmem: &SpinLock<Kmem>) -> Option<NonNull<u8>> {
        let header = if !self.caches[cache].partial.is_empty() {
            // SAFETY: partial holds PageHeader links of this cache.
            (unsafe { list_entry!(self.caches[cache].partial.next(), PageHeader, link) })
                as *const PageHeader as *mut PageHeader
        } else if !self.caches[cache].empty.is_empty() {
            // SAFETY: empty holds PageHeader links of this cache.
            (unsafe { list_entry!(self.caches[cache].empty.next(), PageHeader, link) })
                as *const PageHeader as *mut PageHeader
        } else {
            let page = kmem.lock().alloc()?;
            if self.caches[cache].is_big() {
                if self.init_big_page(page, cache, kmem).is_none() {
                    return None;
                }
            } else {
                self.init_small_page(page, cache);
            }
            // SAFETY: the init path pushed the new header onto empty.
            (unsafe { list_entry!(self.caches[cache].empty.next(), PageHeader, link) })
                as *const PageHeader as *mut PageHeader
        };
        // SAFETY: header points at a live header of this cache with at
        // least one free block.
        Some(unsafe { self.pop_block(header) })
    }

    /// Carves `page` into blocks of `cache` with the header in-page.
    fn init_small_page(&mut self, mut page: Page, cache: usize) {
        let block_size = self.caches[cache].block_size;
        let count = self.caches[cache].blocks_per_page();
        let base = page.addr();
        let first = base + mem::size_of::<PageHeader>();
        page.write_bytes(0);
        // Ownership of the page now rests with the cache lists.
        let base = page.into_usize();

        // Thread the intra-page free list.
        let mut block = first;
        while block + 2 * block_size <= base + PGSIZE {
            // SAFETY: block and its successor lie inside the page.
            unsafe { *(block as *mut *mut u8) = (block + block_size) as *mut u8 };
            block += block_size;
        }
        // SAFETY: the last block lies inside the page.
        unsafe { *(block as *mut *mut u8) = ptr::null_mut() };

        let header = base as *mut PageHeader;
        // SAFETY: the page is fresh and the header area is in bounds.
        unsafe {
            (*header).cache = cache;
            (*header).free_block = first as *mut u8;
            (*header).free_count = count;
            (*header).link.init();
            self.caches[cache].empty.push_front(&(*header).link);
        }
    }

    /// Sets up `page` for a large-object cache: the whole page is blocks,
    /// the header lives in a hashed `BigPageInfo`.
    fn init_big_page(
        &mut self,
        mut page: Page,
        cache: usize,
        kmem: &SpinLock<Kmem>,
    ) -> Option<()> {
        let info_cache = self.info_cache;
        let info = match self.get_empty_block(info_cache, kmem) {
            Some(p) => p.as_ptr() as *mut BigPageInfo,
            None => {
                kmem.lock().free(page);
                return None;
            }
        };

        let block_size = self.caches[cache].block_size;
        let count = PGSIZE / block_size;
        let base = page.addr();
        page.write_bytes(0);
        let base_owned = page.into_usize();
        debug_assert_eq!(base, base_owned);

        let mut block = base;
        while block + 2 * block_size <= base + PGSIZE {
            // SAFETY: block and its successor lie inside the page.
            unsafe { *(block as *mut *mut u8) = (block + block_size) as *mut u8 };
            block += block_size;
        }
        // SAFETY: the last block lies inside the page.
        unsafe { *(block as *mut *mut u8) = ptr::null_mut() };

        // SAFETY: info was just allocated from the bootstrap cache.
        unsafe {
            (*info).page = base;
            (*info).header.cache = cache;
            (*info).header.free_block = base as *mut u8;
            (*info).header.free_count = count;
            (*info).header.link.init();
            (*info).next = ptr::null_mut();
            self.caches[cache].empty.push_front(&(*info).header.link);
        }
        self.hash_insert(info);
        Some(())
    }

    fn hash_bucket(page: usize) -> usize {
        (page / PGSIZE) % NHASH
    }

    fn hash_insert(&mut self, info: *mut BigPageInfo) {
        // SAFETY: info is live; the bucket list is only touched under the
        // allocator lock.
        unsafe {
            let bucket = Self::hash_bucket((*info).page);
            (*info).next = self.hash[bucket];
            self.hash[bucket] = info;
        }
    }

    fn hash_lookup(&self, page: usize) -> *mut BigPageInfo {
        let mut cur = self.hash[Self::hash_bucket(page)];
        while !cur.is_null() {
            // SAFETY: bucket entries are live BigPageInfo records.
            if unsafe { (*cur).page } == page {
                break;
            }
            cur = unsafe { (*cur).next };
        }
        cur
    }

    fn hash_remove(&mut self, page: usize) -> *mut BigPageInfo {
        let bucket = Self::hash_bucket(page);
        let mut cur = self.hash[bucket];
        let mut prev: *mut BigPageInfo = ptr::null_mut();
        while !cur.is_null() {
            // SAFETY: bucket entries are live BigPageInfo records.
            unsafe {
                if (*cur).page == page {
                    if prev.is_null() {
                        self.hash[bucket] = (*cur).next;
                    } else {
                        (*prev).next = (*cur).next;
                    }
                    (*cur).next = ptr::null_mut();
                    return cur;
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
        ptr::null_mut()
    }

    /// Pops the next free block of `header`'s page, moving the page
    /// between lists as its occupancy changes.
    ///
    /// # Safety
    ///
    /// `header` must be a live header with `free_count > 0`.
    unsafe fn pop_block(&mut self, header: *mut PageHeader) -> NonNull<u8> {
        // SAFETY: per the contract.
        unsafe {
            assert!((*header).free_count > 0, "slab: allocating from a full page");
            let block = (*header).free_block;
            (*header).free_block = *(block as *mut *mut u8);
            (*header).free_count -= 1;
            let cache = &self.caches[(*header).cache];
            (*header).link.remove();
            if (*header).free_count == 0 {
                cache.full.push_front(&(*header).link);
            } else {
                cache.partial.push_back(&(*header).link);
            }
            NonNull::new_unchecked(block)
        }
    }

    /// # Safety
    ///
    /// `block` must be a live allocation of this allocator.
    unsafe fn free_block(&mut self, block: *mut u8, kmem: &SpinLock<Kmem>) {
        let page = pgrounddown(block as usize);
        let info = self.hash_lookup(page);
        let header = if info.is_null() {
            page as *mut PageHeader
        } else {
            // SAFETY: info is a live record for this page.
            unsafe { &mut (*info).header as *mut PageHeader }
        };

        // SAFETY: the header is live while its page holds allocations.
        unsafe {
            let cache_id = (*header).cache;
            let capacity = self.caches[cache_id].blocks_per_page();
            debug_assert!(
                info.is_null() == !self.caches[cache_id].is_big(),
                "slab: header kind mismatch"
            );

            *(block as *mut *mut u8) = (*header).free_block;
            (*header).free_block = block;
            (*header).free_count += 1;

            if (*header).free_count == capacity {
                // Last block came back: retire the whole page.
                (*header).link.remove();
                if !info.is_null() {
                    let removed = self.hash_remove(page);
                    debug_assert_eq!(removed, info);
                    self.free_block(info as *mut u8, kmem);
                }
                // SAFETY: every block is free, so the page has no live
                // allocations and ownership returns to the allocator.
                kmem.lock().free(Page::from_usize(page));
            } else if (*header).free_count == 1 {
                (*header).link.remove();
                self.caches[cache_id].partial.push_back(&(*header).link);
            }
        }
    }
}

/// A typed view over a slab cache: allocation placement-news a `T`, free
/// drops it in place.
pub struct TypedCache<T> {
    id: CacheId,
    _marker: core::marker::PhantomData<fn() -> T>,
}

impl<T> TypedCache<T> {
    pub fn create(slab: &SlabAllocator) -> Option<Self> {
        assert!(mem::align_of::<T>() <= mem::align_of::<usize>() * 2);
        let id = slab.cache_create(mem::size_of::<T>())?;
        Some(Self {
            id,
            _marker: core::marker::PhantomData,
        })
    }

    /// Allocates a block and moves `value` into it. On exhaustion the
    /// value is handed back (some kernel objects must not be dropped
    /// implicitly).
    pub fn alloc(
        &self,
        slab: &SlabAllocator,
        kmem: &SpinLock<Kmem>,
        value: T,
    ) -> core::result::Result<NonNull<T>, T> {
        let block = match slab.alloc(self.id, kmem) {
            Some(b) => b,
            None => return Err(value),
        };
        let ptr = block.as_ptr() as *mut T;
        // SAFETY: the block is block_size >= size_of::<T>() bytes and
        // uniquely owned.
        unsafe { ptr::write(ptr, value) };
        Ok(NonNull::new(ptr).expect("slab returned null"))
    }

    /// Drops the object and returns its block to the cache.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` on this cache and have no outstanding
    /// references.
    pub unsafe fn free(&self, slab: &SlabAllocator, kmem: &SpinLock<Kmem>, ptr: NonNull<T>) {
        // SAFETY: per the contract.
        unsafe {
            ptr::drop_in_place(ptr.as_ptr());
            slab.free(ptr.cast(), kmem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::tests::new_kmem;

    fn setup(pages: usize) -> (&'static SlabAllocator, &'static SpinLock<Kmem>) {
        let slab = Box::leak(Box::new(SlabAllocator::new()));
        let kmem = Box::leak(Box::new(new_kmem(pages)));
        slab.init();
        (slab, kmem)
    }

    #[test]
    fn small_cache_alloc_free() {
        let (slab, kmem) = setup(8);
        let cache = slab.cache_create(48).unwrap();
        let a = slab.alloc(cache, kmem).unwrap();
        let b = slab.alloc(cache, kmem).unwrap();
        assert_ne!(a, b);
        assert_eq!(pgrounddown(a.as_ptr() as usize), pgrounddown(b.as_ptr() as usize));
        unsafe {
            slab.free(a, kmem);
            slab.free(b, kmem);
        }
    }

    #[test]
    fn page_returns_when_empty() {
        let (slab, kmem) = setup(4);
        let before = kmem.lock().nfree();
        let cache = slab.cache_create(64).unwrap();
        let p = slab.alloc(cache, kmem).unwrap();
        assert_eq!(kmem.lock().nfree(), before - 1);
        unsafe { slab.free(p, kmem) };
        assert_eq!(kmem.lock().nfree(), before);
    }

    #[test]
    fn fills_page_then_starts_another() {
        let (slab, kmem) = setup(8);
        let cache = slab.cache_create(128).unwrap();
        let per_page = (PGSIZE - mem::size_of::<PageHeader>()) / 128;
        let mut blocks = Vec::new();
        for _ in 0..per_page + 1 {
            blocks.push(slab.alloc(cache, kmem).unwrap());
        }
        let first_page = pgrounddown(blocks[0].as_ptr() as usize);
        let last_page = pgrounddown(blocks[per_page].as_ptr() as usize);
        assert_ne!(first_page, last_page);
        // No duplicate blocks were handed out.
        let mut addrs: Vec<usize> = blocks.iter().map(|b| b.as_ptr() as usize).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), per_page + 1);
        for b in blocks {
            unsafe { slab.free(b, kmem) };
        }
    }

    #[test]
    fn big_cache_uses_hashed_headers() {
        let (slab, kmem) = setup(8);
        // 8 * 1024 > PGSIZE, so this is a large-object cache.
        let cache = slab.cache_create(1024).unwrap();
        let a = slab.alloc(cache, kmem).unwrap();
        let b = slab.alloc(cache, kmem).unwrap();
        // Blocks fill the page from its very start; no in-page header.
        assert_eq!(a.as_ptr() as usize % 1024, 0);
        let free_before = kmem.lock().nfree();
        unsafe {
            slab.free(a, kmem);
            slab.free(b, kmem);
        }
        // The object page went back to the page allocator.
        assert!(kmem.lock().nfree() > free_before);
    }

    #[test]
    fn typed_cache_drops_in_place() {
        struct Probe(&'static std::sync::atomic::AtomicUsize);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        static DROPS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

        let (slab, kmem) = setup(4);
        let cache = TypedCache::<Probe>::create(slab).unwrap();
        let p = cache.alloc(slab, kmem, Probe(&DROPS)).ok().unwrap();
        assert_eq!(DROPS.load(std::sync::atomic::Ordering::Relaxed), 0);
        unsafe { cache.free(slab, kmem, p) };
        assert_eq!(DROPS.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
