//! A fixed-capacity, page-aligned, write-back cache sitting between
//! byte-granular reads/writes and a block-oriented backing store.
//!
//! Eviction is gated on physical-page reference count rather than on
//! usage alone: a page may not be reclaimed while something outside the
//! cache (for example a memory-mapped-file holder) still shares it. That
//! sharing is modeled as `Arc` clones of the per-page mutex — the cache
//! is the page's sole owner exactly when `Arc::strong_count` reads `1`.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;

use arrayvec::ArrayVec;
use log::{debug, trace, warn};
use mutex_api::Mutex;
use vfs_params::{NCACHE, PAGE_SIZE};

/// The owner of cached pages: an inode (or whatever else pages can be
/// keyed on). The cache never touches the backing store directly; it
/// asks the host to fill and flush one page at a time and to adjust the
/// host's own reference count as slots are attached/detached.
pub trait Host {
    /// A cheap, comparable handle identifying one host (e.g. an inode
    /// table index). Cloning a `Ref` does not by itself change any
    /// reference count; `dup`/`put` do that explicitly.
    type Ref: Clone + PartialEq;
    type Error;

    /// Increments the host's reference count and returns a handle to it.
    fn dup(&self, host: &Self::Ref) -> Self::Ref;

    /// Decrements the host's reference count, running last-reference
    /// cleanup if it reaches zero.
    fn put(&self, host: Self::Ref);

    /// Fills `buf` starting at `offset`, returning the number of bytes
    /// actually read (short at EOF; the cache has already zeroed `buf`).
    fn read_page(&self, host: &Self::Ref, offset: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<usize, Self::Error>;

    /// Writes back `data` at `offset`. `data.len()` is never more than
    /// one page and has already been clamped to the host's file size.
    fn write_page(&self, host: &Self::Ref, offset: u64, data: &[u8]) -> Result<(), Self::Error>;

    /// Current size, in bytes, of the host's content.
    fn file_size(&self, host: &Self::Ref) -> Result<u64, Self::Error>;
}

/// Recoverable failure modes of [`PageCache::acquire`].
#[derive(Debug)]
pub enum CacheError<E> {
    /// Every slot is pinned (physical-page ref-count above one); no slot
    /// could be evicted to satisfy the miss.
    NoSpace,
    /// The lower filesystem failed to fill the page.
    Fill(E),
}

/// The bytes and dirty bit of one physical page, as protected by a
/// `PageMutex`. Public only because it appears in [`PageCache`]'s and
/// [`PageGuard`]'s generic bounds; constructed solely by the cache.
pub struct Page {
    data: [u8; PAGE_SIZE],
    dirty: bool,
}

impl Page {
    const fn zeroed() -> Self {
        Self {
            data: [0; PAGE_SIZE],
            dirty: false,
        }
    }
}

struct Slot<H: Host, PageMutex> {
    host: Option<H::Ref>,
    offset: u64,
    valid: bool,
    page: Option<Arc<PageMutex>>,
}

impl<H: Host, PageMutex> Slot<H, PageMutex> {
    const fn empty() -> Self {
        Self {
            host: None,
            offset: 0,
            valid: false,
            page: None,
        }
    }

    fn matches(&self, host: &H::Ref, offset: u64) -> bool {
        self.valid && self.offset == offset && self.host.as_ref() == Some(host)
    }
}

/// The slot table and LRU order, guarded as a unit by a `TableMutex`.
/// Public only because it appears in [`PageCache`]'s generic bounds;
/// constructed solely by the cache.
pub struct Table<H: Host, PageMutex> {
    slots: [Slot<H, PageMutex>; NCACHE],
    /// Dense recency ordering over slot indices; front (index 0) is most
    /// recently used. Its non-null entries are exactly the valid slots.
    lru: ArrayVec<usize, NCACHE>,
}

impl<H: Host, PageMutex> Table<H, PageMutex> {
    fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::empty()),
            lru: ArrayVec::new(),
        }
    }

    fn lru_touch(&mut self, idx: usize) {
        if let Some(pos) = self.lru.iter().position(|&i| i == idx) {
            self.lru.remove(pos);
        }
        self.lru.insert(0, idx);
    }

    fn lru_remove(&mut self, idx: usize) {
        if let Some(pos) = self.lru.iter().position(|&i| i == idx) {
            self.lru.remove(pos);
        }
    }

    fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.valid)
    }

    fn find_valid(&self, host: &H::Ref, offset: u64) -> Option<usize> {
        self.slots.iter().position(|s| s.matches(host, offset))
    }
}

/// The cache proper: one `NCACHE`-slot table guarded by `TableMutex`,
/// each page's bytes and dirty bit guarded individually by a
/// `PageMutex` that is also the unit of physical-page reference
/// counting.
pub struct PageCache<H, TableMutex> {
    host: H,
    table: TableMutex,
}

impl<H, TableMutex, PageMutex> PageCache<H, TableMutex>
where
    H: Host,
    PageMutex: Mutex<Data = Page>,
    TableMutex: Mutex<Data = Table<H, PageMutex>>,
{
    pub fn new(host: H) -> Self {
        Self {
            host,
            table: TableMutex::new(Table::new()),
        }
    }

    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Acquires the page-cache slot for `(host, offset)`, returning it
    /// locked. `offset` must be page-aligned.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not page-aligned.
    pub fn acquire(&self, host: &H::Ref, offset: u64) -> Result<PageGuard<'_, PageMutex>, CacheError<H::Error>> {
        assert_eq!(offset % PAGE_SIZE as u64, 0, "cache offset must be page-aligned");

        let mut t = self.table.lock();
        if let Some(idx) = t.find_valid(host, offset) {
            trace!("page cache hit at offset {offset}");
            t.lru_touch(idx);
            let page = Arc::clone(t.slots[idx].page.as_ref().unwrap());
            drop(t);
            let guard = page.lock();
            // SAFETY: see `extend_guard_lifetime`.
            let guard = unsafe { extend_guard_lifetime::<PageMutex>(guard) };
            return Ok(PageGuard { page, guard });
        }
        trace!("page cache miss at offset {offset}");

        let idx = match t.find_free() {
            Some(idx) => idx,
            None => {
                self.evict_one_locked(&mut t)?;
                t.find_free().ok_or(CacheError::NoSpace)?
            }
        };

        let page = Arc::new(PageMutex::new(Page::zeroed()));
        // Lock the page before publishing `valid: true` under the table
        // lock, so a concurrent acquire() that sees the slot as valid and
        // clones this Arc blocks on the page lock until the fill below
        // has actually happened, instead of racing it for a zeroed read.
        let mut guard = page.lock();
        t.slots[idx] = Slot {
            host: Some(host.clone()),
            offset,
            valid: true,
            page: Some(Arc::clone(&page)),
        };
        drop(t);

        match self.host.read_page(host, offset, &mut guard.data) {
            Ok(_n) => {}
            Err(e) => {
                drop(guard);
                warn!("fill failed at offset {offset}, freeing slot {idx}");
                let mut t = self.table.lock();
                t.slots[idx] = Slot::empty();
                t.lru_remove(idx);
                return Err(CacheError::Fill(e));
            }
        }

        let host_ref = self.host.dup(host);
        let mut t = self.table.lock();
        t.slots[idx].host = Some(host_ref);
        t.lru_touch(idx);
        drop(t);

        // SAFETY: see `extend_guard_lifetime`.
        let guard = unsafe { extend_guard_lifetime::<PageMutex>(guard) };
        Ok(PageGuard { page, guard })
    }

    /// Evicts the least-recently-used slot whose physical page has no
    /// outside holder (`Arc::strong_count == 1`). The table lock must
    /// already be held by the caller.
    fn evict_one_locked(&self, t: &mut TableMutex::Guard<'_>) -> Result<(), CacheError<H::Error>> {
        let lru_order: ArrayVec<usize, NCACHE> = t.lru.iter().rev().copied().collect();
        let victim = lru_order
            .into_iter()
            .find(|&idx| Arc::strong_count(t.slots[idx].page.as_ref().unwrap()) == 1);
        let Some(idx) = victim else {
            return Err(CacheError::NoSpace);
        };

        let page = Arc::clone(t.slots[idx].page.as_ref().unwrap());
        let offset = t.slots[idx].offset;
        let host = t.slots[idx].host.clone().unwrap();

        {
            let guard = page.lock();
            if guard.dirty {
                let size = self.host.file_size(&host).map_err(CacheError::Fill)?;
                let len = usize::try_from(size.saturating_sub(offset)).unwrap_or(0).min(PAGE_SIZE);
                if self.host.write_page(&host, offset, &guard.data[..len]).is_err() {
                    warn!("write-back failed for dirty page at offset {offset} during eviction");
                    panic!("write-back failed for dirty page at offset {offset}");
                }
            }
        }

        t.slots[idx] = Slot::empty();
        t.lru_remove(idx);
        self.host.put(host);
        debug!("evicted slot {idx} at offset {offset}");
        Ok(())
    }

    /// Flushes and tears down every slot whose host equals `host`, or
    /// every valid slot if `host` is `None`. Used on link invalidation,
    /// post-truncate invalidation, and teardown.
    pub fn release_all(&self, host: Option<&H::Ref>) {
        let mut t = self.table.lock();
        let victims: alloc::vec::Vec<usize> = t
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.valid && host.is_none_or(|h| s.host.as_ref() == Some(h)))
            .map(|(i, _)| i)
            .collect();
        let count = victims.len();

        for idx in victims {
            assert_eq!(
                Arc::strong_count(t.slots[idx].page.as_ref().unwrap()),
                1,
                "page pinned by an outside holder during release_all"
            );

            let page = Arc::clone(t.slots[idx].page.as_ref().unwrap());
            let offset = t.slots[idx].offset;
            let slot_host = t.slots[idx].host.clone().unwrap();

            let guard = page.lock();
            if guard.dirty {
                let Ok(size) = self.host.file_size(&slot_host) else {
                    warn!("file size query failed during release_all at offset {offset}");
                    panic!("file size query failed during release_all at offset {offset}");
                };
                let len = usize::try_from(size.saturating_sub(offset)).unwrap_or(0).min(PAGE_SIZE);
                if self.host.write_page(&slot_host, offset, &guard.data[..len]).is_err() {
                    warn!("write-back failed during release_all at offset {offset}");
                    panic!("write-back failed during release_all at offset {offset}");
                }
            }
            drop(guard);

            t.slots[idx] = Slot::empty();
            t.lru_remove(idx);
            self.host.put(slot_host);
        }
        debug!("release_all flushed {count} slot(s)");
    }
}

/// Reinterprets a `PageMutex::Guard` as having an unrelated lifetime so
/// it can be stored in the same struct as the `Arc<PageMutex>` it
/// borrows from (an ordinary owning-guard pattern the borrow checker
/// cannot express on its own).
///
/// # Safety
///
/// The guard's actual referent is the heap allocation behind an
/// `Arc<PageMutex>`, which does not move when the `Arc` handle does.
/// `PageCache` only ever clears a slot's `Arc` when
/// `Arc::strong_count` is `1` (see [`PageCache::evict_one_locked`] and
/// [`PageCache::release_all`]), i.e. never while any `PageGuard` (which
/// holds its own clone of that `Arc`) is alive. So for as long as the
/// returned `PageGuard` exists, the allocation the original guard
/// borrowed from is guaranteed to still be alive, regardless of the
/// field drop order within `PageGuard`.
unsafe fn extend_guard_lifetime<'a, 'b, PageMutex>(guard: PageMutex::Guard<'b>) -> PageMutex::Guard<'a>
where
    PageMutex: Mutex<Data = Page> + 'a + 'b,
{
    let guard = core::mem::ManuallyDrop::new(guard);
    unsafe { core::ptr::read((&raw const *guard).cast()) }
}

/// A locked cache slot, returned by [`PageCache::acquire`]. Dropping it
/// releases the per-page lock; it carries no other side effect, so
/// relying on `Drop` here is just ordinary mutex-guard unlocking.
pub struct PageGuard<'a, PageMutex>
where
    PageMutex: Mutex<Data = Page> + 'a,
{
    page: Arc<PageMutex>,
    guard: PageMutex::Guard<'a>,
}

impl<PageMutex> PageGuard<'_, PageMutex>
where
    PageMutex: Mutex<Data = Page>,
{
    #[must_use]
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.guard.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.guard.dirty = true;
        &mut self.guard.data
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.guard.dirty
    }

    /// Number of outstanding holders of this physical page, including
    /// this guard and the cache slot itself. Exposed for diagnostics and
    /// tests; eviction uses this same count internally.
    #[must_use]
    pub fn page_ref_count(&self) -> usize {
        Arc::strong_count(&self.page)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap, rc::Rc, sync::Mutex as StdMutex};

    use super::*;

    struct StdLock<T>(StdMutex<T>);
    impl<T> Mutex for StdLock<T> {
        type Data = T;
        type Guard<'a>
            = std::sync::MutexGuard<'a, T>
        where
            T: 'a;

        fn new(data: T) -> Self {
            Self(StdMutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            self.0.lock().unwrap()
        }
    }

    #[derive(Clone, PartialEq, Eq, Debug)]
    struct FileId(u32);

    struct MockHost {
        files: Rc<RefCell<HashMap<u32, alloc::vec::Vec<u8>>>>,
        refcounts: Rc<RefCell<HashMap<u32, i32>>>,
        puts: Rc<RefCell<alloc::vec::Vec<u32>>>,
    }

    impl MockHost {
        fn new() -> Self {
            Self {
                files: Rc::new(RefCell::new(HashMap::new())),
                refcounts: Rc::new(RefCell::new(HashMap::new())),
                puts: Rc::new(RefCell::new(alloc::vec::Vec::new())),
            }
        }

        fn set_contents(&self, id: u32, data: alloc::vec::Vec<u8>) {
            self.files.borrow_mut().insert(id, data);
        }
    }

    impl Host for MockHost {
        type Ref = FileId;
        type Error = ();

        fn dup(&self, host: &FileId) -> FileId {
            *self.refcounts.borrow_mut().entry(host.0).or_insert(0) += 1;
            host.clone()
        }

        fn put(&self, host: FileId) {
            *self.refcounts.borrow_mut().entry(host.0).or_insert(0) -= 1;
            self.puts.borrow_mut().push(host.0);
        }

        fn read_page(&self, host: &FileId, offset: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<usize, ()> {
            let files = self.files.borrow();
            let data = files.get(&host.0).ok_or(())?;
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = (data.len() - offset).min(PAGE_SIZE);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        fn write_page(&self, host: &FileId, offset: u64, data: &[u8]) -> Result<(), ()> {
            let mut files = self.files.borrow_mut();
            let buf = files.entry(host.0).or_default();
            let offset = offset as usize;
            if buf.len() < offset + data.len() {
                buf.resize(offset + data.len(), 0);
            }
            buf[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn file_size(&self, host: &FileId) -> Result<u64, ()> {
            Ok(self.files.borrow().get(&host.0).map_or(0, alloc::vec::Vec::len) as u64)
        }
    }

    type TestCache = PageCache<MockHost, StdLock<Table<MockHost, StdLock<Page>>>>;

    #[test]
    fn hit_then_miss_fill_reads_through() {
        let host = MockHost::new();
        host.set_contents(1, b"hello".to_vec());
        let cache: TestCache = PageCache::new(host);
        let id = FileId(1);

        let g = cache.acquire(&id, 0).unwrap();
        assert_eq!(&g.data()[..5], b"hello");
        drop(g);

        let g2 = cache.acquire(&id, 0).unwrap();
        assert_eq!(&g2.data()[..5], b"hello");
    }

    #[test]
    fn write_marks_dirty_and_is_flushed_on_eviction() {
        let host = MockHost::new();
        let cache: TestCache = PageCache::new(host);
        let id = FileId(7);

        {
            let mut g = cache.acquire(&id, 0).unwrap();
            g.data_mut()[..5].copy_from_slice(b"abcde");
            assert!(g.is_dirty());
        }

        cache.release_all(Some(&id));
        assert_eq!(&cache.host().files.borrow()[&7][..5], b"abcde");
    }

    #[test]
    fn eviction_picks_lru_tail_and_respects_pins() {
        let host = MockHost::new();
        let cache: TestCache = PageCache::new(host);

        // fill every slot
        let mut guards = alloc::vec::Vec::new();
        for i in 0..NCACHE {
            let id = FileId(i as u32);
            let g = cache.acquire(&id, 0).unwrap();
            guards.push(g);
        }
        drop(guards);

        // all slots now have ref-count 1 (no external pin); one more
        // acquire should evict the LRU tail (file 0) and succeed.
        let id = FileId(NCACHE as u32);
        let g = cache.acquire(&id, 0);
        assert!(g.is_ok());
        assert_eq!(*cache.host().puts.borrow().last().unwrap(), 0);
    }
}
