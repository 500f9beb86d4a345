//! The virtual inode layer: path resolution, a ref-counted inode table,
//! and byte-granular I/O through a write-back page cache, all generic
//! over a lower filesystem backend and a pluggable mutex implementation.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;

use lower_fs::LowerFs;
use mutex_api::Mutex;
use page_cache::{Page, PageCache};
use vfs_types::{DeviceId, FileKind, Stat};

pub mod byteio;
pub mod error;
pub mod itable;
pub mod path;

pub use error::VfsError;
pub use itable::InodeHandle;

/// The facade tying the inode table and the page cache together. The
/// two halves are otherwise independent: [`itable::InodeTable`] knows
/// nothing of caching, and [`page_cache::PageCache`] knows nothing of
/// the lower FS beyond the [`page_cache::Host`] impl on
/// `Arc<InodeTable<..>>`. Composite operations that must touch both
/// (`truncate`, `link`) live here.
pub struct Vfs<LFS, TableMutex, CacheTableMutex> {
    itable: Arc<itable::InodeTable<LFS, TableMutex>>,
    cache: PageCache<itable::InodeTableHost<LFS, TableMutex>, CacheTableMutex>,
}

impl<LFS, TableMutex, SlotMutex, CacheTableMutex, PageMutex> Vfs<LFS, TableMutex, CacheTableMutex>
where
    LFS: LowerFs,
    SlotMutex: Mutex<Data = itable::Content<LFS>>,
    TableMutex: Mutex<Data = itable::TableState<LFS, SlotMutex>>,
    PageMutex: Mutex<Data = Page>,
    CacheTableMutex: Mutex<Data = page_cache::Table<itable::InodeTableHost<LFS, TableMutex>, PageMutex>>,
{
    pub fn new(fs: LFS) -> Self {
        let itable = Arc::new(itable::InodeTable::new(fs));
        let cache = PageCache::new(itable::InodeTableHost(Arc::clone(&itable)));
        Self { itable, cache }
    }

    #[must_use]
    pub fn root(&self) -> InodeHandle {
        self.itable.root()
    }

    #[must_use]
    pub fn dup(&self, ip: InodeHandle) -> InodeHandle {
        self.itable.dup(ip)
    }

    pub fn put(&self, ip: InodeHandle) {
        self.itable.put(ip);
    }

    #[must_use]
    pub fn kind(&self, ip: InodeHandle) -> FileKind {
        self.itable.kind(ip)
    }

    /// Resolves `path` to an inode, starting from `cwd` (or the root).
    ///
    /// # Errors
    ///
    /// See [`path::resolve`].
    pub fn lookup(&self, path: &str, cwd: Option<InodeHandle>) -> Result<Option<InodeHandle>, VfsError<LFS::Error>> {
        path::resolve(&self.itable, path, false, cwd)
    }

    /// Resolves the parent directory of `path`'s final component.
    ///
    /// # Errors
    ///
    /// See [`path::resolve`].
    pub fn lookup_parent(&self, path: &str, cwd: Option<InodeHandle>) -> Result<Option<InodeHandle>, VfsError<LFS::Error>> {
        path::resolve(&self.itable, path, true, cwd)
    }

    /// Creates `name` inside `dp`, or reopens it if it already exists.
    ///
    /// # Errors
    ///
    /// See [`itable::InodeTable::create`].
    pub fn create(&self, dp: InodeHandle, name: &str, kind: FileKind, device: DeviceId) -> Result<InodeHandle, VfsError<LFS::Error>> {
        self.itable.create(dp, name, kind, device)
    }

    #[must_use]
    pub fn readi(&self, ip: InodeHandle, dst: &mut [u8], off: u64) -> usize {
        byteio::readi(&self.cache, ip, dst, off)
    }

    pub fn writei(&self, ip: InodeHandle, src: &[u8], off: u64) -> usize {
        byteio::writei(&self.cache, ip, src, off)
    }

    pub fn stat(&self, ip: InodeHandle) -> Result<Stat, VfsError<LFS::Error>> {
        self.itable.stat(ip)
    }

    /// Fills `buf` with `getdents`-formatted directory records.
    ///
    /// # Errors
    ///
    /// See [`itable::InodeTable::getdents`].
    pub fn getdents(&self, dp: InodeHandle, buf: &mut [u8]) -> Result<usize, VfsError<LFS::Error>> {
        self.itable.getdents(dp, buf)
    }

    /// Marks `ip` for removal at last put. Already-cached pages are left
    /// alone: removal itself is deferred to last put, same as the table
    /// slot it belongs to, so a page pinned by a concurrent reader is
    /// never torn down out from under it.
    pub fn unlink(&self, ip: InodeHandle) {
        self.itable.unlink(ip);
    }

    /// Stores a deferred rename to `new_path`, taking effect at last
    /// put. Cached pages are left untouched: a rename changes the path
    /// a slot is keyed under in the table, not its content.
    pub fn rename(&self, ip: InodeHandle, new_path: alloc::string::String) {
        self.itable.rename(ip, new_path);
    }

    /// Truncates `ip` to zero length on the lower FS and drops any
    /// cached pages of it, so a subsequent read never returns bytes
    /// from before the truncate.
    ///
    /// # Errors
    ///
    /// See [`itable::InodeTable::truncate_lower`].
    pub fn truncate(&self, ip: InodeHandle) -> Result<(), VfsError<LFS::Error>> {
        self.itable.truncate_lower(ip)?;
        self.cache.release_all(Some(&ip));
        Ok(())
    }

    /// Writes a symlink record into `new` pointing at `old`'s path and
    /// drops any cached pages of `new`, so a reopen of `new` sees the
    /// symlink indirection rather than `new`'s previous content.
    ///
    /// # Errors
    ///
    /// See [`itable::InodeTable::write_symlink`].
    pub fn link(&self, old: InodeHandle, new: InodeHandle) -> Result<(), VfsError<LFS::Error>> {
        self.itable.write_symlink(old, new)?;
        self.cache.release_all(Some(&new));
        Ok(())
    }

    /// Flushes and tears down every cached page. Call once, at shutdown.
    pub fn sync_all(&self) {
        self.cache.release_all(None);
    }
}
