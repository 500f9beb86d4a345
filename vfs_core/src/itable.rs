//! The inode table: a fixed pool of `NINODE` slots, each keyed by an
//! absolute path, ref-counted, and closed/unlinked/renamed on last put.

use alloc::{
    string::{String, ToString as _},
    sync::Arc,
};
use core::marker::PhantomData;

use log::{debug, trace};
use lower_fs::{symlink, LowerDir, LowerFile, LowerFs, OpenFlags};
use mutex_api::Mutex;
use vfs_params::{MAXPATH, NINODE, PAGE_SIZE, ROOTDEV};
use vfs_types::{DeviceId, DeviceRecord, DirEntryType, DirRecord, FileKind, Stat};

use crate::error::VfsError;

/// A handle into one inode-table slot. Stable for the slot's lifetime
/// (from the `dup`/`dirlookup`/`create` call that produced it, until the
/// matching `put`); never compared across a slot's reuse by convention,
/// the same discipline the table's ref-counting already requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeHandle(usize);

/// The open lower-FS handle backing a live slot, protected by that
/// slot's own mutex independent of the table lock. Public only because
/// it appears in [`InodeTable`]'s generic bounds.
pub enum Content<LFS: LowerFs> {
    /// The slot is free; no handle is open.
    Empty,
    Dir(LFS::Dir),
    File(LFS::File),
    Device(LFS::File),
}

struct Meta {
    path: String,
    kind: FileKind,
    refcount: i32,
    device: DeviceId,
    unlinked: bool,
    new_path: Option<String>,
}

struct Slot<SlotMutex> {
    meta: Option<Meta>,
    content: Arc<SlotMutex>,
}

/// The slot array, guarded as a unit by a `TableMutex`. Public only
/// because it appears in [`InodeTable`]'s generic bounds; constructed
/// solely by the table.
pub struct TableState<LFS: LowerFs, SlotMutex> {
    slots: [Slot<SlotMutex>; NINODE],
    _marker: PhantomData<LFS>,
}

/// The inode table proper.
pub struct InodeTable<LFS, TableMutex> {
    fs: LFS,
    state: TableMutex,
}

fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        alloc::format!("/{name}")
    } else {
        alloc::format!("{dir}/{name}")
    }
}

fn encode_device_record(record: &DeviceRecord) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&record.magic.to_le_bytes());
    buf[4..6].copy_from_slice(&record.major.to_le_bytes());
    buf[6..8].copy_from_slice(&record.minor.to_le_bytes());
    buf
}

fn decode_device_record(bytes: &[u8]) -> Option<DeviceId> {
    if !DeviceRecord::is_device_record(bytes) || bytes.len() < 8 {
        return None;
    }
    Some(DeviceId {
        major: i16::from_le_bytes(bytes[4..6].try_into().ok()?),
        minor: i16::from_le_bytes(bytes[6..8].try_into().ok()?),
    })
}

impl<LFS, TableMutex, SlotMutex> InodeTable<LFS, TableMutex>
where
    LFS: LowerFs,
    SlotMutex: Mutex<Data = Content<LFS>>,
    TableMutex: Mutex<Data = TableState<LFS, SlotMutex>>,
{
    pub fn new(fs: LFS) -> Self {
        Self {
            fs,
            state: TableMutex::new(TableState {
                slots: core::array::from_fn(|_| Slot {
                    meta: None,
                    content: Arc::new(SlotMutex::new(Content::Empty)),
                }),
                _marker: PhantomData,
            }),
        }
    }

    fn path_of(&self, ip: InodeHandle) -> String {
        let t = self.state.lock();
        t.slots[ip.0].meta.as_ref().expect("path query on free inode slot").path.clone()
    }

    #[must_use]
    pub fn kind(&self, ip: InodeHandle) -> FileKind {
        let t = self.state.lock();
        t.slots[ip.0].meta.as_ref().expect("kind query on free inode slot").kind
    }

    fn alloc_slot_locked(t: &mut TableState<LFS, SlotMutex>, path: String, kind: FileKind, device: DeviceId, content: Content<LFS>) -> InodeHandle {
        let idx = t.slots.iter().position(|s| s.meta.is_none()).expect("inode table exhausted");
        t.slots[idx].meta = Some(Meta {
            path,
            kind,
            refcount: 1,
            device,
            unlinked: false,
            new_path: None,
        });
        *t.slots[idx].content.lock() = content;
        InodeHandle(idx)
    }

    fn find_live_by_path(t: &TableState<LFS, SlotMutex>, path: &str) -> Option<usize> {
        t.slots.iter().position(|s| s.meta.as_ref().is_some_and(|m| m.path == path))
    }

    /// Returns the singleton inode for `"/"`, opening it on first call.
    ///
    /// # Panics
    ///
    /// Panics if the root directory cannot be opened on the lower FS.
    #[must_use]
    pub fn root(&self) -> InodeHandle {
        let mut t = self.state.lock();
        if let Some(idx) = Self::find_live_by_path(&t, "/") {
            t.slots[idx].meta.as_mut().unwrap().refcount += 1;
            return InodeHandle(idx);
        }
        let dir = self.fs.open_dir("/").unwrap_or_else(|_| panic!("failed to open root directory"));
        Self::alloc_slot_locked(&mut t, "/".to_string(), FileKind::Dir, DeviceId::default(), Content::Dir(dir))
    }

    #[must_use]
    pub fn dup(&self, ip: InodeHandle) -> InodeHandle {
        let mut t = self.state.lock();
        t.slots[ip.0].meta.as_mut().expect("dup on free inode slot").refcount += 1;
        ip
    }

    /// Decrements `ip`'s reference count, closing the lower-FS handle and
    /// executing any deferred unlink/rename on the last reference.
    pub fn put(&self, ip: InodeHandle) {
        let mut t = self.state.lock();
        let meta = t.slots[ip.0].meta.as_mut().expect("put on free inode slot");
        meta.refcount -= 1;
        if meta.refcount > 0 {
            return;
        }

        let path = meta.path.clone();
        let unlinked = meta.unlinked;
        let new_path = meta.new_path.clone();
        t.slots[ip.0].meta = None;
        *t.slots[ip.0].content.lock() = Content::Empty;

        if unlinked {
            debug!("deferred unlink of {path} at last put");
            self.fs.unlink(&path).unwrap_or_else(|_| panic!("unlink failed for {path} at last put"));
        } else if let Some(new_path) = new_path {
            debug!("deferred rename of {path} to {new_path} at last put");
            self.fs
                .rename(&path, &new_path)
                .unwrap_or_else(|_| panic!("rename failed for {path} to {new_path} at last put"));
        }
    }

    fn content_arc(&self, ip: InodeHandle) -> Arc<SlotMutex> {
        let t = self.state.lock();
        assert!(
            t.slots[ip.0].meta.as_ref().is_some_and(|m| m.refcount >= 1),
            "operation on inode slot with ref < 1"
        );
        Arc::clone(&t.slots[ip.0].content)
    }

    /// Locks the per-slot content mutex. Dropping the returned guard
    /// unlocks it; this carries no side effect beyond that, so relying
    /// on `Drop` here is ordinary mutex-guard unlocking.
    ///
    /// # Panics
    ///
    /// Panics if `ip`'s reference count is less than one.
    #[must_use]
    pub fn lock(&self, ip: InodeHandle) -> InodeGuard<'_, SlotMutex> {
        let content = self.content_arc(ip);
        let guard = content.lock();
        // SAFETY: see `extend_content_guard_lifetime`.
        let guard = unsafe { extend_content_guard_lifetime::<SlotMutex>(guard) };
        InodeGuard { handle: ip, content, guard }
    }

    fn with_file<R>(&self, ip: InodeHandle, f: impl FnOnce(&mut LFS::File) -> Result<R, LFS::Error>) -> Result<R, VfsError<LFS::Error>> {
        let content = self.content_arc(ip);
        let mut guard = content.lock();
        match &mut *guard {
            Content::File(file) | Content::Device(file) => f(file).map_err(VfsError::Io),
            Content::Dir(_) | Content::Empty => Err(VfsError::TypeMismatch),
        }
    }

    pub fn file_size(&self, ip: InodeHandle) -> Result<u64, VfsError<LFS::Error>> {
        if self.kind(ip) == FileKind::Dir {
            return Ok(4);
        }
        self.with_file(ip, |f| LowerFile::size(&*f))
    }

    /// Extends or shrinks the lower-FS file to exactly `new_size` bytes.
    pub fn set_size(&self, ip: InodeHandle, new_size: u64) -> Result<(), VfsError<LFS::Error>> {
        self.with_file(ip, |f| f.truncate(new_size))
    }

    pub fn read_bytes(&self, ip: InodeHandle, offset: u64, buf: &mut [u8]) -> Result<usize, VfsError<LFS::Error>> {
        self.with_file(ip, |f| f.read_at(offset, buf))
    }

    pub fn write_bytes(&self, ip: InodeHandle, offset: u64, data: &[u8]) -> Result<usize, VfsError<LFS::Error>> {
        self.with_file(ip, |f| f.write_at(offset, data))
    }

    fn probe_and_alloc(t: &mut TableState<LFS, SlotMutex>, fs: &LFS, absolute: String) -> Result<InodeHandle, VfsError<LFS::Error>> {
        if let Ok(dir) = fs.open_dir(&absolute) {
            return Ok(Self::alloc_slot_locked(t, absolute, FileKind::Dir, DeviceId::default(), Content::Dir(dir)));
        }
        let mut file = fs.open_file(&absolute, OpenFlags::READ | OpenFlags::WRITE).map_err(VfsError::Io)?;
        let mut probe = [0u8; MAXPATH + 8];
        let n = file.read_at(0, &mut probe).map_err(VfsError::Io)?;
        let bytes = &probe[..n];

        if let Some(device) = decode_device_record(bytes) {
            return Ok(Self::alloc_slot_locked(t, absolute, FileKind::Device, device, Content::Device(file)));
        }
        if symlink::is_symlink_record(bytes) {
            let target = symlink::decode(bytes).ok_or(VfsError::Corruption)?;
            drop(file);
            // The target may already be a live slot (opened directly, or
            // via another symlink); path uniqueness requires reusing it
            // rather than allocating a second slot for the same path.
            if let Some(idx) = Self::find_live_by_path(t, &target) {
                t.slots[idx].meta.as_mut().unwrap().refcount += 1;
                return Ok(InodeHandle(idx));
            }
            let target_file = fs.open_file(&target, OpenFlags::READ | OpenFlags::WRITE).map_err(VfsError::Io)?;
            return Ok(Self::alloc_slot_locked(t, target, FileKind::File, DeviceId::default(), Content::File(target_file)));
        }
        Ok(Self::alloc_slot_locked(t, absolute, FileKind::File, DeviceId::default(), Content::File(file)))
    }

    /// Resolves `name` inside directory `dp`. Returns `Ok(None)` when no
    /// lower-FS entry matches.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::TypeMismatch`] if `dp` is not a directory, or
    /// [`VfsError::Io`] if the lower filesystem fails mid-probe.
    pub fn dirlookup(&self, dp: InodeHandle, name: &str) -> Result<Option<InodeHandle>, VfsError<LFS::Error>> {
        if self.kind(dp) != FileKind::Dir {
            return Err(VfsError::TypeMismatch);
        }
        let absolute = join_path(&self.path_of(dp), name);
        trace!("dirlookup {absolute}");

        let mut t = self.state.lock();
        if let Some(idx) = Self::find_live_by_path(&t, &absolute) {
            t.slots[idx].meta.as_mut().unwrap().refcount += 1;
            return Ok(Some(InodeHandle(idx)));
        }

        match Self::probe_and_alloc(&mut t, &self.fs, absolute) {
            Ok(ip) => Ok(Some(ip)),
            Err(VfsError::Io(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// Creates `name` inside directory `dp`, or returns the existing
    /// live slot for that path (idempotent re-open).
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::TypeMismatch`] if `dp` is not a directory, or
    /// [`VfsError::Io`] if the lower-FS creation primitive fails.
    pub fn create(&self, dp: InodeHandle, name: &str, kind: FileKind, device: DeviceId) -> Result<InodeHandle, VfsError<LFS::Error>> {
        if self.kind(dp) != FileKind::Dir {
            return Err(VfsError::TypeMismatch);
        }
        let absolute = join_path(&self.path_of(dp), name);
        trace!("create {absolute}");

        let mut t = self.state.lock();
        if let Some(idx) = Self::find_live_by_path(&t, &absolute) {
            t.slots[idx].meta.as_mut().unwrap().refcount += 1;
            return Ok(InodeHandle(idx));
        }

        match kind {
            FileKind::Dir => {
                self.fs.mkdir(&absolute).map_err(VfsError::Io)?;
                let dir = self.fs.open_dir(&absolute).map_err(VfsError::Io)?;
                Ok(Self::alloc_slot_locked(&mut t, absolute, FileKind::Dir, DeviceId::default(), Content::Dir(dir)))
            }
            FileKind::File => {
                let file = self
                    .fs
                    .open_file(&absolute, OpenFlags::CREATE | OpenFlags::TRUNC | OpenFlags::READ | OpenFlags::WRITE)
                    .map_err(VfsError::Io)?;
                Ok(Self::alloc_slot_locked(&mut t, absolute, FileKind::File, DeviceId::default(), Content::File(file)))
            }
            FileKind::Device => {
                let mut file = self
                    .fs
                    .open_file(&absolute, OpenFlags::CREATE | OpenFlags::TRUNC | OpenFlags::READ | OpenFlags::WRITE)
                    .map_err(VfsError::Io)?;
                let record = encode_device_record(&DeviceRecord::new(device));
                file.write_at(0, &record).map_err(VfsError::Io)?;
                Ok(Self::alloc_slot_locked(&mut t, absolute, FileKind::Device, device, Content::Device(file)))
            }
        }
    }

    /// Marks `ip` for removal at last put, clearing any pending rename.
    ///
    /// # Panics
    ///
    /// Panics if `ip`'s slot is free.
    pub fn unlink(&self, ip: InodeHandle) {
        let mut t = self.state.lock();
        let meta = t.slots[ip.0].meta.as_mut().expect("unlink on free inode slot");
        meta.new_path = None;
        meta.unlinked = true;
    }

    /// Stores `new_path` for a deferred rename at last put, clearing any
    /// pending unlink.
    ///
    /// # Panics
    ///
    /// Panics if `ip`'s slot is free.
    pub fn rename(&self, ip: InodeHandle, new_path: String) {
        let mut t = self.state.lock();
        let meta = t.slots[ip.0].meta.as_mut().expect("rename on free inode slot");
        meta.unlinked = false;
        meta.new_path = Some(new_path);
    }

    /// Truncates `ip`'s lower-FS content to zero length. Callers must
    /// also invalidate any cached pages of `ip` (see `Vfs::truncate`).
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::TypeMismatch`] if `ip` is not a regular file.
    pub fn truncate_lower(&self, ip: InodeHandle) -> Result<(), VfsError<LFS::Error>> {
        if self.kind(ip) != FileKind::File {
            return Err(VfsError::TypeMismatch);
        }
        self.with_file(ip, |f| f.truncate(0))
    }

    /// Writes a symlink record pointing at `old`'s path into `new`'s
    /// content. Callers must also invalidate any cached pages of `new`.
    pub fn write_symlink(&self, old: InodeHandle, new: InodeHandle) -> Result<(), VfsError<LFS::Error>> {
        let target = self.path_of(old);
        let record = symlink::encode(&target);
        self.with_file(new, |f| f.write_at(0, &record).map(|_| ()))
    }

    /// Reports `stat(2)`-style metadata for `ip`.
    ///
    /// # Panics
    ///
    /// Panics if `ip`'s slot is free.
    pub fn stat(&self, ip: InodeHandle) -> Result<Stat, VfsError<LFS::Error>> {
        let kind = self.kind(ip);
        let size = self.file_size(ip)?;
        Ok(Stat::for_kind(kind, u32::try_from(ROOTDEV).unwrap_or(0), size))
    }

    /// Fills `buf` with as many `getdents`-formatted records as fit,
    /// returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::TypeMismatch`] if `dp` is not a directory.
    pub fn getdents(&self, dp: InodeHandle, buf: &mut [u8]) -> Result<usize, VfsError<LFS::Error>> {
        let content = self.content_arc(dp);
        let mut guard = content.lock();
        let Content::Dir(dir) = &mut *guard else {
            return Err(VfsError::TypeMismatch);
        };

        let mut written = 0usize;
        while let Some(entry) = dir.next_entry().map_err(VfsError::Io)? {
            let ty = if entry.is_dir { DirEntryType::Dir } else { DirEntryType::Reg };
            let name = entry.name.as_bytes();
            let reclen = DirRecord::HEADER_LEN + name.len() + 1;
            if written + reclen > buf.len() {
                break;
            }
            let record = DirRecord {
                ino: 0,
                off: (written + reclen) as u64,
                ty,
                name,
            };
            written += record.encode(&mut buf[written..]).expect("buffer space already checked");
        }
        Ok(written)
    }
}

/// Reinterprets a `SlotMutex::Guard` as having an unrelated lifetime so
/// it can be stored in the same struct as the `Arc<SlotMutex>` it
/// borrows from (an ordinary owning-guard pattern the borrow checker
/// cannot express on its own).
///
/// # Safety
///
/// The guard's actual referent is the heap allocation behind an
/// `Arc<SlotMutex>`. Each table slot keeps its own `content: Arc<SlotMutex>`
/// for the entire lifetime of the `InodeTable` (`put` resets its
/// contents to `Content::Empty` in place; it never replaces or drops the
/// slot's `Arc`), so that allocation outlives any `&InodeTable` borrow,
/// which in turn outlives the `'a` this is cast to.
unsafe fn extend_content_guard_lifetime<'a, 'b, SlotMutex>(guard: SlotMutex::Guard<'b>) -> SlotMutex::Guard<'a>
where
    SlotMutex: Mutex + 'a + 'b,
{
    let guard = core::mem::ManuallyDrop::new(guard);
    unsafe { core::ptr::read((&raw const *guard).cast()) }
}

/// A locked inode content guard, returned by [`InodeTable::lock`].
pub struct InodeGuard<'a, SlotMutex>
where
    SlotMutex: Mutex + 'a,
{
    handle: InodeHandle,
    content: Arc<SlotMutex>,
    guard: SlotMutex::Guard<'a>,
}

impl<'a, LFS, SlotMutex> InodeGuard<'a, SlotMutex>
where
    LFS: LowerFs,
    SlotMutex: Mutex<Data = Content<LFS>> + 'a,
{
    #[must_use]
    pub fn handle(&self) -> InodeHandle {
        self.handle
    }

    #[must_use]
    pub fn content(&self) -> &Content<LFS> {
        &self.guard
    }

    pub fn content_mut(&mut self) -> &mut Content<LFS> {
        &mut self.guard
    }

    #[must_use]
    pub fn outstanding_holders(&self) -> usize {
        Arc::strong_count(&self.content)
    }
}

/// Newtype around `Arc<InodeTable<..>>` so [`page_cache::Host`] (a
/// foreign trait) can be implemented for it; Rust's orphan rules forbid
/// implementing a foreign trait directly for `Arc<InodeTable<..>>`,
/// since neither `Arc` nor the trait is local to this crate. Cloning
/// this type clones the inner `Arc`, so it still shares the same table
/// as the rest of [`crate::Vfs`].
pub struct InodeTableHost<LFS, TableMutex>(pub Arc<InodeTable<LFS, TableMutex>>);

impl<LFS, TableMutex> Clone for InodeTableHost<LFS, TableMutex> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<LFS, TableMutex> core::ops::Deref for InodeTableHost<LFS, TableMutex> {
    type Target = InodeTable<LFS, TableMutex>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Lets [`crate::byteio`] address the inode table through a
/// [`page_cache::PageCache`] alone: the cache's host is an `Arc` clone of
/// the table, and `host()` hands that `Arc` straight back.
impl<LFS, TableMutex, SlotMutex> page_cache::Host for InodeTableHost<LFS, TableMutex>
where
    LFS: LowerFs,
    SlotMutex: Mutex<Data = Content<LFS>>,
    TableMutex: Mutex<Data = TableState<LFS, SlotMutex>>,
{
    type Ref = InodeHandle;
    type Error = VfsError<LFS::Error>;

    fn dup(&self, host: &InodeHandle) -> InodeHandle {
        InodeTable::dup(self, *host)
    }

    fn put(&self, host: InodeHandle) {
        InodeTable::put(self, host);
    }

    fn read_page(&self, host: &InodeHandle, offset: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<usize, Self::Error> {
        self.read_bytes(*host, offset, buf)
    }

    fn write_page(&self, host: &InodeHandle, offset: u64, data: &[u8]) -> Result<(), Self::Error> {
        self.write_bytes(*host, offset, data).map(|_| ())
    }

    fn file_size(&self, host: &InodeHandle) -> Result<u64, Self::Error> {
        InodeTable::file_size(self, *host)
    }
}
