//! End-to-end tests against the in-memory lower-FS mock, exercising the
//! [`vfs_core::Vfs`] facade the way a kernel syscall layer would.

use std::sync::Mutex as StdMutex;

use lower_fs::mock::InMemoryFs;
use mutex_api::Mutex;
use vfs_core::{itable, Vfs};
use vfs_params::{DEVICE_MAGIC, NCACHE, PAGE_SIZE};
use vfs_types::{DeviceId, FileKind};

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

type SlotMutex = StdLock<itable::Content<InMemoryFs>>;
type TableMutex = StdLock<itable::TableState<InMemoryFs, SlotMutex>>;
type PageMutex = StdLock<page_cache::Page>;
type CacheTableMutex = StdLock<page_cache::Table<std::sync::Arc<itable::InodeTable<InMemoryFs, TableMutex>>, PageMutex>>;
type TestVfs = Vfs<InMemoryFs, TableMutex, CacheTableMutex>;

fn new_vfs() -> TestVfs {
    Vfs::new(InMemoryFs::new())
}

#[test]
fn create_write_read_round_trip() {
    let vfs = new_vfs();
    let root = vfs.root();
    let file = vfs.create(root, "a.txt", FileKind::File, DeviceId::default()).unwrap();

    assert_eq!(vfs.writei(file, b"hello", 0), 5);
    let mut buf = [0u8; 5];
    assert_eq!(vfs.readi(file, &mut buf, 0), 5);
    assert_eq!(&buf, b"hello");

    vfs.put(file);
    vfs.put(root);
}

#[test]
fn fills_cache_and_evicts_lru_tail_with_dirty_data_preserved() {
    // One file spread across NCACHE + 1 page-aligned offsets: enough
    // distinct (host, offset) pairs to exceed the cache's capacity
    // while keeping the inode table to a single open file.
    let vfs = new_vfs();
    let root = vfs.root();
    let file = vfs.create(root, "big", FileKind::File, DeviceId::default()).unwrap();

    for i in 0..(NCACHE + 1) {
        let off = (i * PAGE_SIZE) as u64;
        vfs.writei(file, &[0xAB; PAGE_SIZE], off);
    }

    // Page 0 was the LRU tail and had to be evicted to make room for
    // the last page; its dirty write-back must still be visible.
    let mut buf = [0u8; PAGE_SIZE];
    assert_eq!(vfs.readi(file, &mut buf, 0), PAGE_SIZE);
    assert!(buf.iter().all(|&b| b == 0xAB));

    vfs.put(file);
    vfs.put(root);
}

#[test]
fn write_spanning_a_page_boundary_splits_correctly() {
    let vfs = new_vfs();
    let root = vfs.root();
    let file = vfs.create(root, "split", FileKind::File, DeviceId::default()).unwrap();

    let off = (PAGE_SIZE - 5) as u64;
    vfs.writei(file, b"0123456789", off);

    let mut buf = [0u8; 10];
    assert_eq!(vfs.readi(file, &mut buf, off), 10);
    assert_eq!(&buf, b"0123456789");

    vfs.put(file);
    vfs.put(root);
}

#[test]
fn link_aliases_content_through_a_symlink_record() {
    let vfs = new_vfs();
    let root = vfs.root();

    let a = vfs.create(root, "a", FileKind::File, DeviceId::default()).unwrap();
    vfs.writei(a, b"content of a", 0);

    let b = vfs.create(root, "b", FileKind::File, DeviceId::default()).unwrap();
    vfs.link(a, b).unwrap();
    vfs.put(b);

    let b2 = vfs.lookup("/b", None).unwrap().unwrap();
    let mut buf = [0u8; 12];
    assert_eq!(vfs.readi(b2, &mut buf, 0), 12);
    assert_eq!(&buf, b"content of a");

    vfs.put(a);
    vfs.put(b2);
    vfs.put(root);
}

#[test]
fn unlink_removes_the_path_at_last_put() {
    let vfs = new_vfs();
    let root = vfs.root();

    let tmp = vfs.create(root, "tmp", FileKind::File, DeviceId::default()).unwrap();
    vfs.unlink(tmp);
    assert!(vfs.lookup("/tmp", None).unwrap().is_some(), "still open, not yet removed");
    vfs.put(tmp);

    assert!(vfs.lookup("/tmp", None).unwrap().is_none());
    vfs.put(root);
}

#[test]
fn device_sentinel_record_is_recognized_on_reopen() {
    let vfs = new_vfs();
    let root = vfs.root();

    let dev = vfs
        .create(root, "console", FileKind::Device, DeviceId { major: 1, minor: 2 })
        .unwrap();
    vfs.put(dev);

    let reopened = vfs.lookup("/console", None).unwrap().unwrap();
    assert_eq!(vfs.kind(reopened), FileKind::Device);

    vfs.put(reopened);
    vfs.put(root);
}

#[test]
fn rename_updates_the_live_path_at_last_put() {
    let vfs = new_vfs();
    let root = vfs.root();

    let ip = vfs.create(root, "old", FileKind::File, DeviceId::default()).unwrap();
    vfs.rename(ip, "/new".to_string());
    vfs.put(ip);

    assert!(vfs.lookup("/new", None).unwrap().is_some());
    assert!(vfs.lookup("/old", None).unwrap().is_none());
    vfs.put(root);
}

#[test]
fn read_at_or_past_eof_returns_zero() {
    let vfs = new_vfs();
    let root = vfs.root();
    let file = vfs.create(root, "empty", FileKind::File, DeviceId::default()).unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(vfs.readi(file, &mut buf, 0), 0);

    vfs.put(file);
    vfs.put(root);
}

#[test]
fn truncate_drops_cached_pages_and_lower_fs_content() {
    let vfs = new_vfs();
    let root = vfs.root();
    let file = vfs.create(root, "grows", FileKind::File, DeviceId::default()).unwrap();

    vfs.writei(file, b"some data", 0);
    vfs.truncate(file).unwrap();

    let mut buf = [0u8; 9];
    assert_eq!(vfs.readi(file, &mut buf, 0), 0);

    vfs.put(file);
    vfs.put(root);
}

#[test]
fn directory_listing_sees_created_children() {
    let vfs = new_vfs();
    let root = vfs.root();
    let a = vfs.create(root, "a", FileKind::File, DeviceId::default()).unwrap();
    let b = vfs.create(root, "b", FileKind::File, DeviceId::default()).unwrap();

    let mut buf = [0u8; 256];
    let n = vfs.getdents(root, &mut buf).unwrap();
    assert!(n > 0);

    vfs.put(a);
    vfs.put(b);
    vfs.put(root);
}

#[test]
fn device_magic_prefix_is_detected_without_explicit_create_kind() {
    // Mirrors seed scenario 6: a file whose first bytes happen to match
    // the device sentinel is reopened as a device inode even though it
    // was created as a plain file.
    let vfs = new_vfs();
    let root = vfs.root();

    let file = vfs.create(root, "raw", FileKind::File, DeviceId::default()).unwrap();
    let mut record = [0u8; 8];
    record[0..4].copy_from_slice(&DEVICE_MAGIC.to_le_bytes());
    record[4..6].copy_from_slice(&1i16.to_le_bytes());
    record[6..8].copy_from_slice(&2i16.to_le_bytes());
    vfs.writei(file, &record, 0);
    vfs.put(file);

    let reopened = vfs.lookup("/raw", None).unwrap().unwrap();
    assert_eq!(vfs.kind(reopened), FileKind::Device);

    vfs.put(reopened);
    vfs.put(root);
}
