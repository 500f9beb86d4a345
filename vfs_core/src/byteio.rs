//! Byte-granular reads and writes layered on top of [`page_cache`],
//! page-aligning each request and delegating the actual fill/flush of a
//! page to the inode table via [`page_cache::Host`].

use lower_fs::LowerFs;
use mutex_api::Mutex;
use page_cache::{Page, PageCache, Table as PageTable};
use vfs_params::PAGE_SIZE;

use crate::itable::{Content, InodeHandle, InodeTable, InodeTableHost, TableState};

/// Reads up to `dst.len()` bytes of `ip`'s content starting at `off`.
///
/// Reads are clamped to the file's current size; a request at or past
/// EOF reads zero bytes. Never fails outright: a cache miss that can't
/// be filled just stops the copy short, and the bytes copied so far are
/// returned.
pub fn readi<LFS, TableMutex, SlotMutex, CacheTableMutex, PageMutex>(
    cache: &PageCache<InodeTableHost<LFS, TableMutex>, CacheTableMutex>,
    ip: InodeHandle,
    dst: &mut [u8],
    off: u64,
) -> usize
where
    LFS: LowerFs,
    SlotMutex: Mutex<Data = Content<LFS>>,
    TableMutex: Mutex<Data = TableState<LFS, SlotMutex>>,
    PageMutex: Mutex<Data = Page>,
    CacheTableMutex: Mutex<Data = PageTable<InodeTableHost<LFS, TableMutex>, PageMutex>>,
{
    let Ok(size) = cache.host().file_size(ip) else {
        return 0;
    };
    if off >= size {
        return 0;
    }
    let Some(requested_end) = off.checked_add(dst.len() as u64) else {
        return 0;
    };
    let want = usize::try_from(requested_end.min(size) - off).unwrap_or(0);

    let mut done = 0usize;
    while done < want {
        let pos = off + done as u64;
        let page_off = pos - pos % PAGE_SIZE as u64;
        let in_page = usize::try_from(pos - page_off).unwrap_or(0);
        let Ok(guard) = cache.acquire(&ip, page_off) else {
            break;
        };
        let n = (PAGE_SIZE - in_page).min(want - done);
        dst[done..done + n].copy_from_slice(&guard.data()[in_page..in_page + n]);
        done += n;
    }
    done
}

/// Writes `src` into `ip`'s content starting at `off`, extending the
/// lower-FS file first if `off + src.len()` exceeds its current size.
///
/// Never fails outright: if the extension or a page fill fails, the
/// copy stops short and the bytes written so far are returned.
pub fn writei<LFS, TableMutex, SlotMutex, CacheTableMutex, PageMutex>(
    cache: &PageCache<InodeTableHost<LFS, TableMutex>, CacheTableMutex>,
    ip: InodeHandle,
    src: &[u8],
    off: u64,
) -> usize
where
    LFS: LowerFs,
    SlotMutex: Mutex<Data = Content<LFS>>,
    TableMutex: Mutex<Data = TableState<LFS, SlotMutex>>,
    PageMutex: Mutex<Data = Page>,
    CacheTableMutex: Mutex<Data = PageTable<InodeTableHost<LFS, TableMutex>, PageMutex>>,
{
    let Some(end) = off.checked_add(src.len() as u64) else {
        return 0;
    };
    let Ok(size) = cache.host().file_size(ip) else {
        return 0;
    };
    if end > size && cache.host().set_size(ip, end).is_err() {
        return 0;
    }

    let mut done = 0usize;
    while done < src.len() {
        let pos = off + done as u64;
        let page_off = pos - pos % PAGE_SIZE as u64;
        let in_page = usize::try_from(pos - page_off).unwrap_or(0);
        let Ok(mut guard) = cache.acquire(&ip, page_off) else {
            break;
        };
        let n = (PAGE_SIZE - in_page).min(src.len() - done);
        guard.data_mut()[in_page..in_page + n].copy_from_slice(&src[done..done + n]);
        done += n;
    }
    done
}
