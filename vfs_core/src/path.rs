//! Path-string splitting and the name-resolution driver built on top of
//! [`crate::itable`].

use mutex_api::Mutex;
use vfs_params::DIRSIZ;
use vfs_types::FileKind;

use crate::{
    error::VfsError,
    itable::{Content, InodeHandle, InodeTable, TableState},
};

/// Splits the next path component off `path`.
///
/// Skips leading separators, copies up to the next separator (bounded
/// by `DIRSIZ` bytes) into the returned name, and skips the separators
/// trailing it. Returns `None` iff `path` names no component.
///
/// The third element is `true` when the component's real length
/// exceeds `DIRSIZ`; [`resolve`] is the only caller that rejects this,
/// other callers receive the truncated name.
#[must_use]
pub fn next_component(path: &str) -> Option<(&str, &str, bool)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    let end = path.find('/').unwrap_or(path.len());
    let mut truncated_end = end.min(DIRSIZ);
    while truncated_end > 0 && !path.is_char_boundary(truncated_end) {
        truncated_end -= 1;
    }
    let name = &path[..truncated_end];
    let rest = path[end..].trim_start_matches('/');
    Some((name, rest, end > DIRSIZ))
}

/// Resolves `path` to an inode, starting from `cwd` (or the root if
/// `cwd` is `None` and `path` is relative).
///
/// With `want_parent`, stops one component early and returns the
/// parent directory of the final component instead of the component
/// itself; returns `Ok(None)` if `path` has no final component to stop
/// before (e.g. `""`, `"/"`).
///
/// # Errors
///
/// Returns [`VfsError::TypeMismatch`] if a non-final component is not a
/// directory, or [`VfsError::Io`] if the lower filesystem fails.
pub fn resolve<LFS, TableMutex, SlotMutex>(
    table: &InodeTable<LFS, TableMutex>,
    path: &str,
    want_parent: bool,
    cwd: Option<InodeHandle>,
) -> Result<Option<InodeHandle>, VfsError<LFS::Error>>
where
    LFS: lower_fs::LowerFs,
    SlotMutex: Mutex<Data = Content<LFS>>,
    TableMutex: Mutex<Data = TableState<LFS, SlotMutex>>,
{
    let mut cur = if path.starts_with('/') {
        table.root()
    } else {
        cwd.map_or_else(|| table.root(), |h| table.dup(h))
    };

    let mut rest = path;
    loop {
        let Some((name, tail, overflow)) = next_component(rest) else {
            if want_parent {
                table.put(cur);
                return Ok(None);
            }
            return Ok(Some(cur));
        };

        if table.kind(cur) != FileKind::Dir {
            table.put(cur);
            return Err(VfsError::TypeMismatch);
        }

        if overflow {
            table.put(cur);
            return Ok(None);
        }

        if want_parent && tail.is_empty() {
            return Ok(Some(cur));
        }

        let child = table.dirlookup(cur, name);
        table.put(cur);
        match child? {
            Some(child) => {
                cur = child;
                rest = tail;
            }
            None => return Ok(None),
        }
    }
}
