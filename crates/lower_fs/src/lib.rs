//! The lower filesystem contract and the sentinel record codecs used to
//! extend it with file kinds it does not natively support.
//!
//! This crate names the interface the virtual inode layer consumes; it is
//! never the filesystem implementation itself. [`mock`] (behind the
//! `mock` feature) is a `std`-backed reference implementation used only by
//! tests.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::String;

use bitflags::bitflags;

bitflags! {
    /// Access-mode flags passed to [`LowerFs::open_file`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct OpenFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        /// Create the file if it does not exist.
        const CREATE = 0x4;
        /// Truncate an existing file to zero length on open.
        const TRUNC = 0x8;
    }
}

/// One entry yielded by a [`LowerDir`]'s iterator.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub is_dir: bool,
}

/// A directory cursor open on the lower filesystem.
pub trait LowerDir {
    type Error;

    /// Returns the next entry, or `None` at end of directory. The lower
    /// filesystem decides whether `.`/`..` are materialized; this layer
    /// never synthesizes them.
    fn next_entry(&mut self) -> Result<Option<Entry>, Self::Error>;
}

/// A file cursor open on the lower filesystem.
pub trait LowerFile {
    type Error;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Self::Error>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize, Self::Error>;
    fn size(&self) -> Result<u64, Self::Error>;
    fn truncate(&mut self, len: u64) -> Result<(), Self::Error>;
}

/// The block-oriented filesystem backend this layer is built on top of.
///
/// Implementations operate purely on path strings; this layer owns no
/// on-disk format of its own and delegates every mutation here.
pub trait LowerFs {
    type Error;
    type File: LowerFile<Error = Self::Error>;
    type Dir: LowerDir<Error = Self::Error>;

    fn open_dir(&self, path: &str) -> Result<Self::Dir, Self::Error>;
    fn open_file(&self, path: &str, flags: OpenFlags) -> Result<Self::File, Self::Error>;
    fn mkdir(&self, path: &str) -> Result<(), Self::Error>;
    fn unlink(&self, path: &str) -> Result<(), Self::Error>;
    fn rename(&self, from: &str, to: &str) -> Result<(), Self::Error>;
}

/// Encode/decode for the symlink sentinel record (`magic`, then a
/// NUL-terminated absolute path). Unlike [`vfs_types::DeviceRecord`] this
/// has no fixed size, so it is not a `Pod` struct.
pub mod symlink {
    use alloc::{string::String, vec::Vec};

    use vfs_params::SYMLINK_MAGIC;

    #[must_use]
    pub fn encode(target_path: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(size_of::<u32>() + target_path.len() + 1);
        buf.extend_from_slice(&SYMLINK_MAGIC.to_le_bytes());
        buf.extend_from_slice(target_path.as_bytes());
        buf.push(0);
        buf
    }

    /// Returns the target path if `bytes` is a well-formed symlink
    /// record: correct magic, NUL terminator present, and the target
    /// starts with `/`.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<String> {
        let magic_len = size_of::<u32>();
        let magic = bytes.get(..magic_len)?;
        if u32::from_le_bytes(magic.try_into().ok()?) != SYMLINK_MAGIC {
            return None;
        }
        let rest = &bytes[magic_len..];
        let nul = rest.iter().position(|&b| b == 0)?;
        let path = core::str::from_utf8(&rest[..nul]).ok()?;
        if !path.starts_with('/') {
            return None;
        }
        Some(String::from(path))
    }

    #[must_use]
    pub fn is_symlink_record(bytes: &[u8]) -> bool {
        bytes.len() >= size_of::<u32>()
            && u32::from_le_bytes(bytes[..size_of::<u32>()].try_into().unwrap()) == SYMLINK_MAGIC
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(test)]
mod tests {
    use super::symlink;

    #[test]
    fn symlink_round_trip() {
        let encoded = symlink::encode("/a/b/c");
        assert!(symlink::is_symlink_record(&encoded));
        assert_eq!(symlink::decode(&encoded).as_deref(), Some("/a/b/c"));
    }

    #[test]
    fn symlink_rejects_relative_target() {
        let encoded = symlink::encode("not-absolute");
        // malformed per the contract, but still round-trips the magic
        assert!(symlink::is_symlink_record(&encoded));
        assert_eq!(symlink::decode(&encoded), None);
    }

    #[test]
    fn symlink_rejects_bad_magic() {
        assert_eq!(symlink::decode(b"\x00\x00\x00\x00/a\0"), None);
    }
}
