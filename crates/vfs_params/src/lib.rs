//! Compile-time tunables for the virtual inode layer and its page cache.
//!
//! These are kernel parameters, not runtime configuration: the lower
//! filesystem and page allocator are injected as generics/trait objects by
//! the caller, so nothing here needs to vary at runtime.
#![no_std]

/// Number of slots in the inode table.
pub const NINODE: usize = 50;

/// Number of slots in the page cache table.
pub const NCACHE: usize = 64;

/// Size, in bytes, of one page cache slot and of one physical page frame.
pub const PAGE_SIZE: usize = 4096;

/// Maximum length, in bytes, of an absolute path string.
pub const MAXPATH: usize = 128;

/// Maximum length, in bytes, of a single path component (directory entry
/// name), not counting the terminating NUL.
pub const DIRSIZ: usize = 14;

/// Block size of the lower filesystem, used for `st_blksize`/`st_blocks`.
pub const BSIZE: usize = 1024;

/// Device identifier of the filesystem root device.
pub const ROOTDEV: usize = 1;

/// Magic number identifying a device sentinel record.
pub const DEVICE_MAGIC: u32 = 0x5445_5644; // "DVTE" swapped to read as ASCII-ish in a hex dump.

/// Magic number identifying a symlink sentinel record.
pub const SYMLINK_MAGIC: u32 = 0x4b4e_494c; // "LINK" swapped, same reasoning.
