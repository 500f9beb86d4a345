//! Shared wire and in-memory record types for the virtual inode layer.
//!
//! None of these types own any synchronization or lower-filesystem state;
//! they are plain data, either `#[repr(C)]`/[`Pod`] records exchanged with
//! the lower filesystem or plain Rust enums used inside the core.
#![no_std]

use dataview::Pod;
use strum::FromRepr;
use vfs_params::{BSIZE, DEVICE_MAGIC, SYMLINK_MAGIC};

/// The kind of filesystem object a live inode slot represents.
///
/// This is a closed set: dispatch over it is a `match`, never a trait
/// object, because the lower filesystem can only ever hand back one of
/// these three shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Dir,
    File,
    Device,
}

/// Major/minor pair identifying a device inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceId {
    pub major: i16,
    pub minor: i16,
}

/// `d_type` values for [`DirRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum DirEntryType {
    Dir = 4,
    Reg = 8,
}

/// File mode bits reported in [`Stat::mode`].
pub mod mode {
    pub const S_IFDIR: u32 = 0o040_000;
    pub const S_IFREG: u32 = 0o100_000;
    pub const S_IFCHR: u32 = 0o020_000;
}

/// `stat(2)`-style metadata for an inode, populated per the fields this
/// layer can actually supply (the lower filesystem does not track
/// hard-link counts, inode numbers, or timestamps).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct Stat {
    /// Filesystem's disk device.
    pub dev: u32,
    /// Always `1`: the lower filesystem does not support hard links.
    pub nlink: i16,
    pub padding: [u8; 2],
    /// One of `S_IFDIR`, `S_IFREG`, `S_IFCHR`.
    pub mode: u32,
    pub padding3: [u8; 4],
    /// Size in bytes; `4` for directories.
    pub size: u64,
    /// Preferred I/O block size, always [`BSIZE`].
    pub blksize: u32,
    pub padding2: [u8; 4],
    /// `ceil(size / BSIZE)`.
    pub blocks: u64,
}

impl Stat {
    #[must_use]
    pub fn for_kind(kind: FileKind, dev: u32, size: u64) -> Self {
        let mode = match kind {
            FileKind::Dir => mode::S_IFDIR,
            FileKind::File => mode::S_IFREG,
            FileKind::Device => mode::S_IFCHR,
        };
        let size = if kind == FileKind::Dir { 4 } else { size };
        Self {
            dev,
            nlink: 1,
            padding: [0; 2],
            mode,
            padding3: [0; 4],
            size,
            #[expect(clippy::cast_possible_truncation, reason = "BSIZE fits in u32")]
            blksize: BSIZE as u32,
            padding2: [0; 4],
            blocks: size.div_ceil(BSIZE as u64),
        }
    }
}

/// On-disk layout of a device sentinel record: the entire contents of a
/// file that represents a character device rather than regular data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct DeviceRecord {
    pub magic: u32,
    pub major: i16,
    pub minor: i16,
}

impl DeviceRecord {
    #[must_use]
    pub fn new(device: DeviceId) -> Self {
        Self {
            magic: DEVICE_MAGIC,
            major: device.major,
            minor: device.minor,
        }
    }

    #[must_use]
    pub fn is_device_record(bytes: &[u8]) -> bool {
        bytes.len() >= size_of::<u32>() && u32::from_le_bytes(bytes[..4].try_into().unwrap()) == DEVICE_MAGIC
    }
}

/// Leading magic of a symlink sentinel record; the remainder of the file
/// is a NUL-terminated absolute path and is not fixed-size, so it has no
/// `Pod` representation here (see `lower_fs::symlink` for the codec).
pub const SYMLINK_RECORD_MAGIC: u32 = SYMLINK_MAGIC;

/// One output record of `getdents`, as returned to the caller's buffer.
#[derive(Debug, Clone, Copy)]
pub struct DirRecord<'a> {
    pub ino: u64,
    pub off: u64,
    pub ty: DirEntryType,
    pub name: &'a [u8],
}

impl DirRecord<'_> {
    /// Fixed-header length, not counting the name or its terminator.
    pub const HEADER_LEN: usize = size_of::<u64>() + size_of::<u64>() + size_of::<u16>() + size_of::<u8>();

    #[must_use]
    pub fn reclen(&self) -> usize {
        Self::HEADER_LEN + self.name.len() + 1
    }

    /// Encodes the record into `buf`, returning the number of bytes
    /// written, or `None` if it would not fit.
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let reclen = self.reclen();
        if buf.len() < reclen {
            return None;
        }
        let d_reclen = u16::try_from(reclen).ok()?;
        buf[0..8].copy_from_slice(&self.ino.to_le_bytes());
        buf[8..16].copy_from_slice(&self.off.to_le_bytes());
        buf[16..18].copy_from_slice(&d_reclen.to_le_bytes());
        buf[18] = self.ty as u8;
        let name_start = Self::HEADER_LEN;
        buf[name_start..name_start + self.name.len()].copy_from_slice(self.name);
        buf[name_start + self.name.len()] = 0;
        Some(reclen)
    }
}
