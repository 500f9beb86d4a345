//! The tier-1 error taxonomy. Tier-2 (programmer) and tier-3
//! (data-integrity) conditions are not represented here; they are
//! `panic!`/`assert!` call sites at the point of violation.

/// Recoverable failure of a single virtual-inode-layer operation.
#[derive(Debug, thiserror::Error)]
pub enum VfsError<E> {
    /// No slot matched the requested path, or a symlink's target is gone.
    #[error("path not found")]
    NotFound,
    /// Every cache slot was pinned; nothing could be evicted.
    #[error("no free cache slot")]
    NoSpace,
    /// A directory operation was attempted on a non-directory inode, or
    /// vice versa.
    #[error("inode type mismatch")]
    TypeMismatch,
    /// A sentinel record's magic matched but the remaining bytes did not
    /// decode (e.g. a symlink record naming a non-absolute target).
    #[error("corrupt sentinel record")]
    Corruption,
    /// The lower filesystem reported a failure on a recoverable path
    /// (lookup, cache fill).
    #[error("lower filesystem error")]
    Io(#[from] E),
}
