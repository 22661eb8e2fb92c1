use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the buffered file, the allocator, the block layer and
/// both B-Trees.
///
/// A missing key is not represented here: per the error taxonomy, `search`
/// returns `None` and `delete` returns `false` rather than raising.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Raw read/write/truncate/open failure. Propagated as-is.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Block header/footer mismatch, bad magic, truncated node, or a size
    /// outside the admissible range. Fatal for the current operation; the
    /// allocator that raised it should be treated as read-only until
    /// remounted.
    #[error("block corruption at offset 0x{offset:x}: {reason}")]
    BlockCorruption { offset: u64, reason: &'static str },

    /// Node magic mismatch or an internal B-Tree invariant violation.
    /// Handled identically to `BlockCorruption`.
    #[error("btree corruption at offset 0x{offset:x}: {reason}")]
    BTreeCorruption { offset: u64, reason: &'static str },

    /// Freeing an already-free block, allocating zero bytes, using a stale
    /// iterator. Leaves on-disk state unchanged.
    #[error("logic error: {0}")]
    Logic(&'static str),

    /// Commit/abort with no active transaction, or begin while one is
    /// already active.
    #[error("transaction violation: {0}")]
    TransactionViolation(&'static str),

    /// Couldn't take the exclusive advisory lock on the backing file.
    #[error("failed to acquire exclusive lock on {path}")]
    Lock { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, Error>;
