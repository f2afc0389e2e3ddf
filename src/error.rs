//! Error types for chunk operations.
//!
//! Lock timeouts and resource exhaustion are returned as values; invariant
//! breaches (releasing a lock on a deleted chunk, handing unreserved CIDs to
//! `create_reserved`, out-of-range addresses) are programmer errors caught by
//! assertions.

use thiserror::Error;

/// Status of a failed chunk operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The CID is not backed by a chunk (never created, or removed).
    #[error("chunk does not exist")]
    DoesNotExist,

    /// The CID itself is malformed (invalid sentinel or zero local id).
    #[error("invalid chunk id")]
    InvalidId,

    /// The per-chunk lock could not be acquired within the timeout.
    #[error("lock timeout")]
    LockTimeout,

    /// The heap could not satisfy the allocation, or the local id space of
    /// this node is exhausted.
    #[error("out of memory")]
    OutOfMemory,

    /// Requested chunk size outside the supported range.
    #[error("chunk size out of range: {0}")]
    SizeOutOfRange(usize),

    /// A heap read or write stopped short of the requested length.
    #[error("incomplete heap i/o")]
    IncompleteIo,
}

/// Result alias for chunk operations.
pub type Result<T> = std::result::Result<T, Error>;
