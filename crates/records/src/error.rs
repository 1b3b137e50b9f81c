//! Record Store Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A record store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for record store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// Reading or writing a snapshot file failed.
    #[display("snapshot I/O failed: {}", _0.display())]
    SnapshotIo(#[error(not(source))] PathBuf),
    /// A snapshot file failed validation and must not be loaded or installed.
    #[display("invalid snapshot: {_0}")]
    InvalidSnapshot(#[error(not(source))] SnapshotDefect),
    /// The snapshot passed validation but its tables could not be loaded.
    #[display("snapshot could not be restored: {}", _0.display())]
    Restore(#[error(not(source))] PathBuf),
    /// Owner keys must look like `collection:item`.
    #[display("invalid owner id: {_0:?}")]
    InvalidOwner(#[error(not(source))] String),
    /// Stored data could not be converted to or from its model.
    #[display("invalid record data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SnapshotIo(_))
    }
}

/// Why a snapshot file was rejected.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDefect {
    #[display("shorter than the 100-byte SQLite header")]
    Truncated,
    #[display("missing SQLite header magic")]
    BadMagic,
    #[display("page size {_0} is not a power of two between 512 and 65536")]
    BadPageSize(u32),
    #[display("header declares zero pages")]
    NoPages,
    #[display("header declares {declared} bytes but the file holds {actual}")]
    LengthMismatch { declared: u64, actual: u64 },
}
