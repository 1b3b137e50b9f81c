//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Entry does not exist
    #[display("entry not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Access denied
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Entry name is not a single, plain file name inside the cache directory
    #[display("invalid entry: {}", _0.display())]
    InvalidEntry(#[error(not(source))] PathBuf),
    /// The cache root itself is unusable (relative, or not a directory)
    #[display("invalid cache root: {}", _0.display())]
    InvalidRoot(#[error(not(source))] PathBuf),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Returns `true` for errors that mean "it's already gone".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ErrorKind::NotFound(PathBuf::from("abc")).to_string(), "entry not found: abc");
        assert_eq!(ErrorKind::InvalidEntry(PathBuf::from("../x")).to_string(), "invalid entry: ../x");
    }

    #[test]
    fn test_classification() {
        assert!(ErrorKind::NotFound(PathBuf::from("abc")).is_not_found());
        assert!(!ErrorKind::NotFound(PathBuf::from("abc")).is_retryable());
        assert!(ErrorKind::Io(IoError::other("disk on fire")).is_retryable());
    }
}
