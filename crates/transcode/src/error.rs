//! Transcoding Error Types

use derive_more::{Display, Error};

/// A transcoding error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for transcoding operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// None of these are worth retrying with the same input: callers keep the
/// original bytes instead.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input is not an image format we can decode.
    #[display("could not decode image")]
    Decode,
    #[display("could not encode JPEG")]
    Encode,
    /// The encoder succeeded but produced nothing.
    #[display("encoder produced no output")]
    EmptyOutput,
    #[display("JPEG quality must be between 1 and 100, got {_0}")]
    InvalidQuality(#[error(not(source))] u8),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
