//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! [`ErrorKind`] is `Clone` because a de-duplicated download hands the same
//! failure to every caller that joined it. The full error tree is logged
//! once, where it happens; joiners receive the kind only.

use derive_more::{Display, Error};
use kura_asyncutils::Aborted;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request never produced a response (DNS, connect, timeout, reset).
    #[display("request failed: {_0}")]
    Network(#[error(not(source))] String),
    /// The server answered with a non-success status.
    #[display("HTTP {status} from {url}")]
    Status {
        #[error(not(source))]
        status: u16,
        #[error(not(source))]
        url: String,
    },
    /// A request header name or value is not valid HTTP.
    #[display("invalid request header: {_0}")]
    InvalidHeader(#[error(not(source))] String),
    /// Reading, writing or deleting cache files failed.
    #[display("cache storage error")]
    Storage,
    /// The record store failed.
    #[display("record store error")]
    Store,
    #[display("configuration error")]
    Config,
    /// The operation this caller joined died without a result.
    #[display("in-flight operation was aborted")]
    Aborted,
}

impl From<Aborted> for ErrorKind {
    fn from(_: Aborted) -> Self {
        Self::Aborted
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Aborted => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` for failures of the local cache itself, as opposed to
    /// the upstream source. Fetching without the cache may still work.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Storage | Self::Store | Self::Aborted)
    }
}
