//! Storage models.

use std::path::PathBuf;

/// Metadata about one entry in a cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Entry name relative to the cache root
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
}
impl FileInfo {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self { path: path.into(), size }
    }
}
