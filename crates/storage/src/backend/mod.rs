//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, the interface the caches
//! use for every operation on a cache directory.

mod local;

pub use self::local::LocalBackend;
use crate::error::Result;
use crate::models::FileInfo;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;

pub(crate) type FileInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<FileInfo>> + Send + 'a>>;

/// Unified interface for a flat cache directory.
///
/// All entry names are relative to the cache root and are validated with
/// [`validate_entry`](crate::validate_entry) before use.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use kura_storage::{StorageBackend, error::Result};
///
/// async fn cached_size(backend: &dyn StorageBackend, hash: &str) -> Result<Option<u64>> {
///     let entry = Path::new(hash);
///     if backend.exists(entry).await? {
///         Ok(Some(backend.stat(entry).await?.size))
///     } else {
///         Ok(None)
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the cache this backend serves (used for logging only).
    fn name(&self) -> &str;

    /// Absolute filesystem path of an entry, for handing to callers that
    /// read the file themselves.
    fn locate(&self, entry: &Path) -> Result<PathBuf>;

    /// Inverse of [`locate()`](Self::locate): the entry name for an absolute
    /// path, or an error if the path is not an entry of this cache.
    fn entry_of(&self, absolute: &Path) -> Result<PathBuf>;

    /// Stream metadata for every entry.
    ///
    /// Entries that disappear while the walk is running are skipped.
    fn list_stream(&self) -> FileInfoStream<'_>;

    /// Collect [`list_stream()`](Self::list_stream) into a [`Vec`].
    async fn list(&self) -> Result<Vec<FileInfo>> {
        self.list_stream().try_collect().await
    }

    /// Total size in bytes of every entry, measured on disk.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use kura_storage::{StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let bytes = backend.usage().await?;
    /// println!("cache holds {bytes} bytes");
    /// # Ok(())
    /// # }
    /// ```
    async fn usage(&self) -> Result<u64> {
        self.list_stream().try_fold(0u64, |total, info| async move { Ok::<_, crate::error::Error>(total + info.size) }).await
    }

    /// Check if an entry exists.
    async fn exists(&self, entry: &Path) -> Result<bool>;

    /// Read an entry's contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the entry
    /// does not exist.
    async fn read(&self, entry: &Path) -> Result<Vec<u8>>;

    /// Write an entry, replacing any previous contents.
    ///
    /// Readers never observe a partially written entry: the data goes to a
    /// hidden sibling first and is renamed into place.
    async fn write(&self, entry: &Path, data: &[u8]) -> Result<()>;

    /// Delete an entry.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the entry
    /// does not exist; callers that treat "already gone" as success should
    /// check [`is_not_found()`](crate::error::ErrorKind::is_not_found).
    async fn delete(&self, entry: &Path) -> Result<()>;

    /// Get entry metadata without reading contents.
    async fn stat(&self, entry: &Path) -> Result<FileInfo>;

    /// Remove every entry (and anything else) under the cache root, leaving
    /// an empty root directory behind.
    async fn purge(&self) -> Result<()>;
}
