//! Local filesystem storage backend.
//!
//! Entries are plain files directly under a configured root directory,
//! accessed through `tokio::fs`.

use crate::backend::FileInfoStream;
use crate::error::{ErrorKind, Result};
use crate::{FileInfo, StorageBackend, path::validate as validate_entry};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, DirEntry};

/// Makes concurrent writes of the same entry use different temporary files.
static WRITE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

enum WalkEntry {
    File(FileInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// # Examples
///
/// ```no_run
/// use kura_storage::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("assets", "/var/cache/kura/assets").map_err(|e| e.to_string())?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct LocalBackend {
    name: String,
    /// Root directory of the cache
    root: PathBuf,
}
impl LocalBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRoot`](ErrorKind::InvalidRoot) if the path is not
    /// absolute or exists but is not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidRoot(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidRoot(root));
            }
        } else {
            // Use non-async here; it'll only happen once on cache
            // initialization and it's not worth making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute_path(&self, entry: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_entry(entry.as_ref())?;
        Ok(self.root.join(validated))
    }

    fn temporary_path(&self, entry: &Path) -> PathBuf {
        let sequence = WRITE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let mut name = std::ffi::OsString::from(".");
        name.push(entry.as_os_str());
        name.push(format!(".{sequence}.part"));
        self.root.join(name)
    }

    fn metadata(path: &Path, metadata: &Metadata) -> FileInfo {
        FileInfo::new(path, metadata.len())
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Classify one directory entry of the walk. Entries deleted between
    /// `read_dir` and `metadata` are skipped rather than reported.
    async fn process_entry(&self, entry: DirEntry) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(WalkEntry::Skip),
            Err(e) => exn::bail!(Self::map_io_error(e, &path)),
        };
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        if metadata.is_file() {
            let relative = path.strip_prefix(&self.root).unwrap_or(&path);
            return Ok(WalkEntry::File(Self::metadata(relative, &metadata)));
        }
        // Note: silently drop what is most likely a broken symlink.
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn locate(&self, entry: &Path) -> Result<PathBuf> {
        self.absolute_path(entry)
    }

    fn entry_of(&self, absolute: &Path) -> Result<PathBuf> {
        let relative = absolute
            .strip_prefix(&self.root)
            .or_raise(|| ErrorKind::InvalidEntry(absolute.to_path_buf()))?;
        validate_entry(relative)
    }

    fn list_stream(&self) -> FileInfoStream<'_> {
        let mut stack = vec![self.root.clone()];
        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // A directory removed mid-walk (or a purged root) is empty,
                    // not an error.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, entry: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(entry)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, entry: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(entry)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, entry))?)
    }

    async fn write(&self, entry: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(entry)?;
        // Someone may have purged the root since construction.
        fs::create_dir_all(&self.root).await.map_err(|e| Self::map_io_error(e, &self.root))?;
        let temporary = self.temporary_path(entry);
        if let Err(e) = fs::write(&temporary, data).await {
            _ = fs::remove_file(&temporary).await;
            exn::bail!(Self::map_io_error(e, entry));
        }
        if let Err(e) = fs::rename(&temporary, &abs_path).await {
            _ = fs::remove_file(&temporary).await;
            exn::bail!(Self::map_io_error(e, entry));
        }
        tracing::trace!(cache = %self.name, entry = %entry.display(), bytes = data.len(), "Wrote cache entry");
        Ok(())
    }

    async fn delete(&self, entry: &Path) -> Result<()> {
        let abs_path = self.absolute_path(entry)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, entry))?)
    }

    async fn stat(&self, entry: &Path) -> Result<FileInfo> {
        let abs_path = self.absolute_path(entry)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, entry))?;
        Ok(Self::metadata(entry, &metadata))
    }

    async fn purge(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => exn::bail!(Self::map_io_error(e, &self.root)),
        }
        fs::create_dir_all(&self.root).await.map_err(|e| Self::map_io_error(e, &self.root))?;
        tracing::info!(cache = %self.name, root = %self.root.display(), "Purged cache directory");
        Ok(())
    }
}
