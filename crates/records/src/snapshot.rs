//! Snapshot file protocol.
//!
//! The canonical file only ever changes by atomic rename of a fully written,
//! validated temporary sibling. Siblings of `records.db`:
//!
//! - `records.db.tmp`: a flush in progress (a leftover one is a crashed flush)
//! - `records.db.backup`: copy of the last snapshot that loaded cleanly
//! - `records.db.corrupt.<unix seconds>[.<n>]`: quarantined, never loaded again

use crate::db::Database;
use crate::error::{ErrorKind, Result, SnapshotDefect};
use exn::ResultExt;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use tokio::fs;
use tokio::io::AsyncReadExt;

const MAGIC: &[u8; 16] = b"SQLite format 3\0";
const HEADER_LEN: usize = 100;

/// Number of bytes a database file must hold according to its own header.
fn declared_length(header: &[u8]) -> std::result::Result<u64, SnapshotDefect> {
    if header.len() < HEADER_LEN {
        return Err(SnapshotDefect::Truncated);
    }
    if &header[..MAGIC.len()] != MAGIC {
        return Err(SnapshotDefect::BadMagic);
    }
    let page_size = match u16::from_be_bytes([header[16], header[17]]) {
        1 => 65_536,
        size => u32::from(size),
    };
    if !(512..=65_536).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(SnapshotDefect::BadPageSize(page_size));
    }
    let page_count = u32::from_be_bytes([header[28], header[29], header[30], header[31]]);
    if page_count == 0 {
        return Err(SnapshotDefect::NoPages);
    }
    Ok(u64::from(page_size) * u64::from(page_count))
}

/// Check a database image: `header` is (at least) its first 100 bytes and
/// `actual` its total length.
pub(crate) fn validate(header: &[u8], actual: u64) -> Result<()> {
    match declared_length(header) {
        Ok(declared) if declared == actual => Ok(()),
        Ok(declared) => exn::bail!(ErrorKind::InvalidSnapshot(SnapshotDefect::LengthMismatch { declared, actual })),
        Err(defect) => exn::bail!(ErrorKind::InvalidSnapshot(defect)),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// What [`SnapshotFile::prepare()`] found at the canonical path.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Startup {
    /// Nothing to load.
    Missing,
    /// The snapshot failed validation and was moved to the given path.
    Quarantined(PathBuf),
    /// The snapshot is valid and should be restored.
    Valid,
}

/// The canonical snapshot path and its siblings.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn temporary(&self) -> PathBuf {
        sibling(&self.path, ".tmp")
    }

    pub(crate) fn backup(&self) -> PathBuf {
        sibling(&self.path, ".backup")
    }

    fn corrupt(&self) -> PathBuf {
        sibling(&self.path, &format!(".corrupt.{}", UtcDateTime::now().unix_timestamp()))
    }

    /// First `.corrupt.<secs>[.<n>]` sibling that doesn't exist yet.
    async fn free_corrupt(&self) -> Result<PathBuf> {
        let base = self.corrupt();
        let mut candidate = base.clone();
        let mut sequence = 0u32;
        while fs::try_exists(&candidate).await.or_raise(|| ErrorKind::SnapshotIo(candidate.clone()))? {
            sequence += 1;
            candidate = sibling(&base, &format!(".{sequence}"));
        }
        Ok(candidate)
    }

    async fn remove_temporary(&self) -> Result<()> {
        let temporary = self.temporary();
        match fs::remove_file(&temporary).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).or_raise(|| ErrorKind::SnapshotIo(temporary)),
        }
    }

    /// Startup half of the protocol: clean up after a crashed flush, then
    /// quarantine the canonical file if it is not a complete database image,
    /// or back it up if it is.
    pub(crate) async fn prepare(&self) -> Result<Startup> {
        self.remove_temporary().await?;
        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Startup::Missing),
            Err(e) => return Err(e).or_raise(|| ErrorKind::SnapshotIo(self.path.clone())),
        };
        let actual = file.metadata().await.or_raise(|| ErrorKind::SnapshotIo(self.path.clone()))?.len();
        let mut header = Vec::with_capacity(HEADER_LEN);
        (&mut file)
            .take(HEADER_LEN as u64)
            .read_to_end(&mut header)
            .await
            .or_raise(|| ErrorKind::SnapshotIo(self.path.clone()))?;
        drop(file);

        if let Err(e) = validate(&header, actual) {
            tracing::warn!(path = %self.path.display(), error = ?e, "Snapshot failed validation");
            return Ok(Startup::Quarantined(self.quarantine().await?));
        }
        let backup = self.backup();
        if let Err(e) = fs::copy(&self.path, &backup).await {
            tracing::warn!(path = %backup.display(), error = %e, "Could not back up snapshot");
        }
        Ok(Startup::Valid)
    }

    /// Move the canonical file out of the way so it is never loaded again.
    pub(crate) async fn quarantine(&self) -> Result<PathBuf> {
        let target = self.free_corrupt().await?;
        fs::rename(&self.path, &target).await.or_raise(|| ErrorKind::SnapshotIo(self.path.clone()))?;
        tracing::warn!(path = %self.path.display(), quarantined = %target.display(), "Quarantined snapshot; starting empty");
        Ok(target)
    }

    /// Flush half of the protocol: serialize `db` to the temporary sibling,
    /// validate what actually landed on disk, then rename it into place.
    ///
    /// On any failure the temporary file is removed and the canonical file is
    /// left untouched.
    pub(crate) async fn write(&self, db: &Database) -> Result<()> {
        let result = self.write_inner(db).await;
        if result.is_err() {
            _ = self.remove_temporary().await;
        }
        result
    }

    async fn write_inner(&self, db: &Database) -> Result<()> {
        let temporary = self.temporary();
        self.remove_temporary().await?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.or_raise(|| ErrorKind::SnapshotIo(parent.to_path_buf()))?;
        }
        db.vacuum_into(&temporary).await?;

        let written = fs::read(&temporary).await.or_raise(|| ErrorKind::SnapshotIo(temporary.clone()))?;
        validate(&written, written.len() as u64)?;

        let file = fs::OpenOptions::new()
            .write(true)
            .open(&temporary)
            .await
            .or_raise(|| ErrorKind::SnapshotIo(temporary.clone()))?;
        file.sync_all().await.or_raise(|| ErrorKind::SnapshotIo(temporary.clone()))?;
        drop(file);
        fs::rename(&temporary, &self.path).await.or_raise(|| ErrorKind::SnapshotIo(self.path.clone()))?;
        tracing::debug!(path = %self.path.display(), bytes = written.len(), "Snapshot written");
        Ok(())
    }
}
