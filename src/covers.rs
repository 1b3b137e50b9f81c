//! Cover thumbnail cache.
//!
//! Covers are re-encoded to JPEG and kept for a fixed time-to-live. Each
//! cover has a JSON sidecar, `<hash>.meta`, recording where its data file
//! is and when it was cached; the record store is not involved and covers
//! do not count towards the asset size budget.
//!
//! Expiry is discovered lazily: an expired or inconsistent entry is purged
//! by the lookup that finds it.

use crate::error::{Error, ErrorKind, Result};
use crate::fetch::{Fetcher, Headers};
use crate::hash::content_hash;
use exn::ResultExt;
use kura_asyncutils::Deduplicator;
use kura_storage::BackendHandle;
use kura_transcode::Transcoder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::UtcDateTime;
use tokio_util::task::TaskTracker;
use tracing::instrument;

/// Sidecar contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoverRecord {
    url: String,
    /// Absolute path of the data file
    file_path: PathBuf,
    /// Unix seconds
    cached_at: i64,
}

impl CoverRecord {
    fn is_fresh(&self, ttl: Duration, now: UtcDateTime) -> bool {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        self.cached_at.saturating_add(ttl) > now.unix_timestamp()
    }
}

fn meta_entry(hash: &str) -> PathBuf {
    PathBuf::from(format!("{hash}.meta"))
}

fn jpeg_entry(hash: &str) -> PathBuf {
    PathBuf::from(format!("{hash}.jpg"))
}

struct Inner {
    backend: BackendHandle,
    fetcher: Arc<dyn Fetcher>,
    transcoder: Transcoder,
    ttl: Duration,
}

impl Inner {
    async fn delete_quietly(&self, entry: &Path) {
        match self.backend.delete(entry).await {
            Ok(()) => {},
            Err(e) if e.is_not_found() => {},
            Err(e) => tracing::warn!(entry = %entry.display(), error = ?e, "Could not delete cover file"),
        }
    }

    /// Delete the sidecar and every file that could belong to `hash`.
    async fn purge(&self, hash: &str, recorded: Option<&Path>) {
        let mut entries = vec![meta_entry(hash), PathBuf::from(hash), jpeg_entry(hash)];
        if let Some(recorded) = recorded
            && let Ok(entry) = self.backend.entry_of(recorded)
            && !entries.contains(&entry)
        {
            entries.push(entry);
        }
        for entry in &entries {
            self.delete_quietly(entry).await;
        }
    }

    async fn lookup(&self, url: &str) -> Result<Option<PathBuf>> {
        let hash = content_hash(url);
        let sidecar = match self.backend.read(&meta_entry(&hash)).await {
            Ok(sidecar) => sidecar,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
        };
        let record: CoverRecord = match serde_json::from_slice(&sidecar) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(url, error = %e, "Unreadable cover sidecar; purging");
                self.purge(&hash, None).await;
                return Ok(None);
            },
        };
        if !record.is_fresh(self.ttl, UtcDateTime::now()) {
            tracing::debug!(url, cached_at = record.cached_at, "Cover expired; purging");
            self.purge(&hash, Some(&record.file_path)).await;
            return Ok(None);
        }
        let present = match self.backend.entry_of(&record.file_path) {
            Ok(entry) => self.backend.exists(&entry).await.or_raise(|| ErrorKind::Storage)?,
            // Points outside the cover directory.
            Err(_) => false,
        };
        if !present {
            tracing::debug!(url, path = %record.file_path.display(), "Cover file missing; purging");
            self.purge(&hash, Some(&record.file_path)).await;
            return Ok(None);
        }
        Ok(Some(record.file_path))
    }

    #[instrument("storing cover", skip(self, headers))]
    async fn store(&self, url: &str, headers: &Headers) -> Result<PathBuf> {
        let hash = content_hash(url);
        let original = Arc::new(self.fetcher.fetch(url, headers).await?);

        let transcoder = self.transcoder;
        let input = Arc::clone(&original);
        let transcoded = tokio::task::spawn_blocking(move || transcoder.to_jpeg(&input)).await;
        let (entry, stale, data) = match transcoded {
            Ok(Ok(jpeg)) => (jpeg_entry(&hash), PathBuf::from(&hash), jpeg),
            Ok(Err(e)) => {
                tracing::debug!(url, error = ?e, "Cover kept in its original format");
                (PathBuf::from(&hash), jpeg_entry(&hash), original.to_vec())
            },
            Err(e) => {
                tracing::warn!(url, error = %e, "Cover transcoding task died");
                (PathBuf::from(&hash), jpeg_entry(&hash), original.to_vec())
            },
        };

        self.backend.write(&entry, &data).await.or_raise(|| ErrorKind::Storage)?;
        self.delete_quietly(&stale).await;
        let file_path = self.backend.locate(&entry).or_raise(|| ErrorKind::Storage)?;
        let record =
            CoverRecord { url: url.to_string(), file_path: file_path.clone(), cached_at: UtcDateTime::now().unix_timestamp() };
        let sidecar = serde_json::to_vec(&record).or_raise(|| ErrorKind::Storage)?;
        self.backend.write(&meta_entry(&hash), &sidecar).await.or_raise(|| ErrorKind::Storage)?;
        tracing::debug!(url, path = %file_path.display(), bytes = data.len(), "Cover stored");
        Ok(file_path)
    }
}

/// TTL cache of recompressed cover thumbnails.
pub struct CoverCache {
    inner: Arc<Inner>,
    in_flight: Deduplicator<String, PathBuf, ErrorKind>,
}

impl CoverCache {
    pub(crate) fn new(
        backend: BackendHandle,
        fetcher: Arc<dyn Fetcher>,
        transcoder: Transcoder,
        ttl: Duration,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            inner: Arc::new(Inner { backend, fetcher, transcoder, ttl }),
            in_flight: Deduplicator::with_tracker(tasks),
        }
    }

    /// Path of a fresh cached cover for `url`, if there is one.
    pub async fn lookup(&self, url: &str) -> Result<Option<PathBuf>> {
        self.inner.lookup(url).await
    }

    /// Download, recompress and cache the cover at `url`.
    ///
    /// Images that can't be recompressed are stored as downloaded. Concurrent
    /// calls for the same URL share one download.
    pub async fn store(&self, url: &str, headers: &Headers) -> Result<PathBuf> {
        let inner = Arc::clone(&self.inner);
        let job = (url.to_string(), headers.clone());
        self.in_flight
            .dedupe(url.to_string(), move || async move {
                let (url, headers) = job;
                inner.store(&url, &headers).await.map_err(|e| {
                    tracing::warn!(url = %url, error = ?e, "Cover download failed");
                    (*e).clone()
                })
            })
            .await
            .map_err(Error::from)
    }

    pub async fn clear(&self) -> Result<()> {
        self.inner.backend.purge().await.or_raise(|| ErrorKind::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MockFetcher;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use kura_storage::LocalBackend;
    use std::io::Cursor;

    const URL: &str = "https://example.com/covers/42.png";

    struct Fixture {
        dir: tempfile::TempDir,
        fetcher: Arc<MockFetcher>,
        covers: CoverCache,
    }

    fn fixture(ttl: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend: BackendHandle = Arc::new(LocalBackend::new("covers", dir.path()).unwrap());
        let fetcher = Arc::new(MockFetcher::new());
        let covers = CoverCache::new(
            backend,
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            Transcoder::default(),
            ttl,
            TaskTracker::new(),
        );
        Fixture { dir, fetcher, covers }
    }

    fn png() -> Vec<u8> {
        let buffer = ImageBuffer::from_fn(32, 48, |x, y| Rgb([x as u8 * 8, y as u8 * 5, 90]));
        let mut out = Cursor::new(Vec::new());
        buffer.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn write_sidecar(dir: &Path, record: &CoverRecord) {
        let hash = content_hash(&record.url);
        std::fs::write(dir.join(format!("{hash}.meta")), serde_json::to_vec(record).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_store_transcodes_to_jpeg() {
        let f = fixture(Duration::from_secs(60));
        f.fetcher.insert(URL, png());
        let path = f.covers.store(URL, &Headers::new()).await.unwrap();
        assert_eq!(path, f.dir.path().join(format!("{}.jpg", content_hash(URL))));
        assert_eq!(&std::fs::read(&path).unwrap()[..2], &[0xFF, 0xD8]);
        assert_eq!(f.covers.lookup(URL).await.unwrap(), Some(path));

        let sidecar: serde_json::Value =
            serde_json::from_slice(&std::fs::read(f.dir.path().join(format!("{}.meta", content_hash(URL)))).unwrap())
                .unwrap();
        assert_eq!(sidecar["url"], URL);
        assert!(sidecar["filePath"].is_string());
        assert!(sidecar["cachedAt"].is_i64());
    }

    #[tokio::test]
    async fn test_undecodable_cover_is_stored_verbatim() {
        let f = fixture(Duration::from_secs(60));
        f.fetcher.insert(URL, b"<svg>not raster</svg>".to_vec());
        let path = f.covers.store(URL, &Headers::new()).await.unwrap();
        assert_eq!(path, f.dir.path().join(content_hash(URL)));
        assert_eq!(std::fs::read(&path).unwrap(), b"<svg>not raster</svg>");
    }

    #[tokio::test]
    async fn test_restore_removes_stale_variant() {
        let f = fixture(Duration::from_secs(60));
        f.fetcher.insert(URL, b"garbage".to_vec());
        let verbatim = f.covers.store(URL, &Headers::new()).await.unwrap();
        f.fetcher.insert(URL, png());
        let jpeg = f.covers.store(URL, &Headers::new()).await.unwrap();
        assert_ne!(verbatim, jpeg);
        assert!(!verbatim.exists());
        assert!(jpeg.exists());
    }

    #[tokio::test]
    async fn test_expired_cover_is_purged() {
        let f = fixture(Duration::from_secs(3600));
        f.fetcher.insert(URL, png());
        let path = f.covers.store(URL, &Headers::new()).await.unwrap();
        let expired = CoverRecord {
            url: URL.to_string(),
            file_path: path.clone(),
            cached_at: UtcDateTime::now().unix_timestamp() - 3600 - 1,
        };
        write_sidecar(f.dir.path(), &expired);

        assert_eq!(f.covers.lookup(URL).await.unwrap(), None);
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(f.dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_a_miss() {
        let f = fixture(Duration::from_secs(3600));
        f.fetcher.insert(URL, png());
        let path = f.covers.store(URL, &Headers::new()).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(f.covers.lookup(URL).await.unwrap(), None);
        assert_eq!(std::fs::read_dir(f.dir.path()).unwrap().count(), 0, "sidecar purged too");
    }

    #[tokio::test]
    async fn test_sidecar_pointing_outside_is_a_miss() {
        let f = fixture(Duration::from_secs(3600));
        let outside = tempfile::NamedTempFile::new().unwrap();
        let record = CoverRecord {
            url: URL.to_string(),
            file_path: outside.path().to_path_buf(),
            cached_at: UtcDateTime::now().unix_timestamp(),
        };
        write_sidecar(f.dir.path(), &record);
        assert_eq!(f.covers.lookup(URL).await.unwrap(), None);
        assert!(outside.path().exists(), "never deletes outside the cover directory");
    }

    #[tokio::test]
    async fn test_unreadable_sidecar_is_purged() {
        let f = fixture(Duration::from_secs(3600));
        let hash = content_hash(URL);
        std::fs::write(f.dir.path().join(format!("{hash}.meta")), b"{not json").unwrap();
        std::fs::write(f.dir.path().join(&hash), b"orphan").unwrap();
        assert_eq!(f.covers.lookup(URL).await.unwrap(), None);
        assert_eq!(std::fs::read_dir(f.dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_no_sidecar_is_a_plain_miss() {
        let f = fixture(Duration::from_secs(3600));
        assert_eq!(f.covers.lookup(URL).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear() {
        let f = fixture(Duration::from_secs(3600));
        f.fetcher.insert(URL, png());
        f.covers.store(URL, &Headers::new()).await.unwrap();
        f.covers.clear().await.unwrap();
        assert_eq!(f.covers.lookup(URL).await.unwrap(), None);
        assert!(f.dir.path().is_dir());
    }

    #[test]
    fn test_freshness_boundary() {
        let now = UtcDateTime::from_unix_timestamp(1_000_000).unwrap();
        let record = |cached_at| CoverRecord { url: String::new(), file_path: PathBuf::new(), cached_at };
        let ttl = Duration::from_secs(100);
        assert!(record(1_000_000 - 99).is_fresh(ttl, now));
        assert!(!record(1_000_000 - 100).is_fresh(ttl, now));
        assert!(!record(1_000_000 - 101).is_fresh(ttl, now));
    }
}
