//! Primary asset cache: full-quality page images.
//!
//! Files live at `<cache dir>/<sha256 of url>` and every file has a record in
//! the record store, which is what eviction accounts against. A record whose
//! file has disappeared is dropped the next time it is looked up.

use crate::error::{Error, ErrorKind, Result};
use crate::eviction::EvictionScheduler;
use crate::fetch::{Fetcher, Headers};
use crate::hash::content_hash;
use exn::ResultExt;
use kura_asyncutils::Deduplicator;
use kura_records::{AssetRecord, OwnerId, StoreHandle};
use kura_storage::BackendHandle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::UtcDateTime;
use tokio_util::task::TaskTracker;
use tracing::instrument;

struct Inner {
    backend: BackendHandle,
    store: StoreHandle,
    fetcher: Arc<dyn Fetcher>,
    eviction: Arc<EvictionScheduler>,
}

impl Inner {
    /// The de-duplicated part of [`AssetCache::fetch_and_store()`].
    #[instrument("storing asset", skip(self, headers, owner))]
    async fn store(&self, url: &str, headers: &Headers, owner: Option<&OwnerId>) -> Result<PathBuf> {
        let hash = content_hash(url);
        let entry = Path::new(&hash);
        let path = self.backend.locate(entry).or_raise(|| ErrorKind::Storage)?;

        let size_bytes = match self.backend.stat(entry).await {
            Ok(info) => {
                tracing::debug!(url, "Asset already on disk; refreshing record");
                info.size
            },
            Err(e) if e.is_not_found() => {
                let data = self.fetcher.fetch(url, headers).await?;
                self.backend.write(entry, &data).await.or_raise(|| ErrorKind::Storage)?;
                tracing::debug!(url, bytes = data.len(), "Asset downloaded");
                data.len() as u64
            },
            Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
        };

        let record = AssetRecord::new(url, hash.as_str(), size_bytes).with_owner(owner.cloned());
        self.store.upsert(&record).await.or_raise(|| ErrorKind::Store)?;
        self.eviction.schedule();
        Ok(path)
    }
}

/// Content-addressed cache of full-quality images, bounded by eviction.
pub struct AssetCache {
    inner: Arc<Inner>,
    in_flight: Deduplicator<String, PathBuf, ErrorKind>,
    tasks: TaskTracker,
}

impl AssetCache {
    pub(crate) fn new(
        backend: BackendHandle,
        store: StoreHandle,
        fetcher: Arc<dyn Fetcher>,
        eviction: Arc<EvictionScheduler>,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            inner: Arc::new(Inner { backend, store, fetcher, eviction }),
            in_flight: Deduplicator::with_tracker(tasks.clone()),
            tasks,
        }
    }

    /// Path of the cached file for `url`, if there is one.
    ///
    /// A hit refreshes the record's `cached_at` in the background. A miss
    /// drops any record left behind by a file that has since disappeared.
    pub async fn lookup(&self, url: &str) -> Result<Option<PathBuf>> {
        let hash = content_hash(url);
        let entry = Path::new(&hash);
        if self.inner.backend.exists(entry).await.or_raise(|| ErrorKind::Storage)? {
            let store = Arc::clone(&self.inner.store);
            let url = url.to_string();
            self.tasks.spawn(async move {
                // Best effort: a lost touch only makes eviction slightly less accurate.
                if let Err(e) = store.touch(&url, UtcDateTime::now()).await {
                    tracing::debug!(url = %url, error = ?e, "Could not refresh asset recency");
                }
            });
            return Ok(Some(self.inner.backend.locate(entry).or_raise(|| ErrorKind::Storage)?));
        }
        if self.inner.store.delete(url).await.or_raise(|| ErrorKind::Store)? {
            tracing::debug!(url, "Dropped record for missing asset file");
        }
        Ok(None)
    }

    /// Download `url` into the cache (or adopt the file already there) and
    /// return its path.
    ///
    /// Concurrent calls for the same URL share one download. Every caller's
    /// `owner` ends up linked, whether it started the download or joined it.
    pub async fn fetch_and_store(&self, url: &str, headers: &Headers, owner: Option<&OwnerId>) -> Result<PathBuf> {
        let inner = Arc::clone(&self.inner);
        let job = (url.to_string(), headers.clone(), owner.cloned());
        let path = self
            .in_flight
            .dedupe(url.to_string(), move || async move {
                let (url, headers, owner) = job;
                inner.store(&url, &headers, owner.as_ref()).await.map_err(|e| {
                    tracing::warn!(url = %url, error = ?e, "Asset download failed");
                    (*e).clone()
                })
            })
            .await
            .map_err(Error::from)?;

        if let Some(owner) = owner
            && let Err(e) = self.inner.store.link_owner(url, owner).await
        {
            tracing::warn!(url, %owner, error = ?e, "Could not link asset to owner");
        }
        Ok(path)
    }

    /// Change the size budget and schedule a pass against it.
    pub fn set_size_limit(&self, bytes: u64) {
        self.inner.eviction.evictor().set_limit(bytes);
        self.inner.eviction.schedule();
    }

    pub fn size_limit(&self) -> u64 {
        self.inner.eviction.evictor().limit()
    }

    /// Bytes on disk in the cache directory, measured by walking it.
    pub async fn current_usage_bytes(&self) -> Result<u64> {
        self.inner.backend.usage().await.or_raise(|| ErrorKind::Storage)
    }

    /// Remove everything, or only `owner`'s assets. Returns the number of
    /// asset records removed.
    #[instrument("clearing asset cache", skip(self))]
    pub async fn clear(&self, owner: Option<&OwnerId>) -> Result<u64> {
        let Some(owner) = owner else {
            self.inner.backend.purge().await.or_raise(|| ErrorKind::Storage)?;
            return self.inner.store.clear().await.or_raise(|| ErrorKind::Store);
        };
        for record in self.inner.store.list_owner(owner).await.or_raise(|| ErrorKind::Store)? {
            match self.inner.backend.delete(Path::new(&record.content_hash)).await {
                Ok(()) => {},
                Err(e) if e.is_not_found() => {},
                Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
            }
        }
        self.inner.store.delete_owner(owner).await.or_raise(|| ErrorKind::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::Evictor;
    use crate::fetch::MockFetcher;
    use kura_records::{RecordStore, StoreOptions};
    use kura_storage::LocalBackend;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: BackendHandle,
        store: StoreHandle,
        fetcher: Arc<MockFetcher>,
        eviction: Arc<EvictionScheduler>,
        tasks: TaskTracker,
        cache: AssetCache,
    }

    async fn fixture(delay: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend: BackendHandle = Arc::new(LocalBackend::new("assets", dir.path()).unwrap());
        let store = Arc::new(RecordStore::open(StoreOptions::ephemeral()).await.unwrap());
        let fetcher = Arc::new(MockFetcher::with_delay(delay));
        let evictor = Arc::new(Evictor::new(Arc::clone(&backend), Arc::clone(&store), u64::MAX, 50));
        let eviction = Arc::new(EvictionScheduler::spawn(evictor, Duration::from_millis(10)));
        let tasks = TaskTracker::new();
        let cache = AssetCache::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            Arc::clone(&eviction),
            tasks.clone(),
        );
        Fixture { _dir: dir, backend, store, fetcher, eviction, tasks, cache }
    }

    impl Fixture {
        async fn settle(&self) {
            self.tasks.close();
            self.tasks.wait().await;
            self.tasks.reopen();
        }
    }

    const URL: &str = "https://example.com/manga/1/001.png";

    #[tokio::test]
    async fn test_fetch_then_lookup() {
        let f = fixture(Duration::ZERO).await;
        f.fetcher.insert(URL, vec![7u8; 321]);
        assert_eq!(f.cache.lookup(URL).await.unwrap(), None);

        let path = f.cache.fetch_and_store(URL, &Headers::new(), None).await.unwrap();
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), content_hash(URL));
        assert_eq!(f.cache.lookup(URL).await.unwrap(), Some(path.clone()));
        let record = f.store.get(URL).await.unwrap().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), record.size_bytes);
        assert_eq!(record.size_bytes, 321);
        f.settle().await;
        f.eviction.shutdown().await;
    }

    #[tokio::test]
    async fn test_existing_file_is_adopted_without_fetching() {
        let f = fixture(Duration::ZERO).await;
        f.backend.write(Path::new(&content_hash(URL)), b"already here").await.unwrap();
        let owner: OwnerId = "manga:1".parse().unwrap();
        f.cache.fetch_and_store(URL, &Headers::new(), Some(&owner)).await.unwrap();
        assert_eq!(f.fetcher.calls(), 0);
        let record = f.store.get(URL).await.unwrap().unwrap();
        assert_eq!(record.size_bytes, 12);
        assert_eq!(record.owner, Some(owner));
        f.eviction.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_fetches_share_one_download() {
        let f = fixture(Duration::from_millis(50)).await;
        f.fetcher.insert(URL, vec![1u8; 10]);
        let first: OwnerId = "manga:1".parse().unwrap();
        let second: OwnerId = "manga:2".parse().unwrap();
        let headers = Headers::new();
        let (a, b) = tokio::join!(
            f.cache.fetch_and_store(URL, &headers, Some(&first)),
            f.cache.fetch_and_store(URL, &headers, Some(&second)),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(f.fetcher.calls_for(URL), 1);
        // The joiner's owner is linked after the shared download.
        let owner = f.store.get(URL).await.unwrap().unwrap().owner.unwrap();
        assert!(owner == first || owner == second);
        f.eviction.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_nothing_behind() {
        let f = fixture(Duration::ZERO).await;
        let err = f.cache.fetch_and_store(URL, &Headers::new(), None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Status { status: 404, .. }));
        assert_eq!(f.cache.current_usage_bytes().await.unwrap(), 0);
        assert_eq!(f.store.count().await.unwrap(), 0);

        // A later attempt starts from scratch.
        f.fetcher.insert(URL, b"ok".to_vec());
        f.cache.fetch_and_store(URL, &Headers::new(), None).await.unwrap();
        assert_eq!(f.fetcher.calls_for(URL), 2);
        f.eviction.shutdown().await;
    }

    #[tokio::test]
    async fn test_phantom_record_is_dropped_on_lookup() {
        let f = fixture(Duration::ZERO).await;
        f.fetcher.insert(URL, b"data".to_vec());
        let path = f.cache.fetch_and_store(URL, &Headers::new(), None).await.unwrap();
        std::fs::remove_file(path).unwrap();
        assert_eq!(f.cache.lookup(URL).await.unwrap(), None);
        assert_eq!(f.store.get(URL).await.unwrap(), None);
        f.eviction.shutdown().await;
    }

    #[tokio::test]
    async fn test_hit_refreshes_recency() {
        let f = fixture(Duration::ZERO).await;
        f.fetcher.insert(URL, b"data".to_vec());
        f.cache.fetch_and_store(URL, &Headers::new(), None).await.unwrap();
        let old = UtcDateTime::from_unix_timestamp(10).unwrap();
        f.store.touch(URL, old).await.unwrap();
        f.cache.lookup(URL).await.unwrap().unwrap();
        f.settle().await;
        assert!(f.store.get(URL).await.unwrap().unwrap().cached_at > old);
        f.eviction.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_for_owner() {
        let f = fixture(Duration::ZERO).await;
        let one: OwnerId = "manga:1".parse().unwrap();
        let two: OwnerId = "manga:2".parse().unwrap();
        for (url, owner) in [("a", &one), ("b", &one), ("c", &two)] {
            f.fetcher.insert(url, vec![0u8; 10]);
            f.cache.fetch_and_store(url, &Headers::new(), Some(owner)).await.unwrap();
        }
        assert_eq!(f.cache.clear(Some(&one)).await.unwrap(), 2);
        assert_eq!(f.cache.current_usage_bytes().await.unwrap(), 10);
        assert_eq!(f.cache.lookup("a").await.unwrap(), None);
        assert!(f.cache.lookup("c").await.unwrap().is_some());

        assert_eq!(f.cache.clear(None).await.unwrap(), 1);
        assert_eq!(f.cache.current_usage_bytes().await.unwrap(), 0);
        assert_eq!(f.store.count().await.unwrap(), 0);
        f.settle().await;
        f.eviction.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_size_limit_schedules_eviction() {
        let f = fixture(Duration::ZERO).await;
        f.fetcher.insert(URL, vec![0u8; 100]);
        f.cache.fetch_and_store(URL, &Headers::new(), None).await.unwrap();
        f.cache.set_size_limit(0);
        assert_eq!(f.cache.size_limit(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.store.sum_size().await.unwrap(), 0);
        assert_eq!(f.cache.lookup(URL).await.unwrap(), None);
        f.eviction.shutdown().await;
    }
}
