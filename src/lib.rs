//! Bounded, durable on-disk cache for manga page images and cover
//! thumbnails.
//!
//! [`ImageCache`] ties the pieces together:
//!
//! - full-quality page images go to the asset cache, a content-addressed
//!   directory whose size is kept under a budget by least-recently-used
//!   eviction, with every file accounted for in the record store;
//! - cover thumbnails go to the cover cache, recompressed to JPEG and kept
//!   for a fixed time-to-live;
//! - concurrent requests for one URL share a single download.
//!
//! Callers get file system paths back and read the files themselves.

mod assets;
mod covers;
pub mod error;
mod eviction;
mod fetch;
mod hash;

pub use crate::assets::AssetCache;
pub use crate::covers::CoverCache;
pub use crate::eviction::EvictionReport;
#[cfg(any(test, feature = "mock"))]
pub use crate::fetch::MockFetcher;
pub use crate::fetch::{Fetcher, Headers, HttpFetcher};
pub use crate::hash::content_hash;
pub use kura_config::Config;
pub use kura_records::{OwnerId, OwnerUsage};

use crate::error::{ErrorKind, Result};
use crate::eviction::{EvictionScheduler, Evictor};
use exn::ResultExt;
use kura_records::{RecordStore, StoreHandle, StoreOptions};
use kura_storage::{BackendHandle, LocalBackend};
use kura_transcode::Transcoder;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::instrument;

/// The cache as the rest of the application sees it.
///
/// Open one per process with [`open()`](Self::open) and [`close()`](Self::close)
/// it on shutdown; closing waits for background work and writes the final
/// record snapshot.
pub struct ImageCache {
    assets: AssetCache,
    covers: CoverCache,
    store: StoreHandle,
    eviction: Arc<EvictionScheduler>,
    fetcher: Arc<dyn Fetcher>,
    tasks: TaskTracker,
}

impl ImageCache {
    /// Open with the default HTTP fetcher.
    pub async fn open(config: &Config) -> Result<Self> {
        let fetcher = HttpFetcher::new(&config.http)?;
        Self::open_with_fetcher(config, Arc::new(fetcher)).await
    }

    #[instrument("opening image cache", skip_all)]
    pub async fn open_with_fetcher(config: &Config, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Config)?;
        let transcoder = Transcoder::new(config.covers.jpeg_quality).or_raise(|| ErrorKind::Config)?;
        let asset_backend: BackendHandle =
            Arc::new(LocalBackend::new("assets", &config.cache.dir).or_raise(|| ErrorKind::Storage)?);
        let cover_backend: BackendHandle =
            Arc::new(LocalBackend::new("covers", &config.covers.dir).or_raise(|| ErrorKind::Storage)?);

        let options = StoreOptions::persistent(&config.store.path).with_flush_debounce(config.store.flush_debounce());
        let store: StoreHandle = Arc::new(RecordStore::open(options).await.or_raise(|| ErrorKind::Store)?);

        let evictor = Evictor::new(
            Arc::clone(&asset_backend),
            Arc::clone(&store),
            config.cache.size_limit,
            config.cache.eviction_batch,
        );
        let eviction = Arc::new(EvictionScheduler::spawn(Arc::new(evictor), config.cache.eviction_debounce()));
        let tasks = TaskTracker::new();

        let assets = AssetCache::new(
            asset_backend,
            Arc::clone(&store),
            Arc::clone(&fetcher),
            Arc::clone(&eviction),
            tasks.clone(),
        );
        let covers = CoverCache::new(cover_backend, Arc::clone(&fetcher), transcoder, config.covers.ttl(), tasks.clone());

        tracing::info!(
            assets = %config.cache.dir.display(),
            covers = %config.covers.dir.display(),
            size_limit = config.cache.size_limit,
            "Image cache ready"
        );
        // Catch up with a budget lowered while we weren't running.
        eviction.schedule();
        Ok(Self { assets, covers, store, eviction, fetcher, tasks })
    }

    pub fn assets(&self) -> &AssetCache {
        &self.assets
    }

    pub fn covers(&self) -> &CoverCache {
        &self.covers
    }

    pub async fn get_cached_asset_path(&self, url: &str) -> Result<Option<PathBuf>> {
        self.assets.lookup(url).await
    }

    pub async fn fetch_and_store_asset(&self, url: &str, headers: &Headers, owner: Option<&OwnerId>) -> Result<PathBuf> {
        self.assets.fetch_and_store(url, headers, owner).await
    }

    pub async fn get_cached_cover_path(&self, url: &str) -> Result<Option<PathBuf>> {
        self.covers.lookup(url).await
    }

    pub async fn fetch_and_store_cover(&self, url: &str, headers: &Headers) -> Result<PathBuf> {
        self.covers.store(url, headers).await
    }

    /// Bytes of an asset, from the cache when possible.
    ///
    /// When the cache itself is broken (disk or record store errors) the
    /// asset is fetched directly instead, without being cached. Upstream
    /// failures are returned as they are.
    pub async fn load_asset(&self, url: &str, headers: &Headers, owner: Option<&OwnerId>) -> Result<Vec<u8>> {
        let cached = async {
            let path = match self.assets.lookup(url).await? {
                Some(path) => path,
                None => self.assets.fetch_and_store(url, headers, owner).await?,
            };
            tokio::fs::read(&path).await.or_raise(|| ErrorKind::Storage)
        };
        match cached.await {
            Ok(data) => Ok(data),
            Err(e) if e.is_local() => {
                tracing::warn!(url, error = ?e, "Asset cache unavailable; fetching directly");
                self.fetcher.fetch(url, headers).await
            },
            Err(e) => Err(e),
        }
    }

    pub fn set_cache_limit(&self, bytes: u64) {
        tracing::info!(limit_bytes = bytes, "Asset cache limit changed");
        self.assets.set_size_limit(bytes);
    }

    pub fn cache_limit(&self) -> u64 {
        self.assets.size_limit()
    }

    pub async fn current_usage_bytes(&self) -> Result<u64> {
        self.assets.current_usage_bytes().await
    }

    /// Recorded asset usage per owner, largest first.
    pub async fn owner_usage(&self) -> Result<Vec<OwnerUsage>> {
        self.store.owner_usage().await.or_raise(|| ErrorKind::Store)
    }

    /// Run an eviction pass now instead of waiting for the scheduler.
    pub async fn evict_now(&self) -> Result<EvictionReport> {
        self.eviction.evictor().run_now().await
    }

    /// Empty both caches.
    pub async fn clear_all(&self) -> Result<()> {
        let records = self.assets.clear(None).await?;
        self.covers.clear().await?;
        tracing::info!(records, "Cleared all cached images");
        Ok(())
    }

    /// Remove the assets linked to `owner`. Returns how many were removed.
    pub async fn clear_for_owner(&self, owner: &OwnerId) -> Result<u64> {
        let records = self.assets.clear(Some(owner)).await?;
        tracing::info!(%owner, records, "Cleared cached assets for owner");
        Ok(records)
    }

    /// Wait for background work, stop eviction and write the final snapshot.
    ///
    /// The cache must not be used afterwards.
    #[instrument("closing image cache", skip_all)]
    pub async fn close(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.eviction.shutdown().await;
        self.store.close().await;
    }
}
