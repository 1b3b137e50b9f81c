use crate::db::Database;
use crate::error::Result;
use crate::models::{AssetRecord, OwnerId, OwnerUsage};
use crate::repo::Repository;
use crate::snapshot::{SnapshotFile, Startup};
use kura_asyncutils::{Debouncer, FlightGuard, SingleFlight};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::UtcDateTime;
use tracing::instrument;

/// Default quiet period between the last mutation and the snapshot flush.
pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// How a [`RecordStore`] persists itself.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Snapshot file; `None` keeps the store purely in memory.
    pub path: Option<PathBuf>,
    pub flush_debounce: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { path: None, flush_debounce: DEFAULT_FLUSH_DEBOUNCE }
    }
}

impl StoreOptions {
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()), ..Self::default() }
    }

    pub fn ephemeral() -> Self {
        Self::default()
    }

    pub fn with_flush_debounce(mut self, debounce: Duration) -> Self {
        self.flush_debounce = debounce;
        self
    }
}

/// Flushes never overlap, and a request made during a flush is never lost.
#[derive(Debug)]
struct Persistence {
    db: Database,
    snapshot: SnapshotFile,
    flight: SingleFlight,
}

impl Persistence {
    async fn flush(&self) {
        let Some(guard) = self.flight.begin() else {
            tracing::trace!("Flush already running; scheduled a rerun");
            return;
        };
        self.run(guard).await;
    }

    async fn run(&self, mut guard: FlightGuard<'_>) {
        loop {
            if let Err(e) = self.snapshot.write(&self.db).await {
                // In-memory state stays authoritative; the next mutation retries.
                tracing::error!(path = %self.snapshot.path().display(), error = ?e, "Snapshot flush failed");
            }
            if !guard.finish() {
                break;
            }
        }
    }

    async fn flush_and_wait(&self) {
        self.flush().await;
        self.flight.wait_idle().await;
    }
}

/// The single handle to the asset record database.
///
/// Reads and writes go to an in-memory SQLite database. When opened with a
/// snapshot path, every mutation (re-)arms a debounced flush of the whole
/// database to that file; [`close()`](Self::close) flushes one final time.
///
/// Flush failures are logged, never returned from the mutating call that
/// triggered them.
///
/// # Examples
///
/// ```no_run
/// use kura_records::{AssetRecord, RecordStore, StoreOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = RecordStore::open(StoreOptions::persistent("/var/lib/kura/records.db"))
///     .await
///     .map_err(|e| e.to_string())?;
/// store.upsert(&AssetRecord::new("https://example.com/1.png", "3a7bd3e2", 1024)).await.map_err(|e| e.to_string())?;
/// assert_eq!(store.sum_size().await.map_err(|e| e.to_string())?, 1024);
/// store.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RecordStore {
    db: Database,
    repo: Repository,
    persistence: Option<Arc<Persistence>>,
    debouncer: Option<Debouncer>,
    closed: AtomicBool,
}

/// Shared handle, injected into everything that reads or writes records.
pub type StoreHandle = Arc<RecordStore>;

impl RecordStore {
    /// Open the store, loading the snapshot if there is a valid one.
    ///
    /// A snapshot that fails validation, or whose tables can't be loaded, is
    /// quarantined next to the canonical path and the store starts empty.
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument("opening record store", skip_all, fields(path = ?options.path))]
    pub async fn open(options: StoreOptions) -> Result<Self> {
        let db = Database::connect_in_memory().await?;
        let repo = Repository::from(&db);
        let Some(path) = options.path else {
            return Ok(Self { db, repo, persistence: None, debouncer: None, closed: AtomicBool::new(false) });
        };

        let snapshot = SnapshotFile::new(path);
        if snapshot.prepare().await? == Startup::Valid {
            match db.restore_from(snapshot.path()).await {
                Ok(assets) => tracing::info!(path = %snapshot.path().display(), assets, "Loaded record snapshot"),
                Err(e) => {
                    tracing::warn!(path = %snapshot.path().display(), error = ?e, "Snapshot could not be loaded");
                    snapshot.quarantine().await?;
                },
            }
        }

        let persistence = Arc::new(Persistence { db: db.clone(), snapshot, flight: SingleFlight::new() });
        let flusher = Arc::clone(&persistence);
        let debouncer = Debouncer::spawn(options.flush_debounce, move || {
            let persistence = Arc::clone(&flusher);
            async move { persistence.flush().await }
        });
        Ok(Self { db, repo, persistence: Some(persistence), debouncer: Some(debouncer), closed: AtomicBool::new(false) })
    }

    fn mark_dirty(&self) {
        if let Some(debouncer) = &self.debouncer {
            debouncer.trigger();
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    /// Insert or replace the record for `record.url`.
    ///
    /// A record without an owner never detaches an already linked owner.
    pub async fn upsert(&self, record: &AssetRecord) -> Result<()> {
        self.repo.upsert(record).await?;
        self.mark_dirty();
        Ok(())
    }

    pub async fn get(&self, url: &str) -> Result<Option<AssetRecord>> {
        self.repo.get(url).await
    }

    /// Refresh a record's `cached_at`. Returns `false` if there is no record.
    pub async fn touch(&self, url: &str, at: UtcDateTime) -> Result<bool> {
        let touched = self.repo.touch(url, at).await?;
        if touched {
            self.mark_dirty();
        }
        Ok(touched)
    }

    /// Link an existing record to `owner`. Returns `false` if nothing changed.
    pub async fn link_owner(&self, url: &str, owner: &OwnerId) -> Result<bool> {
        let linked = self.repo.link_owner(url, owner, UtcDateTime::now()).await?;
        if linked {
            self.mark_dirty();
        }
        Ok(linked)
    }

    /// Returns `false` if there was no record.
    pub async fn delete(&self, url: &str) -> Result<bool> {
        let deleted = self.repo.delete(url).await?;
        if deleted {
            self.mark_dirty();
        }
        Ok(deleted)
    }

    /// Delete every record linked to `owner` and the owner itself. Returns
    /// the number of asset records deleted.
    pub async fn delete_owner(&self, owner: &OwnerId) -> Result<u64> {
        let deleted = self.repo.delete_owner(owner).await?;
        self.mark_dirty();
        Ok(deleted)
    }

    pub async fn list_owner(&self, owner: &OwnerId) -> Result<Vec<AssetRecord>> {
        self.repo.list_owner(owner).await
    }

    /// Total recorded size of every asset, in bytes.
    pub async fn sum_size(&self) -> Result<u64> {
        self.repo.sum_size().await
    }

    /// Up to `limit` records, least recently cached first.
    pub async fn oldest(&self, limit: u64) -> Result<Vec<AssetRecord>> {
        self.repo.oldest(limit).await
    }

    pub async fn count(&self) -> Result<u64> {
        self.repo.count().await
    }

    pub async fn owner_usage(&self) -> Result<Vec<OwnerUsage>> {
        self.repo.owner_usage().await
    }

    /// Delete every record. Returns the number of asset records deleted.
    pub async fn clear(&self) -> Result<u64> {
        let deleted = self.repo.clear().await?;
        self.mark_dirty();
        Ok(deleted)
    }

    /// Write the snapshot now, without waiting for the debounce, and return
    /// once no flush is running.
    pub async fn flush(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.flush_and_wait().await;
        }
    }

    /// Cancel the pending debounced flush, wait for a running one, flush a
    /// final time and close the database. Later calls do nothing.
    #[instrument("closing record store", skip_all)]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(debouncer) = &self.debouncer {
            debouncer.shutdown().await;
        }
        self.flush().await;
        self.db.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use kura_asyncutils::FlightState;
    use std::path::Path;

    fn record(url: &str, size: u64, cached_at: i64) -> AssetRecord {
        AssetRecord::new(url, format!("hash-of-{url}"), size)
            .with_cached_at(UtcDateTime::from_unix_timestamp(cached_at).unwrap())
    }

    fn corrupt_siblings(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.to_str().unwrap().contains(".corrupt."))
            .collect()
    }

    #[tokio::test]
    async fn test_ephemeral_store() {
        let store = RecordStore::open(StoreOptions::ephemeral()).await.unwrap();
        assert!(!store.is_persistent());
        store.upsert(&record("a", 10, 1)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        store.flush().await;
        store.close().await;
        // Closing twice is harmless.
        store.close().await;
    }

    #[tokio::test]
    async fn test_round_trip_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let owner: OwnerId = "manga:chapter-1".parse().unwrap();

        let store = RecordStore::open(StoreOptions::persistent(&path)).await.unwrap();
        for i in 0..25 {
            let owned = (i % 2 == 0).then(|| owner.clone());
            store.upsert(&record(&format!("https://example.com/{i}.png"), i, i as i64).with_owner(owned)).await.unwrap();
        }
        store.close().await;
        assert!(path.exists());

        let reopened = RecordStore::open(StoreOptions::persistent(&path)).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 25);
        assert_eq!(reopened.sum_size().await.unwrap(), (0..25).sum::<u64>());
        assert_eq!(reopened.list_owner(&owner).await.unwrap().len(), 13);
        let restored = reopened.get("https://example.com/7.png").await.unwrap().unwrap();
        assert_eq!(restored, record("https://example.com/7.png", 7, 7));
        assert_eq!(reopened.oldest(1).await.unwrap()[0].url, "https://example.com/0.png");
        assert!(dir.path().join("records.db.backup").exists());
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_debounced_flush_without_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let store =
            RecordStore::open(StoreOptions::persistent(&path).with_flush_debounce(Duration::from_millis(20)))
                .await
                .unwrap();
        store.upsert(&record("a", 10, 1)).await.unwrap();
        assert!(!path.exists(), "nothing is written inside the quiet period");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(path.exists());

        // A second process-lifetime reads what the debounced flush wrote.
        let copy = dir.path().join("copy.db");
        std::fs::copy(&path, &copy).unwrap();
        let other = RecordStore::open(StoreOptions::persistent(&copy)).await.unwrap();
        assert_eq!(other.count().await.unwrap(), 1);
        other.close().await;
        store.close().await;
    }

    #[tokio::test]
    async fn test_garbage_snapshot_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        std::fs::write(&path, b"this is not a sqlite database").unwrap();

        let store = RecordStore::open(StoreOptions::persistent(&path)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(!path.exists());
        let quarantined = corrupt_siblings(dir.path());
        assert_eq!(quarantined.len(), 1);
        assert_eq!(std::fs::read(&quarantined[0]).unwrap(), b"this is not a sqlite database");

        // The empty store still persists normally afterwards.
        store.upsert(&record("a", 1, 1)).await.unwrap();
        store.close().await;
        let reopened = RecordStore::open(StoreOptions::persistent(&path)).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_unloadable_snapshot_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        // A valid SQLite image, but not one of ours.
        let db = Database::connect_in_memory().await.unwrap();
        sqlx::query("DROP TABLE assets").execute(db.pool()).await.unwrap();
        db.vacuum_into(&path).await.unwrap();
        db.close().await;

        let store = RecordStore::open(StoreOptions::persistent(&path)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(corrupt_siblings(dir.path()).len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_leftover_temporary_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let temporary = dir.path().join("records.db.tmp");
        std::fs::write(&temporary, b"crashed mid-flush").unwrap();
        let store = RecordStore::open(StoreOptions::persistent(&path)).await.unwrap();
        assert!(!temporary.exists());
        store.close().await;
    }

    #[tokio::test]
    async fn test_mutations_after_close_fail() {
        let store = RecordStore::open(StoreOptions::ephemeral()).await.unwrap();
        store.close().await;
        let err = store.upsert(&record("a", 1, 1)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Database));
    }

    #[tokio::test]
    async fn test_concurrent_flush_requests_keep_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let store = Arc::new(RecordStore::open(StoreOptions::persistent(&path)).await.unwrap());
        let mut writers = tokio::task::JoinSet::new();
        for i in 0..10 {
            let store = Arc::clone(&store);
            writers.spawn(async move {
                store.upsert(&record(&format!("u{i}"), 1, i)).await.unwrap();
                store.flush().await;
            });
        }
        while let Some(joined) = writers.join_next().await {
            joined.unwrap();
        }
        store.close().await;

        let reopened = RecordStore::open(StoreOptions::persistent(&path)).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 10, "the last requested flush always runs");
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_flush_during_running_flush_waits_for_its_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let options = StoreOptions::persistent(&path).with_flush_debounce(Duration::from_secs(3600));
        let store = Arc::new(RecordStore::open(options).await.unwrap());
        let persistence = Arc::clone(store.persistence.as_ref().unwrap());

        // A debounced flush is under way when the record changes.
        let running = persistence.flight.begin().unwrap();
        store.upsert(&record("https://example.com/late.png", 5, 100)).await.unwrap();
        let requester = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(persistence.flight.state(), FlightState::RunningWithRerun);
        assert!(!requester.is_finished(), "flush() returned before its write landed");
        persistence.flush().await;
        assert!(!path.exists(), "a second flush started alongside the running one");

        persistence.run(running).await;
        requester.await.unwrap();
        assert_eq!(persistence.flight.state(), FlightState::Idle);

        let copy = dir.path().join("copy.db");
        std::fs::copy(&path, &copy).unwrap();
        let reopened = RecordStore::open(StoreOptions::persistent(&copy)).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        reopened.close().await;
        store.close().await;
    }
}
