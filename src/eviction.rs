//! Size-budget enforcement for the asset cache.
//!
//! Eviction is least-recently-cached first, using the record store's
//! `cached_at` (refreshed on every hit) as the recency signal. Passes are
//! debounced after writes and never overlap; a request that arrives during a
//! pass makes that pass go round once more.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use kura_asyncutils::{Debouncer, SingleFlight};
use kura_records::StoreHandle;
use kura_storage::BackendHandle;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Outcome of an eviction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub files_deleted: u64,
    pub bytes_freed: u64,
    /// Recorded cache size before eviction
    pub size_before: u64,
    /// Recorded cache size after eviction
    pub size_after: u64,
    pub duration_ms: u64,
}

impl EvictionReport {
    /// Fold a rerun into the report of the run that preceded it.
    fn then(self, next: Self) -> Self {
        Self {
            files_deleted: self.files_deleted + next.files_deleted,
            bytes_freed: self.bytes_freed + next.bytes_freed,
            size_before: self.size_before,
            size_after: next.size_after,
            duration_ms: self.duration_ms + next.duration_ms,
        }
    }
}

fn log_report(report: &EvictionReport, limit: u64) {
    if report.files_deleted > 0 {
        tracing::info!(
            files_deleted = report.files_deleted,
            bytes_freed = report.bytes_freed,
            size_before = report.size_before,
            size_after = report.size_after,
            limit_bytes = limit,
            duration_ms = report.duration_ms,
            "Asset cache eviction complete"
        );
    } else {
        tracing::debug!(size_bytes = report.size_after, limit_bytes = limit, "Asset cache under limit");
    }
}

/// Deletes the oldest assets until the recorded size fits the budget.
pub(crate) struct Evictor {
    backend: BackendHandle,
    store: StoreHandle,
    limit: AtomicU64,
    batch: u64,
    flight: SingleFlight,
}

impl Evictor {
    pub(crate) fn new(backend: BackendHandle, store: StoreHandle, limit: u64, batch: u64) -> Self {
        Self { backend, store, limit: AtomicU64::new(limit), batch: batch.max(1), flight: SingleFlight::new() }
    }

    pub(crate) fn limit(&self) -> u64 {
        self.limit.load(Ordering::SeqCst)
    }

    pub(crate) fn set_limit(&self, bytes: u64) {
        self.limit.store(bytes, Ordering::SeqCst);
    }

    /// Run a pass unless one is already running, in which case that pass
    /// will go round again and this returns `None` immediately.
    pub(crate) async fn run(&self) -> Option<Result<EvictionReport>> {
        let guard = self.flight.begin()?;
        Some(self.run_guarded(guard).await)
    }

    /// Run a pass and return its report, waiting for a running pass first.
    pub(crate) async fn run_now(&self) -> Result<EvictionReport> {
        loop {
            self.flight.wait_idle().await;
            if let Some(guard) = self.flight.begin() {
                return self.run_guarded(guard).await;
            }
        }
    }

    async fn run_guarded(&self, mut guard: kura_asyncutils::FlightGuard<'_>) -> Result<EvictionReport> {
        let mut report: Option<EvictionReport> = None;
        loop {
            let pass = self.pass().await;
            let pass = match pass {
                Ok(pass) => pass,
                Err(e) => {
                    tracing::error!(error = ?e, "Asset cache eviction failed");
                    // A rerun requested meanwhile is dropped with the guard. The
                    // next stored asset schedules a fresh pass.
                    if guard.finish() {
                        tracing::debug!("Dropping requested eviction rerun after failure");
                    }
                    return Err(e);
                },
            };
            report = Some(match report {
                Some(previous) => previous.then(pass),
                None => pass,
            });
            if !guard.finish() {
                break;
            }
        }
        let report = report.unwrap_or_default();
        log_report(&report, self.limit());
        Ok(report)
    }

    async fn pass(&self) -> Result<EvictionReport> {
        let started = Instant::now();
        let limit = self.limit();
        let size_before = self.store.sum_size().await.or_raise(|| ErrorKind::Store)?;
        let mut report = EvictionReport { size_before, ..EvictionReport::default() };
        let mut current = size_before;
        while current > limit {
            let batch = self.store.oldest(self.batch).await.or_raise(|| ErrorKind::Store)?;
            if batch.is_empty() {
                break;
            }
            for record in batch {
                if current <= limit {
                    break;
                }
                match self.backend.delete(Path::new(&record.content_hash)).await {
                    Ok(()) => {},
                    // Someone else got there first; the space is free either way.
                    Err(e) if e.is_not_found() => {},
                    Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
                }
                self.store.delete(&record.url).await.or_raise(|| ErrorKind::Store)?;
                current = current.saturating_sub(record.size_bytes);
                report.files_deleted += 1;
                report.bytes_freed += record.size_bytes;
            }
            if current > limit {
                // Let foreground work through between batches.
                tokio::task::yield_now().await;
                current = self.store.sum_size().await.or_raise(|| ErrorKind::Store)?;
            }
        }
        report.size_after = self.store.sum_size().await.or_raise(|| ErrorKind::Store)?;
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(report)
    }
}

/// Debounced trigger for [`Evictor`] passes.
pub(crate) struct EvictionScheduler {
    evictor: Arc<Evictor>,
    debouncer: Debouncer,
}

impl EvictionScheduler {
    pub(crate) fn spawn(evictor: Arc<Evictor>, debounce: Duration) -> Self {
        let runner = Arc::clone(&evictor);
        let debouncer = Debouncer::spawn(debounce, move || {
            let evictor = Arc::clone(&runner);
            async move {
                // Failures are logged by the evictor; the next write retries.
                _ = evictor.run().await;
            }
        });
        Self { evictor, debouncer }
    }

    pub(crate) fn evictor(&self) -> &Evictor {
        &self.evictor
    }

    /// Request a pass after the debounce period.
    pub(crate) fn schedule(&self) {
        self.debouncer.trigger();
    }

    pub(crate) async fn shutdown(&self) {
        self.debouncer.shutdown().await;
        self.evictor.flight.wait_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_records::{AssetRecord, RecordStore, StoreOptions};
    use kura_storage::LocalBackend;
    use time::UtcDateTime;

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: BackendHandle,
        store: StoreHandle,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let backend: BackendHandle = Arc::new(LocalBackend::new("assets", dir.path()).unwrap());
            let store = Arc::new(RecordStore::open(StoreOptions::ephemeral()).await.unwrap());
            Self { _dir: dir, backend, store }
        }

        async fn add(&self, url: &str, size: usize, cached_at: i64) {
            let hash = crate::content_hash(url);
            self.backend.write(Path::new(&hash), &vec![0u8; size]).await.unwrap();
            let record = AssetRecord::new(url, hash, size as u64)
                .with_cached_at(UtcDateTime::from_unix_timestamp(cached_at).unwrap());
            self.store.upsert(&record).await.unwrap();
        }

        fn evictor(&self, limit: u64, batch: u64) -> Evictor {
            Evictor::new(Arc::clone(&self.backend), Arc::clone(&self.store), limit, batch)
        }

        async fn urls(&self) -> Vec<String> {
            self.store.oldest(u64::MAX >> 1).await.unwrap().into_iter().map(|r| r.url).collect()
        }
    }

    #[tokio::test]
    async fn test_under_limit_does_nothing() {
        let fixture = Fixture::new().await;
        fixture.add("a", 10, 1).await;
        let report = fixture.evictor(100, 50).run_now().await.unwrap();
        assert_eq!(report.files_deleted, 0);
        assert_eq!((report.size_before, report.size_after), (10, 10));
    }

    #[tokio::test]
    async fn test_oldest_goes_first() {
        let fixture = Fixture::new().await;
        fixture.add("thirty", 10, 30).await;
        fixture.add("ten", 10, 10).await;
        fixture.add("twenty", 10, 20).await;
        let report = fixture.evictor(25, 50).run_now().await.unwrap();
        assert_eq!(report.files_deleted, 1);
        assert_eq!(fixture.urls().await, vec!["twenty", "thirty"]);
        assert!(!fixture.backend.exists(Path::new(&crate::content_hash("ten"))).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_limit_evicts_everything() {
        let fixture = Fixture::new().await;
        fixture.add("only", 100, 1).await;
        let report = fixture.evictor(0, 50).run_now().await.unwrap();
        assert_eq!((report.files_deleted, report.bytes_freed), (1, 100));
        assert_eq!((report.size_before, report.size_after), (100, 0));
        assert_eq!(fixture.store.sum_size().await.unwrap(), 0);
        assert_eq!(fixture.backend.usage().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_multiple_batches() {
        let fixture = Fixture::new().await;
        for i in 0..12 {
            fixture.add(&format!("u{i:02}"), 10, i).await;
        }
        let report = fixture.evictor(35, 2).run_now().await.unwrap();
        assert_eq!(report.files_deleted, 9);
        assert!(fixture.store.sum_size().await.unwrap() <= 35);
        assert_eq!(fixture.urls().await, vec!["u09", "u10", "u11"]);
    }

    #[tokio::test]
    async fn test_missing_files_count_as_evicted() {
        let fixture = Fixture::new().await;
        fixture.add("gone", 50, 1).await;
        fixture.add("kept", 50, 2).await;
        fixture.backend.delete(Path::new(&crate::content_hash("gone"))).await.unwrap();
        let report = fixture.evictor(60, 50).run_now().await.unwrap();
        assert_eq!(report.files_deleted, 1);
        assert_eq!(fixture.urls().await, vec!["kept"]);
    }

    #[tokio::test]
    async fn test_concurrent_requests_fold_into_rerun() {
        let fixture = Fixture::new().await;
        for i in 0..5 {
            fixture.add(&format!("u{i}"), 10, i).await;
        }
        let evictor = fixture.evictor(20, 1);
        let (a, b) = tokio::join!(evictor.run(), evictor.run());
        // Exactly one of the two callers ran the pass.
        assert!(a.is_some() ^ b.is_some());
        assert!(fixture.store.sum_size().await.unwrap() <= 20);
    }

    #[tokio::test]
    async fn test_run_now_waits_for_a_running_pass() {
        let fixture = Fixture::new().await;
        for i in 0..4 {
            fixture.add(&format!("u{i}"), 10, i).await;
        }
        let evictor = Arc::new(fixture.evictor(20, 50));
        // A scheduled pass is under way.
        let running = evictor.flight.begin().unwrap();

        let caller = tokio::spawn({
            let evictor = Arc::clone(&evictor);
            async move { evictor.run_now().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!caller.is_finished(), "must not start a second pass alongside the first");
        assert!(evictor.run().await.is_none());
        assert_eq!(fixture.store.count().await.unwrap(), 4, "nothing evicted yet");

        let scheduled = evictor.run_guarded(running).await.unwrap();
        assert_eq!(scheduled.files_deleted, 2);
        let immediate = caller.await.unwrap().unwrap();
        assert_eq!(immediate.files_deleted, 0);
        assert_eq!(immediate.size_before, 20);
        assert_eq!(fixture.urls().await, vec!["u2", "u3"]);
        assert_eq!(evictor.flight.state(), kura_asyncutils::FlightState::Idle);
    }

    #[tokio::test]
    async fn test_scheduler_debounces() {
        let fixture = Fixture::new().await;
        fixture.add("a", 10, 1).await;
        fixture.add("b", 10, 2).await;
        let evictor = Arc::new(fixture.evictor(100, 50));
        let scheduler = EvictionScheduler::spawn(Arc::clone(&evictor), Duration::from_millis(10));
        scheduler.evictor().set_limit(10);
        scheduler.schedule();
        scheduler.schedule();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fixture.urls().await, vec!["b"]);
        scheduler.shutdown().await;
    }
}
