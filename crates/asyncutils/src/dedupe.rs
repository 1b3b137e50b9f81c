//! In-flight request de-duplication.

use derive_more::{Display, Error};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::task::TaskTracker;

/// The in-flight task ended without producing a result (it panicked, or the
/// runtime shut down underneath it).
#[derive(Clone, Copy, Debug, Display, Error, PartialEq, Eq)]
#[display("in-flight operation was aborted")]
pub struct Aborted;

type InFlight<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;
type InFlightMap<K, T, E> = Arc<Mutex<HashMap<K, InFlight<T, E>>>>;

/// Shares one running operation between every caller asking for the same key.
///
/// The operation is spawned onto the Tokio runtime, so it runs to completion
/// even if every caller stops waiting for it. Its map entry is removed as
/// soon as it completes (success, failure or panic): a caller arriving after
/// that starts a fresh attempt.
///
/// Results are handed out by clone, which is why `T` and `E` must be
/// [`Clone`]. Wrap large values in an [`Arc`].
///
/// # Examples
///
/// ```
/// use kura_asyncutils::{Aborted, Deduplicator};
///
/// #[derive(Clone, Debug)]
/// struct Failed;
/// impl From<Aborted> for Failed {
///     fn from(_: Aborted) -> Self { Failed }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let dedupe: Deduplicator<String, u32, Failed> = Deduplicator::new();
/// let (a, b) = tokio::join!(
///     dedupe.dedupe("key".to_string(), || async { Ok(7) }),
///     dedupe.dedupe("key".to_string(), || async { Ok(8) }),
/// );
/// // The second caller joined the first caller's operation.
/// assert_eq!((a.unwrap(), b.unwrap()), (7, 7));
/// # }
/// ```
pub struct Deduplicator<K, T, E> {
    in_flight: InFlightMap<K, T, E>,
    tracker: Option<TaskTracker>,
}

impl<K, T, E> Default for Deduplicator<K, T, E> {
    fn default() -> Self {
        Self { in_flight: Arc::new(Mutex::new(HashMap::new())), tracker: None }
    }
}

impl<K, T, E> std::fmt::Debug for Deduplicator<K, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator").field("in_flight", &self.len()).finish()
    }
}

/// Removes the map entry when the spawned task ends, however it ends.
struct Release<K: Eq + Hash, T, E> {
    in_flight: InFlightMap<K, T, E>,
    key: Option<K>,
}

impl<K: Eq + Hash, T, E> Drop for Release<K, T, E> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).remove(&key);
        }
    }
}

impl<K, T, E> Deduplicator<K, T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn operations on `tracker`, so that whoever owns it can wait for
    /// in-flight work on shutdown.
    pub fn with_tracker(tracker: TaskTracker) -> Self {
        Self { tracker: Some(tracker), ..Self::default() }
    }

    /// Number of operations currently in flight.
    pub fn len(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T, E> Deduplicator<K, T, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<Aborted> + 'static,
{
    /// Join the operation in flight for `key`, or start one with `factory`.
    ///
    /// `factory` is only called when nothing is in flight for `key`.
    pub async fn dedupe<F, Fut>(&self, key: K, factory: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let shared = {
            let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match map.get(&key) {
                Some(existing) => {
                    tracing::trace!("Joining in-flight operation");
                    existing.clone()
                },
                None => {
                    let operation = factory();
                    let release = Release { in_flight: Arc::clone(&self.in_flight), key: Some(key.clone()) };
                    // The entry is inserted below while the lock is still held,
                    // so the task can't release it before it exists.
                    let task = async move {
                        let _release = release;
                        operation.await
                    };
                    let handle = match &self.tracker {
                        Some(tracker) => tracker.spawn(task),
                        None => tokio::spawn(task),
                    };
                    let shared = async move { handle.await.unwrap_or_else(|_| Err(E::from(Aborted))) }
                        .boxed()
                        .shared();
                    map.insert(key, shared.clone());
                    shared
                },
            }
        };
        shared.await
    }
}
