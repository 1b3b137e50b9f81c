//! Trailing-edge debounce backed by a background task.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs an action once `delay` has passed without a new [`trigger()`](Self::trigger).
///
/// Every trigger restarts the quiet period (debounce, not throttle). The
/// action is awaited inside the background task, so two runs of the action
/// never overlap through the same debouncer. Cancellation only interrupts the
/// waiting: an action that has started always runs to completion.
///
/// # Examples
///
/// ```
/// use kura_asyncutils::Debouncer;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let runs = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&runs);
/// let debouncer = Debouncer::spawn(Duration::from_millis(10), move || {
///     let counter = Arc::clone(&counter);
///     async move { counter.fetch_add(1, Ordering::SeqCst); }
/// });
/// for _ in 0..10 {
///     debouncer.trigger();
/// }
/// tokio::time::sleep(Duration::from_millis(50)).await;
/// assert_eq!(runs.load(Ordering::SeqCst), 1);
/// debouncer.shutdown().await;
/// # }
/// ```
#[derive(Debug)]
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    /// Start the background task. Must be called from within a Tokio runtime.
    pub fn spawn<F, Fut>(delay: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(delay, rx, cancel.clone(), action));
        Self { tx, cancel, task: Mutex::new(Some(task)) }
    }

    /// Arm (or re-arm) the timer.
    ///
    /// Triggers after [`shutdown()`](Self::shutdown) are ignored.
    pub fn trigger(&self) {
        _ = self.tx.send(());
    }

    /// Drop any pending trigger and wait for a running action to finish.
    ///
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "Debounced action did not shut down cleanly");
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<F, Fut>(delay: Duration, mut rx: mpsc::UnboundedReceiver<()>, cancel: CancellationToken, action: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        // Idle: wait for the first trigger.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            msg = rx.recv() => if msg.is_none() { return },
        }
        // Armed: every further trigger restarts the quiet period.
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                msg = rx.recv() => match msg {
                    Some(()) => continue,
                    None => break,
                },
                _ = tokio::time::sleep(delay) => break,
            }
        }
        action().await;
    }
}
