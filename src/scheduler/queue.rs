//! Bounded hand-off between a single dispatcher and the worker set.
//!
//! The dispatcher owns the (blocking) target iterator and runs on a blocking
//! thread; workers pull from a shared receiver. The channel capacity bounds
//! how far the dispatcher can read ahead of the workers.

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Receiving side shared by all workers.
pub struct TargetQueue<T> {
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> TargetQueue<T> {
    /// Next item, or `None` once the source is exhausted or the run was
    /// cancelled.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<T> {
        if cancel.is_cancelled() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = rx.recv() => item,
        }
    }
}

/// Start the dispatcher. The returned handle resolves to the number of items
/// handed to workers.
pub fn spawn_dispatcher<I>(
    source: I,
    capacity: usize,
    cancel: CancellationToken,
) -> (TargetQueue<I::Item>, JoinHandle<u64>)
where
    I: IntoIterator + Send + 'static,
    I::IntoIter: Send,
    I::Item: Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::task::spawn_blocking(move || {
        let mut dispatched = 0u64;
        for item in source {
            if cancel.is_cancelled() {
                debug!(dispatched, "dispatcher stopping: cancelled");
                break;
            }
            // Blocks while the queue is full; fails once all workers are gone.
            if tx.blocking_send(item).is_err() {
                debug!(dispatched, "dispatcher stopping: queue closed");
                break;
            }
            dispatched += 1;
        }
        dispatched
    });

    (TargetQueue { rx: Mutex::new(rx) }, handle)
}
