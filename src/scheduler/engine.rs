use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{spawn_dispatcher, TargetQueue};
use crate::error::ConfigError;

/// What a pool run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Items handed from the source to the workers.
    pub dispatched: u64,
    /// Items whose worker function returned.
    pub completed: u64,
    /// Highest number of worker functions observed executing at once.
    pub peak_in_flight: usize,
    /// Worker or dispatcher tasks that panicked.
    pub panicked: usize,
    pub cancelled: bool,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicU64,
}

/// Fixed-size set of workers draining one source.
///
/// At most `concurrency` worker functions run at once. Their outputs go to a
/// caller-supplied bounded channel, so a slow consumer stalls the workers
/// instead of growing a buffer.
pub struct WorkerPool {
    concurrency: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Result<Self, ConfigError> {
        if concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(concurrency));
        }
        Ok(Self {
            concurrency,
            cancel: CancellationToken::new(),
        })
    }

    /// Share an externally owned cancellation token (e.g. a Ctrl-C handler).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until the source is exhausted (or the pool is cancelled) and all
    /// in-flight work has finished. Outputs for one item are sent in the
    /// order the worker returned them.
    pub async fn run<I, F, Fut, R>(&self, source: I, worker: F, sink: mpsc::Sender<R>) -> PoolStats
    where
        I: IntoIterator + Send + 'static,
        I::IntoIter: Send,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<R>> + Send + 'static,
        R: Send + 'static,
    {
        let (queue, dispatcher) = spawn_dispatcher(source, self.concurrency, self.cancel.clone());
        let queue = Arc::new(queue);
        let worker = Arc::new(worker);
        let counters = Arc::new(Counters::default());

        let mut workers = JoinSet::new();
        for id in 0..self.concurrency {
            workers.spawn(worker_loop(
                id,
                Arc::clone(&queue),
                Arc::clone(&worker),
                sink.clone(),
                Arc::clone(&counters),
                self.cancel.clone(),
            ));
        }
        drop(sink);

        let mut panicked = 0;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
                panicked += 1;
            }
        }

        // Closing the queue releases a dispatcher blocked on a full channel.
        drop(queue);
        let dispatched = match dispatcher.await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "dispatcher task failed");
                panicked += 1;
                0
            }
        };

        let stats = PoolStats {
            dispatched,
            completed: counters.completed.load(Ordering::SeqCst),
            peak_in_flight: counters.peak.load(Ordering::SeqCst),
            panicked,
            cancelled: self.cancel.is_cancelled(),
        };
        info!(
            dispatched = stats.dispatched,
            completed = stats.completed,
            peak_in_flight = stats.peak_in_flight,
            cancelled = stats.cancelled,
            "worker pool drained"
        );
        stats
    }
}

async fn worker_loop<T, F, Fut, R>(
    id: usize,
    queue: Arc<TargetQueue<T>>,
    worker: Arc<F>,
    sink: mpsc::Sender<R>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Vec<R>>,
{
    while let Some(item) = queue.next(&cancel).await {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(now, Ordering::SeqCst);

        let outputs = worker(item).await;

        counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        counters.completed.fetch_add(1, Ordering::SeqCst);

        for output in outputs {
            if sink.send(output).await.is_err() {
                warn!(worker = id, "result consumer gone; cancelling pool");
                cancel.cancel();
                return;
            }
        }
    }
    debug!(worker = id, "worker exiting");
}
