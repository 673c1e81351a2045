//! Transfer worker pool.
//!
//! Workers are unordered peers pulling jobs from one shared queue. Each
//! iteration first reserves what a job needs (a pool buffer for ranged
//! downloads), then takes the next job, so the lowest outstanding chunk
//! always holds a buffer and the reassembler can make progress.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TransferError;

// ---------------------------------------------------------------------------
// FailureSlot
// ---------------------------------------------------------------------------

/// Holds the first terminal error of a transfer and cancels it.
#[derive(Clone)]
pub(crate) struct FailureSlot {
    first: Arc<Mutex<Option<TransferError>>>,
    cancel: CancellationToken,
}

impl FailureSlot {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            first: Arc::new(Mutex::new(None)),
            cancel,
        }
    }

    /// Records `err` unless an earlier error exists, cancels the transfer,
    /// and returns the error that won.
    pub(crate) fn record(&self, err: TransferError) -> TransferError {
        let winner = {
            let mut first = self.first.lock().unwrap();
            first.get_or_insert(err).clone()
        };
        self.cancel.cancel();
        winner
    }

    /// The first recorded error, if any.
    pub(crate) fn recorded(&self) -> Option<TransferError> {
        self.first.lock().unwrap().clone()
    }

    /// The first recorded error, or [`TransferError::Cancelled`] when the
    /// transfer was cancelled from outside.
    pub(crate) fn error(&self) -> TransferError {
        self.recorded().unwrap_or(TransferError::Cancelled)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Multi-consumer view of an mpsc receiver. Each job is taken exactly once.
pub(crate) struct JobQueue<J> {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<J>>>,
}

impl<J> Clone for JobQueue<J> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<J> JobQueue<J> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<J>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Next job, or `None` once the queue is drained or `cancel` fires.
    pub(crate) async fn next(&self, cancel: &CancellationToken) -> Option<J> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            job = async { self.rx.lock().await.recv().await } => job,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Per-direction behavior of a worker.
#[async_trait]
pub(crate) trait ChunkHandler: Send + Sync + 'static {
    type Job: Send + 'static;
    /// Held before pulling a job and handed to [`handle`](Self::handle).
    type Reservation: Send + 'static;

    async fn reserve(&self) -> Result<Self::Reservation, TransferError>;

    /// Performs one job and publishes its outcome.
    async fn handle(&self, worker: usize, reservation: Self::Reservation, job: Self::Job);
}

/// Spawned worker tasks of one transfer.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `count` workers draining `queue`.
    pub(crate) fn spawn<H: ChunkHandler>(
        handler: Arc<H>,
        queue: JobQueue<H::Job>,
        count: usize,
        cancel: CancellationToken,
    ) -> Self {
        let handles = (0..count.max(1))
            .map(|worker| {
                let handler = Arc::clone(&handler);
                let queue = queue.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    run_worker(worker, handler, queue, cancel).await;
                })
            })
            .collect();
        Self { handles }
    }

    /// Waits for every worker to stop.
    pub(crate) async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "transfer worker panicked");
            }
        }
    }
}

async fn run_worker<H: ChunkHandler>(
    worker: usize,
    handler: Arc<H>,
    queue: JobQueue<H::Job>,
    cancel: CancellationToken,
) {
    let mut jobs = 0usize;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let reservation = match handler.reserve().await {
            Ok(reservation) => reservation,
            Err(_) => break,
        };
        let Some(job) = queue.next(&cancel).await else {
            break;
        };
        handler.handle(worker, reservation, job).await;
        jobs += 1;
    }
    debug!(worker, jobs, "transfer worker stopped");
}
