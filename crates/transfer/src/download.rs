//! Parallel ranged download.

use std::sync::Arc;

use async_trait::async_trait;
use s3ferry_storage::ObjectStore;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TransferError;
use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::progress::TransferProgress;
use crate::reassembler::{Signal, reassemble};
use crate::types::{Chunk, TransferSpec};
use crate::worker::{ChunkHandler, FailureSlot, JobQueue, WorkerPool};

pub(crate) struct RangeJob {
    chunk: Chunk,
    signal: oneshot::Sender<Result<PooledBuffer, TransferError>>,
}

/// Fetches one chunk per job into a pool buffer.
struct RangeFetcher {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    pool: BufferPool,
    failure: FailureSlot,
}

impl RangeFetcher {
    async fn fetch(&self, chunk: &Chunk, buffer: &mut PooledBuffer) -> Result<(), TransferError> {
        let data = buffer.as_mut_vec();
        data.clear();
        self.store
            .get_range_into(&self.bucket, &self.key, chunk.range(), data)
            .await?;
        if data.len() as u64 != chunk.len() {
            return Err(TransferError::InvalidRange(format!(
                "chunk {} expected {} bytes, got {}",
                chunk.index,
                chunk.len(),
                data.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkHandler for RangeFetcher {
    type Job = RangeJob;
    type Reservation = PooledBuffer;

    async fn reserve(&self) -> Result<PooledBuffer, TransferError> {
        self.pool.acquire().await
    }

    async fn handle(&self, worker: usize, mut buffer: PooledBuffer, job: RangeJob) {
        let RangeJob { chunk, signal } = job;
        let outcome = match self.fetch(&chunk, &mut buffer).await {
            Ok(()) => {
                debug!(worker, chunk = chunk.index, bytes = chunk.len(), "chunk downloaded");
                Ok(buffer)
            }
            Err(err) => {
                debug!(worker, chunk = chunk.index, error = %err, "chunk download failed");
                Err(self.failure.record(err))
            }
        };
        // The reassembler may already be gone; the buffer returns to the pool either way.
        let _ = signal.send(outcome);
    }
}

/// Downloads `chunks` of the object in `spec` and writes them to `dest` in
/// order. One worker runs per pool buffer.
pub(crate) async fn download_parallel<W>(
    store: Arc<dyn ObjectStore>,
    spec: &TransferSpec,
    chunks: Vec<Chunk>,
    pool: &BufferPool,
    dest: &mut W,
    progress: &TransferProgress,
    cancel: CancellationToken,
) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let failure = FailureSlot::new(cancel.clone());

    let (tx, rx) = mpsc::unbounded_channel();
    let mut signals: Vec<Signal<PooledBuffer>> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let (signal, receiver) = oneshot::channel();
        signals.push(receiver);
        if tx.send(RangeJob { chunk, signal }).is_err() {
            return Err(TransferError::Cancelled);
        }
    }
    drop(tx);

    debug!(
        key = %spec.key,
        chunks = signals.len(),
        workers = pool.capacity(),
        chunk_size = spec.chunk_size,
        "starting parallel download"
    );

    let fetcher = Arc::new(RangeFetcher {
        store,
        bucket: spec.bucket.clone(),
        key: spec.key.clone(),
        pool: pool.clone(),
        failure: failure.clone(),
    });
    let workers = WorkerPool::spawn(fetcher, JobQueue::new(rx), pool.capacity(), cancel.clone());

    let result = reassemble(signals, dest, progress, &failure).await;
    if result.is_err() {
        cancel.cancel();
    }
    workers.join().await;

    debug!(
        key = %spec.key,
        peak_buffers = pool.peak_checked_out(),
        allocated = pool.allocated(),
        "parallel download finished"
    );
    result
}
