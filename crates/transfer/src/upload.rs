//! Multipart upload of a stream.

use std::sync::Arc;

use async_trait::async_trait;
use s3ferry_storage::{CompletedPart, ObjectStore};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::chunked::ChunkReader;
use crate::progress::TransferProgress;
use crate::reassembler::{Signal, await_signal};
use crate::types::{Chunk, TransferSpec};
use crate::worker::{ChunkHandler, FailureSlot, JobQueue, WorkerPool};
use crate::{MAX_UPLOAD_PARTS, TransferError};

pub(crate) struct PartJob {
    chunk: Chunk,
    buffer: PooledBuffer,
    signal: oneshot::Sender<Result<CompletedPart, TransferError>>,
}

/// Uploads one filled buffer per job as a multipart part.
struct PartUploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    upload_id: String,
    failure: FailureSlot,
}

#[async_trait]
impl ChunkHandler for PartUploader {
    type Job = PartJob;
    type Reservation = ();

    async fn reserve(&self) -> Result<(), TransferError> {
        Ok(())
    }

    async fn handle(&self, worker: usize, _: (), job: PartJob) {
        let PartJob {
            chunk,
            mut buffer,
            signal,
        } = job;
        let body = buffer.take_bytes();
        let outcome = self
            .store
            .upload_part(
                &self.bucket,
                &self.key,
                &self.upload_id,
                chunk.part_number(),
                body,
            )
            .await;
        buffer.release();

        let outcome = match outcome {
            Ok(part) => {
                debug!(worker, chunk = chunk.index, bytes = chunk.len(), "part uploaded");
                Ok(part)
            }
            Err(err) => {
                debug!(worker, chunk = chunk.index, error = %err, "part upload failed");
                Err(self.failure.record(err.into()))
            }
        };
        let _ = signal.send(outcome);
    }
}

/// Uploads the rest of `reader` as a multipart upload, starting with the
/// already read `first` chunk.
///
/// The upload is aborted if any step fails.
pub(crate) async fn upload_multipart<R>(
    store: Arc<dyn ObjectStore>,
    spec: &TransferSpec,
    reader: &mut ChunkReader<R>,
    first: (Chunk, PooledBuffer),
    pool: &BufferPool,
    progress: &TransferProgress,
    cancel: CancellationToken,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
{
    let upload_id = store
        .create_multipart_upload(&spec.bucket, &spec.key)
        .await?;
    debug!(key = %spec.key, upload_id = %upload_id, "multipart upload started");

    let uploader = PartUploader {
        store: Arc::clone(&store),
        bucket: spec.bucket.clone(),
        key: spec.key.clone(),
        upload_id: upload_id.clone(),
        failure: FailureSlot::new(cancel.clone()),
    };
    let outcome = match upload_parts(uploader, reader, first, pool, progress, cancel).await {
        Ok(parts) => store
            .complete_multipart_upload(&spec.bucket, &spec.key, &upload_id, &parts)
            .await
            .map_err(TransferError::from),
        Err(err) => Err(err),
    };

    if let Err(err) = &outcome {
        match store
            .abort_multipart_upload(&spec.bucket, &spec.key, &upload_id)
            .await
        {
            Ok(()) => warn!(key = %spec.key, upload_id = %upload_id, error = %err, "multipart upload aborted"),
            Err(e) => warn!(
                key = %spec.key,
                upload_id = %upload_id,
                error = %e,
                "failed to abort multipart upload"
            ),
        }
    }
    outcome
}

async fn upload_parts<R>(
    uploader: PartUploader,
    reader: &mut ChunkReader<R>,
    first: (Chunk, PooledBuffer),
    pool: &BufferPool,
    progress: &TransferProgress,
    cancel: CancellationToken,
) -> Result<Vec<CompletedPart>, TransferError>
where
    R: AsyncRead + Unpin,
{
    let failure = uploader.failure.clone();
    let (tx, rx) = mpsc::unbounded_channel();
    let workers = WorkerPool::spawn(
        Arc::new(uploader),
        JobQueue::new(rx),
        pool.capacity(),
        cancel.clone(),
    );

    // Producer: reads the source sequentially into pool buffers.
    let mut pending: Vec<(u64, Signal<CompletedPart>)> = Vec::new();
    let mut next = Some(first);
    while let Some((chunk, buffer)) = next.take() {
        if chunk.index >= MAX_UPLOAD_PARTS {
            failure.record(TransferError::InvalidSpec(format!(
                "source exceeds {MAX_UPLOAD_PARTS} parts of {} bytes",
                pool.buffer_size()
            )));
            break;
        }
        let (signal, receiver) = oneshot::channel();
        pending.push((chunk.len(), receiver));
        if tx.send(PartJob { chunk, buffer, signal }).is_err() {
            break;
        }

        let Ok(mut buffer) = pool.acquire().await else {
            break;
        };
        match reader.next_chunk(&mut buffer).await {
            Ok(Some(chunk)) => next = Some((chunk, buffer)),
            Ok(None) => {}
            Err(err) => {
                failure.record(err);
            }
        }
    }
    drop(tx);

    // Collector: gathers receipts in part order.
    let mut parts = Vec::with_capacity(pending.len());
    let mut result = Ok(());
    for (len, receiver) in pending {
        match await_signal(receiver, &failure).await {
            Ok(part) => {
                progress.add(len);
                debug!(
                    part = part.part_number,
                    bytes = len,
                    sent = progress.bytes(),
                    rate_bps = progress.bytes_per_second() as u64,
                    eta_ms = progress.eta().map(|eta| eta.as_millis() as u64),
                    "part confirmed"
                );
                parts.push(part);
            }
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }
    if result.is_ok() && cancel.is_cancelled() {
        result = Err(failure.error());
    }
    if result.is_err() {
        cancel.cancel();
    }
    workers.join().await;

    debug!(
        parts = parts.len(),
        read = reader.bytes_read(),
        peak_buffers = pool.peak_checked_out(),
        "multipart parts collected"
    );
    result.map(|()| parts)
}
