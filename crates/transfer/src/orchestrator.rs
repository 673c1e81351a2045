//! Transfer entry point.

use std::sync::Arc;

use s3ferry_storage::{ObjectStore, RetryPolicy, RetryingStore};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer_pool::BufferPool;
use crate::chunked::{ChunkReader, plan};
use crate::download::download_parallel;
use crate::progress::TransferProgress;
use crate::types::{Direction, TransferOptions, TransferResult, TransferSpec, TransferStream};
use crate::upload::upload_multipart;
use crate::validation::{validate_object_key, validate_spec};
use crate::TransferError;

/// Moves objects between local streams and an object store.
///
/// Objects that fit in one chunk take a single request. Larger objects are
/// split into chunks that up to `concurrency` workers transfer at once,
/// with every request going through the configured retry policy.
pub struct TransferEngine {
    store: Arc<dyn ObjectStore>,
    options: TransferOptions,
    cancel: CancellationToken,
}

impl TransferEngine {
    /// Creates an engine over `store`. Every request is wrapped in a
    /// [`RetryingStore`] built from `options.retry`.
    pub fn new(store: Arc<dyn ObjectStore>, options: TransferOptions) -> Self {
        let policy = RetryPolicy::new(options.retry.clone());
        Self {
            store: Arc::new(RetryingStore::new(store, policy)),
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancels in-progress transfers when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// The retrying store, for requests outside of transfers.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Returns the size of an object.
    ///
    /// A 404 is retried, since an object that was just written may not be
    /// visible yet.
    pub async fn object_size(&self, bucket: &str, key: &str) -> Result<u64, TransferError> {
        Ok(self.store.head_object(bucket, key).await?)
    }

    /// Runs an upload or download depending on `stream`.
    pub async fn transfer(
        &self,
        bucket: &str,
        key: &str,
        stream: TransferStream<'_>,
    ) -> TransferResult {
        match stream {
            TransferStream::Source(source) => self.upload(bucket, key, source).await,
            TransferStream::Destination(dest) => self.download(bucket, key, dest).await,
        }
    }

    /// Downloads `bucket/key` into `dest`.
    pub async fn download<W>(&self, bucket: &str, key: &str, dest: &mut W) -> TransferResult
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let progress = TransferProgress::new(None);
        let cancel = self.cancel.child_token();
        let outcome = self.run_download(bucket, key, dest, &progress, cancel).await;
        finish(Direction::Download, key, &progress, outcome)
    }

    /// Uploads everything `source` yields to `bucket/key`.
    pub async fn upload<R>(&self, bucket: &str, key: &str, source: &mut R) -> TransferResult
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let progress = TransferProgress::new(None);
        let cancel = self.cancel.child_token();
        let outcome = self.run_upload(bucket, key, source, &progress, cancel).await;
        finish(Direction::Upload, key, &progress, outcome)
    }

    /// Uploads a source whose length is known up front, such as a file.
    ///
    /// A source that needs more than [`MAX_UPLOAD_PARTS`](crate::MAX_UPLOAD_PARTS)
    /// parts is rejected before any request is issued, and a source that
    /// yields a different number of bytes than `size` fails the transfer.
    pub async fn upload_sized<R>(
        &self,
        bucket: &str,
        key: &str,
        source: &mut R,
        size: u64,
    ) -> TransferResult
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let progress = TransferProgress::new(Some(size));
        let cancel = self.cancel.child_token();
        let outcome = self.run_upload(bucket, key, source, &progress, cancel).await;
        finish(Direction::Upload, key, &progress, outcome)
    }

    async fn run_download<W>(
        &self,
        bucket: &str,
        key: &str,
        dest: &mut W,
        progress: &TransferProgress,
        cancel: CancellationToken,
    ) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let tuning = self.options.tuning(Direction::Download);
        validate_object_key(key)?;
        validate_spec(&TransferSpec::new(bucket, key, None, tuning), Direction::Download)?;

        let size = self.object_size(bucket, key).await?;
        let spec = TransferSpec::new(bucket, key, Some(size), tuning);
        progress.set_total(size);
        debug!(key, size, "object size known");

        if spec.is_single_shot() {
            let data = self.store.get_object(bucket, key).await?;
            if data.len() as u64 != size {
                return Err(TransferError::SizeMismatch {
                    expected: size,
                    actual: data.len() as u64,
                });
            }
            dest.write_all(&data)
                .await
                .map_err(TransferError::destination)?;
            dest.flush().await.map_err(TransferError::destination)?;
            progress.add(size);
            return Ok(());
        }

        let chunks = plan(size, spec.chunk_size);
        let pool = BufferPool::new(
            spec.concurrency.min(chunks.len()),
            spec.chunk_size,
            cancel.clone(),
        );
        download_parallel(
            Arc::clone(&self.store),
            &spec,
            chunks,
            &pool,
            dest,
            progress,
            cancel,
        )
        .await?;

        if progress.bytes() != size {
            return Err(TransferError::SizeMismatch {
                expected: size,
                actual: progress.bytes(),
            });
        }
        Ok(())
    }

    async fn run_upload<R>(
        &self,
        bucket: &str,
        key: &str,
        source: &mut R,
        progress: &TransferProgress,
        cancel: CancellationToken,
    ) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let tuning = self.options.tuning(Direction::Upload);
        let spec = TransferSpec::new(bucket, key, progress.total(), tuning);
        validate_object_key(key)?;
        validate_spec(&spec, Direction::Upload)?;

        // Buffers are allocated lazily, so a short source never allocates
        // more than it has chunks.
        let pool = BufferPool::new(spec.concurrency, spec.chunk_size, cancel.clone());
        let mut reader = ChunkReader::new(source, spec.chunk_size);
        let mut buffer = pool.acquire().await?;
        let first = reader.next_chunk(&mut buffer).await?;
        let single_shot = match first {
            None => true,
            Some(_) => reader.at_eof().await?,
        };

        match first {
            Some(chunk) if !single_shot => {
                upload_multipart(
                    Arc::clone(&self.store),
                    &spec,
                    &mut reader,
                    (chunk, buffer),
                    &pool,
                    progress,
                    cancel,
                )
                .await?;
            }
            _ => {
                let body = buffer.take_bytes();
                let len = body.len() as u64;
                self.store.put_object(bucket, key, body).await?;
                progress.add(len);
                buffer.release();
            }
        }

        let read = reader.bytes_read();
        if let Some(size) = spec.total_bytes
            && size != read
        {
            return Err(TransferError::SizeMismatch {
                expected: size,
                actual: read,
            });
        }
        let stored = self.object_size(bucket, key).await?;
        if stored != read {
            return Err(TransferError::SizeMismatch {
                expected: read,
                actual: stored,
            });
        }
        Ok(())
    }
}

fn finish(
    direction: Direction,
    key: &str,
    progress: &TransferProgress,
    outcome: Result<(), TransferError>,
) -> TransferResult {
    let result = TransferResult {
        bytes_transferred: progress.bytes(),
        elapsed: progress.elapsed(),
        error: outcome.err(),
    };
    let elapsed_ms = result.elapsed.as_millis() as u64;
    let rate_bps = result.throughput() as u64;
    match &result.error {
        None => info!(
            %direction,
            key,
            bytes = result.bytes_transferred,
            elapsed_ms,
            rate_bps,
            "transfer complete"
        ),
        Some(err) => warn!(
            %direction,
            key,
            bytes = result.bytes_transferred,
            total = progress.total(),
            elapsed_ms,
            error = %err,
            "transfer failed"
        ),
    }
    result
}
