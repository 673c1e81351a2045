//! Sequential consumer of per-chunk completion signals.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::debug;

use crate::TransferError;
use crate::buffer_pool::PooledBuffer;
use crate::progress::TransferProgress;
use crate::worker::FailureSlot;

/// Single-use completion signal of one chunk.
pub(crate) type Signal<T> = oneshot::Receiver<Result<T, TransferError>>;

/// Waits for one chunk's signal.
///
/// Unblocks with the transfer's first error when the transfer is cancelled
/// or the signal's sender is dropped without firing.
pub(crate) async fn await_signal<T>(
    signal: Signal<T>,
    failure: &FailureSlot,
) -> Result<T, TransferError> {
    let outcome = tokio::select! {
        biased;
        outcome = signal => outcome,
        _ = failure.cancel_token().cancelled() => return Err(failure.error()),
    };
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(failure.record(err)),
        Err(_) => Err(failure.error()),
    }
}

/// Writes chunk payloads to `dest` in index order and releases each buffer
/// right after its write.
pub(crate) async fn reassemble<W>(
    signals: Vec<Signal<PooledBuffer>>,
    dest: &mut W,
    progress: &TransferProgress,
    failure: &FailureSlot,
) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    for (index, signal) in signals.into_iter().enumerate() {
        let buffer = await_signal(signal, failure).await?;
        if let Err(e) = dest.write_all(&buffer).await {
            return Err(failure.record(TransferError::destination(e)));
        }
        let len = buffer.len() as u64;
        buffer.release();
        progress.add(len);
        debug!(
            chunk = index,
            bytes = len,
            written = progress.bytes(),
            rate_bps = progress.bytes_per_second() as u64,
            eta_ms = progress.eta().map(|eta| eta.as_millis() as u64),
            "chunk written"
        );
    }
    dest.flush()
        .await
        .map_err(|e| failure.record(TransferError::destination(e)))
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::buffer_pool::BufferPool;

    async fn filled(pool: &BufferPool, bytes: &[u8]) -> PooledBuffer {
        let mut buffer = pool.acquire().await.unwrap();
        buffer.as_mut_vec().extend_from_slice(bytes);
        buffer
    }

    #[tokio::test]
    async fn writes_in_index_order_despite_completion_order() {
        let cancel = CancellationToken::new();
        let failure = FailureSlot::new(cancel.clone());
        let pool = BufferPool::new(3, 4, cancel);
        let progress = TransferProgress::new(Some(10));

        let (tx0, rx0) = oneshot::channel();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();

        let last = filled(&pool, b"89").await;
        let middle = filled(&pool, b"4567").await;
        let first = filled(&pool, b"0123").await;
        tokio::spawn(async move {
            tx2.send(Ok(last)).ok();
            tokio::time::sleep(Duration::from_millis(5)).await;
            tx1.send(Ok(middle)).ok();
            tokio::time::sleep(Duration::from_millis(5)).await;
            tx0.send(Ok(first)).ok();
        });

        let mut out = Vec::new();
        reassemble(vec![rx0, rx1, rx2], &mut out, &progress, &failure)
            .await
            .unwrap();
        assert_eq!(out, b"0123456789");
        assert_eq!(progress.bytes(), 10);
        assert_eq!(pool.checked_out(), 0);
    }

    #[tokio::test]
    async fn chunk_error_stops_reassembly() {
        let cancel = CancellationToken::new();
        let failure = FailureSlot::new(cancel.clone());
        let pool = BufferPool::new(2, 4, cancel.clone());
        let progress = TransferProgress::new(None);

        let (tx0, rx0) = oneshot::channel();
        let (tx1, rx1) = oneshot::channel::<Result<PooledBuffer, TransferError>>();
        let (_tx2, rx2) = oneshot::channel();
        tx0.send(Ok(filled(&pool, b"ok").await)).ok();
        tx1.send(Err(TransferError::InvalidRange("chunk 1".into()))).ok();

        let mut out = Vec::new();
        let err = reassemble(vec![rx0, rx1, rx2], &mut out, &progress, &failure)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidRange(_)));
        assert_eq!(out, b"ok");
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_sender_reports_first_error() {
        let cancel = CancellationToken::new();
        let failure = FailureSlot::new(cancel.clone());
        failure.record(TransferError::SizeMismatch {
            expected: 1,
            actual: 2,
        });

        let (tx, rx) = oneshot::channel::<Result<u8, TransferError>>();
        drop(tx);
        let err = await_signal(rx, &failure).await.unwrap_err();
        assert!(matches!(err, TransferError::SizeMismatch { .. }));
    }

    #[tokio::test]
    async fn cancellation_unblocks_pending_signal() {
        let cancel = CancellationToken::new();
        let failure = FailureSlot::new(cancel.clone());
        let (_tx, rx) = oneshot::channel::<Result<u8, TransferError>>();

        let waiter = {
            let failure = failure.clone();
            tokio::spawn(async move { await_signal(rx, &failure).await })
        };
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn destination_failure_cancels_transfer() {
        let cancel = CancellationToken::new();
        let failure = FailureSlot::new(cancel.clone());
        let pool = BufferPool::new(1, 4, cancel.clone());
        let progress = TransferProgress::new(None);

        let (tx, rx) = oneshot::channel();
        tx.send(Ok(filled(&pool, b"data").await)).ok();

        let err = reassemble(vec![rx], &mut BrokenPipe, &progress, &failure)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::DestinationWriteFailed(_)));
        assert!(cancel.is_cancelled());
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(progress.bytes(), 0);
    }
}
