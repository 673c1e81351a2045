//! Bounded pool of reusable chunk buffers.
//!
//! The pool is the back-pressure of a transfer: at most `capacity` buffers
//! are checked out at once, so memory stays within
//! `capacity × buffer_size` regardless of object size.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::TransferError;

struct PoolInner {
    permits: Arc<Semaphore>,
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    capacity: usize,
    checked_out: AtomicUsize,
    peak_checked_out: AtomicUsize,
    allocated: AtomicUsize,
    cancel: CancellationToken,
}

/// A fixed-size set of byte buffers shared by one transfer.
///
/// Buffers are allocated lazily on first use and recycled afterwards.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool of `capacity` buffers of `buffer_size` bytes each.
    ///
    /// Pending [`acquire`](Self::acquire) calls fail with
    /// [`TransferError::Cancelled`] once `cancel` fires.
    pub fn new(capacity: usize, buffer_size: usize, cancel: CancellationToken) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(capacity)),
                free: Mutex::new(Vec::with_capacity(capacity)),
                buffer_size,
                capacity,
                checked_out: AtomicUsize::new(0),
                peak_checked_out: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
                cancel,
            }),
        }
    }

    /// Waits for a free buffer. The returned buffer is empty.
    pub async fn acquire(&self) -> Result<PooledBuffer, TransferError> {
        let permits = Arc::clone(&self.inner.permits);
        let permit = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return Err(TransferError::Cancelled),
            permit = permits.acquire_owned() => permit.map_err(|_| TransferError::Cancelled)?,
        };

        let recycled = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let data = recycled.unwrap_or_else(|| {
            self.inner.allocated.fetch_add(1, Ordering::SeqCst);
            Vec::with_capacity(self.inner.buffer_size)
        });

        let now = self.inner.checked_out.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_checked_out.fetch_max(now, Ordering::SeqCst);

        Ok(PooledBuffer {
            data,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Buffers currently held by workers or the reassembler.
    pub fn checked_out(&self) -> usize {
        self.inner.checked_out.load(Ordering::SeqCst)
    }

    /// Highest value [`checked_out`](Self::checked_out) has reached.
    pub fn peak_checked_out(&self) -> usize {
        self.inner.peak_checked_out.load(Ordering::SeqCst)
    }

    /// Buffers currently allocated, free or checked out. Never exceeds the
    /// capacity.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::SeqCst)
    }
}

/// A buffer on loan from a [`BufferPool`]. Returned to the pool on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledBuffer {
    /// Mutable access for readers that append into the buffer.
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Moves the contents out as [`Bytes`] without copying.
    ///
    /// The slot stays checked out until this buffer is dropped, so the bytes
    /// count against the pool while a request holds them. The allocation
    /// itself leaves the pool and a fresh one is made on a later acquire.
    pub fn take_bytes(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.data))
    }

    /// Returns the buffer to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut data = std::mem::take(&mut self.data);
        if data.capacity() == 0 {
            self.pool.allocated.fetch_sub(1, Ordering::SeqCst);
        } else {
            data.clear();
            self.pool
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(data);
        }
        self.pool.checked_out.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn buffers_are_recycled() {
        let pool = BufferPool::new(2, 16, CancellationToken::new());

        let mut a = pool.acquire().await.unwrap();
        a.as_mut_vec().extend_from_slice(b"hello");
        assert_eq!(a.as_slice(), b"hello");
        assert_eq!(pool.checked_out(), 1);
        a.release();
        assert_eq!(pool.checked_out(), 0);

        let b = pool.acquire().await.unwrap();
        assert!(b.is_empty());
        assert!(b.as_slice().is_empty());
        assert_eq!(pool.allocated(), 1);
    }

    #[tokio::test]
    async fn acquire_blocks_at_capacity() {
        let pool = BufferPool::new(2, 8, CancellationToken::new());
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(waiting.is_err(), "third acquire should block");

        drop(a);
        let c = tokio::time::timeout(Duration::from_millis(200), pool.acquire()).await;
        assert!(c.is_ok());
        assert_eq!(pool.peak_checked_out(), 2);
        assert_eq!(pool.allocated(), 2);
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiters() {
        let cancel = CancellationToken::new();
        let pool = BufferPool::new(1, 8, cancel.clone());
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn peak_never_exceeds_capacity_under_contention() {
        let pool = BufferPool::new(3, 4, CancellationToken::new());
        let mut handles = Vec::new();
        for i in 0..20u64 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mut buf = pool.acquire().await.unwrap();
                buf.as_mut_vec().extend_from_slice(&i.to_le_bytes()[..4]);
                tokio::time::sleep(Duration::from_millis(i % 3)).await;
                assert!(pool.checked_out() <= 3);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(pool.peak_checked_out() <= 3);
        assert_eq!(pool.checked_out(), 0);
    }

    #[tokio::test]
    async fn taken_bytes_keep_the_slot_until_release() {
        let pool = BufferPool::new(1, 8, CancellationToken::new());
        let mut buf = pool.acquire().await.unwrap();
        buf.as_mut_vec().extend_from_slice(b"payload");
        let bytes = buf.take_bytes();
        assert_eq!(bytes.as_ref(), b"payload");
        assert!(buf.is_empty());

        let waiting = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(waiting.is_err(), "slot must stay held while the bytes are in use");

        drop(bytes);
        buf.release();
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(pool.allocated(), 0);

        let again = pool.acquire().await.unwrap();
        assert!(again.is_empty());
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn poisoned_free_list_still_recycles() {
        let pool = BufferPool::new(1, 8, CancellationToken::new());
        let inner = Arc::clone(&pool.inner);
        let _ = std::thread::spawn(move || {
            let _guard = inner.free.lock().unwrap();
            panic!("poison the free list");
        })
        .join();
        assert!(pool.inner.free.is_poisoned());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            let mut buf = pool.acquire().await.unwrap();
            buf.as_mut_vec().extend_from_slice(b"x");
            buf.release();
            let again = pool.acquire().await.unwrap();
            assert!(again.is_empty());
        });
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.checked_out(), 0);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let pool = BufferPool::new(0, 8, CancellationToken::new());
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.buffer_size(), 8);
    }
}
