//! Retry policy for object-store requests.
//!
//! Every request the transfer engine issues goes through [`RetryingStore`],
//! which asks [`RetryPolicy::should_retry`] after each failure. Retry
//! triggers, in priority order:
//!
//! 1. Connection resets (the peer closed the connection).
//! 2. HTTP 404 on [`RequestKind::HeadObject`]: the object was just written and
//!    the store may not reflect it yet (read-after-write is not guaranteed).
//! 3. The generic backoff classes: 5xx except 501, 429, dispatch failures and
//!    timeouts.
//!
//! Everything else (403, 400, 404 on data requests, success statuses) is
//! returned immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tracing::debug;

use crate::error::StorageError;
use crate::store::{ByteRange, CompletedPart, ObjectInfo, ObjectStore};

/// Default maximum number of attempts per request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// The kind of request being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    HeadObject,
    GetObject,
    GetRange,
    PutObject,
    CreateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    ListPrefix,
    DeleteObjects,
}

impl RequestKind {
    /// Stable name used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::HeadObject => "head_object",
            RequestKind::GetObject => "get_object",
            RequestKind::GetRange => "get_range",
            RequestKind::PutObject => "put_object",
            RequestKind::CreateMultipartUpload => "create_multipart_upload",
            RequestKind::UploadPart => "upload_part",
            RequestKind::CompleteMultipartUpload => "complete_multipart_upload",
            RequestKind::AbortMultipartUpload => "abort_multipart_upload",
            RequestKind::ListPrefix => "list_prefix",
            RequestKind::DeleteObjects => "delete_objects",
        }
    }

    /// Whether a 404 for this request may be an eventual-consistency window
    /// rather than a genuinely missing object.
    pub fn tolerates_stale_not_found(&self) -> bool {
        matches!(self, RequestKind::HeadObject)
    }
}

/// Retry settings, fixed for the lifetime of a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Maximum attempts per request, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Delay before the first retry of a throttled (429/503) request.
    pub throttle_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(30),
            throttle_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(20),
            backoff_factor: 2.0,
        }
    }
}

impl RetrySettings {
    /// Settings that never retry.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Decides whether a failed request is retried and how long to wait.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    settings: RetrySettings,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    /// Returns `true` if the request should be attempted again.
    ///
    /// `attempt` is the number of attempts already made (1 after the first
    /// failure). Once it reaches `max_attempts` the answer is always `false`.
    pub fn should_retry(
        &self,
        request: RequestKind,
        status: Option<u16>,
        error: Option<&StorageError>,
        attempt: u32,
    ) -> bool {
        if attempt >= self.settings.max_attempts {
            return false;
        }
        is_retryable(request, status, error)
    }

    /// Backoff before the retry that follows attempt number `attempt`.
    ///
    /// Exponential from `initial_backoff` (or `throttle_backoff` for 429/503),
    /// capped at `max_backoff`, with the upper half jittered.
    pub fn backoff(&self, attempt: u32, status: Option<u16>) -> Duration {
        let base = match status {
            Some(429) | Some(503) => self.settings.throttle_backoff,
            _ => self.settings.initial_backoff,
        };
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = base.as_secs_f64() * self.settings.backoff_factor.powi(exp);
        let capped = secs.min(self.settings.max_backoff.as_secs_f64());
        let jittered = rand::thread_rng().gen_range(capped / 2.0..=capped);
        Duration::from_secs_f64(jittered)
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt cap is
    /// reached.
    ///
    /// A retryable fault that outlives the cap is reported as
    /// [`StorageError::Exhausted`].
    pub async fn run<T, F, Fut>(&self, request: RequestKind, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => self.after_failure(request, attempt, err).await?,
            }
        }
    }

    /// Handles the failure of attempt number `attempt`.
    ///
    /// Sleeps out the backoff and returns `Ok` when another attempt should
    /// follow; otherwise returns the error to report.
    async fn after_failure(
        &self,
        request: RequestKind,
        attempt: u32,
        err: StorageError,
    ) -> Result<(), StorageError> {
        let status = err.status();
        if self.should_retry(request, status, Some(&err), attempt) {
            let delay = self.backoff(attempt, status);
            debug!(
                request = request.as_str(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "request attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            return Ok(());
        }

        if is_retryable(request, status, Some(&err)) {
            return Err(StorageError::Exhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }
        Err(err)
    }
}

fn is_retryable(request: RequestKind, status: Option<u16>, error: Option<&StorageError>) -> bool {
    if error.is_some_and(StorageError::is_connection_reset) {
        return true;
    }

    let status = status.or_else(|| error.and_then(StorageError::status));
    if status == Some(404) && request.tolerates_stale_not_found() {
        return true;
    }

    if error.is_some_and(StorageError::is_connectivity) {
        return true;
    }

    match status {
        Some(429) => true,
        Some(501) => false,
        Some(s) => (500..600).contains(&s),
        None => false,
    }
}

/// An [`ObjectStore`] that routes every request through a [`RetryPolicy`].
pub struct RetryingStore {
    inner: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl ObjectStore for RetryingStore {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, StorageError> {
        self.policy
            .run(RequestKind::HeadObject, || self.inner.head_object(bucket, key))
            .await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        self.policy
            .run(RequestKind::GetObject, || self.inner.get_object(bucket, key))
            .await
    }

    async fn get_range_into(
        &self,
        bucket: &str,
        key: &str,
        range: ByteRange,
        sink: &mut Vec<u8>,
    ) -> Result<(), StorageError> {
        let start = sink.len();
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match self.inner.get_range_into(bucket, key, range, sink).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    sink.truncate(start);
                    self.policy
                        .after_failure(RequestKind::GetRange, attempt, err)
                        .await?;
                }
            }
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError> {
        self.policy
            .run(RequestKind::PutObject, || {
                self.inner.put_object(bucket, key, body.clone())
            })
            .await
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, StorageError> {
        self.policy
            .run(RequestKind::CreateMultipartUpload, || {
                self.inner.create_multipart_upload(bucket, key)
            })
            .await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        self.policy
            .run(RequestKind::UploadPart, || {
                self.inner
                    .upload_part(bucket, key, upload_id, part_number, body.clone())
            })
            .await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        self.policy
            .run(RequestKind::CompleteMultipartUpload, || {
                self.inner
                    .complete_multipart_upload(bucket, key, upload_id, parts)
            })
            .await
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.policy
            .run(RequestKind::AbortMultipartUpload, || {
                self.inner.abort_multipart_upload(bucket, key, upload_id)
            })
            .await
    }

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        self.policy
            .run(RequestKind::ListPrefix, || self.inner.list_prefix(bucket, prefix))
            .await
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), StorageError> {
        self.policy
            .run(RequestKind::DeleteObjects, || {
                self.inner.delete_objects(bucket, keys)
            })
            .await
    }
}
