//! In-process object store with fault injection.
//!
//! [`MemoryStore`] behaves like a strongly consistent S3 bucket by default.
//! Tests script misbehavior on top of it: failed requests, per-chunk
//! failures, a read-after-write window in which fresh objects report 404, and
//! random per-request latency to shuffle completion order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;

use crate::content_etag;
use crate::error::StorageError;
use crate::retry::RequestKind;
use crate::store::{ByteRange, CompletedPart, ObjectInfo, ObjectStore};

/// A scripted failure returned instead of performing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The service answers with this HTTP status.
    Status(u16),
    /// The connection is reset by the peer.
    ConnectionReset,
    /// The request never reaches the service.
    Connectivity,
}

impl Fault {
    fn into_error(self, bucket: &str, key: &str) -> StorageError {
        match self {
            Fault::Status(status) => {
                StorageError::from_status(status, bucket, key, format!("injected HTTP {status}"))
            }
            Fault::ConnectionReset => StorageError::ConnectionReset {
                message: "injected connection reset".into(),
            },
            Fault::Connectivity => StorageError::Connectivity {
                message: "injected dispatch failure".into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Any,
    RangeStart(u64),
    PartNumber(i32),
}

#[derive(Debug)]
struct FaultRule {
    request: RequestKind,
    target: Target,
    /// `None` fails forever.
    remaining: Option<u32>,
    fault: Fault,
    /// Fires after part of the body has been delivered.
    mid_body: bool,
}

impl FaultRule {
    fn matches(&self, request: RequestKind, target: Target, mid_body: bool) -> bool {
        self.request == request
            && self.mid_body == mid_body
            && self.remaining != Some(0)
            && (self.target == Target::Any || self.target == target)
    }
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<(String, String), Bytes>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
    completed_uploads: usize,
    aborted_uploads: usize,
    rules: Vec<FaultRule>,
    /// HEAD requests that still report 404 for a freshly written object.
    stale_heads: HashMap<(String, String), u32>,
    consistency_window: u32,
    requests: HashMap<RequestKind, usize>,
    ranges: Vec<ByteRange>,
}

/// In-memory [`ObjectStore`] backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    latency: Option<(Duration, Duration)>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every request by a random duration in `[min, max]`.
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.latency = Some((min, max.max(min)));
        self
    }

    /// Stores an object directly, bypassing faults and the consistency window.
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    /// Returns a stored object.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Fails the next `times` requests of kind `request` with `fault`.
    pub fn fail(&self, request: RequestKind, fault: Fault, times: u32) {
        self.push_rule(request, Target::Any, Some(times), fault);
    }

    /// Fails every ranged GET starting at `start` with `fault`.
    pub fn fail_range(&self, start: u64, fault: Fault) {
        self.push_rule(RequestKind::GetRange, Target::RangeStart(start), None, fault);
    }

    /// Fails the next `times` ranged GETs starting at `start` with `fault`
    /// after half of the requested bytes have been delivered.
    pub fn fail_range_after_body(&self, start: u64, fault: Fault, times: u32) {
        let mut state = self.state.lock().unwrap();
        state.rules.push(FaultRule {
            request: RequestKind::GetRange,
            target: Target::RangeStart(start),
            remaining: Some(times),
            fault,
            mid_body: true,
        });
    }

    /// Fails every upload of `part_number` with `fault`.
    pub fn fail_part(&self, part_number: i32, fault: Fault) {
        self.push_rule(
            RequestKind::UploadPart,
            Target::PartNumber(part_number),
            None,
            fault,
        );
    }

    /// After each write, the next `heads` HEAD requests for that key report 404.
    pub fn set_consistency_window(&self, heads: u32) {
        self.state.lock().unwrap().consistency_window = heads;
    }

    /// Number of requests of `request` kind received, failed ones included.
    pub fn request_count(&self, request: RequestKind) -> usize {
        let state = self.state.lock().unwrap();
        state.requests.get(&request).copied().unwrap_or(0)
    }

    /// Every range requested so far, in arrival order.
    pub fn requested_ranges(&self) -> Vec<ByteRange> {
        self.state.lock().unwrap().ranges.clone()
    }

    /// Multipart uploads neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    pub fn completed_uploads(&self) -> usize {
        self.state.lock().unwrap().completed_uploads
    }

    pub fn aborted_uploads(&self) -> usize {
        self.state.lock().unwrap().aborted_uploads
    }

    /// Highest number of requests observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn push_rule(&self, request: RequestKind, target: Target, remaining: Option<u32>, fault: Fault) {
        let mut state = self.state.lock().unwrap();
        state.rules.push(FaultRule {
            request,
            target,
            remaining,
            fault,
            mid_body: false,
        });
    }

    fn sample_latency(&self) -> Option<Duration> {
        let (min, max) = self.latency?;
        if max > min {
            Some(rand::thread_rng().gen_range(min..=max))
        } else {
            Some(min)
        }
    }

    /// Records the request, waits out the simulated latency, then returns the
    /// scripted fault for it, if any.
    async fn begin(
        &self,
        request: RequestKind,
        target: Target,
        bucket: &str,
        key: &str,
    ) -> Result<InFlight<'_>, StorageError> {
        let guard = InFlight::enter(self);

        if let Some(delay) = self.sample_latency() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        *state.requests.entry(request).or_insert(0) += 1;

        match Self::take_fault(&mut state, request, target, false) {
            Some(fault) => Err(fault.into_error(bucket, key)),
            None => Ok(guard),
        }
    }

    fn take_fault(
        state: &mut State,
        request: RequestKind,
        target: Target,
        mid_body: bool,
    ) -> Option<Fault> {
        let rule = state
            .rules
            .iter_mut()
            .find(|rule| rule.matches(request, target, mid_body))?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.fault.clone())
    }

    fn written(state: &mut State, bucket: &str, key: &str, data: Bytes) {
        let id = (bucket.to_string(), key.to_string());
        if state.consistency_window > 0 {
            state.stale_heads.insert(id.clone(), state.consistency_window);
        }
        state.objects.insert(id, data);
    }
}

/// Tracks concurrent requests for [`MemoryStore::peak_in_flight`].
struct InFlight<'a> {
    store: &'a MemoryStore,
}

impl<'a> InFlight<'a> {
    fn enter(store: &'a MemoryStore) -> Self {
        let now = store.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        store.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { store }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.store.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn not_found(bucket: &str, key: &str) -> StorageError {
    StorageError::NotFound {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, StorageError> {
        let _guard = self
            .begin(RequestKind::HeadObject, Target::Any, bucket, key)
            .await?;
        let mut state = self.state.lock().unwrap();
        let id = (bucket.to_string(), key.to_string());
        if let Some(remaining) = state.stale_heads.get_mut(&id) {
            *remaining -= 1;
            if *remaining == 0 {
                state.stale_heads.remove(&id);
            }
            return Err(not_found(bucket, key));
        }
        state
            .objects
            .get(&id)
            .map(|data| data.len() as u64)
            .ok_or_else(|| not_found(bucket, key))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        let _guard = self
            .begin(RequestKind::GetObject, Target::Any, bucket, key)
            .await?;
        self.object(bucket, key)
            .ok_or_else(|| not_found(bucket, key))
    }

    async fn get_range_into(
        &self,
        bucket: &str,
        key: &str,
        range: ByteRange,
        sink: &mut Vec<u8>,
    ) -> Result<(), StorageError> {
        self.state.lock().unwrap().ranges.push(range);
        let _guard = self
            .begin(
                RequestKind::GetRange,
                Target::RangeStart(range.start),
                bucket,
                key,
            )
            .await?;
        let data = self
            .object(bucket, key)
            .ok_or_else(|| not_found(bucket, key))?;
        let size = data.len() as u64;
        if range.start >= size || range.end < range.start {
            return Err(StorageError::Service {
                status: 416,
                message: format!("range {} not satisfiable for {size} bytes", range.header_value()),
            });
        }
        let end = range.end.min(size - 1);
        let body = &data[range.start as usize..=end as usize];

        let fault = {
            let mut state = self.state.lock().unwrap();
            let target = Target::RangeStart(range.start);
            Self::take_fault(&mut state, RequestKind::GetRange, target, true)
        };
        if let Some(fault) = fault {
            sink.extend_from_slice(&body[..body.len() / 2]);
            return Err(fault.into_error(bucket, key));
        }
        sink.extend_from_slice(body);
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError> {
        let _guard = self
            .begin(RequestKind::PutObject, Target::Any, bucket, key)
            .await?;
        let mut state = self.state.lock().unwrap();
        Self::written(&mut state, bucket, key, body);
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, StorageError> {
        let _guard = self
            .begin(RequestKind::CreateMultipartUpload, Target::Any, bucket, key)
            .await?;
        let mut state = self.state.lock().unwrap();
        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        let _guard = self
            .begin(
                RequestKind::UploadPart,
                Target::PartNumber(part_number),
                bucket,
                key,
            )
            .await?;
        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| not_found(bucket, key))?;
        let etag = content_etag(&body);
        upload.parts.insert(part_number, body);
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        let _guard = self
            .begin(RequestKind::CompleteMultipartUpload, Target::Any, bucket, key)
            .await?;
        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| not_found(bucket, key))?;

        let mut assembled = Vec::new();
        let mut previous = 0;
        for part in parts {
            if part.part_number <= previous {
                return Err(StorageError::Service {
                    status: 400,
                    message: "parts must be listed in ascending order".into(),
                });
            }
            previous = part.part_number;
            let data = upload.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::Service {
                    status: 400,
                    message: format!("part {} was never uploaded", part.part_number),
                }
            })?;
            if content_etag(data) != part.etag {
                return Err(StorageError::Service {
                    status: 400,
                    message: format!("etag mismatch for part {}", part.part_number),
                });
            }
            assembled.extend_from_slice(data);
        }

        Self::written(&mut state, &upload.bucket, &upload.key, Bytes::from(assembled));
        state.completed_uploads += 1;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        let _guard = self
            .begin(RequestKind::AbortMultipartUpload, Target::Any, bucket, key)
            .await?;
        let mut state = self.state.lock().unwrap();
        if state.uploads.remove(upload_id).is_some() {
            state.aborted_uploads += 1;
        }
        Ok(())
    }

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let _guard = self
            .begin(RequestKind::ListPrefix, Target::Any, bucket, prefix)
            .await?;
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), data)| ObjectInfo {
                key: k.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), StorageError> {
        let _guard = self
            .begin(RequestKind::DeleteObjects, Target::Any, bucket, "")
            .await?;
        let mut state = self.state.lock().unwrap();
        for key in keys {
            state.objects.remove(&(bucket.to_string(), key.clone()));
        }
        Ok(())
    }
}
