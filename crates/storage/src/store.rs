//! The object-store capability consumed by the transfer engine.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;

/// Inclusive byte range `[start, end]` of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Creates a range covering `[start, end]`.
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A range always covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Formats the range as an HTTP `Range` header value.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// An object returned by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Receipt for one uploaded part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: i32,
    pub etag: String,
}

/// Low-level object operations, implemented by each backend.
///
/// Implementations issue exactly one request per call; retrying is the job
/// of [`RetryingStore`](crate::RetryingStore).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the size of an object in bytes.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, StorageError>;

    /// Downloads a whole object.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError>;

    /// Downloads the bytes in `range` of an object, appending them to `sink`.
    ///
    /// The body is streamed into `sink` as it arrives. On error `sink` may
    /// hold a partial body.
    async fn get_range_into(
        &self,
        bucket: &str,
        key: &str,
        range: ByteRange,
        sink: &mut Vec<u8>,
    ) -> Result<(), StorageError>;

    /// Uploads a whole object in one request.
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError>;

    /// Starts a multipart upload and returns its upload id.
    async fn create_multipart_upload(&self, bucket: &str, key: &str)
    -> Result<String, StorageError>;

    /// Uploads one part of a multipart upload.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StorageError>;

    /// Assembles the uploaded parts into the final object.
    ///
    /// `parts` must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError>;

    /// Discards a multipart upload and its parts.
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError>;

    /// Lists every object under `prefix`, ordered by key.
    async fn list_prefix(&self, bucket: &str, prefix: &str)
    -> Result<Vec<ObjectInfo>, StorageError>;

    /// Deletes a batch of keys. Missing keys are not an error.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range_len_and_header() {
        let range = ByteRange::new(5_242_880, 10_485_759);
        assert_eq!(range.len(), 5_242_880);
        assert_eq!(range.header_value(), "bytes=5242880-10485759");
    }

    #[test]
    fn single_byte_range() {
        let range = ByteRange::new(7, 7);
        assert_eq!(range.len(), 1);
        assert!(!range.is_empty());
    }
}
