use std::fmt;
use std::time::Duration;

use s3ferry_storage::{ByteRange, RetrySettings};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, TransferError};

/// Direction of a transfer, relative to the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

/// Borrowed stream handed to [`TransferEngine::transfer`](crate::TransferEngine::transfer).
pub enum TransferStream<'a> {
    /// Bytes to upload.
    Source(&'a mut (dyn AsyncRead + Unpin + Send)),
    /// Where downloaded bytes are written.
    Destination(&'a mut (dyn AsyncWrite + Unpin + Send)),
}

/// Chunk size and concurrency for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub chunk_size: usize,
    pub concurrency: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Engine-wide settings, fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub upload: Tuning,
    pub download: Tuning,
    pub retry: RetrySettings,
}

impl TransferOptions {
    pub fn tuning(&self, direction: Direction) -> Tuning {
        match direction {
            Direction::Upload => self.upload,
            Direction::Download => self.download,
        }
    }
}

/// Parameters of one transfer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    pub bucket: String,
    pub key: String,
    /// Object size; `None` for uploads until the source is drained.
    pub total_bytes: Option<u64>,
    pub chunk_size: usize,
    pub concurrency: usize,
}

impl TransferSpec {
    pub fn new(bucket: &str, key: &str, total_bytes: Option<u64>, tuning: Tuning) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            total_bytes,
            chunk_size: tuning.chunk_size,
            concurrency: tuning.concurrency,
        }
    }

    /// Whether the object fits in a single request.
    pub fn is_single_shot(&self) -> bool {
        self.total_bytes
            .is_some_and(|total| total <= self.chunk_size as u64)
    }
}

/// A contiguous byte range of an object, the unit of concurrent work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based position in the object.
    pub index: usize,
    pub start_byte: u64,
    /// Inclusive.
    pub end_byte: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.start_byte, self.end_byte)
    }

    /// 1-based multipart part number.
    pub fn part_number(&self) -> i32 {
        i32::try_from(self.index + 1).unwrap_or(i32::MAX)
    }
}

/// Outcome of one transfer invocation.
#[derive(Debug, Clone)]
pub struct TransferResult {
    /// Bytes written to the destination (download) or accepted by the store
    /// (upload). Partial on failure.
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    /// First unrecoverable error, if any.
    pub error: Option<TransferError>,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Average throughput in bytes per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / secs
    }
}
