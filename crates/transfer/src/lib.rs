//! Chunked, concurrent transfer of large objects to and from an object store.
//!
//! Objects larger than one chunk are split into byte ranges that a bounded
//! pool of workers downloads (or uploads as multipart parts) concurrently.
//! A single sequential consumer reassembles the chunks in their original
//! order, so the destination always receives the exact source bytes no
//! matter in which order requests complete. Memory is bounded by a
//! [`BufferPool`] of `concurrency` chunk-sized buffers.
//!
//! Entry point: [`TransferEngine`].

mod buffer_pool;
mod chunked;
mod download;
mod orchestrator;
mod progress;
mod reassembler;
mod types;
mod upload;
mod validation;
mod worker;

use std::sync::Arc;

use s3ferry_storage::StorageError;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use chunked::{ChunkReader, chunk_count, plan};
pub use orchestrator::TransferEngine;
pub use progress::TransferProgress;
pub use types::{
    Chunk, Direction, TransferOptions, TransferResult, TransferSpec, TransferStream, Tuning,
};
pub use validation::{validate_object_key, validate_spec};

/// Default chunk size: 500 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 500 * 1024 * 1024;

/// Default number of concurrent requests per transfer.
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Maximum number of parts in one multipart upload.
pub const MAX_UPLOAD_PARTS: usize = 10_000;

/// Errors produced by the transfer crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// A transient fault reached the engine without being retried.
    #[error("transient storage fault: {0}")]
    TransientFault(#[source] StorageError),

    #[error("permission denied: {0}")]
    PermissionDenied(#[source] StorageError),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("failed to write destination: {0}")]
    DestinationWriteFailed(#[source] Arc<std::io::Error>),

    #[error("failed to read source: {0}")]
    SourceReadFailed(#[source] Arc<std::io::Error>),

    #[error("{0}")]
    Exhausted(#[source] StorageError),

    /// The service refused the request and retrying would not help.
    #[error("request rejected: {0}")]
    Rejected(#[source] StorageError),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("invalid transfer: {0}")]
    InvalidSpec(String),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub(crate) fn destination(err: std::io::Error) -> Self {
        TransferError::DestinationWriteFailed(Arc::new(err))
    }

    pub(crate) fn source_read(err: std::io::Error) -> Self {
        TransferError::SourceReadFailed(Arc::new(err))
    }
}

impl From<StorageError> for TransferError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { bucket, key } => TransferError::NotFound { bucket, key },
            // A 404 that outlived the read-after-write window.
            StorageError::Exhausted { last, .. } if matches!(*last, StorageError::NotFound { .. }) => {
                TransferError::from(*last)
            }
            StorageError::PermissionDenied { .. } => TransferError::PermissionDenied(err),
            StorageError::Exhausted { .. } => TransferError::Exhausted(err),
            StorageError::ConnectionReset { .. } | StorageError::Connectivity { .. } => {
                TransferError::TransientFault(err)
            }
            StorageError::Service { status: 416, .. } => {
                TransferError::InvalidRange(err.to_string())
            }
            StorageError::Service { status, .. }
                if status == 429 || (status >= 500 && status != 501) =>
            {
                TransferError::TransientFault(err)
            }
            StorageError::Service { .. }
            | StorageError::InvalidResponse { .. }
            | StorageError::InvalidConfig { .. } => TransferError::Rejected(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_transfer_errors() {
        let denied = StorageError::from_status(403, "b", "k", "AccessDenied");
        assert!(matches!(
            TransferError::from(denied),
            TransferError::PermissionDenied(_)
        ));

        let missing = StorageError::from_status(404, "b", "k", "");
        assert!(matches!(
            TransferError::from(missing),
            TransferError::NotFound { .. }
        ));

        let unsatisfiable = StorageError::from_status(416, "b", "k", "");
        assert!(matches!(
            TransferError::from(unsatisfiable),
            TransferError::InvalidRange(_)
        ));

        let bad_request = StorageError::from_status(400, "b", "k", "");
        assert!(matches!(
            TransferError::from(bad_request),
            TransferError::Rejected(_)
        ));

        let slow_down = StorageError::from_status(503, "b", "k", "");
        assert!(matches!(
            TransferError::from(slow_down),
            TransferError::TransientFault(_)
        ));
    }

    #[test]
    fn exhausted_keeps_attempt_count() {
        let err = TransferError::from(StorageError::Exhausted {
            attempts: 10,
            last: Box::new(StorageError::ConnectionReset {
                message: "reset".into(),
            }),
        });
        assert!(matches!(err, TransferError::Exhausted(_)));
        assert!(err.to_string().contains("10 attempts"));
    }

    #[test]
    fn exhausted_not_found_is_not_found() {
        let err = TransferError::from(StorageError::Exhausted {
            attempts: 10,
            last: Box::new(StorageError::from_status(404, "b", "missing", "")),
        });
        assert!(matches!(err, TransferError::NotFound { ref key, .. } if key == "missing"));
    }

    #[test]
    fn io_errors_are_cloneable() {
        let err = TransferError::destination(std::io::Error::other("disk full"));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
