//! Error types for object-store operations.

/// Errors produced by an [`ObjectStore`](crate::ObjectStore) backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("access denied to s3://{bucket}/{key}: {message}")]
    PermissionDenied {
        bucket: String,
        key: String,
        message: String,
    },

    /// The peer closed the connection mid-request.
    #[error("connection reset by peer: {message}")]
    ConnectionReset { message: String },

    /// Dispatch failure or timeout before a response arrived.
    #[error("connectivity error: {message}")]
    Connectivity { message: String },

    /// The service answered with a non-success status not covered above.
    #[error("service returned HTTP {status}: {message}")]
    Service { status: u16, message: String },

    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The retry policy gave up on a retryable fault.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<StorageError>,
    },
}

impl StorageError {
    /// HTTP status associated with the error, if the service answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::NotFound { .. } => Some(404),
            StorageError::PermissionDenied { .. } => Some(403),
            StorageError::Service { status, .. } => Some(*status),
            StorageError::Exhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Returns `true` for transport-level connection resets.
    pub fn is_connection_reset(&self) -> bool {
        matches!(self, StorageError::ConnectionReset { .. })
    }

    /// Returns `true` for dispatch failures and timeouts.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StorageError::Connectivity { .. })
    }

    /// Builds a [`StorageError`] from a raw HTTP status.
    pub fn from_status(status: u16, bucket: &str, key: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            403 => StorageError::PermissionDenied {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message,
            },
            _ => StorageError::Service { status, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(StorageError::from_status(404, "b", "k", "").status(), Some(404));
        assert!(matches!(
            StorageError::from_status(403, "b", "k", "denied"),
            StorageError::PermissionDenied { .. }
        ));
        assert!(matches!(
            StorageError::from_status(503, "b", "k", "slow down"),
            StorageError::Service { status: 503, .. }
        ));
    }

    #[test]
    fn exhausted_reports_last_status() {
        let err = StorageError::Exhausted {
            attempts: 10,
            last: Box::new(StorageError::Service {
                status: 500,
                message: "internal".into(),
            }),
        };
        assert_eq!(err.status(), Some(500));
        assert!(err.to_string().contains("10 attempts"));
    }

    #[test]
    fn transport_errors_have_no_status() {
        let reset = StorageError::ConnectionReset {
            message: "read".into(),
        };
        assert_eq!(reset.status(), None);
        assert!(reset.is_connection_reset());
        assert!(!reset.is_connectivity());
    }
}
