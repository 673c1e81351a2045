use crate::TransferError;
use crate::types::{Direction, TransferSpec};
use crate::{MAX_UPLOAD_PARTS, chunk_count};

/// Longest object key accepted by S3, in bytes.
const MAX_KEY_BYTES: usize = 1024;

/// Validates an object key.
///
/// Rejects:
/// - Empty keys
/// - Keys longer than 1024 bytes
/// - Keys containing control characters
pub fn validate_object_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidSpec("empty object key".into()));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(TransferError::InvalidSpec(format!(
            "object key is {} bytes, limit is {MAX_KEY_BYTES}",
            key.len()
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(TransferError::InvalidSpec(format!(
            "object key contains control characters: {key:?}"
        )));
    }
    Ok(())
}

/// Checks a [`TransferSpec`] before any request is issued.
pub fn validate_spec(spec: &TransferSpec, direction: Direction) -> Result<(), TransferError> {
    if spec.bucket.is_empty() {
        return Err(TransferError::InvalidSpec("empty bucket name".into()));
    }
    if spec.chunk_size == 0 {
        return Err(TransferError::InvalidSpec("chunk size must be positive".into()));
    }
    if spec.concurrency == 0 {
        return Err(TransferError::InvalidSpec(
            "concurrency must be at least 1".into(),
        ));
    }

    if direction == Direction::Upload
        && let Some(total) = spec.total_bytes
    {
        let parts = chunk_count(total, spec.chunk_size);
        if parts > MAX_UPLOAD_PARTS {
            return Err(TransferError::InvalidSpec(format!(
                "{total} bytes need {parts} parts of {} bytes, limit is {MAX_UPLOAD_PARTS}",
                spec.chunk_size
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tuning;

    fn spec(total: Option<u64>, chunk_size: usize, concurrency: usize) -> TransferSpec {
        TransferSpec::new(
            "bucket",
            "key",
            total,
            Tuning {
                chunk_size,
                concurrency,
            },
        )
    }

    #[test]
    fn rejects_empty_key() {
        assert!(validate_object_key("").is_err());
    }

    #[test]
    fn rejects_oversized_key() {
        assert!(validate_object_key(&"k".repeat(1025)).is_err());
        assert!(validate_object_key(&"k".repeat(1024)).is_ok());
    }

    #[test]
    fn rejects_control_characters() {
        assert!(validate_object_key("backups/\n/file").is_err());
    }

    #[test]
    fn accepts_nested_key() {
        assert!(validate_object_key("gpbackup/backups/20240101/20240101120000/file.gz").is_ok());
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = validate_spec(&spec(Some(10), 0, 1), Direction::Download).unwrap_err();
        assert!(matches!(err, TransferError::InvalidSpec(_)));
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(validate_spec(&spec(None, 10, 0), Direction::Upload).is_err());
    }

    #[test]
    fn rejects_empty_bucket() {
        let mut s = spec(None, 10, 1);
        s.bucket.clear();
        assert!(validate_spec(&s, Direction::Download).is_err());
    }

    #[test]
    fn part_limit_applies_to_uploads_only() {
        let too_many = spec(Some(10_001), 1, 4);
        assert!(validate_spec(&too_many, Direction::Upload).is_err());
        assert!(validate_spec(&too_many, Direction::Download).is_ok());
        assert!(validate_spec(&spec(Some(10_000), 1, 4), Direction::Upload).is_ok());
    }
}
