//! Object-store access for s3ferry.
//!
//! The transfer engine only ever talks to an [`ObjectStore`]. This crate
//! provides that capability trait, the error taxonomy shared by every
//! backend, the [`RetryPolicy`] that absorbs transient storage faults, and
//! two backends:
//!
//! - [`S3Store`]: AWS SDK for Rust, usable against AWS or any S3-compatible
//!   endpoint.
//! - [`MemoryStore`]: in-process store with fault injection, used by tests.
//!
//! [`RetryingStore`] decorates any backend so that every request goes
//! through the retry policy.

pub mod error;
pub mod memory;
pub mod retry;
pub mod s3;
pub mod store;

pub use error::StorageError;
pub use memory::{Fault, MemoryStore};
pub use retry::{RequestKind, RetryPolicy, RetrySettings, RetryingStore};
pub use s3::{S3Settings, S3Store};
pub use store::{ByteRange, CompletedPart, ObjectInfo, ObjectStore};

/// Computes the S3-style ETag of a single-part body (hex MD5).
pub fn content_etag(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(data))
}

/// Computes the base64 `Content-MD5` header value for a request body.
pub fn content_md5(data: &[u8]) -> String {
    use base64::Engine;
    use md5::{Digest, Md5};
    base64::engine::general_purpose::STANDARD.encode(Md5::digest(data))
}
