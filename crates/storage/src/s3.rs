//! S3 backend built on the AWS SDK for Rust.
//!
//! SDK-level retries are disabled: every request is retried by
//! [`RetryPolicy`](crate::RetryPolicy) instead, so the retry triggers stay
//! the same for every backend.

use std::error::Error as StdError;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::retry::RetryConfig;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, Delete, ObjectIdentifier};
use bytes::Bytes;
use tracing::{debug, info};

use crate::content_md5;
use crate::error::StorageError;
use crate::store::{ByteRange, CompletedPart, ObjectInfo, ObjectStore};

/// Maximum keys accepted by a single `DeleteObjects` request.
const DELETE_BATCH_SIZE: usize = 1000;

/// Connection settings for [`S3Store`].
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    /// AWS region. Falls back to the SDK's default provider chain.
    pub region: Option<String>,
    /// Custom endpoint host (S3-compatible stores). Scheme is optional.
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Use HTTPS. Only honored for hosts without an explicit scheme.
    pub use_https: bool,
    /// Address buckets as `endpoint/bucket` rather than `bucket.endpoint`.
    pub force_path_style: bool,
}

impl S3Settings {
    /// Endpoint URL with a scheme, if one should be forced.
    fn endpoint_url(&self) -> Option<String> {
        let scheme = if self.use_https { "https" } else { "http" };
        match (&self.endpoint, &self.region) {
            (Some(endpoint), _) if endpoint.contains("://") => Some(endpoint.clone()),
            (Some(endpoint), _) => Some(format!("{scheme}://{endpoint}")),
            (None, Some(region)) if !self.use_https => {
                Some(format!("http://s3.{region}.amazonaws.com"))
            }
            (None, _) => None,
        }
    }
}

/// [`ObjectStore`] backed by Amazon S3 or an S3-compatible service.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    /// Builds an SDK client from `settings`.
    pub async fn connect(settings: &S3Settings) -> Result<Self, StorageError> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).retry_config(RetryConfig::disabled());

        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }

        match (&settings.access_key_id, &settings.secret_access_key) {
            (Some(id), Some(secret)) => {
                loader = loader.credentials_provider(Credentials::new(
                    id.clone(),
                    secret.clone(),
                    None,
                    None,
                    "s3ferry-config",
                ));
            }
            (None, None) => {}
            _ => {
                return Err(StorageError::InvalidConfig {
                    message: "access key id and secret access key must be set together".into(),
                });
            }
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.force_path_style);
        let endpoint = settings.endpoint_url();
        if let Some(url) = &endpoint {
            builder = builder.endpoint_url(url);
        }

        info!(
            region = settings.region.as_deref().unwrap_or("default"),
            endpoint = endpoint.as_deref().unwrap_or("default"),
            "S3 client configured"
        );
        Ok(Self::from_client(Client::from_conf(builder.build())))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

/// Maps an SDK error to a [`StorageError`], keeping the HTTP status when the
/// service answered.
fn classify<E>(err: SdkError<E>, bucket: &str, key: &str) -> StorageError
where
    E: StdError + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    if is_connection_reset(&err) {
        return StorageError::ConnectionReset { message };
    }
    if let Some(response) = err.raw_response() {
        let status = response.status().as_u16();
        return StorageError::from_status(status, bucket, key, message);
    }
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StorageError::Connectivity { message }
        }
        _ => StorageError::InvalidResponse { message },
    }
}

/// Maps a failure while streaming a response body.
fn classify_body(err: impl StdError + 'static) -> StorageError {
    let message = err.to_string();
    if is_connection_reset(&err) {
        StorageError::ConnectionReset { message }
    } else {
        StorageError::Connectivity { message }
    }
}

/// Walks the source chain looking for a reset connection.
fn is_connection_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::ConnectionReset
        {
            return true;
        }
        if e.to_string().to_ascii_lowercase().contains("connection reset") {
            return true;
        }
        current = e.source();
    }
    false
}

fn missing(field: &str) -> StorageError {
    StorageError::InvalidResponse {
        message: format!("response is missing {field}"),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, StorageError> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        let size = output.content_length().ok_or_else(|| missing("Content-Length"))?;
        u64::try_from(size).map_err(|_| missing("a valid Content-Length"))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        let data = output.body.collect().await.map_err(classify_body)?;
        Ok(data.into_bytes())
    }

    async fn get_range_into(
        &self,
        bucket: &str,
        key: &str,
        range: ByteRange,
        sink: &mut Vec<u8>,
    ) -> Result<(), StorageError> {
        let mut output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range.header_value())
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        while let Some(bytes) = output.body.try_next().await.map_err(classify_body)? {
            sink.extend_from_slice(&bytes);
        }
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_md5(content_md5(&body))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, StorageError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        let upload_id = output.upload_id().ok_or_else(|| missing("UploadId"))?;
        debug!(bucket, key, upload_id, "multipart upload created");
        Ok(upload_id.to_string())
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_md5(content_md5(&body))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        let etag = output.e_tag().ok_or_else(|| missing("ETag"))?;
        Ok(CompletedPart {
            part_number,
            etag: etag.to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|part| {
                        aws_sdk_s3::types::CompletedPart::builder()
                            .part_number(part.part_number)
                            .e_tag(&part.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        Ok(())
    }

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| classify(e, bucket, prefix))?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                if key.ends_with('/') {
                    continue;
                }
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                });
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), StorageError> {
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let identifiers = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::InvalidConfig {
                    message: e.to_string(),
                })?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .quiet(true)
                .build()
                .map_err(|e| StorageError::InvalidConfig {
                    message: e.to_string(),
                })?;

            let output = self
                .client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| classify(e, bucket, ""))?;

            if let Some(failed) = output.errors().first() {
                return Err(StorageError::InvalidResponse {
                    message: format!(
                        "failed to delete {}: {}",
                        failed.key().unwrap_or("<unknown>"),
                        failed.message().unwrap_or("no message")
                    ),
                });
            }
            debug!(bucket, deleted = batch.len(), "deleted object batch");
        }
        Ok(())
    }
}
