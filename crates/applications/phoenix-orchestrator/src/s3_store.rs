//! S3 blob storage
//!
//! Stores snapshot blobs in S3 under `<prefix>/<sha256>`. Objects are
//! written once and never overwritten: the key is the content address.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_types::region::Region;
use phoenix_core::{BlobStatus, BlobStore, ContentRef, PhoenixError, Result};
use tracing::{debug, info};

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-east-1";

/// Create S3 client from environment
pub async fn create_s3_client(region: Option<String>) -> Client {
    let region_str = region.unwrap_or_else(|| DEFAULT_REGION.to_string());
    debug!("Creating S3 client for region: {}", region_str);

    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region_str))
        .load()
        .await;

    Client::new(&config)
}

/// S3-backed [`BlobStore`]
pub struct S3BlobStore {
    /// S3 client
    client: Client,

    /// Bucket name
    bucket: String,

    /// Key prefix for blobs
    prefix: String,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: "snapshots".to_string(),
        }
    }

    /// Set key prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// S3 key for a content address
    fn s3_key(&self, content_ref: &ContentRef) -> String {
        object_key(&self.prefix, content_ref)
    }
}

fn object_key(prefix: &str, content_ref: &ContentRef) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), content_ref)
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, data: Vec<u8>) -> Result<ContentRef> {
        let content_ref = ContentRef::of(&data);
        let key = self.s3_key(&content_ref);

        if self.exists(&content_ref).await? {
            debug!("Blob already stored at s3://{}/{}", self.bucket, key);
            return Ok(content_ref);
        }

        info!(
            "Uploading {} bytes to s3://{}/{}",
            data.len(),
            self.bucket,
            key
        );

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| PhoenixError::storage(format!("S3 put {}: {}", key, e)))?;

        Ok(content_ref)
    }

    async fn get(&self, content_ref: &ContentRef) -> Result<Vec<u8>> {
        let key = self.s3_key(content_ref);
        debug!("Downloading s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    PhoenixError::BlobNotFound(content_ref.to_string())
                } else {
                    PhoenixError::storage(format!("S3 get {}: {}", key, service))
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| PhoenixError::storage(format!("S3 body {}: {}", key, e)))?
            .into_bytes()
            .to_vec();

        Ok(data)
    }

    async fn status(&self, content_ref: &ContentRef) -> Result<BlobStatus> {
        let key = self.s3_key(content_ref);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            // S3 PUT is durable once acknowledged
            Ok(_) => Ok(BlobStatus::Committed),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_not_found() {
                    Err(PhoenixError::BlobNotFound(content_ref.to_string()))
                } else {
                    Err(PhoenixError::storage(format!("S3 head {}: {}", key, service)))
                }
            }
        }
    }

    async fn exists(&self, content_ref: &ContentRef) -> Result<bool> {
        match self.status(content_ref).await {
            Ok(status) => Ok(status == BlobStatus::Committed),
            Err(PhoenixError::BlobNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_key_generation() {
        let content_ref = ContentRef::of(b"hello");
        assert_eq!(
            object_key("snapshots/", &content_ref),
            "snapshots/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(object_key("team-a/snaps", &content_ref).split('/').count(), 3);
    }
}
