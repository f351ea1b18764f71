use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::Credentials,
    presigning::PresigningConfig,
    primitives::ByteStream,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use crate::models::{AttachmentId, EmailId, UserId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object store put failed: {0}")]
    Put(String),
    #[error("object store get failed: {0}")]
    Get(String),
    #[error("object store delete failed: {0}")]
    Delete(String),
    #[error("object store list failed: {0}")]
    List(String),
    #[error("presigning failed: {0}")]
    Presign(String),
}

#[derive(Clone)]
pub struct StoreConfig {
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub presign_ttl: Duration,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("OBJECT_STORE_ENDPOINT")
                .expect("Missing OBJECT_STORE_ENDPOINT environment variable"),
            region: std::env::var("OBJECT_STORE_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            access_key: std::env::var("OBJECT_STORE_ACCESS_KEY")
                .expect("Missing OBJECT_STORE_ACCESS_KEY environment variable"),
            secret_key: std::env::var("OBJECT_STORE_SECRET_KEY")
                .expect("Missing OBJECT_STORE_SECRET_KEY environment variable"),
            bucket: std::env::var("OBJECT_STORE_BUCKET")
                .unwrap_or_else(|_| "driftmail-attachments".to_string()),
            presign_ttl: Duration::from_secs(
                std::env::var("OBJECT_STORE_PRESIGN_TTL_SECONDS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(15 * 60),
            ),
        }
    }
}

/// Thin adapter over any S3-compatible store (MinIO in development).
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
    presign_ttl: Duration,
}

/// Key layout: `attachments/<user>/<message>/<attachment-id>`; opaque and
/// unique per object.
pub fn attachment_key(user: UserId, message: EmailId, attachment: AttachmentId) -> String {
    format!("attachments/{user}/{message}/{attachment}")
}

/// Raw wire copies live next to the attachments of the same message.
pub fn raw_blob_key(user: UserId, message: EmailId) -> String {
    format!("attachments/{user}/{message}/raw")
}

impl ObjectStore {
    pub async fn new(config: &StoreConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "driftmail",
        );

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(aws_config::Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            // MinIO and friends do not resolve bucket subdomains
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            presign_ttl: config.presign_ttl,
        }
    }

    pub async fn put(
        &self,
        key: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(), StorageError> {
        trace!(key, bytes = body.len(), "uploading object");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::Put(e.to_string()))?;

        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Get(e.to_string()))?;

        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Get(e.to_string()))?;

        Ok(bytes.into_bytes().to_vec())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        debug!(key, "deleting object");

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;

        Ok(())
    }

    /// Stable object identifier recorded on attachment rows; downloads go
    /// through `presign_get`.
    pub fn object_url(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }

    /// Time-limited capability URL for a single object download.
    pub async fn presign_get(&self, key: &str) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(self.presign_ttl)
            .map_err(|e| StorageError::Presign(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Presign(e.to_string()))?;

        Ok(request.uri().to_string())
    }

    /// Keys under a prefix; used by out-of-band orphan sweeps.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }

            let page = request
                .send()
                .await
                .map_err(|e| StorageError::List(e.to_string()))?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn key_layout() {
        let user: UserId = Uuid::nil().into();
        let message: EmailId = Uuid::nil().into();
        let attachment: AttachmentId = Uuid::nil().into();

        let key = attachment_key(user, message, attachment);
        assert_eq!(
            key,
            "attachments/00000000-0000-0000-0000-000000000000/00000000-0000-0000-0000-000000000000/00000000-0000-0000-0000-000000000000"
        );
        assert!(raw_blob_key(user, message).ends_with("/raw"));
    }
}
