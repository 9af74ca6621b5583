//! S3-compatible object store using the MinIO client
//!
//! Works with AWS S3, MinIO, and any S3-compatible object storage. Entity
//! tags serve as version tokens.

use async_trait::async_trait;
use futures_util::StreamExt;
use minio::s3::{
    client::Client,
    creds::StaticProvider,
    http::BaseUrl,
    types::{S3Api, ToStream},
};
use std::str::FromStr;
use templar::VersionToken;

use super::{ObjectMeta, ObjectStore, StorageError, StoredObject};

/// S3-compatible object store
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Create a new S3 store instance
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Create an S3 store from environment variables
    ///
    /// Expects:
    /// - S3_ACCESS_KEY_ID
    /// - S3_SECRET_ACCESS_KEY
    /// - S3_ENDPOINT_URL (for S3-compatible services like MinIO)
    /// - S3_BUCKET
    pub fn from_env() -> Result<Self, StorageError> {
        let bucket = required_var("S3_BUCKET")?;
        let access_key = required_var("S3_ACCESS_KEY_ID")?;
        let secret_key = required_var("S3_SECRET_ACCESS_KEY")?;
        let endpoint_url = required_var("S3_ENDPOINT_URL")?;

        let base_url = BaseUrl::from_str(&endpoint_url)
            .map_err(|e| StorageError::Backend(format!("Invalid S3_ENDPOINT_URL: {}", e)))?;
        let creds_provider = StaticProvider::new(&access_key, &secret_key, None);

        let client = Client::new(base_url, Some(Box::new(creds_provider)), None, None)
            .map_err(|e| StorageError::Backend(format!("Failed to create S3 client: {}", e)))?;

        Ok(Self::new(client, bucket))
    }

    /// Validate S3 key format
    fn validate_key(&self, key: &str) -> Result<(), StorageError> {
        if key.is_empty() || key.len() > 1024 {
            return Err(StorageError::InvalidKey(
                "Key must be between 1 and 1024 characters".into(),
            ));
        }
        if key.starts_with('/') {
            return Err(StorageError::InvalidKey("Key cannot start with '/'".into()));
        }
        Ok(())
    }
}

fn required_var(name: &str) -> Result<String, StorageError> {
    std::env::var(name)
        .map_err(|_| StorageError::Backend(format!("{} environment variable not set", name)))
}

fn is_missing(error: &impl std::fmt::Display) -> bool {
    let message = error.to_string();
    message.contains("NoSuchKey") || message.contains("404")
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn scheme(&self) -> &str {
        "s3"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn stat(&self, name: &str) -> Result<Option<ObjectMeta>, StorageError> {
        self.validate_key(name)?;

        match self.client.stat_object(&self.bucket, name).send().await {
            Ok(response) => Ok(Some(ObjectMeta {
                name: name.to_string(),
                version: Some(VersionToken::Tag(response.etag)),
            })),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(StorageError::Backend(format!(
                "Failed to stat object '{}': {}",
                name, e
            ))),
        }
    }

    async fn fetch(&self, name: &str) -> Result<StoredObject, StorageError> {
        // The tag is read first; content that changes in between shows up
        // as a different tag on the next check.
        let version = self
            .stat(name)
            .await?
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?
            .version;

        let response = self
            .client
            .get_object(&self.bucket, name)
            .send()
            .await
            .map_err(|e| {
                if is_missing(&e) {
                    StorageError::NotFound(name.to_string())
                } else {
                    StorageError::Backend(format!("Failed to get object '{}': {}", name, e))
                }
            })?;

        let content = response.content.to_segmented_bytes().await.map_err(|e| {
            StorageError::Backend(format!("Failed to read object '{}' content: {}", name, e))
        })?;

        Ok(StoredObject {
            name: name.to_string(),
            content: content.to_bytes().to_vec(),
            version,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        let mut objects = Vec::new();
        let mut stream = self
            .client
            .list_objects(&self.bucket)
            .prefix(Some(prefix.to_string()))
            .recursive(true)
            .to_stream()
            .await;

        while let Some(result) = stream.next().await {
            let response = result.map_err(|e| {
                StorageError::Backend(format!(
                    "Failed to list objects with prefix '{}': {}",
                    prefix, e
                ))
            })?;
            for entry in response.contents {
                objects.push(ObjectMeta {
                    version: entry.etag.map(VersionToken::Tag),
                    name: entry.name,
                });
            }
        }

        Ok(objects)
    }
}
