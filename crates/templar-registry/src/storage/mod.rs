//! Object storage boundary
//!
//! Loaders only need three things from a remote store: the current version
//! of a named object, its bytes, and the objects below a prefix. The
//! in-memory implementation backs tests and local development; the S3
//! implementation talks to any S3-compatible service.

use async_trait::async_trait;
use templar::VersionToken;

pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Invalid key format: {0}")]
    InvalidKey(String),
}

/// Listing entry for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Full object name, including any directory prefix
    pub name: String,
    /// Current revision, if the backend reports one
    pub version: Option<VersionToken>,
}

impl ObjectMeta {
    /// Placeholder objects some stores use to represent folders
    pub fn is_pseudo_directory(&self) -> bool {
        self.name.ends_with('/')
    }
}

/// A downloaded object
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub name: String,
    pub content: Vec<u8>,
    pub version: Option<VersionToken>,
}

impl StoredObject {
    /// Decode the content as UTF-8 template text
    pub fn into_text(self) -> Result<String, StorageError> {
        String::from_utf8(self.content)
            .map_err(|_| StorageError::Backend(format!("Object '{}' is not valid UTF-8", self.name)))
    }
}

/// Abstraction for remote object storage backends
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Scheme used in loader identities for this store
    fn scheme(&self) -> &str {
        "objstore"
    }

    /// Bucket the store reads from
    fn bucket(&self) -> &str;

    /// Current metadata of an object, `None` when it does not exist
    async fn stat(&self, name: &str) -> Result<Option<ObjectMeta>, StorageError>;

    /// Download an object
    async fn fetch(&self, name: &str) -> Result<StoredObject, StorageError>;

    /// List every object whose name starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError>;

    /// Check if an object exists
    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.stat(name).await?.is_some())
    }
}
