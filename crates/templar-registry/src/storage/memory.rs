//! In-memory object store

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use templar::VersionToken;

use super::{ObjectMeta, ObjectStore, StorageError, StoredObject};

#[derive(Debug, Clone)]
struct MemoryObject {
    content: Vec<u8>,
    generation: i64,
}

/// Object store kept entirely in process memory.
///
/// Every write assigns a new generation number, like a versioned bucket.
/// Downloads are counted so callers can observe how often content was
/// actually transferred.
#[derive(Debug)]
pub struct MemoryObjectStore {
    scheme: String,
    bucket: String,
    objects: Mutex<BTreeMap<String, MemoryObject>>,
    next_generation: AtomicI64,
    downloads: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self::with_scheme("mem", bucket)
    }

    /// Create a store that identifies its objects under `scheme`
    pub fn with_scheme(scheme: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
            next_generation: AtomicI64::new(1),
            downloads: AtomicUsize::new(0),
        }
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, MemoryObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object under the next generation number, returning it
    pub fn put(&self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> i64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.put_with_generation(name, content, generation);
        generation
    }

    /// Store an object with an explicit generation number
    pub fn put_with_generation(
        &self,
        name: impl Into<String>,
        content: impl Into<Vec<u8>>,
        generation: i64,
    ) {
        self.next_generation
            .fetch_max(generation.saturating_add(1), Ordering::SeqCst);
        self.objects().insert(
            name.into(),
            MemoryObject {
                content: content.into(),
                generation,
            },
        );
    }

    /// Remove an object
    pub fn remove(&self, name: &str) -> bool {
        self.objects().remove(name).is_some()
    }

    /// Number of completed downloads
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Get all stored object names
    pub fn names(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    /// Get number of stored objects
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn stat(&self, name: &str) -> Result<Option<ObjectMeta>, StorageError> {
        Ok(self.objects().get(name).map(|object| ObjectMeta {
            name: name.to_string(),
            version: Some(VersionToken::Generation(object.generation)),
        }))
    }

    async fn fetch(&self, name: &str) -> Result<StoredObject, StorageError> {
        let object = self
            .objects()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(StoredObject {
            name: name.to_string(),
            content: object.content,
            version: Some(VersionToken::Generation(object.generation)),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        Ok(self
            .objects()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, object)| ObjectMeta {
                name: name.clone(),
                version: Some(VersionToken::Generation(object.generation)),
            })
            .collect())
    }
}
