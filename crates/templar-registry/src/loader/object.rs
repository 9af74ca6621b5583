use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use templar::{CompiledTemplate, VersionToken};
use tokio::sync::Mutex;
use tracing::debug;

use super::{LoadedTemplate, TemplateLoader};
use crate::error::{RegistryError, Result};
use crate::identity::{LoaderIdentity, split_template_path};
use crate::ledger::TokenLedger;
use crate::storage::{ObjectStore, StoredObject};

/// Where one template lives inside an object store
#[derive(Clone)]
pub(crate) struct ObjectLocation {
    pub store: Arc<dyn ObjectStore>,
    pub directory: String,
    pub name: String,
    pub identity: LoaderIdentity,
}

impl ObjectLocation {
    pub fn new(store: Arc<dyn ObjectStore>, template_path: &str) -> Self {
        let (directory, name) = split_template_path(template_path);
        let identity = LoaderIdentity::object(
            store.scheme(),
            store.bucket(),
            directory.as_str(),
            name.as_str(),
        );
        Self {
            store,
            directory,
            name,
            identity,
        }
    }

    /// Listing prefix of the template's directory, empty for the bucket root
    pub fn prefix(&self) -> String {
        match self.directory.trim_matches('/') {
            "" | "." => String::new(),
            directory => format!("{}/", directory),
        }
    }

    /// Full object name of the entry template
    pub fn object_name(&self) -> String {
        format!("{}{}", self.prefix(), self.name)
    }

    /// Name of `object` relative to the template's directory
    pub fn relative<'a>(&self, object: &'a str) -> &'a str {
        let prefix = self.prefix();
        object.strip_prefix(prefix.as_str()).unwrap_or(object)
    }

    pub async fn fetch_entry(&self) -> Result<StoredObject> {
        self.store
            .fetch(&self.object_name())
            .await
            .map_err(|e| RegistryError::from_storage(&self.identity, e))
    }

    pub async fn stat_entry(&self) -> Result<Option<VersionToken>> {
        let meta = self
            .store
            .stat(&self.object_name())
            .await
            .map_err(|e| RegistryError::from_storage(&self.identity, e))?
            .ok_or_else(|| RegistryError::not_found(&self.identity))?;
        Ok(meta.version)
    }

    fn compile(&self, object: StoredObject) -> Result<LoadedTemplate> {
        let version = object.version.clone();
        let source = object
            .into_text()
            .map_err(|e| RegistryError::from_storage(&self.identity, e))?;
        let template = CompiledTemplate::from_source(self.name.as_str(), source)
            .map_err(|e| RegistryError::from_template(&self.identity, e))?;
        Ok(LoadedTemplate { template, version })
    }
}

impl fmt::Debug for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectLocation")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Downloads the template on every load and never reports a version, so
/// anything cached from it is always considered stale.
///
/// Only the entry document is fetched; includes are not resolved.
#[derive(Debug, Clone)]
pub struct NaiveObjectLoader {
    location: ObjectLocation,
}

impl NaiveObjectLoader {
    pub fn new(store: Arc<dyn ObjectStore>, template_path: &str) -> Self {
        Self {
            location: ObjectLocation::new(store, template_path),
        }
    }
}

#[async_trait]
impl TemplateLoader for NaiveObjectLoader {
    fn identity(&self) -> &LoaderIdentity {
        &self.location.identity
    }

    async fn load(&self) -> Result<LoadedTemplate> {
        let object_name = self.location.object_name();
        let exists = self
            .location
            .store
            .exists(&object_name)
            .await
            .map_err(|e| RegistryError::from_storage(&self.location.identity, e))?;
        if !exists {
            return Err(RegistryError::not_found(&self.location.identity));
        }

        let object = self.location.fetch_entry().await?;
        let mut loaded = self.location.compile(object)?;
        loaded.version = None;
        Ok(loaded)
    }
}

/// Downloads a single object and remembers the version it saw in a
/// [`TokenLedger`] on local disk.
///
/// Only the entry document is fetched; includes are not resolved.
pub struct LedgerObjectLoader {
    location: ObjectLocation,
    ledger: Mutex<TokenLedger>,
}

impl LedgerObjectLoader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        template_path: &str,
        ledger_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            location: ObjectLocation::new(store, template_path),
            ledger: Mutex::new(TokenLedger::open(ledger_dir.into())),
        }
    }

    /// Version recorded by the last successful load
    pub async fn recorded_version(&self) -> Option<VersionToken> {
        self.ledger
            .lock()
            .await
            .get(&self.location.object_name())
            .cloned()
    }

    /// Whether the object changed since the last successful load.
    ///
    /// Unknown versions on either side count as stale.
    pub async fn is_stale(&self) -> Result<bool> {
        let current = self.location.stat_entry().await?;
        let ledger = self.ledger.lock().await;
        Ok(ledger.is_stale(&self.location.object_name(), current.as_ref()))
    }
}

impl fmt::Debug for LedgerObjectLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerObjectLoader")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TemplateLoader for LedgerObjectLoader {
    fn identity(&self) -> &LoaderIdentity {
        &self.location.identity
    }

    async fn load(&self) -> Result<LoadedTemplate> {
        let object = self.location.fetch_entry().await?;
        let loaded = self.location.compile(object)?;

        let mut ledger = self.ledger.lock().await;
        ledger.record(self.location.object_name(), loaded.version.clone());
        ledger.persist_or_warn().await;
        debug!(
            "Fetched {} at version {:?}",
            self.location.identity, loaded.version
        );
        Ok(loaded)
    }

    async fn current_version(&self) -> Result<Option<VersionToken>> {
        self.location.stat_entry().await
    }
}
