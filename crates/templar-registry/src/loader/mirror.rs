//! Directory mirrors of an object store
//!
//! A mirror keeps a local copy of every template document below the entry
//! template's directory, so includes and imports resolve against siblings.
//! Each sync lists the directory once and downloads only the objects whose
//! version differs from the one recorded in the ledger.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use templar::{CompiledTemplate, VersionToken};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::object::ObjectLocation;
use super::{LoadedTemplate, TemplateLoader, is_template_document};
use crate::error::{RegistryError, Result};
use crate::identity::LoaderIdentity;
use crate::ledger::TokenLedger;
use crate::storage::{ObjectMeta, ObjectStore};

/// Outcome of one mirror sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Template documents found in the directory
    pub listed: usize,
    /// Documents downloaded because they were new or changed
    pub downloaded: usize,
    /// Local copies dropped because the object disappeared
    pub removed: usize,
}

/// List the template documents below the location's directory.
async fn template_listing(location: &ObjectLocation) -> Result<Vec<ObjectMeta>> {
    let listing = location
        .store
        .list(&location.prefix())
        .await
        .map_err(|e| RegistryError::from_storage(&location.identity, e))?;

    let mut documents = Vec::with_capacity(listing.len());
    for meta in listing {
        if meta.is_pseudo_directory() {
            continue;
        }
        if !is_template_document(&meta.name) {
            debug!("Skipping non-template object {}", meta.name);
            continue;
        }
        documents.push(meta);
    }
    documents.sort_by(|a, b| a.name.cmp(&b.name));

    if !documents
        .iter()
        .any(|meta| meta.name == location.object_name())
    {
        return Err(RegistryError::not_found(&location.identity));
    }
    Ok(documents)
}

/// Version of a whole directory: a digest over every (name, version) pair.
///
/// Unknown if any document lacks a version.
fn listing_version(documents: &[ObjectMeta]) -> Option<VersionToken> {
    let mut hasher = Sha256::new();
    for meta in documents {
        let version = meta.version.as_ref()?;
        hasher.update(meta.name.as_bytes());
        hasher.update([0]);
        hasher.update(version.to_string().as_bytes());
        hasher.update([b'\n']);
    }
    Some(VersionToken::Tag(format!("sha256:{:x}", hasher.finalize())))
}

struct MirrorState {
    sources: HashMap<String, String>,
    ledger: TokenLedger,
}

/// Mirrors a directory of templates into memory.
pub struct MirrorObjectLoader {
    location: ObjectLocation,
    state: Mutex<MirrorState>,
}

impl MirrorObjectLoader {
    pub fn new(store: Arc<dyn ObjectStore>, template_path: &str) -> Self {
        Self {
            location: ObjectLocation::new(store, template_path),
            state: Mutex::new(MirrorState {
                sources: HashMap::new(),
                ledger: TokenLedger::in_memory(),
            }),
        }
    }

    /// Bring the in-memory copy up to date with the store.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.sync_listing().await.map(|(report, _)| report)
    }

    /// Names of the mirrored documents, relative to the template directory
    pub async fn mirrored_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.sources.keys().cloned().collect();
        names.sort();
        names
    }

    async fn sync_listing(&self) -> Result<(SyncReport, Vec<ObjectMeta>)> {
        let documents = template_listing(&self.location).await?;
        let mut state = self.state.lock().await;
        let mut report = SyncReport {
            listed: documents.len(),
            ..SyncReport::default()
        };

        for meta in &documents {
            let relative = self.location.relative(&meta.name).to_string();
            let fresh = !state.ledger.is_stale(&meta.name, meta.version.as_ref());
            if fresh && state.sources.contains_key(&relative) {
                continue;
            }

            let object = self
                .location
                .store
                .fetch(&meta.name)
                .await
                .map_err(|e| RegistryError::from_storage(&self.location.identity, e))?;
            let version = object.version.clone();
            let text = object
                .into_text()
                .map_err(|e| RegistryError::from_storage(&self.location.identity, e))?;

            state.sources.insert(relative, text);
            state.ledger.record(meta.name.as_str(), version);
            report.downloaded += 1;
        }

        let listed: HashSet<String> = documents
            .iter()
            .map(|meta| self.location.relative(&meta.name).to_string())
            .collect();
        let before = state.sources.len();
        state.sources.retain(|name, _| listed.contains(name));
        report.removed = before - state.sources.len();
        let prefix = self.location.prefix();
        state
            .ledger
            .retain(|name| listed.contains(name.strip_prefix(prefix.as_str()).unwrap_or(name)));

        if report.downloaded > 0 || report.removed > 0 {
            info!(
                "Synced {}: {} listed, {} downloaded, {} removed",
                self.location.identity, report.listed, report.downloaded, report.removed
            );
        }
        Ok((report, documents))
    }
}

impl fmt::Debug for MirrorObjectLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorObjectLoader")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TemplateLoader for MirrorObjectLoader {
    fn identity(&self) -> &LoaderIdentity {
        &self.location.identity
    }

    async fn load(&self) -> Result<LoadedTemplate> {
        let (_, documents) = self.sync_listing().await?;
        let sources = self.state.lock().await.sources.clone();
        let template = CompiledTemplate::from_sources(self.location.name.as_str(), sources)
            .map_err(|e| RegistryError::from_template(&self.location.identity, e))?;

        Ok(LoadedTemplate {
            template,
            version: listing_version(&documents),
        })
    }

    async fn current_version(&self) -> Result<Option<VersionToken>> {
        let documents = template_listing(&self.location).await?;
        Ok(listing_version(&documents))
    }
}

/// Reject names that would escape the local mirror directory.
fn is_contained(relative: &str) -> bool {
    Path::new(relative)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
}

/// Mirrors a directory of templates into a local directory.
///
/// The ledger is stored next to the files, so a restarted process only
/// downloads what changed while it was away.
pub struct DiskMirrorLoader {
    location: ObjectLocation,
    local_dir: PathBuf,
    ledger: Mutex<TokenLedger>,
}

impl DiskMirrorLoader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        template_path: &str,
        local_dir: impl Into<PathBuf>,
    ) -> Self {
        let local_dir = local_dir.into();
        Self {
            location: ObjectLocation::new(store, template_path),
            ledger: Mutex::new(TokenLedger::open(&local_dir)),
            local_dir,
        }
    }

    /// Local directory holding the mirrored template directory
    pub fn mirror_dir(&self) -> PathBuf {
        self.local_dir.join(self.location.prefix())
    }

    /// Bring the local copy up to date with the store.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.sync_listing().await.map(|(report, _)| report)
    }

    async fn sync_listing(&self) -> Result<(SyncReport, Vec<ObjectMeta>)> {
        let documents = template_listing(&self.location).await?;
        let mut ledger = self.ledger.lock().await;
        let mut report = SyncReport {
            listed: documents.len(),
            ..SyncReport::default()
        };

        for meta in &documents {
            if !is_contained(&meta.name) {
                warn!("Skipping object with unsafe name {}", meta.name);
                continue;
            }
            let target = self.local_dir.join(&meta.name);
            let on_disk = tokio::fs::try_exists(&target).await.unwrap_or(false);
            if on_disk && !ledger.is_stale(&meta.name, meta.version.as_ref()) {
                continue;
            }

            let object = self
                .location
                .store
                .fetch(&meta.name)
                .await
                .map_err(|e| RegistryError::from_storage(&self.location.identity, e))?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &object.content).await?;

            ledger.record(meta.name.as_str(), object.version);
            report.downloaded += 1;
        }

        let prefix = self.location.prefix();
        let listed: HashSet<&str> = documents.iter().map(|meta| meta.name.as_str()).collect();
        let mut vanished = Vec::new();
        ledger.retain(|name| {
            let keep = !name.starts_with(prefix.as_str()) || listed.contains(name);
            if !keep {
                vanished.push(name.to_string());
            }
            keep
        });
        for name in &vanished {
            if let Err(e) = tokio::fs::remove_file(self.local_dir.join(name)).await {
                debug!("Could not remove mirrored copy of {}: {}", name, e);
            }
        }
        report.removed = vanished.len();

        if report.downloaded > 0 || report.removed > 0 {
            ledger.persist_or_warn().await;
            info!(
                "Synced {} into {}: {} listed, {} downloaded, {} removed",
                self.location.identity,
                self.local_dir.display(),
                report.listed,
                report.downloaded,
                report.removed
            );
        }
        Ok((report, documents))
    }
}

impl fmt::Debug for DiskMirrorLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskMirrorLoader")
            .field("location", &self.location)
            .field("local_dir", &self.local_dir)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TemplateLoader for DiskMirrorLoader {
    fn identity(&self) -> &LoaderIdentity {
        &self.location.identity
    }

    async fn load(&self) -> Result<LoadedTemplate> {
        let (_, documents) = self.sync_listing().await?;

        let mirror_dir = self.mirror_dir();
        let name = self.location.name.clone();
        let template =
            tokio::task::spawn_blocking(move || CompiledTemplate::from_directory(mirror_dir, name))
                .await
                .map_err(|e| RegistryError::Task(e.to_string()))?
                .map_err(|e| RegistryError::from_template(&self.location.identity, e))?;

        Ok(LoadedTemplate {
            template,
            version: listing_version(&documents),
        })
    }

    async fn current_version(&self) -> Result<Option<VersionToken>> {
        let documents = template_listing(&self.location).await?;
        Ok(listing_version(&documents))
    }
}
