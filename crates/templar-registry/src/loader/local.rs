use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use templar::{CompiledTemplate, VersionToken};
use tracing::debug;

use super::{LoadedTemplate, TemplateLoader};
use crate::error::{RegistryError, Result};
use crate::identity::LoaderIdentity;

/// Loads templates from a directory on the local filesystem.
///
/// The version token digests the modification times of every file the
/// compiled environments have read so far: the entry template plus each
/// include seen while rendering. Editing an include therefore makes the
/// cached template stale just like editing the entry file.
#[derive(Debug, Clone)]
pub struct LocalFsLoader {
    directory: PathBuf,
    name: String,
    identity: LoaderIdentity,
    read: Arc<Mutex<BTreeSet<String>>>,
}

impl LocalFsLoader {
    /// Loader for `template_path`; a bare file name resolves against `"."`.
    pub fn new(template_path: impl AsRef<Path>) -> Self {
        let path = template_path.as_ref();
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_parts(directory, name)
    }

    /// Loader for `name` inside `directory`
    pub fn from_parts(directory: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        let directory = directory.into();
        let name = name.into();
        let identity = LoaderIdentity::file(directory.to_string_lossy(), name.as_str());
        let read = Arc::new(Mutex::new(BTreeSet::from([name.clone()])));
        Self {
            directory,
            name,
            identity,
            read,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Names of the files folded into the version token, sorted
    pub fn tracked_files(&self) -> Vec<String> {
        lock_names(&self.read).iter().cloned().collect()
    }

    /// Digest of `(name, mtime)` over every tracked file.
    ///
    /// A missing entry file is an error; a missing include only changes
    /// the digest.
    async fn version(&self) -> std::io::Result<VersionToken> {
        let entry = tokio::fs::metadata(self.directory.join(&self.name)).await?;
        let names = self.tracked_files();

        let mut hasher = Sha256::new();
        for name in &names {
            let modified = if *name == self.name {
                Some(entry.modified()?)
            } else {
                match tokio::fs::metadata(self.directory.join(name)).await {
                    Ok(metadata) => Some(metadata.modified()?),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => return Err(e),
                }
            };
            hasher.update(name.as_bytes());
            hasher.update([0]);
            let stamp = match modified {
                Some(at) => VersionToken::Modified(at).to_string(),
                None => "missing".to_string(),
            };
            hasher.update(stamp.as_bytes());
            hasher.update([b'\n']);
        }
        Ok(VersionToken::Tag(format!("sha256:{:x}", hasher.finalize())))
    }
}

fn lock_names(names: &Mutex<BTreeSet<String>>) -> MutexGuard<'_, BTreeSet<String>> {
    names.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl TemplateLoader for LocalFsLoader {
    fn identity(&self) -> &LoaderIdentity {
        &self.identity
    }

    async fn load(&self) -> Result<LoadedTemplate> {
        // Read the version before the content so a concurrent write can only
        // make the recorded version older than what was compiled.
        let version = self.version().await.ok();

        let directory = self.directory.clone();
        let name = self.name.clone();
        let read = self.read.clone();
        let template = tokio::task::spawn_blocking(move || {
            CompiledTemplate::from_directory_observed(directory, name, move |file| {
                lock_names(&read).insert(file.to_string());
            })
        })
        .await
        .map_err(|e| RegistryError::Task(e.to_string()))?
        .map_err(|e| RegistryError::from_template(&self.identity, e))?;

        debug!("Loaded {} from disk", self.identity);
        Ok(LoadedTemplate { template, version })
    }

    async fn current_version(&self) -> Result<Option<VersionToken>> {
        match self.version().await {
            Ok(version) => Ok(Some(version)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RegistryError::not_found(&self.identity))
            }
            Err(e) => Err(e.into()),
        }
    }
}
