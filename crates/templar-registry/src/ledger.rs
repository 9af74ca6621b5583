//! Locally persisted record of the last observed object versions
//!
//! The ledger lets a process that restarts skip re-downloading objects it
//! already holds. It is never authoritative: every entry is compared against
//! the live store before being trusted, and a missing or unreadable ledger
//! simply means everything is treated as stale.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use templar::{VersionToken, is_stale};
use thiserror::Error;
use tracing::{debug, warn};

/// File name of the ledger inside a local cache directory
pub const LEDGER_FILE_NAME: &str = ".generation";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Failed to write ledger {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("Failed to encode ledger: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Mapping from object name to the version token last downloaded
#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    path: Option<PathBuf>,
    entries: BTreeMap<String, VersionToken>,
}

impl TokenLedger {
    /// A ledger that lives only as long as the process
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the ledger stored in `dir`, creating the directory if needed.
    ///
    /// A missing or corrupt ledger file yields an empty ledger.
    pub fn open(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("Failed to create ledger directory {}: {}", dir.display(), e);
        }
        let path = dir.join(LEDGER_FILE_NAME);

        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Ignoring corrupt ledger {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!("Error reading ledger {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        debug!("Opened ledger {} with {} entries", path.display(), entries.len());

        Self {
            path: Some(path),
            entries,
        }
    }

    /// Backing file, if the ledger is persisted
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<&VersionToken> {
        self.entries.get(name)
    }

    /// Whether `name` must be fetched again given its current version
    pub fn is_stale(&self, name: &str, current: Option<&VersionToken>) -> bool {
        is_stale(self.get(name), current)
    }

    /// Record the version just downloaded; an untracked version erases the
    /// entry so the object is always considered stale.
    pub fn record(&mut self, name: impl Into<String>, version: Option<VersionToken>) {
        let name = name.into();
        match version {
            Some(version) => {
                self.entries.insert(name, version);
            }
            None => {
                self.entries.remove(&name);
            }
        }
    }

    /// Drop every entry not accepted by `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|name, _| keep(name));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the ledger to its backing file.
    pub async fn persist(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let encoded = serde_json::to_vec(&self.entries)?;
        let staging = path.with_extension("tmp");
        let write_error = |e: std::io::Error| LedgerError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        tokio::fs::write(&staging, encoded).await.map_err(write_error)?;
        tokio::fs::rename(&staging, path).await.map_err(write_error)?;
        Ok(())
    }

    /// Persist, degrading a failure to a warning.
    pub async fn persist_or_warn(&self) {
        if let Err(e) = self.persist().await {
            warn!("Ledger not saved, objects will be re-fetched: {}", e);
        }
    }
}
