//! Error types for the template registry

use thiserror::Error;

use crate::config::ConfigError;
use crate::identity::LoaderIdentity;
use crate::ledger::LedgerError;
use crate::storage::StorageError;

/// Registry-specific errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The template is absent at its source
    #[error("Template not found: {identity}")]
    NotFound { identity: LoaderIdentity },

    /// The object store failed
    #[error("Storage error: {0}")]
    Source(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Compilation or rendering failed
    #[error("Template error: {0}")]
    Template(#[from] templar::TemplarError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A blocking worker panicked or was cancelled
    #[error("Worker task failed: {0}")]
    Task(String),
}

impl RegistryError {
    pub(crate) fn not_found(identity: &LoaderIdentity) -> Self {
        RegistryError::NotFound {
            identity: identity.clone(),
        }
    }

    /// Attach the loader identity to an engine error, keeping the
    /// engine's own not-found signal distinguishable.
    pub(crate) fn from_template(identity: &LoaderIdentity, error: templar::TemplarError) -> Self {
        if error.is_not_found() {
            Self::not_found(identity)
        } else {
            RegistryError::Template(error)
        }
    }

    /// Map a storage failure, turning a missing object into `NotFound`.
    pub(crate) fn from_storage(identity: &LoaderIdentity, error: StorageError) -> Self {
        match error {
            StorageError::NotFound(_) => Self::not_found(identity),
            other => RegistryError::Source(other),
        }
    }

    /// Whether the template does not exist at its source
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }

    /// Whether the fetched source failed to compile
    pub fn is_syntax(&self) -> bool {
        matches!(self, RegistryError::Template(e) if e.is_syntax())
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
