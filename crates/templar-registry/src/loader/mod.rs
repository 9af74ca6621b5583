//! Template loaders
//!
//! A loader knows how to produce a compiled template from one named
//! location, and how to report which revision of that location it saw. The
//! registry uses the identity as its cache key and the version token to
//! decide whether a cached template can be kept without re-fetching.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use templar::{CompiledTemplate, VersionToken};

use crate::error::Result;
use crate::identity::LoaderIdentity;
use crate::storage::ObjectStore;

mod local;
mod mirror;
mod object;
mod package;

pub use local::LocalFsLoader;
pub use mirror::{DiskMirrorLoader, MirrorObjectLoader, SyncReport};
pub use object::{LedgerObjectLoader, NaiveObjectLoader};
pub use package::{BUILTIN_TEMPLATES, PackageLoader};

/// File suffixes of the template documents a directory mirror picks up
pub const TEMPLATE_SUFFIXES: [&str; 4] = [".yml.j2", ".yaml.j2", ".yml.jinja2", ".yaml.jinja2"];

/// Check if the given object name is a YAML document processed with Jinja.
pub fn is_template_document(name: &str) -> bool {
    TEMPLATE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// A freshly compiled template and the revision it was compiled from
#[derive(Debug)]
pub struct LoadedTemplate {
    pub template: CompiledTemplate,
    pub version: Option<VersionToken>,
}

/// Strategy producing compiled templates from one location
#[async_trait]
pub trait TemplateLoader: Send + Sync {
    /// Cache key of the location this loader reads
    fn identity(&self) -> &LoaderIdentity;

    /// Fetch and compile the template
    async fn load(&self) -> Result<LoadedTemplate>;

    /// Revision currently held by the source.
    ///
    /// `None` means the source does not track revisions, so anything loaded
    /// from it is always considered stale.
    async fn current_version(&self) -> Result<Option<VersionToken>> {
        Ok(None)
    }
}

/// How templates are read from an object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLoadStrategy {
    /// Download on every load and never track revisions
    Naive,
    /// Download one object and remember its version in a ledger under `ledger_dir`
    LedgerChecked { ledger_dir: PathBuf },
    /// Mirror every template document under the directory into memory
    DirectoryMirror,
    /// Mirror every template document under the directory into `local_dir`
    MirrorToDisk { local_dir: PathBuf },
}

/// Build the loader for `template_path` in `store` using `strategy`.
pub fn object_store_loader(
    store: Arc<dyn ObjectStore>,
    template_path: &str,
    strategy: ObjectLoadStrategy,
) -> Arc<dyn TemplateLoader> {
    match strategy {
        ObjectLoadStrategy::Naive => Arc::new(NaiveObjectLoader::new(store, template_path)),
        ObjectLoadStrategy::LedgerChecked { ledger_dir } => {
            Arc::new(LedgerObjectLoader::new(store, template_path, ledger_dir))
        }
        ObjectLoadStrategy::DirectoryMirror => {
            Arc::new(MirrorObjectLoader::new(store, template_path))
        }
        ObjectLoadStrategy::MirrorToDisk { local_dir } => {
            Arc::new(DiskMirrorLoader::new(store, template_path, local_dir))
        }
    }
}
