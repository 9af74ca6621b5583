//! # Templar Registry
//!
//! Loading and caching of templar templates:
//! - Loaders for local directories, embedded packages and object stores
//! - Version tokens and a local ledger to skip unchanged downloads
//! - A bounded cache with TTL revalidation or background refresh
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use templar_registry::*;
//! use templar_registry::storage::MemoryObjectStore;
//!
//! # async fn example() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryObjectStore::new("prompts"));
//! store.put("chat/main.yml.j2", "Hello {{ name }}");
//!
//! let registry = Registry::new(CachePolicy::TtlLazy {
//!     capacity: 16,
//!     ttl: Duration::from_secs(30),
//! });
//! let loader = object_store_loader(store, "chat/main.yml.j2", ObjectLoadStrategy::DirectoryMirror);
//!
//! let mut template = registry.open(TemplateSource::Loader(loader), true).await?;
//! println!("{}", template.render(serde_json::json!({ "name": "Ada" }))?);
//!
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod loader;
mod refresher;
pub mod registry;
pub mod storage;

pub use config::{ConfigError, PolicyKind, RegistryConfig};
pub use error::{RegistryError, Result};
pub use identity::{LoaderIdentity, split_template_path};
pub use ledger::{LedgerError, TokenLedger};
pub use loader::{
    DiskMirrorLoader, LedgerObjectLoader, LoadedTemplate, LocalFsLoader, MirrorObjectLoader,
    NaiveObjectLoader, ObjectLoadStrategy, PackageLoader, SyncReport, TemplateLoader,
    object_store_loader,
};
pub use registry::{
    CachePolicy, EntryInfo, MIN_POLL_INTERVAL, RefreshMode, Registry, TemplateSource, global,
    init_global,
};
pub use storage::{ObjectMeta, ObjectStore, StorageError};

#[cfg(feature = "s3")]
pub use storage::S3ObjectStore;
