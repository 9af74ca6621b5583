#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use templar::{CompiledTemplate, VersionToken};
use templar_registry::{LoadedTemplate, LoaderIdentity, RegistryError, StorageError, TemplateLoader};
use tokio::sync::Semaphore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Loader whose content, version and failures are driven by the test
pub struct CountingLoader {
    identity: LoaderIdentity,
    source: Mutex<String>,
    version: Mutex<Option<VersionToken>>,
    loads: AtomicUsize,
    version_checks: AtomicUsize,
    failing: AtomicBool,
    failing_loads: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

impl CountingLoader {
    pub fn new(name: &str, source: &str) -> Arc<Self> {
        Arc::new(Self::build(name, source, None))
    }

    /// Loads block until the gate hands out a permit.
    pub fn gated(name: &str, source: &str, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self::build(name, source, Some(gate)))
    }

    fn build(name: &str, source: &str, gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            identity: LoaderIdentity::new("test", "suite", "templates", name),
            source: Mutex::new(source.to_string()),
            version: Mutex::new(Some(VersionToken::Generation(1))),
            loads: AtomicUsize::new(0),
            version_checks: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            failing_loads: AtomicBool::new(false),
            gate,
        }
    }

    /// Replace the content and bump the version.
    pub fn update(&self, source: &str, generation: i64) {
        *self.source.lock().unwrap() = source.to_string();
        *self.version.lock().unwrap() = Some(VersionToken::Generation(generation));
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail loads only; version checks keep answering.
    pub fn set_failing_loads(&self, failing: bool) {
        self.failing_loads.store(failing, Ordering::SeqCst);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn version_checks(&self) -> usize {
        self.version_checks.load(Ordering::SeqCst)
    }

    fn failure(&self) -> RegistryError {
        RegistryError::Source(StorageError::Backend("source unavailable".into()))
    }
}

#[async_trait]
impl TemplateLoader for CountingLoader {
    fn identity(&self) -> &LoaderIdentity {
        &self.identity
    }

    async fn load(&self) -> templar_registry::Result<LoadedTemplate> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.failing.load(Ordering::SeqCst) || self.failing_loads.load(Ordering::SeqCst) {
            return Err(self.failure());
        }

        let source = self.source.lock().unwrap().clone();
        let version = self.version.lock().unwrap().clone();
        let template = CompiledTemplate::from_source(self.identity.name(), source)?;
        Ok(LoadedTemplate { template, version })
    }

    async fn current_version(&self) -> templar_registry::Result<Option<VersionToken>> {
        self.version_checks.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.failure());
        }
        Ok(self.version.lock().unwrap().clone())
    }
}
