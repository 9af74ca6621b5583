//! Bounded cache of compiled templates keyed by loader identity
//!
//! Two bounded policies are supported. `TtlLazy` makes the caller wait for
//! revalidation once an entry is older than its TTL. `LruBackground` always
//! answers from the cache when it can and refreshes in the background,
//! either one task per stale access or one poll task for every warm
//! template.
//!
//! The entry map is guarded by a plain mutex that is never held across an
//! await point; all fetching and compiling happens outside of it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use once_cell::sync::OnceCell;
use templar::{CompiledTemplate, Template, VersionToken, is_stale};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{ConfigError, RegistryConfig, invalid};
use crate::error::{RegistryError, Result};
use crate::identity::LoaderIdentity;
use crate::loader::{LoadedTemplate, TemplateLoader};
use crate::refresher::RefresherHandle;

/// Shortest interval a poll refresher runs with
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// When a background-refreshed cache goes back to the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// A hit older than the TTL spawns one refresh for that template
    OnAccess,
    /// A single task refreshes every warm template each `interval`
    Poll { interval: Duration },
}

/// Caching policy of a [`Registry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Every lookup loads from the source
    NoCache,
    /// Entries older than `ttl` are revalidated before they are served
    TtlLazy { capacity: usize, ttl: Duration },
    /// Entries are served immediately and refreshed in the background
    LruBackground {
        capacity: usize,
        ttl: Duration,
        refresh: RefreshMode,
    },
}

impl CachePolicy {
    /// Maximum number of cached entries, zero when caching is off
    pub fn capacity(&self) -> usize {
        match self {
            CachePolicy::NoCache => 0,
            CachePolicy::TtlLazy { capacity, .. } | CachePolicy::LruBackground { capacity, .. } => {
                *capacity
            }
        }
    }

    /// Check that a bounded policy has room for an entry and that a poll
    /// interval is non-zero.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !matches!(self, CachePolicy::NoCache) && self.capacity() == 0 {
            return Err(invalid("capacity", "capacity must be at least 1"));
        }
        if let CachePolicy::LruBackground {
            refresh: RefreshMode::Poll { interval },
            ..
        } = self
        {
            if interval.is_zero() {
                return Err(invalid("refresh interval", "interval must be non-zero"));
            }
        }
        Ok(())
    }

    /// Raise a zero capacity to 1 and a poll interval to [`MIN_POLL_INTERVAL`]
    fn clamped(self) -> Self {
        match self {
            CachePolicy::NoCache => CachePolicy::NoCache,
            CachePolicy::TtlLazy { capacity, ttl } => CachePolicy::TtlLazy {
                capacity: capacity.max(1),
                ttl,
            },
            CachePolicy::LruBackground {
                capacity,
                ttl,
                refresh,
            } => CachePolicy::LruBackground {
                capacity: capacity.max(1),
                ttl,
                refresh: match refresh {
                    RefreshMode::Poll { interval } => RefreshMode::Poll {
                        interval: interval.max(MIN_POLL_INTERVAL),
                    },
                    RefreshMode::OnAccess => RefreshMode::OnAccess,
                },
            },
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::TtlLazy {
            capacity: 100,
            ttl: Duration::from_secs(30),
        }
    }
}

/// Where a facade template comes from
pub enum TemplateSource {
    /// Source text given directly; never cached
    Raw(String),
    /// A template location resolved through the registry
    Loader(Arc<dyn TemplateLoader>),
}

impl fmt::Debug for TemplateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateSource::Raw(source) => f.debug_tuple("Raw").field(source).finish(),
            TemplateSource::Loader(loader) => {
                f.debug_tuple("Loader").field(loader.identity()).finish()
            }
        }
    }
}

/// Snapshot of one cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub version: Option<VersionToken>,
    /// Wall-clock time of the last load or successful revalidation
    pub refreshed_at: OffsetDateTime,
    pub age: Duration,
}

impl fmt::Display for EntryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let refreshed_at = self.refreshed_at.format(&Rfc3339).map_err(|_| fmt::Error)?;
        match &self.version {
            Some(version) => write!(f, "version {} refreshed at {}", version, refreshed_at),
            None => write!(f, "untracked version refreshed at {}", refreshed_at),
        }
    }
}

struct CacheEntry {
    template: Arc<CompiledTemplate>,
    version: Option<VersionToken>,
    refreshed: Instant,
    refreshed_at: OffsetDateTime,
}

impl CacheEntry {
    fn new(template: Arc<CompiledTemplate>, version: Option<VersionToken>) -> Self {
        Self {
            template,
            version,
            refreshed: Instant::now(),
            refreshed_at: OffsetDateTime::now_utc(),
        }
    }

    fn touch(&mut self) {
        self.refreshed = Instant::now();
        self.refreshed_at = OffsetDateTime::now_utc();
    }

    fn is_due(&self, ttl: Duration) -> bool {
        self.refreshed.elapsed() >= ttl
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by every handle of one registry and its background tasks
pub(crate) struct Shared {
    policy: CachePolicy,
    entries: Mutex<LruCache<LoaderIdentity, CacheEntry>>,
    in_flight: Mutex<HashSet<LoaderIdentity>>,
    idle: Notify,
    warm: Mutex<HashMap<LoaderIdentity, Arc<dyn TemplateLoader>>>,
    failures: Mutex<HashMap<LoaderIdentity, u32>>,
    refresher: Mutex<Option<RefresherHandle>>,
    shut_down: AtomicBool,
    /// Bumped by every reset while the entry lock is held
    epoch: AtomicU64,
}

/// Marks one identity as being refreshed until dropped
struct InFlight {
    shared: Arc<Shared>,
    identity: LoaderIdentity,
}

impl InFlight {
    fn acquire(shared: &Arc<Shared>, identity: &LoaderIdentity) -> Option<Self> {
        let mut in_flight = lock(&shared.in_flight);
        if shared.is_shut_down() || !in_flight.insert(identity.clone()) {
            return None;
        }
        Some(Self {
            shared: shared.clone(),
            identity: identity.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.shared.in_flight).remove(&self.identity);
        self.shared.idle.notify_waiters();
    }
}

impl Shared {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Insert a freshly loaded template, evicting as the policy requires.
    ///
    /// With `epoch` set the insert is skipped when a reset happened since,
    /// and the template is only handed back.
    fn store(
        &self,
        identity: LoaderIdentity,
        loaded: LoadedTemplate,
        epoch: Option<u64>,
    ) -> Arc<CompiledTemplate> {
        let template = Arc::new(loaded.template);
        let entry = CacheEntry::new(template.clone(), loaded.version);

        let evicted = {
            let mut entries = lock(&self.entries);
            if epoch.is_some_and(|epoch| epoch != self.epoch()) {
                debug!("Registry reset while loading {}, not caching", identity);
                return template;
            }
            let mut evicted = self.sweep_lapsed(&mut entries);
            if let Some((old, _)) = entries.push(identity.clone(), entry) {
                if old != identity {
                    evicted.push(old);
                }
            }
            evicted
        };

        self.forget_evicted(&evicted);
        template
    }

    /// Remove entries older than the TTL of a lazy policy
    fn sweep_lapsed(
        &self,
        entries: &mut LruCache<LoaderIdentity, CacheEntry>,
    ) -> Vec<LoaderIdentity> {
        let CachePolicy::TtlLazy { ttl, .. } = self.policy else {
            return Vec::new();
        };
        let lapsed: Vec<LoaderIdentity> = entries
            .iter()
            .filter(|(_, entry)| entry.is_due(ttl))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &lapsed {
            entries.pop(id);
        }
        lapsed
    }

    /// Lock the entries after dropping lapsed ones, then run `f` on them
    fn with_live_entries<R>(
        &self,
        f: impl FnOnce(&mut LruCache<LoaderIdentity, CacheEntry>) -> R,
    ) -> R {
        let (result, lapsed) = {
            let mut entries = lock(&self.entries);
            let lapsed = self.sweep_lapsed(&mut entries);
            (f(&mut entries), lapsed)
        };
        self.forget_evicted(&lapsed);
        result
    }

    fn forget_evicted(&self, evicted: &[LoaderIdentity]) {
        if evicted.is_empty() {
            return;
        }
        for id in evicted {
            debug!("Evicted {}", id);
        }
        self.forget(evicted);
    }

    /// Drop the warm and failure bookkeeping of identities no longer cached
    fn forget(&self, identities: &[LoaderIdentity]) {
        {
            let mut warm = lock(&self.warm);
            for id in identities {
                warm.remove(id);
            }
        }
        let mut failures = lock(&self.failures);
        for id in identities {
            failures.remove(id);
        }
    }

    /// Bring one cached template up to date without surfacing errors.
    ///
    /// Without `load_missing` an identity that is not cached any more is
    /// left alone.
    async fn refresh(&self, loader: &Arc<dyn TemplateLoader>, load_missing: bool) {
        let id = loader.identity().clone();
        let (epoch, cached) = {
            let entries = lock(&self.entries);
            (self.epoch(), entries.peek(&id).map(|entry| entry.version.clone()))
        };
        if cached.is_none() && !load_missing {
            return;
        }

        let outcome = match &cached {
            Some(last) => match loader.current_version().await {
                Ok(current) if !is_stale(last.as_ref(), current.as_ref()) => Ok(None),
                Ok(_) => loader.load().await.map(Some),
                Err(e) => Err(e),
            },
            None => loader.load().await.map(Some),
        };

        if self.is_shut_down() {
            debug!("Registry shut down, discarding refresh of {}", id);
            return;
        }

        match outcome {
            Ok(None) => {
                let mut entries = lock(&self.entries);
                if self.epoch() == epoch {
                    if let Some(entry) = entries.peek_mut(&id) {
                        entry.touch();
                    }
                }
                debug!("{} unchanged", id);
            }
            Ok(Some(loaded)) if cached.is_some() => {
                let swapped = {
                    let mut entries = lock(&self.entries);
                    match entries.peek_mut(&id) {
                        Some(entry) if self.epoch() == epoch => {
                            *entry = CacheEntry::new(Arc::new(loaded.template), loaded.version);
                            true
                        }
                        _ => false,
                    }
                };
                if swapped {
                    debug!("Refreshed {}", id);
                } else {
                    debug!("{} evicted during refresh, discarding", id);
                }
            }
            Ok(Some(loaded)) => {
                self.store(id.clone(), loaded, Some(epoch));
                debug!("Warmed {}", id);
            }
            Err(e) => {
                // Failures only count for identities the registry still tracks
                let tracked = if cached.is_some() {
                    let entries = lock(&self.entries);
                    self.epoch() == epoch && entries.contains(&id)
                } else {
                    self.epoch() == epoch && lock(&self.warm).contains_key(&id)
                };
                if !tracked {
                    debug!("{} left the cache during refresh, dropping error: {}", id, e);
                    return;
                }
                let failures = {
                    let mut failures = lock(&self.failures);
                    let count = failures.entry(id.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                warn!(
                    "Background refresh of {} failed ({} in a row), keeping previous value: {}",
                    id, failures, e
                );
                return;
            }
        }
        lock(&self.failures).remove(&id);
    }

    /// One poll round over every warm template.
    pub(crate) async fn refresh_warm(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }
        let loaders: Vec<Arc<dyn TemplateLoader>> = lock(&self.warm).values().cloned().collect();
        debug!("Polling {} warm templates", loaders.len());

        for loader in loaders {
            if self.is_shut_down() {
                break;
            }
            let Some(_guard) = InFlight::acquire(self, loader.identity()) else {
                continue;
            };
            self.refresh(&loader, true).await;
        }
    }
}

/// Handle to a template cache.
///
/// Clones share the same cache, background refresher and shutdown state.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    /// Registry with `policy`.
    ///
    /// A bounded policy with capacity 0 holds one entry, and a zero poll
    /// interval runs at [`MIN_POLL_INTERVAL`]. Use [`try_new`](Self::try_new)
    /// to reject such policies instead.
    pub fn new(policy: CachePolicy) -> Self {
        let policy = policy.clamped();
        let capacity = NonZeroUsize::new(policy.capacity()).unwrap_or(NonZeroUsize::MIN);
        Self {
            shared: Arc::new(Shared {
                policy,
                entries: Mutex::new(LruCache::new(capacity)),
                in_flight: Mutex::new(HashSet::new()),
                idle: Notify::new(),
                warm: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                refresher: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Registry with `policy`, failing if [`CachePolicy::validate`] does
    pub fn try_new(policy: CachePolicy) -> std::result::Result<Self, ConfigError> {
        policy.validate()?;
        Ok(Self::new(policy))
    }

    pub fn from_config(config: &RegistryConfig) -> std::result::Result<Self, ConfigError> {
        Self::try_new(config.cache_policy()?)
    }

    pub fn policy(&self) -> CachePolicy {
        self.shared.policy
    }

    /// Resolve the compiled template of `loader`.
    ///
    /// With `use_cache` off, or under [`CachePolicy::NoCache`], the loader is
    /// called directly and cached state is neither read nor written.
    pub async fn get_template(
        &self,
        loader: Arc<dyn TemplateLoader>,
        use_cache: bool,
    ) -> Result<Arc<CompiledTemplate>> {
        match self.shared.policy {
            CachePolicy::NoCache => self.load_uncached(&loader).await,
            _ if !use_cache => self.load_uncached(&loader).await,
            CachePolicy::TtlLazy { ttl, .. } => self.get_lazy(loader, ttl).await,
            CachePolicy::LruBackground { ttl, refresh, .. } => {
                self.get_background(loader, ttl, refresh).await
            }
        }
    }

    async fn load_uncached(&self, loader: &Arc<dyn TemplateLoader>) -> Result<Arc<CompiledTemplate>> {
        debug!("Loading {} without cache", loader.identity());
        Ok(Arc::new(loader.load().await?.template))
    }

    async fn load_and_store(
        &self,
        loader: &Arc<dyn TemplateLoader>,
    ) -> Result<Arc<CompiledTemplate>> {
        let id = loader.identity().clone();
        debug!("Cache miss for {}", id);
        let loaded = loader.load().await?;
        Ok(self.shared.store(id, loaded, None))
    }

    async fn get_lazy(
        &self,
        loader: Arc<dyn TemplateLoader>,
        ttl: Duration,
    ) -> Result<Arc<CompiledTemplate>> {
        let id = loader.identity();
        let cached = lock(&self.shared.entries)
            .get(id)
            .map(|entry| (entry.template.clone(), entry.version.clone(), entry.is_due(ttl)));

        if let Some((template, version, due)) = cached {
            if !due {
                debug!("Cache hit for {}", id);
                return Ok(template);
            }
            let current = loader.current_version().await?;
            if !is_stale(version.as_ref(), current.as_ref()) {
                if let Some(entry) = lock(&self.shared.entries).peek_mut(id) {
                    entry.touch();
                }
                debug!("Revalidated {}", id);
                return Ok(template);
            }
        }
        self.load_and_store(&loader).await
    }

    async fn get_background(
        &self,
        loader: Arc<dyn TemplateLoader>,
        ttl: Duration,
        refresh: RefreshMode,
    ) -> Result<Arc<CompiledTemplate>> {
        let cached = lock(&self.shared.entries)
            .get(loader.identity())
            .map(|entry| (entry.template.clone(), entry.is_due(ttl)));

        if let Some((template, due)) = cached {
            debug!("Cache hit for {}", loader.identity());
            if due && refresh == RefreshMode::OnAccess {
                self.spawn_refresh(loader);
            }
            return Ok(template);
        }

        let template = self.load_and_store(&loader).await?;
        if let RefreshMode::Poll { interval } = refresh {
            self.keep_warm(loader);
            self.start_refresher(interval);
        }
        Ok(template)
    }

    fn spawn_refresh(&self, loader: Arc<dyn TemplateLoader>) {
        if self.shared.is_shut_down() {
            return;
        }
        let Some(guard) = InFlight::acquire(&self.shared, loader.identity()) else {
            debug!("Refresh of {} already in flight", loader.identity());
            return;
        };
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let _guard = guard;
            shared.refresh(&loader, false).await;
        });
    }

    /// Open a renderable template.
    ///
    /// Raw sources are compiled on the spot and never touch the cache.
    pub async fn open(&self, source: TemplateSource, use_cache: bool) -> Result<Template> {
        match source {
            TemplateSource::Raw(source) => Ok(Template::from_raw(source)?),
            TemplateSource::Loader(loader) => {
                let compiled = self.get_template(loader.clone(), use_cache).await?;
                Ok(Template::from_compiled(loader.identity(), compiled))
            }
        }
    }

    /// Add `loader` to the set the poll refresher keeps fresh.
    ///
    /// A warm template that is not cached yet is loaded on the next poll.
    pub fn keep_warm(&self, loader: Arc<dyn TemplateLoader>) {
        let id = loader.identity().clone();
        lock(&self.shared.warm).insert(id, loader);
    }

    /// Start the poll refresher unless it runs already or the registry was
    /// shut down. Returns whether a new refresher was started.
    ///
    /// `interval` is raised to [`MIN_POLL_INTERVAL`]. Must be called from
    /// within a Tokio runtime.
    pub fn start_refresher(&self, interval: Duration) -> bool {
        let interval = interval.max(MIN_POLL_INTERVAL);
        if self.shared.is_shut_down() {
            debug!("Registry shut down, not starting refresher");
            return false;
        }
        let mut refresher = lock(&self.shared.refresher);
        if refresher.is_some() {
            return false;
        }
        *refresher = Some(RefresherHandle::spawn(
            Arc::downgrade(&self.shared),
            interval,
        ));
        true
    }

    /// Stop all background work and wait for it to finish.
    ///
    /// Calling this more than once, or on a registry that never started a
    /// refresher, is fine. Lookups keep working afterwards but no refresh
    /// is ever started again.
    pub async fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);

        let refresher = lock(&self.shared.refresher).take();
        if let Some(refresher) = refresher {
            refresher.stop().await;
        }

        loop {
            let mut drained = pin!(self.shared.idle.notified());
            drained.as_mut().enable();
            if lock(&self.shared.in_flight).is_empty() {
                break;
            }
            drained.await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Forget everything about one identity. Returns whether it was cached.
    pub fn invalidate(&self, identity: &LoaderIdentity) -> bool {
        let removed = lock(&self.shared.entries).pop(identity).is_some();
        self.shared.forget(std::slice::from_ref(identity));
        removed
    }

    /// Drop every cached entry and all warm-set bookkeeping.
    ///
    /// Background refreshes that started before the reset finish without
    /// writing anything back. A running poll refresher stays up with an
    /// empty warm set.
    pub fn reset(&self) {
        {
            let mut entries = lock(&self.shared.entries);
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            entries.clear();
        }
        lock(&self.shared.warm).clear();
        lock(&self.shared.failures).clear();
    }

    /// Whether `identity` is cached. Under a lazy policy, entries past
    /// their TTL are dropped first.
    pub fn contains(&self, identity: &LoaderIdentity) -> bool {
        self.shared.with_live_entries(|entries| entries.contains(identity))
    }

    pub fn len(&self) -> usize {
        self.shared.with_live_entries(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Version and refresh time of a cached entry, without touching its
    /// recency.
    pub fn entry_info(&self, identity: &LoaderIdentity) -> Option<EntryInfo> {
        self.shared.with_live_entries(|entries| {
            entries.peek(identity).map(|entry| EntryInfo {
                version: entry.version.clone(),
                refreshed_at: entry.refreshed_at,
                age: entry.refreshed.elapsed(),
            })
        })
    }

    /// Background refresh failures of `identity` since its last success
    pub fn refresh_failures(&self, identity: &LoaderIdentity) -> u32 {
        lock(&self.shared.failures)
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a background refresh of `identity` is running
    pub fn is_refreshing(&self, identity: &LoaderIdentity) -> bool {
        lock(&self.shared.in_flight).contains(identity)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("policy", &self.shared.policy)
            .field("entries", &self.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

static GLOBAL: OnceCell<Registry> = OnceCell::new();

/// Process-wide registry, configured from the environment on first use.
pub fn global() -> Result<&'static Registry> {
    GLOBAL.get_or_try_init(|| -> Result<Registry> {
        let config = RegistryConfig::from_env()?;
        Ok(Registry::from_config(&config)?)
    })
}

/// Initialize the process-wide registry with an explicit configuration.
///
/// Fails if [`global`] or this function already ran.
pub fn init_global(config: &RegistryConfig) -> Result<&'static Registry> {
    let registry = Registry::from_config(config)?;
    GLOBAL
        .try_insert(registry)
        .map_err(|_| RegistryError::from(ConfigError::AlreadyInitialized))
}
