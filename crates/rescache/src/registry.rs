//! The process-wide home of all resource caches.
//!
//! There is one [`ResourceCache`] per [`ResourceFactory`] type. Caches are created on first use
//! through [`CacheRegistry::get_or_init`] and live until [`CacheRegistry::teardown`], which
//! asserts that all of them are empty.
use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex, OnceLock};

use rustc_hash::FxHashMap;

use crate::config::{CacheConfig, Config, ShutdownConfig};
use crate::utils::sync;
use crate::{CacheError, ResourceCache, ResourceFactory};

static REGISTRY: OnceLock<CacheRegistry> = OnceLock::new();

/// Returns the process-wide registry, creating it with the default configuration if needed.
pub fn registry() -> &'static CacheRegistry {
    REGISTRY.get_or_init(CacheRegistry::default)
}

/// Creates the process-wide registry from `config`.
///
/// This should be called once during startup, before the first call to [`registry`]. If the
/// registry already exists, `config` is ignored with a warning.
pub fn init_registry(config: &Config) -> &'static CacheRegistry {
    let mut created = false;
    let registry = REGISTRY.get_or_init(|| {
        created = true;
        CacheRegistry::with_config(config)
    });
    if !created {
        tracing::warn!("Cache registry was already initialized, ignoring new configuration");
    }
    registry
}

/// The type-erased view of a [`ResourceCache`] that the registry needs at teardown.
trait RegisteredCache: Send + Sync {
    fn kind(&self) -> &'static str;
    fn check_empty(&self) -> Result<(), CacheError>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<F: ResourceFactory> RegisteredCache for ResourceCache<F> {
    fn kind(&self) -> &'static str {
        F::KIND
    }

    fn check_empty(&self) -> Result<(), CacheError> {
        ResourceCache::check_empty(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn downcast<F: ResourceFactory>(
    cache: &Arc<dyn RegisteredCache>,
) -> Option<Arc<ResourceCache<F>>> {
    Arc::clone(cache).into_any().downcast().ok()
}

/// A set of resource caches, keyed by their factory type.
///
/// Most code uses the process-wide instance returned by [`registry`], but tests can create
/// their own.
pub struct CacheRegistry {
    caches_config: CacheConfig,
    shutdown: ShutdownConfig,
    caches: Mutex<FxHashMap<TypeId, Arc<dyn RegisteredCache>>>,
}

impl CacheRegistry {
    /// Creates an empty registry.
    pub fn with_config(config: &Config) -> Self {
        Self {
            caches_config: config.caches,
            shutdown: config.shutdown,
            caches: Mutex::default(),
        }
    }

    /// Returns the cache for factory `F`, creating it with the factory returned by `init` first
    /// if there is none.
    ///
    /// `init` runs while the registry is locked, so it must not use the registry itself.
    pub fn get_or_init<F: ResourceFactory>(
        &self,
        init: impl FnOnce() -> F,
    ) -> Arc<ResourceCache<F>> {
        let mut caches = sync::lock(&self.caches);
        let cache = caches.entry(TypeId::of::<F>()).or_insert_with(|| {
            tracing::debug!(kind = F::KIND, "Creating resource cache");
            Arc::new(ResourceCache::with_config(init(), self.caches_config))
        });
        match downcast::<F>(cache) {
            Some(cache) => cache,
            None => unreachable!("caches are keyed by the type id of their factory"),
        }
    }

    /// Returns the cache for factory `F`, if it has been created.
    pub fn get<F: ResourceFactory>(&self) -> Option<Arc<ResourceCache<F>>> {
        sync::lock(&self.caches)
            .get(&TypeId::of::<F>())
            .and_then(downcast::<F>)
    }

    /// The resource kinds of all registered caches, sorted.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = sync::lock(&self.caches)
            .values()
            .map(|cache| cache.kind())
            .collect();
        kinds.sort_unstable();
        kinds
    }

    /// Checks that every cache is empty and removes all caches from the registry.
    ///
    /// Leaks are logged per cache and returned as one combined
    /// [`CacheError::LeakedEntriesAtShutdown`]. With
    /// [`panic_on_leaks`](ShutdownConfig::panic_on_leaks) set, a leak panics instead.
    ///
    /// A later [`get_or_init`](Self::get_or_init) starts over with a fresh cache.
    pub fn teardown(&self) -> Result<(), CacheError> {
        let mut caches: Vec<_> = sync::lock(&self.caches)
            .drain()
            .map(|(_, cache)| cache)
            .collect();
        caches.sort_by_key(|cache| cache.kind());

        let mut errors = Vec::new();
        for cache in &caches {
            if let Err(error) = cache.check_empty() {
                tracing::error!(
                    kind = cache.kind(),
                    error = &error as &dyn std::error::Error,
                    "Resource cache leaked entries"
                );
                errors.push(error);
            }
        }
        tracing::debug!(caches = caches.len(), "Tore down resource caches");
        drop(caches);

        match CacheError::merge_leaks(errors) {
            None => Ok(()),
            Some(error) if self.shutdown.panic_on_leaks => panic!("{error}"),
            Some(error) => Err(error),
        }
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::with_config(&Config::default())
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
