use std::collections::hash_map::Entry;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLockReadGuard};
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::config::CacheConfig;
use crate::entry::{Begin, EntryState, Populated, RegistryEntry};
use crate::utils::{defer, sync};
use crate::{CacheError, Document, DocumentRef, ResourceFactory, ResourceKey, SharedDocument};

/// The outcome of [`ResourceCache::refresh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refreshed<R> {
    /// `true` if this call populated the resource.
    pub updated: bool,
    /// The loader result of the populate the resource is currently built from.
    pub loader_result: R,
}

/// A snapshot of the counters of a [`ResourceCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of `acquire` calls.
    pub acquires: u64,
    /// Number of entries that were created.
    pub created: u64,
    /// Number of successful `release` calls.
    pub releases: u64,
    /// Number of entries that were destroyed.
    pub destroyed: u64,
    /// Number of `refresh` calls that got past the handle and document checks.
    pub refreshes: u64,
    /// Number of times the factory's `populate` was invoked.
    pub populates: u64,
    /// Number of populates that returned an error.
    pub populate_failures: u64,
    /// Number of refreshes that had to wait for a concurrent populate of the same entry.
    pub refresh_waits: u64,
    /// Number of entries currently in the cache.
    pub live: usize,
}

#[derive(Default)]
struct Counters {
    acquires: AtomicU64,
    created: AtomicU64,
    releases: AtomicU64,
    destroyed: AtomicU64,
    refreshes: AtomicU64,
    populates: AtomicU64,
    populate_failures: AtomicU64,
    refresh_waits: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A consumer's reference to one derived resource, returned by [`ResourceCache::acquire`].
///
/// Every handle stands for exactly one logical reference and has to be passed to
/// [`ResourceCache::release`] exactly once. Handles are not `Clone`; acquire again to get
/// another reference. A released handle no longer refers to anything, even while other handles
/// keep its entry alive.
pub struct ResourceHandle<F: ResourceFactory> {
    key: ResourceKey,
    state: Arc<EntryState<F>>,
    /// Only written under the cache's map lock.
    released: AtomicBool,
}

impl<F: ResourceFactory> ResourceHandle<F> {
    fn new(key: ResourceKey, state: Arc<EntryState<F>>) -> Self {
        Self {
            key,
            state,
            released: AtomicBool::new(false),
        }
    }

    /// The identity key of the referenced resource.
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Whether this handle's reference was already given up.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Gives shared read access to the resource.
    ///
    /// This blocks while the resource is being populated. Fails with
    /// [`CacheError::UnknownResource`] once the handle was released or the resource has been
    /// deallocated.
    ///
    /// The guard only locks the resource, never the document, so the document may be mutated
    /// while it is held. Drop it before refreshing or releasing the same resource on this
    /// thread, as both wait for all readers to finish.
    pub fn read(&self) -> Result<ResourceGuard<'_, F>, CacheError> {
        if self.is_released() {
            return Err(CacheError::UnknownResource {
                key: self.key.clone(),
            });
        }
        let guard = sync::read(&self.state.resource);
        if guard.is_none() {
            return Err(CacheError::UnknownResource {
                key: self.key.clone(),
            });
        }
        Ok(ResourceGuard { guard })
    }
}

impl<F: ResourceFactory> fmt::Debug for ResourceHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("kind", &F::KIND)
            .field("key", &self.key)
            .finish()
    }
}

/// Read access to a derived resource, see [`ResourceHandle::read`].
pub struct ResourceGuard<'a, F: ResourceFactory> {
    guard: RwLockReadGuard<'a, Option<F::Resource>>,
}

impl<F: ResourceFactory> Deref for ResourceGuard<'_, F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        match &*self.guard {
            Some(resource) => resource,
            None => unreachable!("guards are only created for present resources"),
        }
    }
}

/// A [`ResourceHandle`] that releases itself when dropped.
///
/// The handle itself is not exposed, so the lease's reference can only be given up once, either
/// by [`release`](Self::release) or on drop. Release errors on drop are logged, as there is
/// nobody to return them to.
pub struct ResourceLease<'a, F: ResourceFactory> {
    cache: &'a ResourceCache<F>,
    handle: ResourceHandle<F>,
}

impl<F: ResourceFactory> ResourceLease<'_, F> {
    /// See [`ResourceHandle::key`].
    pub fn key(&self) -> &ResourceKey {
        self.handle.key()
    }

    /// See [`ResourceHandle::read`].
    pub fn read(&self) -> Result<ResourceGuard<'_, F>, CacheError> {
        self.handle.read()
    }

    /// See [`ResourceCache::use_count`].
    pub fn use_count(&self) -> Option<usize> {
        self.cache.use_count(&self.handle)
    }

    /// See [`ResourceCache::refresh`].
    pub fn refresh(&self) -> Result<Refreshed<F::LoaderResult>, CacheError> {
        self.cache.refresh(&self.handle)
    }

    /// See [`ResourceCache::needs_refresh`].
    pub fn needs_refresh(&self) -> Result<bool, CacheError> {
        self.cache.needs_refresh(&self.handle)
    }

    /// Releases the lease now instead of on drop, returning any error.
    pub fn release(self) -> Result<(), CacheError> {
        let result = self.cache.release(&self.handle);
        // the reference is gone either way, dropping must not try again
        self.handle.released.store(true, Ordering::Release);
        result
    }
}

impl<F: ResourceFactory> Drop for ResourceLease<'_, F> {
    fn drop(&mut self) {
        if self.handle.is_released() {
            return;
        }
        if let Err(error) = self.cache.release(&self.handle) {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                "Failed to release leased resource"
            );
        }
    }
}

/// Shares one derived resource per identity key between all consumers.
///
/// Entries are created by [`acquire`](Self::acquire) and destroyed by the
/// [`release`](Self::release) that drops their use count to zero. The content of a resource is
/// only ever built by [`refresh`](Self::refresh), at most once per modification marker of its
/// document.
///
/// # Locking
///
/// The map lock is only held for lookups and bookkeeping, never while populating. Each entry has
/// its own refresh state: a refresh that finds another refresh populating the same entry waits
/// for it to finish and then re-checks the marker, so concurrent refreshes of an unchanged
/// document populate exactly once. Different entries always populate independently, even if
/// they are derived from the same document.
///
/// Nothing in the cache waits for a document or resource lock while holding another lock, so a
/// consumer holding a [`ResourceGuard`] may still mutate the document, and a consumer holding
/// the document's write lock may still read the resource.
pub struct ResourceCache<F: ResourceFactory> {
    factory: F,
    config: CacheConfig,
    entries: Mutex<FxHashMap<ResourceKey, RegistryEntry<F>>>,
    counters: Counters,
}

impl<F: ResourceFactory> ResourceCache<F> {
    /// Creates an empty cache with the default [`CacheConfig`].
    pub fn new(factory: F) -> Self {
        Self::with_config(factory, CacheConfig::default())
    }

    /// Creates an empty cache.
    pub fn with_config(factory: F, config: CacheConfig) -> Self {
        Self {
            factory,
            config,
            entries: Mutex::default(),
            counters: Counters::default(),
        }
    }

    /// The factory this cache builds resources with.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Returns a reference to the shared resource of `document` and `suffix`.
    ///
    /// A new, empty resource is allocated if there is none yet. Acquiring never populates, call
    /// [`refresh`](Self::refresh) before using the resource.
    pub fn acquire(
        &self,
        document: &SharedDocument<F::Document>,
        suffix: &str,
    ) -> ResourceHandle<F> {
        let key = Self::key_for(document, suffix);
        bump(&self.counters.acquires);
        metric!(counter("resources.acquire") += 1, "kind" => F::KIND);

        let mut entries = sync::lock(&self.entries);
        let state = match entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.use_count += 1;
                tracing::trace!(
                    kind = F::KIND,
                    %key,
                    use_count = entry.use_count,
                    "Sharing existing resource"
                );
                return ResourceHandle::new(key, Arc::clone(&entry.state));
            }
            Entry::Vacant(vacant) => {
                let resource = self.factory.allocate(&key);
                let entry = vacant.insert(RegistryEntry::new(DocumentRef::new(document), resource));
                Arc::clone(&entry.state)
            }
        };

        bump(&self.counters.created);
        metric!(counter("resources.created") += 1, "kind" => F::KIND);
        metric!(gauge("resources.live") = entries.len() as u64, "kind" => F::KIND);
        tracing::debug!(kind = F::KIND, %key, "Allocated resource");

        ResourceHandle::new(key, state)
    }

    /// Like [`acquire`](Self::acquire), but releases the reference when the lease is dropped.
    pub fn lease(
        &self,
        document: &SharedDocument<F::Document>,
        suffix: &str,
    ) -> ResourceLease<'_, F> {
        ResourceLease {
            cache: self,
            handle: self.acquire(document, suffix),
        }
    }

    /// Gives up the reference held by `handle`.
    ///
    /// The release that drops the use count to zero removes the entry and deallocates the
    /// resource. Releasing the same handle twice, or a handle of another cache, fails with
    /// [`CacheError::UnknownResource`] without touching any entry, even if other handles still
    /// share it.
    pub fn release(&self, handle: &ResourceHandle<F>) -> Result<(), CacheError> {
        let removed = {
            let mut entries = sync::lock(&self.entries);
            let Entry::Occupied(mut occupied) = entries.entry(handle.key.clone()) else {
                return Err(self.unknown(handle));
            };
            if !Arc::ptr_eq(&occupied.get().state, &handle.state)
                || handle.released.swap(true, Ordering::AcqRel)
            {
                return Err(self.unknown(handle));
            }

            bump(&self.counters.releases);
            metric!(counter("resources.release") += 1, "kind" => F::KIND);

            let entry = occupied.get_mut();
            entry.use_count -= 1;
            if entry.use_count > 0 {
                tracing::trace!(
                    kind = F::KIND,
                    key = %handle.key,
                    use_count = entry.use_count,
                    "Released shared resource"
                );
                return Ok(());
            }

            let removed = occupied.remove();
            metric!(gauge("resources.live") = entries.len() as u64, "kind" => F::KIND);
            removed
        };

        // The entry is already unreachable, so a slow deallocation does not block the map.
        self.destroy(&handle.key, &removed.state);
        Ok(())
    }

    /// Whether [`refresh`](Self::refresh) would populate the resource right now.
    ///
    /// While another refresh is populating the entry this is `true`, as that populate may still
    /// fail and leave the old content in place.
    pub fn needs_refresh(&self, handle: &ResourceHandle<F>) -> Result<bool, CacheError> {
        let document = self.live_document(handle)?;
        let marker = sync::read(&document).modification_marker();
        Ok(handle.state.needs_refresh(marker))
    }

    /// Brings the resource up to date with its document.
    ///
    /// If the resource was last populated from the document's current modification marker, this
    /// returns the stored loader result with `updated: false`. Otherwise the factory populates
    /// the resource, with the document read-locked and the resource write-locked for the whole
    /// call. Both locks are taken without holding one while blocking on the other, so consumers
    /// may lock them in either order.
    ///
    /// A failed populate leaves the previously stored marker and loader result in place, so the
    /// next refresh tries again.
    #[tracing::instrument(skip_all, fields(kind = F::KIND, key = %handle.key))]
    pub fn refresh(
        &self,
        handle: &ResourceHandle<F>,
    ) -> Result<Refreshed<F::LoaderResult>, CacheError> {
        let document = self.live_document(handle)?;
        bump(&self.counters.refreshes);
        metric!(counter("resources.refresh") += 1, "kind" => F::KIND);

        let state = &handle.state;
        let marker = sync::read(&document).modification_marker();

        // No lock is held while waiting for a concurrent populate of this entry.
        let waited = match state.begin_populate(marker) {
            Begin::Current {
                loader_result,
                waited,
            } => {
                if waited {
                    self.record_wait();
                }
                tracing::trace!(marker, "Resource is up to date");
                return Ok(Refreshed {
                    updated: false,
                    loader_result,
                });
            }
            Begin::Populate { waited } => waited,
        };
        if waited {
            self.record_wait();
        }

        // Restores the previous state if populate fails, panics, or the resource is gone.
        let abort = defer(|| state.finish_populate(None));

        let (marker, result) = {
            let (document, mut slot) = sync::read_and_write(&document, &state.resource);
            // The document may have changed while we were waiting for the locks.
            let marker = document.modification_marker();
            if let Some(loader_result) = state.populated_for(marker) {
                tracing::trace!(marker, "Resource was populated while waiting");
                return Ok(Refreshed {
                    updated: false,
                    loader_result,
                });
            }
            let Some(resource) = slot.as_mut() else {
                return Err(self.unknown(handle));
            };

            bump(&self.counters.populates);
            metric!(counter("resources.populate") += 1, "kind" => F::KIND);
            tracing::debug!(marker, "Populating resource");

            let start = Instant::now();
            let result = self.factory.populate(&document, resource);
            let elapsed = start.elapsed();

            metric!(timer("resources.populate.duration") = elapsed, "kind" => F::KIND);
            if let Some(warn_after) = self.config.populate_warn_after {
                if elapsed > warn_after {
                    tracing::warn!(?elapsed, marker, "Populating resource took too long");
                }
            }
            (marker, result)
        };

        match result {
            Ok(loader_result) => {
                abort.cancel();
                state.finish_populate(Some(Populated {
                    marker,
                    loader_result: loader_result.clone(),
                }));
                Ok(Refreshed {
                    updated: true,
                    loader_result,
                })
            }
            Err(source) => {
                drop(abort);
                bump(&self.counters.populate_failures);
                metric!(counter("resources.populate.failed") += 1, "kind" => F::KIND);
                tracing::warn!(
                    error = &source as &dyn std::error::Error,
                    marker,
                    "Failed to populate resource"
                );
                Err(CacheError::PopulateFailed {
                    key: handle.key.clone(),
                    source,
                })
            }
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        sync::lock(&self.entries).len()
    }

    /// Whether there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current use count of the entry referenced by `handle`.
    ///
    /// Returns `None` for released handles and handles that have no entry in this cache.
    pub fn use_count(&self, handle: &ResourceHandle<F>) -> Option<usize> {
        let entries = sync::lock(&self.entries);
        let entry = entries.get(&handle.key)?;
        (Arc::ptr_eq(&entry.state, &handle.state) && !handle.is_released())
            .then_some(entry.use_count)
    }

    /// Whether an entry exists for `document` and `suffix`.
    pub fn contains(&self, document: &SharedDocument<F::Document>, suffix: &str) -> bool {
        let key = Self::key_for(document, suffix);
        sync::lock(&self.entries).contains_key(&key)
    }

    /// The keys of all live entries, sorted.
    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = sync::lock(&self.entries).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// A snapshot of this cache's counters.
    pub fn stats(&self) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            acquires: load(&self.counters.acquires),
            created: load(&self.counters.created),
            releases: load(&self.counters.releases),
            destroyed: load(&self.counters.destroyed),
            refreshes: load(&self.counters.refreshes),
            populates: load(&self.counters.populates),
            populate_failures: load(&self.counters.populate_failures),
            refresh_waits: load(&self.counters.refresh_waits),
            live: self.len(),
        }
    }

    /// Fails with [`CacheError::LeakedEntriesAtShutdown`] if any entry is still alive.
    pub fn check_empty(&self) -> Result<(), CacheError> {
        let keys = self.keys();
        if keys.is_empty() {
            return Ok(());
        }
        Err(CacheError::LeakedEntriesAtShutdown {
            kinds: vec![F::KIND],
            keys,
        })
    }

    fn key_for(document: &SharedDocument<F::Document>, suffix: &str) -> ResourceKey {
        ResourceKey::new(sync::read(document).key(), F::KIND, suffix)
    }

    fn unknown(&self, handle: &ResourceHandle<F>) -> CacheError {
        tracing::debug!(kind = F::KIND, key = %handle.key, "Handle has no entry in this cache");
        CacheError::UnknownResource {
            key: handle.key.clone(),
        }
    }

    /// Validates `handle` and returns a strong reference to its document.
    fn live_document(
        &self,
        handle: &ResourceHandle<F>,
    ) -> Result<SharedDocument<F::Document>, CacheError> {
        let entries = sync::lock(&self.entries);
        let entry = entries
            .get(&handle.key)
            .filter(|entry| Arc::ptr_eq(&entry.state, &handle.state) && !handle.is_released())
            .ok_or_else(|| self.unknown(handle))?;

        entry.document.upgrade().ok_or_else(|| {
            tracing::error!(
                kind = F::KIND,
                key = %handle.key,
                use_count = entry.use_count,
                "Document was dropped while its resource is still in use"
            );
            CacheError::DocumentExpired {
                key: handle.key.clone(),
            }
        })
    }

    fn record_wait(&self) {
        bump(&self.counters.refresh_waits);
        metric!(counter("resources.refresh.wait") += 1, "kind" => F::KIND);
    }

    fn destroy(&self, key: &ResourceKey, state: &EntryState<F>) {
        if let Some(resource) = state.take_resource() {
            self.factory.deallocate(resource);
        }
        bump(&self.counters.destroyed);
        metric!(counter("resources.destroyed") += 1, "kind" => F::KIND);
        tracing::debug!(kind = F::KIND, %key, "Destroyed resource");
    }
}

impl<F: ResourceFactory> fmt::Debug for ResourceCache<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("kind", &F::KIND)
            .field("keys", &self.keys())
            .finish()
    }
}

impl<F: ResourceFactory> Drop for ResourceCache<F> {
    fn drop(&mut self) {
        let entries = std::mem::take(
            self.entries
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if entries.is_empty() {
            return;
        }

        let mut keys: Vec<_> = entries.keys().cloned().collect();
        keys.sort();
        tracing::error!(
            kind = F::KIND,
            leaked = keys.len(),
            ?keys,
            "Dropped resource cache with leaked resources"
        );
        for entry in entries.into_values() {
            if let Some(resource) = entry.state.take_resource() {
                self.factory.deallocate(resource);
            }
        }
    }
}
