use std::sync::{Arc, Condvar, Mutex, RwLock};

use crate::utils::sync;
use crate::{DocumentRef, Marker, ResourceFactory};

/// The result of a successful populate, together with the marker it was built from.
#[derive(Debug, Clone)]
pub(crate) struct Populated<R> {
    pub marker: Marker,
    pub loader_result: R,
}

/// Tracks whether an entry's resource is up to date.
///
/// `Idle` means the resource was never populated successfully, and compares unequal to every
/// real marker. Only the refresh path transitions between states.
#[derive(Debug)]
pub(crate) enum RefreshState<R> {
    Idle,
    Populating { previous: Option<Populated<R>> },
    Ready(Populated<R>),
}

/// What a refresh call has to do after inspecting the [`RefreshState`].
pub(crate) enum Begin<R> {
    /// The resource is already built from the current marker.
    Current { loader_result: R, waited: bool },
    /// The caller is now responsible for populating, and must call
    /// [`EntryState::finish_populate`] afterwards.
    Populate { waited: bool },
}

/// The part of an entry that is shared with all handles.
pub(crate) struct EntryState<F: ResourceFactory> {
    /// `None` once the resource has been deallocated.
    pub resource: RwLock<Option<F::Resource>>,
    refresh: Mutex<RefreshState<F::LoaderResult>>,
    refreshed: Condvar,
}

impl<F: ResourceFactory> EntryState<F> {
    pub fn new(resource: F::Resource) -> Self {
        Self {
            resource: RwLock::new(Some(resource)),
            refresh: Mutex::new(RefreshState::Idle),
            refreshed: Condvar::new(),
        }
    }

    /// Whether a refresh against `marker` would populate the resource.
    ///
    /// An in-flight populate counts as not refreshed yet, it may still fail.
    pub fn needs_refresh(&self, marker: Marker) -> bool {
        match &*sync::lock(&self.refresh) {
            RefreshState::Idle | RefreshState::Populating { .. } => true,
            RefreshState::Ready(populated) => populated.marker != marker,
        }
    }

    /// Waits for any in-flight populate, then either returns the current result or switches the
    /// entry into `Populating`.
    pub fn begin_populate(&self, marker: Marker) -> Begin<F::LoaderResult> {
        let mut state = sync::lock(&self.refresh);
        let mut waited = false;
        while matches!(*state, RefreshState::Populating { .. }) {
            waited = true;
            state = sync::wait(&self.refreshed, state);
        }
        if let RefreshState::Ready(populated) = &*state {
            if populated.marker == marker {
                return Begin::Current {
                    loader_result: populated.loader_result.clone(),
                    waited,
                };
            }
        }

        let previous = match std::mem::replace(&mut *state, RefreshState::Idle) {
            RefreshState::Ready(populated) => Some(populated),
            RefreshState::Idle => None,
            RefreshState::Populating { .. } => unreachable!("we waited for this above"),
        };
        *state = RefreshState::Populating { previous };
        Begin::Populate { waited }
    }

    /// Leaves the `Populating` state and wakes up all waiting refreshes.
    ///
    /// Without an `outcome` (failed or panicked populate) the previous state is restored.
    pub fn finish_populate(&self, outcome: Option<Populated<F::LoaderResult>>) {
        let mut state = sync::lock(&self.refresh);
        let previous = match std::mem::replace(&mut *state, RefreshState::Idle) {
            RefreshState::Populating { previous, .. } => previous,
            other => {
                tracing::error!(kind = F::KIND, "Finished a populate that was never started");
                *state = other;
                return;
            }
        };
        *state = match outcome.or(previous) {
            Some(populated) => RefreshState::Ready(populated),
            None => RefreshState::Idle,
        };
        self.refreshed.notify_all();
    }

    /// The loader result of the last successful populate, if it was built from `marker`.
    pub fn populated_for(&self, marker: Marker) -> Option<F::LoaderResult> {
        let state = sync::lock(&self.refresh);
        let populated = match &*state {
            RefreshState::Idle => None,
            RefreshState::Populating { previous, .. } => previous.as_ref(),
            RefreshState::Ready(populated) => Some(populated),
        }?;
        (populated.marker == marker).then(|| populated.loader_result.clone())
    }

    #[cfg(test)]
    fn last_populated(&self) -> Option<Populated<F::LoaderResult>> {
        match &*sync::lock(&self.refresh) {
            RefreshState::Idle => None,
            RefreshState::Populating { previous, .. } => previous.clone(),
            RefreshState::Ready(populated) => Some(populated.clone()),
        }
    }

    /// Takes the resource out for deallocation.
    ///
    /// This waits for a running populate, as that holds the write lock.
    pub fn take_resource(&self) -> Option<F::Resource> {
        sync::write(&self.resource).take()
    }
}

/// The record a [`ResourceCache`](crate::ResourceCache) keeps per live derived resource.
///
/// `use_count` is only ever touched under the cache's map lock, and an entry is removed from
/// the map in the same critical section that decrements it to zero.
pub(crate) struct RegistryEntry<F: ResourceFactory> {
    pub document: DocumentRef<F::Document>,
    pub use_count: usize,
    pub state: Arc<EntryState<F>>,
}

impl<F: ResourceFactory> RegistryEntry<F> {
    pub fn new(document: DocumentRef<F::Document>, resource: F::Resource) -> Self {
        Self {
            document,
            use_count: 1,
            state: Arc::new(EntryState::new(resource)),
        }
    }
}
