use std::fmt;
use std::sync::{Arc, RwLock, Weak};

/// The modification marker of a [`Document`].
pub type Marker = u64;

/// A long-lived source object that derived resources are built from.
///
/// The cache never owns a document. It only reads the stable [`key`](Document::key) and the
/// current [`modification_marker`](Document::modification_marker), and hands the document
/// read-locked to [`ResourceFactory::populate`](crate::ResourceFactory::populate).
pub trait Document {
    /// The stable identity of this document.
    fn key(&self) -> &str;

    /// A monotonically non-decreasing counter that changes on every mutation visible to caches.
    fn modification_marker(&self) -> Marker;
}

/// The externally owned form in which documents are passed to the cache.
///
/// Mutations must happen under the write lock, and must bump the modification marker before
/// the lock is released.
pub type SharedDocument<D> = Arc<RwLock<D>>;

/// A non-owning back reference from a cache entry to its source document.
pub struct DocumentRef<D> {
    inner: Weak<RwLock<D>>,
}

impl<D> DocumentRef<D> {
    /// Creates a back reference to `document` without keeping it alive.
    pub fn new(document: &SharedDocument<D>) -> Self {
        Self {
            inner: Arc::downgrade(document),
        }
    }

    /// Whether the referenced document still exists.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Gets a strong reference to the document, if it still exists.
    pub fn upgrade(&self) -> Option<SharedDocument<D>> {
        self.inner.upgrade()
    }
}

impl<D> Clone for DocumentRef<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<D> fmt::Debug for DocumentRef<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentRef")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// A [`Document`] wrapping arbitrary data, which bumps its marker on every mutable access.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    key: Arc<str>,
    marker: Marker,
    data: T,
}

impl<T> Versioned<T> {
    /// Creates a new document at marker `0`.
    pub fn new(key: impl Into<Arc<str>>, data: T) -> Self {
        Self {
            key: key.into(),
            marker: 0,
            data,
        }
    }

    /// Wraps this document into its shared form.
    pub fn shared(self) -> SharedDocument<Self> {
        Arc::new(RwLock::new(self))
    }

    /// Read-only access to the data.
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Mutable access to the data.
    ///
    /// The marker is bumped up front, so any derived resource is considered stale afterwards,
    /// even if the data ends up unchanged.
    pub fn data_mut(&mut self) -> &mut T {
        self.touch();
        &mut self.data
    }

    /// Applies `f` to the data and bumps the marker.
    pub fn modify<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        f(self.data_mut())
    }

    /// Bumps the marker without touching the data.
    pub fn touch(&mut self) {
        self.marker = self.marker.saturating_add(1);
    }
}

impl<T> Document for Versioned<T> {
    fn key(&self) -> &str {
        &self.key
    }

    fn modification_marker(&self) -> Marker {
        self.marker
    }
}
