use std::error::Error as StdError;

use thiserror::Error;

use crate::ResourceKey;

/// An error raised by [`ResourceFactory::populate`](crate::ResourceFactory::populate).
///
/// A failed populate is never cached. The entry keeps its previous state, so the next refresh
/// retries.
#[derive(Debug, Error)]
pub enum PopulateError {
    /// The document content is invalid for this kind of resource.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The document content is valid, but cannot be turned into this kind of resource.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Any other failure, like a failed upload.
    #[error("populate failed")]
    Failed(#[source] Box<dyn StdError + Send + Sync>),
}

impl PopulateError {
    /// Wraps an arbitrary error into [`PopulateError::Failed`].
    pub fn failed(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Failed(err.into())
    }
}

/// An error returned by the operations of a [`ResourceCache`](crate::ResourceCache).
///
/// None of these errors corrupt the cache. They are reported synchronously at the call site, and
/// most of them signal that a consumer violated its usage contract.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The handle has no registry entry in this cache.
    ///
    /// This is either a double release, a handle whose entry was already destroyed, or a handle
    /// that was obtained from a different cache instance.
    #[error("unknown resource `{key}`")]
    UnknownResource {
        /// The key the handle was created for.
        key: ResourceKey,
    },
    /// The source document was dropped while consumers still reference the derived resource.
    ///
    /// The entry is left untouched.
    #[error("document of resource `{key}` no longer exists")]
    DocumentExpired {
        /// The key of the affected resource.
        key: ResourceKey,
    },
    /// Populating the resource from its document failed.
    #[error("failed to populate resource `{key}`")]
    PopulateFailed {
        /// The key of the affected resource.
        key: ResourceKey,
        /// The error returned by the factory.
        #[source]
        source: PopulateError,
    },
    /// Caches still held entries at shutdown, meaning some consumer never released them.
    #[error(
        "{} resource(s) leaked at shutdown in {}: {}",
        .keys.len(),
        .kinds.join(", "),
        format_keys(.keys)
    )]
    LeakedEntriesAtShutdown {
        /// The resource kinds of the caches that leaked.
        kinds: Vec<&'static str>,
        /// The leaked keys.
        keys: Vec<ResourceKey>,
    },
}

impl CacheError {
    /// Merges multiple leak reports into one.
    ///
    /// Returns `None` if `errors` contains no [`LeakedEntriesAtShutdown`](Self::LeakedEntriesAtShutdown).
    pub(crate) fn merge_leaks(errors: impl IntoIterator<Item = CacheError>) -> Option<Self> {
        let mut all_kinds = Vec::new();
        let mut all_keys = Vec::new();
        for error in errors {
            if let Self::LeakedEntriesAtShutdown { kinds, keys } = error {
                all_kinds.extend(kinds);
                all_keys.extend(keys);
            }
        }
        if all_kinds.is_empty() {
            return None;
        }
        Some(Self::LeakedEntriesAtShutdown {
            kinds: all_kinds,
            keys: all_keys,
        })
    }
}

fn format_keys(keys: &[ResourceKey]) -> String {
    let keys: Vec<_> = keys.iter().map(ResourceKey::as_str).collect();
    keys.join(", ")
}
