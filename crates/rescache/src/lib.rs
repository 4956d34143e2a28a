//! A reference-counted cache for resources derived from long-lived documents.
//!
//! A [`ResourceCache`] hands out one shared derived resource per document and resource kind
//! (plus an optional suffix). Consumers [`acquire`](ResourceCache::acquire) a
//! [`ResourceHandle`], [`refresh`](ResourceCache::refresh) it before use, and
//! [`release`](ResourceCache::release) it when done. The last release destroys the resource.
//!
//! How a resource is built is up to a [`ResourceFactory`]. The cache only calls its
//! [`populate`](ResourceFactory::populate) when the document's modification marker changed
//! since the last successful populate, even if many consumers refresh concurrently.
//!
//! All caches of a process live in the [`CacheRegistry`] returned by [`registry`], which checks
//! for leaked references at [`teardown`](CacheRegistry::teardown).

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

mod cache;
pub mod config;
mod document;
mod entry;
mod error;
mod factory;
mod key;
pub mod logging;
mod registry;
mod utils;

pub use cache::{CacheStats, Refreshed, ResourceCache, ResourceGuard, ResourceHandle, ResourceLease};
pub use document::{Document, DocumentRef, Marker, SharedDocument, Versioned};
pub use error::{CacheError, PopulateError};
pub use factory::ResourceFactory;
pub use key::ResourceKey;
pub use registry::{CacheRegistry, init_registry, registry};
