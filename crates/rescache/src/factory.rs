use crate::{Document, PopulateError, ResourceKey};

/// Knows how to build one kind of derived resource from a [`Document`].
///
/// There is one factory per resource kind, and one [`ResourceCache`](crate::ResourceCache) per
/// factory type. The cache decides *when* resources are allocated, populated and deallocated,
/// the factory decides *how*.
pub trait ResourceFactory: Send + Sync + 'static {
    /// The name of this resource kind, used in [`ResourceKey`]s, logs and metrics.
    const KIND: &'static str;

    /// The source document type.
    type Document: Document + Send + Sync + 'static;

    /// The derived resource.
    type Resource: Send + Sync + 'static;

    /// Kind-specific information produced by a successful populate.
    type LoaderResult: Clone + Send + Sync + 'static;

    /// Creates an empty, named resource.
    ///
    /// This is called while the cache holds its map lock, so it has to be cheap, and it must not
    /// read the document.
    fn allocate(&self, key: &ResourceKey) -> Self::Resource;

    /// Fills `resource` with content derived from `document`.
    ///
    /// This may take arbitrarily long. It runs outside of the cache lock, with the document
    /// read-locked and exclusive access to the resource. It has to be idempotent for the same
    /// document content.
    fn populate(
        &self,
        document: &Self::Document,
        resource: &mut Self::Resource,
    ) -> Result<Self::LoaderResult, PopulateError>;

    /// Releases the underlying storage of `resource`.
    ///
    /// The cache calls this exactly once per allocated resource.
    fn deallocate(&self, resource: Self::Resource) {
        drop(resource);
    }
}
