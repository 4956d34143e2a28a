use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// The identity of one derived resource instance.
///
/// A key is formed as `{document_key}_{kind}{suffix}`. Two acquisitions with the same document
/// key, resource kind and suffix always resolve to the same cache entry for as long as any
/// consumer holds a reference to it.
///
/// **NOTE**: The suffix is appended verbatim, so callers that use suffixes need to make sure
/// they do not collide with other kinds, for example by starting them with a separator.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    key: Arc<str>,
}

impl ResourceKey {
    /// Creates the key for the `kind` resource of the document identified by `document_key`.
    pub fn new(document_key: &str, kind: &str, suffix: &str) -> Self {
        let mut key = String::with_capacity(document_key.len() + kind.len() + suffix.len() + 1);
        key.push_str(document_key);
        key.push('_');
        key.push_str(kind);
        key.push_str(suffix);
        Self { key: key.into() }
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.key, f)
    }
}

impl Borrow<str> for ResourceKey {
    fn borrow(&self) -> &str {
        &self.key
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}
