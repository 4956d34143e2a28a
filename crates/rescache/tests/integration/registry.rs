use std::sync::Arc;
use std::time::Duration;

use rescache::config::Config;
use rescache::{
    CacheError, CacheRegistry, PopulateError, ResourceFactory, ResourceKey, Versioned,
};
use rescache_test as test;
use std::prelude::v1::test;

use crate::{CountingFactory, document};

/// Counts the words of a text document.
struct WordCount;

impl ResourceFactory for WordCount {
    const KIND: &'static str = "words";
    type Document = Versioned<String>;
    type Resource = usize;
    type LoaderResult = usize;

    fn allocate(&self, _key: &ResourceKey) -> usize {
        0
    }

    fn populate(
        &self,
        document: &Versioned<String>,
        resource: &mut usize,
    ) -> Result<usize, PopulateError> {
        *resource = document.data().split_whitespace().count();
        Ok(*resource)
    }
}

#[test]
fn test_caches_per_kind() {
    test::setup();
    let registry = CacheRegistry::default();
    let doc = document("doc", "three little words");

    let counting = registry.get_or_init(CountingFactory::new);
    let words = registry.get_or_init(|| WordCount);
    assert_eq!(registry.kinds(), ["counting", "words"]);

    // one document, one entry per kind
    let a = counting.acquire(&doc, "");
    let b = words.acquire(&doc, "");
    assert_eq!(a.key().as_str(), "doc_counting");
    assert_eq!(b.key().as_str(), "doc_words");
    assert_eq!(words.refresh(&b).unwrap().loader_result, 3);

    // the registry hands out the same instance every time
    let again = registry.get::<WordCount>().unwrap();
    assert!(Arc::ptr_eq(&words, &again));
    assert_eq!(again.use_count(&b), Some(1));

    counting.release(&a).unwrap();
    words.release(&b).unwrap();
    registry.teardown().unwrap();
    assert!(registry.get::<CountingFactory>().is_none());
}

#[test]
fn test_teardown_collects_leaks_of_all_caches() {
    test::setup();
    let registry = CacheRegistry::default();
    let doc = document("doc", "text");
    let other = document("other", "text");

    let counting = registry.get_or_init(CountingFactory::new);
    let words = registry.get_or_init(|| WordCount);
    let _leak1 = counting.acquire(&doc, "");
    let _leak2 = counting.acquire(&other, "#2");
    let released = words.acquire(&doc, "");
    let _leak3 = words.acquire(&other, "");
    words.release(&released).unwrap();

    let err = registry.teardown().unwrap_err();
    let CacheError::LeakedEntriesAtShutdown { kinds, keys } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(kinds, &["counting", "words"]);
    assert_eq!(keys.len(), 3);
    insta::assert_snapshot!(
        err.to_string(),
        @"3 resource(s) leaked at shutdown in counting, words: doc_counting, other_counting#2, other_words"
    );

    // a fresh cache after teardown
    let fresh = registry.get_or_init(CountingFactory::new);
    assert!(!Arc::ptr_eq(&fresh, &counting));
    assert!(fresh.is_empty());
}

#[test]
fn test_registry_from_config_file() {
    test::setup();
    let file = test::config_file(
        r#"
        caches:
          populate_warn_after: 1ms
        shutdown:
          panic_on_leaks: true
        "#,
    );
    let config = Config::get(Some(file.path())).unwrap();
    assert!(config.shutdown.panic_on_leaks);

    let registry = CacheRegistry::with_config(&config);
    let cache = registry.get_or_init(|| CountingFactory::with_delay(Duration::from_millis(5)));
    let doc = document("doc", "slow");

    // slow populates are only logged
    let handle = cache.acquire(&doc, "");
    assert!(cache.refresh(&handle).unwrap().updated);
    cache.release(&handle).unwrap();

    registry.teardown().unwrap();
}

#[test]
#[should_panic(expected = "1 resource(s) leaked at shutdown in counting: doc_counting")]
fn test_teardown_panics_when_configured() {
    test::setup();
    let mut config = Config::default();
    config.shutdown.panic_on_leaks = true;
    let registry = CacheRegistry::with_config(&config);

    let cache = registry.get_or_init(CountingFactory::new);
    let doc = document("doc", "text");
    let _leaked = cache.acquire(&doc, "");

    let _ = registry.teardown();
}
