use rescache::ResourceCache;
use rescache_test as test;

pub use test::{CountingFactory, TestResult, document, set_text, touch};

/// Setup tests and create an empty cache around a fresh [`CountingFactory`].
pub fn setup_cache() -> ResourceCache<CountingFactory> {
    test::setup();
    ResourceCache::new(CountingFactory::new())
}

/// Asserts that `cache` holds no entries and deallocated everything it allocated.
#[track_caller]
pub fn assert_balanced(cache: &ResourceCache<CountingFactory>) {
    cache.check_empty().unwrap();
    let factory = cache.factory();
    assert_eq!(factory.allocated(), factory.deallocated());
}
