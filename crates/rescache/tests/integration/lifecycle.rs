use rescache::{CacheError, ResourceCache};

use crate::{CountingFactory, assert_balanced, document, setup_cache};

#[test]
fn test_same_key_shares_entry() {
    let cache = setup_cache();
    let doc = document("doc", "content");

    let h1 = cache.acquire(&doc, "");
    let h2 = cache.acquire(&doc, "");

    assert_eq!(h1.key(), h2.key());
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.use_count(&h1), Some(2));
    assert_eq!(cache.factory().allocated(), 1);

    // populating through one handle is visible through the other
    cache.refresh(&h1).unwrap();
    assert_eq!(h2.read().unwrap().text.as_deref(), Some("content"));
    assert!(!cache.refresh(&h2).unwrap().updated);
    assert_eq!(cache.factory().populated(), 1);

    cache.release(&h1).unwrap();
    cache.release(&h2).unwrap();
    assert_balanced(&cache);
}

#[test]
fn test_suffix_creates_separate_entry() {
    let cache = setup_cache();
    let doc = document("doc", "content");

    let left = cache.acquire(&doc, "#left");
    let right = cache.acquire(&doc, "#right");
    let plain = cache.acquire(&doc, "");

    insta::assert_debug_snapshot!(cache.keys(), @r###"
    [
        "doc_counting",
        "doc_counting#left",
        "doc_counting#right",
    ]
    "###);
    assert!(cache.contains(&doc, "#left"));
    assert!(!cache.contains(&doc, "#top"));

    for handle in [left, right, plain] {
        cache.release(&handle).unwrap();
    }
    assert_balanced(&cache);
}

#[test]
fn test_entry_lives_until_last_release() {
    let cache = setup_cache();
    let doc = document("doc", "content");

    let handles: Vec<_> = (0..5).map(|_| cache.acquire(&doc, "")).collect();
    let (last, rest) = handles.split_last().unwrap();

    for handle in rest {
        cache.release(handle).unwrap();
        assert!(cache.contains(&doc, ""));
        assert_eq!(cache.factory().deallocated(), 0);
    }
    assert_eq!(cache.use_count(last), Some(1));

    cache.release(last).unwrap();
    assert!(!cache.contains(&doc, ""));
    assert_eq!(cache.factory().deallocated(), 1);
    insta::assert_debug_snapshot!(cache.factory().deallocated_keys(), @r###"
    [
        "doc_counting",
    ]
    "###);

    let stats = cache.stats();
    assert_eq!((stats.acquires, stats.created), (5, 1));
    assert_eq!((stats.releases, stats.destroyed, stats.live), (5, 1, 0));
}

#[test]
fn test_double_release() {
    let cache = setup_cache();
    let doc = document("doc", "content");

    let handle = cache.acquire(&doc, "");
    cache.release(&handle).unwrap();

    let err = cache.release(&handle).unwrap_err();
    assert!(matches!(err, CacheError::UnknownResource { .. }));
    insta::assert_snapshot!(err.to_string(), @"unknown resource `doc_counting`");

    assert!(matches!(
        cache.refresh(&handle),
        Err(CacheError::UnknownResource { .. })
    ));
    assert!(matches!(
        cache.needs_refresh(&handle),
        Err(CacheError::UnknownResource { .. })
    ));
    assert!(matches!(
        handle.read(),
        Err(CacheError::UnknownResource { .. })
    ));
    assert_eq!(cache.use_count(&handle), None);

    // deallocated exactly once
    assert_eq!(cache.factory().deallocated(), 1);
    assert_balanced(&cache);
}

#[test]
fn test_double_release_keeps_shared_entry() {
    let cache = setup_cache();
    let doc = document("doc", "content");

    let h1 = cache.acquire(&doc, "");
    let h2 = cache.acquire(&doc, "");
    cache.refresh(&h2).unwrap();

    cache.release(&h1).unwrap();
    assert!(h1.is_released());
    let err = cache.release(&h1).unwrap_err();
    assert!(matches!(err, CacheError::UnknownResource { .. }));

    // the second handle keeps its reference and the resource
    assert_eq!(cache.use_count(&h2), Some(1));
    assert_eq!(cache.use_count(&h1), None);
    assert_eq!(cache.factory().deallocated(), 0);
    assert_eq!(h2.read().unwrap().text.as_deref(), Some("content"));

    // the released handle can no longer be used, even though its entry lives on
    assert!(matches!(
        cache.refresh(&h1),
        Err(CacheError::UnknownResource { .. })
    ));
    assert!(matches!(h1.read(), Err(CacheError::UnknownResource { .. })));

    let stats = cache.stats();
    assert_eq!((stats.releases, stats.destroyed), (1, 0));

    cache.release(&h2).unwrap();
    assert_eq!(cache.factory().deallocated(), 1);
    assert_balanced(&cache);
}

#[test]
fn test_stale_handle_does_not_touch_new_entry() {
    let cache = setup_cache();
    let doc = document("doc", "content");

    let stale = cache.acquire(&doc, "");
    cache.release(&stale).unwrap();

    // same key, but a new entry
    let fresh = cache.acquire(&doc, "");
    assert_eq!(stale.key(), fresh.key());

    assert!(matches!(
        cache.release(&stale),
        Err(CacheError::UnknownResource { .. })
    ));
    assert_eq!(cache.use_count(&fresh), Some(1));
    assert!(fresh.read().is_ok());

    cache.release(&fresh).unwrap();
    assert_balanced(&cache);
}

#[test]
fn test_handle_from_other_cache() {
    let cache = setup_cache();
    let other = ResourceCache::new(CountingFactory::new());
    let doc = document("doc", "content");

    let ours = cache.acquire(&doc, "");
    let theirs = other.acquire(&doc, "");

    assert!(matches!(
        cache.release(&theirs),
        Err(CacheError::UnknownResource { .. })
    ));
    assert_eq!(cache.use_count(&ours), Some(1));
    assert_eq!(other.use_count(&theirs), Some(1));

    cache.release(&ours).unwrap();
    other.release(&theirs).unwrap();
    assert_balanced(&cache);
    assert_balanced(&other);
}

#[test]
fn test_lease() {
    let cache = setup_cache();
    let doc = document("doc", "content");

    {
        let lease = cache.lease(&doc, "");
        let also = cache.acquire(&doc, "");
        assert_eq!(cache.use_count(&also), Some(2));

        assert!(lease.refresh().unwrap().updated);
        assert_eq!(lease.read().unwrap().text.as_deref(), Some("content"));

        // releasing the plain handle leaves the lease alive
        cache.release(&also).unwrap();
        assert_eq!(lease.use_count(), Some(1));
    }

    assert_balanced(&cache);
}

#[test]
fn test_lease_released_explicitly() {
    let cache = setup_cache();
    let doc = document("doc", "content");

    let other = cache.acquire(&doc, "");
    let lease = cache.lease(&doc, "");
    assert_eq!(lease.use_count(), Some(2));

    // dropping after an explicit release must not release a second time
    lease.release().unwrap();
    assert_eq!(cache.use_count(&other), Some(1));
    assert_eq!(cache.stats().releases, 1);
    assert_eq!(cache.factory().deallocated(), 0);

    cache.release(&other).unwrap();
    assert_balanced(&cache);
}

#[test]
fn test_acquire_does_not_populate() {
    let cache = setup_cache();
    let doc = document("doc", "content");

    let handle = cache.acquire(&doc, "");
    assert_eq!(handle.read().unwrap().text, None);
    assert_eq!(cache.factory().populated(), 0);
    assert!(cache.needs_refresh(&handle).unwrap());

    cache.release(&handle).unwrap();
    assert_balanced(&cache);
}
