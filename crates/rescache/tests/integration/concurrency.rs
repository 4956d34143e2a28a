use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rescache::{PopulateError, ResourceCache, ResourceFactory, ResourceKey, Versioned};

use crate::{assert_balanced, document, set_text, setup_cache};

#[test]
fn test_concurrent_refresh_populates_once() {
    let cache = Arc::new(setup_cache());
    let doc = document("doc", "content");
    let handles: Vec<_> = (0..4).map(|_| cache.acquire(&doc, "")).collect();
    let handles = Arc::new(handles);

    cache.factory().pause();
    let threads: Vec<_> = (0..4)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let handles = Arc::clone(&handles);
            thread::spawn(move || cache.refresh(&handles[i]).unwrap())
        })
        .collect();

    cache.factory().wait_for_populates(1);
    // give the other refreshes time to run into the in-flight populate
    thread::sleep(Duration::from_millis(50));
    cache.factory().resume();

    let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.updated).count(), 1);
    assert!(
        results
            .iter()
            .all(|r| r.loader_result == results[0].loader_result)
    );
    assert_eq!(cache.factory().populated(), 1);
    assert_eq!(cache.factory().max_concurrent_populates(), 1);

    for handle in handles.iter() {
        cache.release(handle).unwrap();
    }
    assert_balanced(&cache);
}

#[test]
fn test_different_entries_populate_in_parallel() {
    let cache = Arc::new(setup_cache());
    let doc = document("doc", "content");
    let left = Arc::new(cache.acquire(&doc, "#left"));
    let right = Arc::new(cache.acquire(&doc, "#right"));

    cache.factory().pause();
    let threads: Vec<_> = [&left, &right]
        .into_iter()
        .map(|handle| {
            let cache = Arc::clone(&cache);
            let handle = Arc::clone(handle);
            thread::spawn(move || cache.refresh(&handle).unwrap())
        })
        .collect();

    // both populates are running at the same time
    cache.factory().wait_for_populates(2);
    cache.factory().resume();

    for thread in threads {
        assert!(thread.join().unwrap().updated);
    }
    assert_eq!(cache.factory().max_concurrent_populates(), 2);

    cache.release(&left).unwrap();
    cache.release(&right).unwrap();
    assert_balanced(&cache);
}

#[test]
fn test_populate_does_not_block_the_map() {
    let cache = Arc::new(setup_cache());
    let slow = document("slow", "content");
    let other = document("other", "content");
    let handle = Arc::new(cache.acquire(&slow, ""));

    cache.factory().pause();
    let refresh = {
        let cache = Arc::clone(&cache);
        let handle = Arc::clone(&handle);
        thread::spawn(move || cache.refresh(&handle).unwrap())
    };
    cache.factory().wait_for_populates(1);

    // all of these would deadlock if the map lock was held across populate
    let shared = cache.acquire(&slow, "");
    let unrelated = cache.acquire(&other, "");
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.use_count(&shared), Some(2));
    // still stale until the running populate succeeded
    assert!(cache.needs_refresh(&shared).unwrap());
    cache.release(&unrelated).unwrap();
    cache.release(&shared).unwrap();

    cache.factory().resume();
    assert!(refresh.join().unwrap().updated);

    cache.release(&handle).unwrap();
    assert_balanced(&cache);
}

#[test]
fn test_refresh_after_concurrent_change() {
    let cache = Arc::new(setup_cache());
    let doc = document("doc", "v0");
    let handle = Arc::new(cache.acquire(&doc, ""));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                for _ in 0..50 {
                    cache.refresh(&handle).unwrap();
                }
            })
        })
        .collect();
    for i in 1..=20 {
        set_text(&doc, &format!("v{i}"));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // the final refresh always catches up with the last mutation
    cache.refresh(&handle).unwrap();
    assert_eq!(handle.read().unwrap().text.as_deref(), Some("v20"));
    assert!(!cache.needs_refresh(&handle).unwrap());
    assert!(cache.factory().populated() <= 21);
    assert_eq!(cache.factory().max_concurrent_populates(), 1);

    cache.release(&handle).unwrap();
    assert_balanced(&cache);
}

#[test]
fn test_concurrent_acquire_release() {
    let cache = Arc::new(setup_cache());
    let docs: Vec<_> = (0..4).map(|i| document(&format!("doc{i}"), "x")).collect();
    let docs = Arc::new(docs);

    let threads: Vec<_> = (0..8)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let docs = Arc::clone(&docs);
            thread::spawn(move || {
                for i in 0..200 {
                    let doc = &docs[(t + i) % docs.len()];
                    let handle = cache.acquire(doc, "");
                    cache.refresh(&handle).unwrap();
                    assert!(handle.read().unwrap().text.is_some());
                    cache.release(&handle).unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.acquires, 1600);
    assert_eq!(stats.releases, 1600);
    assert_eq!(stats.created, stats.destroyed);
    assert_balanced(&cache);
}

#[test]
fn test_document_writable_while_resource_is_read() {
    let cache = Arc::new(setup_cache());
    let doc = document("doc", "v0");
    let handle = Arc::new(cache.acquire(&doc, ""));
    cache.refresh(&handle).unwrap();
    set_text(&doc, "v1");

    let guard = handle.read().unwrap();
    let refresh = {
        let cache = Arc::clone(&cache);
        let handle = Arc::clone(&handle);
        thread::spawn(move || cache.refresh(&handle).unwrap())
    };
    thread::sleep(Duration::from_millis(50));

    // the pending refresh waits for our guard without keeping the document locked
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut written = false;
    while !written && Instant::now() < deadline {
        if let Ok(mut document) = doc.try_write() {
            *document.data_mut() = "v2".to_owned();
            written = true;
        } else {
            thread::sleep(Duration::from_millis(1));
        }
    }
    assert!(written, "document stayed locked while the resource was read");
    assert_eq!(guard.text.as_deref(), Some("v0"));
    drop(guard);

    let refreshed = refresh.join().unwrap();
    assert!(refreshed.updated);
    assert_eq!(refreshed.loader_result.marker, 2);
    assert_eq!(handle.read().unwrap().text.as_deref(), Some("v2"));
    assert!(!cache.needs_refresh(&handle).unwrap());

    cache.release(&handle).unwrap();
    assert_balanced(&cache);
}

/// Panics in the first populate, succeeds afterwards.
#[derive(Default)]
struct PanicOnce {
    panicked: AtomicBool,
}

impl ResourceFactory for PanicOnce {
    const KIND: &'static str = "panic";
    type Document = Versioned<u32>;
    type Resource = u32;
    type LoaderResult = u32;

    fn allocate(&self, _key: &ResourceKey) -> u32 {
        0
    }

    fn populate(&self, document: &Versioned<u32>, resource: &mut u32) -> Result<u32, PopulateError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("populate exploded");
        }
        *resource = *document.data();
        Ok(*resource)
    }
}

#[test]
fn test_panicking_populate_leaves_entry_usable() {
    rescache_test::setup();
    let cache = ResourceCache::new(PanicOnce::default());
    let doc = Versioned::new("doc", 7).shared();
    let handle = cache.acquire(&doc, "");

    let result = catch_unwind(AssertUnwindSafe(|| cache.refresh(&handle)));
    assert!(result.is_err());

    // not stuck in `Populating`, and the resource is still readable
    assert!(cache.needs_refresh(&handle).unwrap());
    assert_eq!(*handle.read().unwrap(), 0);

    let refreshed = cache.refresh(&handle).unwrap();
    assert!(refreshed.updated);
    assert_eq!(refreshed.loader_result, 7);

    cache.release(&handle).unwrap();
    assert!(cache.check_empty().is_ok());
}
