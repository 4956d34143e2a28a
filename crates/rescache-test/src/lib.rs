//! Helpers for testing resource caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Prefer a local [`CacheRegistry`](rescache::CacheRegistry) over the global
//!    [`registry`](rescache::registry). Tests run in parallel, and a teardown of the global
//!    registry in one test would report the live entries of all other tests as leaks.
//!
//!  - When using [`CountingFactory::pause`], make sure to [`resume`](CountingFactory::resume)
//!    before joining any thread that refreshes, or the test hangs.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rescache::{
    Document, Marker, PopulateError, ResourceFactory, ResourceKey, SharedDocument, Versioned,
};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::NamedTempFile;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `rescache` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("rescache=trace,rescache_kinds=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Writes `contents` into a temporary config file.
///
/// The file is deleted when the returned handle is dropped, so hold on to it.
pub fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// The document type of [`CountingFactory`].
pub type TestDocument = Versioned<String>;

/// Creates a shared text document at marker `0`.
pub fn document(key: &str, text: &str) -> SharedDocument<TestDocument> {
    Versioned::new(key, text.to_owned()).shared()
}

/// Replaces the text of `document`, bumping its marker.
pub fn set_text(document: &SharedDocument<TestDocument>, text: &str) {
    let mut document = document.write().unwrap();
    *document.data_mut() = text.to_owned();
}

/// Bumps the marker of `document` without changing its content.
pub fn touch(document: &SharedDocument<TestDocument>) {
    document.write().unwrap().touch();
}

/// The resource built by [`CountingFactory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResource {
    /// The key the resource was allocated for.
    pub key: ResourceKey,
    /// The document text as of the last populate, `None` before the first one.
    pub text: Option<String>,
}

/// The loader result of [`CountingFactory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestResult {
    /// The document marker at populate time.
    pub marker: Marker,
    /// The number of populates this factory had started before, across all resources.
    ///
    /// This makes results of different populates distinguishable even for the same marker.
    pub populate: usize,
}

/// Text documents that contain this string fail to populate as `Malformed`.
pub const MALFORMED: &str = "<malformed>";

/// A [`ResourceFactory`] that counts its calls and can fail or block on demand.
#[derive(Debug, Default)]
pub struct CountingFactory {
    allocated: AtomicUsize,
    populated: AtomicUsize,
    deallocated: AtomicUsize,
    deallocated_keys: Mutex<Vec<ResourceKey>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    fail: AtomicBool,
    delay: Option<Duration>,
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl CountingFactory {
    /// Creates a factory that populates instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory that sleeps for `delay` in every populate.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Number of `allocate` calls.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Number of started `populate` calls, including failed ones.
    pub fn populated(&self) -> usize {
        self.populated.load(Ordering::SeqCst)
    }

    /// Number of `deallocate` calls.
    pub fn deallocated(&self) -> usize {
        self.deallocated.load(Ordering::SeqCst)
    }

    /// The keys of all deallocated resources, in deallocation order.
    pub fn deallocated_keys(&self) -> Vec<ResourceKey> {
        self.deallocated_keys.lock().unwrap().clone()
    }

    /// The largest number of populates that ever ran at the same time.
    pub fn max_concurrent_populates(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Makes all following populates fail with [`PopulateError::Failed`] until reset.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Blocks all following populates inside the factory until [`resume`](Self::resume).
    pub fn pause(&self) {
        *self.paused.lock().unwrap() = true;
    }

    /// Lets all blocked populates continue.
    pub fn resume(&self) {
        *self.paused.lock().unwrap() = false;
        self.resumed.notify_all();
    }

    /// Waits until at least `count` populates have started.
    ///
    /// # Panics
    ///
    /// Panics if this takes longer than 10 seconds.
    pub fn wait_for_populates(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.populated() < count {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} populates"
            );
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn block_while_paused(&self) {
        let mut paused = self.paused.lock().unwrap();
        while *paused {
            paused = self.resumed.wait(paused).unwrap();
        }
    }
}

impl ResourceFactory for CountingFactory {
    const KIND: &'static str = "counting";
    type Document = TestDocument;
    type Resource = TestResource;
    type LoaderResult = TestResult;

    fn allocate(&self, key: &ResourceKey) -> TestResource {
        self.allocated.fetch_add(1, Ordering::SeqCst);
        TestResource {
            key: key.clone(),
            text: None,
        }
    }

    fn populate(
        &self,
        document: &TestDocument,
        resource: &mut TestResource,
    ) -> Result<TestResult, PopulateError> {
        let populate = self.populated.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        self.block_while_paused();
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(PopulateError::failed("injected failure"));
        }
        if document.data().contains(MALFORMED) {
            return Err(PopulateError::Malformed(format!(
                "document `{}` is marked as malformed",
                document.key()
            )));
        }

        resource.text = Some(document.data().clone());
        Ok(TestResult {
            marker: document.modification_marker(),
            populate,
        })
    }

    fn deallocate(&self, resource: TestResource) {
        self.deallocated.fetch_add(1, Ordering::SeqCst);
        self.deallocated_keys.lock().unwrap().push(resource.key);
    }
}
