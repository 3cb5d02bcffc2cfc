#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing the `in_turn` packages.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

/// Runs a test with a timeout to prevent infinite hangs.
///
/// Most failures of a scheduler are lost wakeups, which show up as a thread parked forever. This
/// turns them into a test failure instead of a CI job that never ends.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under Miri, where thread
/// synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled and
/// the test function is executed directly, so that mutation testing can detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has already timed out.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {timeout:?} timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Collects values from any number of threads, preserving the order they were recorded in.
///
/// Clones share the same storage.
#[derive(Debug)]
pub struct Recorder<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T> Recorder<T> {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Appends a value.
    pub fn record(&self, value: T) {
        self.values.lock().push(value);
    }

    /// The number of values recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl<T: Clone> Recorder<T> {
    /// A copy of everything recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.values.lock().clone()
    }
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Measures how many threads are inside a section of code at the same time.
///
/// Clones share the same counters.
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyProbe {
    counters: Arc<ProbeCounters>,
}

#[derive(Debug, Default)]
struct ProbeCounters {
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ConcurrencyProbe {
    /// Creates a probe that has seen no activity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the current thread as inside the section until the returned guard is dropped.
    #[must_use]
    pub fn enter(&self) -> ProbeGuard<'_> {
        let active = self
            .counters
            .active
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1);

        self.counters.max_active.fetch_max(active, Ordering::SeqCst);

        ProbeGuard { probe: self }
    }

    /// The largest number of threads that were ever inside the section at the same time.
    #[must_use]
    pub fn max_active(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }
}

/// Keeps a thread counted as inside a [`ConcurrencyProbe`] section.
#[derive(Debug)]
pub struct ProbeGuard<'a> {
    probe: &'a ConcurrencyProbe,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probe.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}
