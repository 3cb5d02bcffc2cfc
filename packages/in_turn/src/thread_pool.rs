//! A fixed-size thread pool that processors can run their batches on.

use std::borrow::Cow;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::{fmt, mem};

use crossbeam::channel::{self, Receiver, Sender};
use new_zealand::nz;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::{ExecuteError, Executor, Failure, Job};

const DEFAULT_NAME_PREFIX: &str = "in-turn";

/// A fixed-size pool of worker threads executing [`Job`]s in submission order.
///
/// Every worker pulls from one shared channel, so a job runs on whichever worker becomes free
/// first. A job that panics is logged and does not take its worker down.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use in_turn::{Dispatcher, ThreadPool};
/// use new_zealand::nz;
///
/// let pool = Arc::new(
///     ThreadPool::builder()
///         .thread_count(nz!(2))
///         .name_prefix("accounts")
///         .build(),
/// );
/// assert_eq!(pool.thread_count().get(), 2);
///
/// let dispatcher = Dispatcher::new(pool);
/// ```
///
/// # Lifecycle
///
/// Dropping the pool, or calling [`shutdown()`][Self::shutdown], stops accepting new jobs, lets
/// the already queued ones finish and then joins the worker threads. Processors whose batch
/// runner is refused because of this abort.
pub struct ThreadPool {
    /// `None` once shut down.
    sender: RwLock<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_count: NonZero<usize>,
}

impl ThreadPool {
    /// Creates a pool with one worker thread per processor available to the process.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn a worker thread.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a pool with custom options.
    #[must_use]
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::new()
    }

    /// The number of worker threads the pool was started with.
    #[must_use]
    pub fn thread_count(&self) -> NonZero<usize> {
        self.thread_count
    }

    /// Stops accepting jobs, waits for queued jobs to finish and joins the worker threads.
    ///
    /// Calling this from one of the pool's own workers does not wait for that worker, which
    /// exits on its own once its current job returns. Calling it more than once is harmless.
    #[cfg_attr(test, mutants::skip)] // Impractical to test that stuff stops happening.
    pub fn shutdown(&self) {
        // Dropping the only sender disconnects the channel once the remaining jobs are received.
        drop(self.sender.write().take());

        let workers = mem::take(&mut *self.workers.lock());
        let current = thread::current().id();

        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }

            if let Err(payload) = worker.join() {
                // Workers run every job inside a panic trap and should never panic. If one does,
                // the pool infrastructure itself is broken and the failure must not go unnoticed.
                panic::resume_unwind(payload);
            }
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) -> Result<(), ExecuteError> {
        let sender = self.sender.read();

        let Some(sender) = sender.as_ref() else {
            return Err(ExecuteError::new("thread pool is shut down"));
        };

        if sender.send(job).is_err() {
            return Err(ExecuteError::new("thread pool has no running workers"));
        }

        Ok(())
    }
}

impl Drop for ThreadPool {
    #[cfg_attr(test, mutants::skip)] // Impractical to test that stuff stops happening.
    fn drop(&mut self) {
        if thread::panicking() {
            // Joining workers now could hide the original panic behind a new one. Closing the
            // channel still lets them exit on their own.
            drop(self.sender.get_mut().take());
            return;
        }

        self.shutdown();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("thread_count", &self.thread_count)
            .field("shut_down", &self.sender.read().is_none())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`ThreadPool`].
#[derive(Debug)]
#[must_use]
pub struct ThreadPoolBuilder {
    thread_count: Option<NonZero<usize>>,
    name_prefix: Cow<'static, str>,
}

impl ThreadPoolBuilder {
    fn new() -> Self {
        Self {
            thread_count: None,
            name_prefix: Cow::Borrowed(DEFAULT_NAME_PREFIX),
        }
    }

    /// The number of worker threads. Defaults to the available parallelism of the process.
    pub fn thread_count(mut self, thread_count: NonZero<usize>) -> Self {
        self.thread_count = Some(thread_count);
        self
    }

    /// Prefix of the worker thread names, which are `{prefix}-w{index}`. Defaults to `in-turn`.
    pub fn name_prefix(mut self, name_prefix: impl Into<Cow<'static, str>>) -> Self {
        self.name_prefix = name_prefix.into();
        self
    }

    /// Starts the worker threads.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn a worker thread.
    #[must_use]
    pub fn build(self) -> ThreadPool {
        let thread_count = self
            .thread_count
            .unwrap_or_else(|| thread::available_parallelism().unwrap_or(nz!(1)));

        let (sender, receiver) = channel::unbounded::<Job>();

        let workers = (0..thread_count.get())
            .map(|worker_index| {
                let receiver = receiver.clone();

                thread::Builder::new()
                    .name(format!("{}-w{worker_index}", self.name_prefix))
                    .spawn(move || {
                        debug!(worker_index, "worker thread started");
                        worker_loop(&receiver, worker_index);
                        debug!(worker_index, "worker thread exiting");
                    })
                    .expect("failed to spawn worker thread: thread spawning failure is not supported")
            })
            .collect();

        ThreadPool {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            thread_count,
        }
    }
}

fn worker_loop(receiver: &Receiver<Job>, worker_index: usize) {
    // Ends once the pool has dropped its sender and every queued job has been received.
    for job in receiver {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let failure = Failure::Panic(payload);
            error!(worker_index, %failure, "job panicked; worker continues");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;

    assert_impl_all!(ThreadPool: Send, Sync, Executor, fmt::Debug);
    assert_impl_all!(ThreadPoolBuilder: Send, fmt::Debug);

    #[cfg_attr(miri, ignore)]
    #[test]
    fn runs_submitted_jobs() {
        with_watchdog(|| {
            let pool = ThreadPool::builder().thread_count(nz!(3)).build();
            assert_eq!(pool.thread_count(), nz!(3));

            let counter = Arc::new(AtomicUsize::new(0));

            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                pool.execute(Box::new(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
            }

            // Shutdown waits for queued jobs.
            pool.shutdown();

            assert_eq!(counter.load(Ordering::Relaxed), 100);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn panicking_job_does_not_kill_worker() {
        with_watchdog(|| {
            let pool = ThreadPool::builder().thread_count(nz!(1)).build();
            let (done_tx, done_rx) = channel::bounded::<()>(1);

            pool.execute(Box::new(|| panic!("job exploded"))).unwrap();
            pool.execute(Box::new(move || done_tx.send(()).unwrap()))
                .unwrap();

            done_rx.recv().unwrap();
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn shut_down_pool_refuses_jobs() {
        with_watchdog(|| {
            let pool = ThreadPool::builder().thread_count(nz!(1)).build();
            pool.shutdown();
            pool.shutdown();

            let error = pool.execute(Box::new(|| {})).unwrap_err();
            assert!(error.reason().contains("shut down"));
            assert!(format!("{pool:?}").contains("shut_down: true"));
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn workers_use_name_prefix() {
        with_watchdog(|| {
            let pool = ThreadPool::builder()
                .thread_count(nz!(1))
                .name_prefix("custom")
                .build();
            let (name_tx, name_rx) = channel::bounded::<Option<String>>(1);

            pool.execute(Box::new(move || {
                name_tx
                    .send(thread::current().name().map(str::to_owned))
                    .unwrap();
            }))
            .unwrap();

            assert_eq!(name_rx.recv().unwrap().as_deref(), Some("custom-w0"));
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn last_reference_dropped_on_worker_does_not_deadlock() {
        with_watchdog(|| {
            let pool = Arc::new(ThreadPool::builder().thread_count(nz!(2)).build());
            let (done_tx, done_rx) = channel::bounded::<()>(1);

            let job_pool = Arc::clone(&pool);
            pool.execute(Box::new(move || {
                // Give the test thread time to drop its reference first.
                thread::sleep(Duration::from_millis(20));
                drop(job_pool);
                done_tx.send(()).unwrap();
            }))
            .unwrap();

            drop(pool);
            done_rx.recv().unwrap();
        });
    }
}
