//! The public handle through which tasks are added to a processor and its progress observed.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::{Error, Interrupt, Sequence, TaskError, WaitOutcome};

/// Observable lifecycle state of a [`Processor`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ProcessorState {
    /// No tasks are queued or running and no batch runner exists.
    Idle,

    /// Tasks are queued or running, and exactly one batch runner is submitted to or running on
    /// the executor.
    Scheduled,

    /// The error policy or the executor ended the processor. It accepts nothing any more.
    Aborted,
}

/// A sequential mailbox of tasks executed on a shared [`Executor`][crate::Executor].
///
/// Tasks added to a processor run one at a time, in the order they were admitted, each one
/// observing every effect of the tasks before it. Different processors run in parallel on the
/// executor's threads.
///
/// Create processors via [`Dispatcher::processor()`][crate::Dispatcher::processor] or
/// [`Processor::builder()`].
///
/// The type is a cheap handle: clones refer to the same processor and can be sent to other
/// threads. The processor lives until the last handle and the last of its pending batch runner
/// jobs are gone.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// use in_turn::{Processor, ThreadPool};
/// use new_zealand::nz;
///
/// let pool = Arc::new(ThreadPool::new());
/// let processor = Processor::builder(pool).batch_size(nz!(16)).build();
///
/// let counter = Arc::new(AtomicU32::new(0));
///
/// for _ in 0..100 {
///     let counter = Arc::clone(&counter);
///     processor.add(move || {
///         counter.fetch_add(1, Ordering::Relaxed);
///         Ok(())
///     });
/// }
///
/// processor.await_finish();
/// assert_eq!(counter.load(Ordering::Relaxed), 100);
/// ```
#[derive(Clone)]
pub struct Processor {
    inner: Arc<dyn Sequence>,
}

impl Processor {
    pub(crate) fn new(inner: Arc<dyn Sequence>) -> Self {
        Self { inner }
    }

    /// Adds a task to the end of the processor's queue.
    ///
    /// Returns `false` if the task was not accepted because the processor is aborted, because
    /// its bounded queue is full or because the executor refused the processor's batch runner.
    /// A rejected task is dropped without running.
    ///
    /// In blocking mode, a full bounded queue makes this wait until there is room instead.
    /// Called from one of the processor's own tasks, it never waits and rejects instead.
    #[allow(
        clippy::must_use_candidate,
        reason = "ignoring a rejection is legitimate, e.g. when the processor is known to be aborting"
    )]
    pub fn add<F>(&self, task: F) -> bool
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.inner.admit(Box::new(task), None, None).unwrap_or(false)
    }

    /// Adds a task like [`add()`][Self::add], except that waiting for room in a full bounded
    /// queue can be cancelled through the interrupt token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if the token was interrupted while the call was waiting or
    /// before it started to wait. The task was not added in that case.
    pub fn add_interruptible<F>(&self, task: F, interrupt: &Interrupt) -> crate::Result<bool>
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.inner.admit(Box::new(task), None, Some(interrupt))
    }

    /// Adds a task once the queue holds at most `threshold` tasks.
    ///
    /// The calling thread waits while the queue is longer than `threshold`, so a producer that
    /// only ever uses this method keeps the queue at most `threshold + 1` tasks long. After the
    /// wait, the task is added as by [`add()`][Self::add].
    ///
    /// Called from one of the processor's own tasks, it does not wait. If the processor aborts
    /// while the caller waits, the call returns `false`.
    #[allow(
        clippy::must_use_candidate,
        reason = "ignoring a rejection is legitimate, e.g. when the processor is known to be aborting"
    )]
    pub fn add_with_backpressure<F>(&self, task: F, threshold: usize) -> bool
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.inner
            .admit(Box::new(task), Some(threshold), None)
            .unwrap_or(false)
    }

    /// Adds a task like [`add_with_backpressure()`][Self::add_with_backpressure], except that the
    /// wait can be cancelled through the interrupt token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if the token was interrupted while the call was waiting or
    /// before it started to wait. The task was not added in that case.
    pub fn add_with_backpressure_interruptible<F>(
        &self,
        task: F,
        threshold: usize,
        interrupt: &Interrupt,
    ) -> crate::Result<bool>
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.inner
            .admit(Box::new(task), Some(threshold), Some(interrupt))
    }

    /// The number of tasks waiting in the queue, not counting a task that is currently running.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Whether the processor has nothing queued and no batch runner.
    ///
    /// An aborted processor is not idle.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state() == ProcessorState::Idle
    }

    /// Whether the processor has been aborted. Aborted is a terminal state.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state() == ProcessorState::Aborted
    }

    /// A snapshot of the processor's lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessorState {
        self.inner.state()
    }

    /// Waits until the processor is idle or aborted.
    ///
    /// Tasks added concurrently with this call may or may not have run when it returns. Called
    /// from one of the processor's own tasks, it returns immediately, as the processor cannot
    /// become idle while the caller runs.
    pub fn await_finish(&self) {
        if self.inner.await_settled(None, None) != WaitOutcome::Ready {
            warn!("await_finish() called from a task of the same processor; not waiting");
        }
    }

    /// Waits like [`await_finish()`][Self::await_finish], except that the wait can be cancelled
    /// through the interrupt token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if the token was interrupted before the processor finished.
    pub fn await_finish_interruptible(&self, interrupt: &Interrupt) -> crate::Result<()> {
        match self.inner.await_settled(Some(interrupt), None) {
            WaitOutcome::Interrupted => Err(Error::Interrupted),
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::TimedOut => {
                warn!("await_finish_interruptible() called from a task of the same processor; not waiting");
                Ok(())
            }
        }
    }

    /// Waits like [`await_finish()`][Self::await_finish], for at most `timeout`.
    ///
    /// Returns `true` if the processor became idle or aborted within the timeout.
    #[must_use]
    pub fn await_finish_timeout(&self, timeout: Duration) -> bool {
        // An unrepresentable deadline is as good as no deadline.
        let deadline = Instant::now().checked_add(timeout);

        self.inner.await_settled(None, deadline) == WaitOutcome::Ready
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings = self.inner.settings();

        f.debug_struct("Processor")
            .field("state", &self.state())
            .field("size", &self.size())
            .field("multi_source", &settings.multi_source)
            .field("limit", &settings.limit)
            .field("batch_size", &settings.batch_size)
            .field("blocking", &settings.blocking)
            .finish_non_exhaustive()
    }
}
