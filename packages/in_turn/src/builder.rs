//! Configuration of a processor before it is created.

use std::fmt;
use std::num::NonZero;
use std::sync::Arc;

use new_zealand::nz;

use crate::{
    BoundedQueue, Decision, ErrorPolicy, Executor, Failure, Processor, Sequencer, Settings,
    UnboundedQueue, continue_always,
};

/// Builder for a [`Processor`].
///
/// The defaults are a multi-source processor with an unbounded queue, a batch size of 1 and an
/// error policy that continues past every failure.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use in_turn::{Decision, Failure, Processor, ThreadPool};
/// use new_zealand::nz;
///
/// let pool = Arc::new(ThreadPool::new());
///
/// let processor = Processor::builder(pool)
///     .limit(1000)
///     .blocking(true)
///     .batch_size(nz!(32))
///     .error_policy(|failure: &Failure| {
///         if failure.is_panic() {
///             Decision::Abort
///         } else {
///             Decision::Continue
///         }
///     })
///     .build();
///
/// assert!(processor.is_idle());
/// ```
#[must_use]
pub struct ProcessorBuilder {
    executor: Arc<dyn Executor>,
    multi_source: bool,
    limit: u32,
    batch_size: NonZero<u32>,
    error_policy: ErrorPolicy,
    blocking: bool,
}

impl ProcessorBuilder {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            multi_source: true,
            limit: 0,
            batch_size: nz!(1),
            error_policy: continue_always(),
            blocking: false,
        }
    }

    /// Whether producers on more than one thread may add tasks concurrently. Defaults to `true`.
    ///
    /// A multi-source processor serializes the entry of producers, so tasks are queued in the
    /// order their producers entered. Setting this to `false` skips that serialization; the
    /// caller then promises that only one thread at a time adds tasks. Breaking that promise is
    /// memory-safe and loses no tasks, but the relative order of tasks from concurrent producers
    /// is unspecified.
    pub fn multi_source(mut self, multi_source: bool) -> Self {
        self.multi_source = multi_source;
        self
    }

    /// The maximum number of queued tasks, 0 meaning unbounded. Defaults to 0.
    ///
    /// When the queue is full, [`Processor::add()`] rejects the task, or waits for room if the
    /// processor is in [blocking][Self::blocking] mode.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// The maximum number of tasks one batch runner job executes before handing its thread back
    /// to the executor. Defaults to 1.
    ///
    /// Larger batches amortize the cost of scheduling over more tasks at the expense of fairness
    /// between processors sharing the executor.
    pub fn batch_size(mut self, batch_size: NonZero<u32>) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// The callback that decides whether the processor continues after a task fails. Defaults
    /// to always continuing.
    ///
    /// The policy runs on the executor thread that ran the failed task, before the next task of
    /// the processor starts. It may add tasks to its own processor. A panicking policy is treated
    /// as if it had returned [`Decision::Abort`].
    pub fn error_policy<P>(mut self, policy: P) -> Self
    where
        P: Fn(&Failure) -> Decision + Send + Sync + 'static,
    {
        self.error_policy = Arc::new(policy);
        self
    }

    /// Whether [`Processor::add()`] waits for room in a full queue instead of rejecting the
    /// task. Defaults to `false`. Only meaningful together with a nonzero [limit][Self::limit].
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Creates the processor. It starts idle and consumes no executor resources until the first
    /// task is added.
    #[must_use]
    pub fn build(self) -> Processor {
        let settings = Settings {
            batch_size: self.batch_size,
            limit: self.limit,
            multi_source: self.multi_source,
            blocking: self.blocking && self.limit > 0,
        };

        let capacity = NonZero::new(
            usize::try_from(self.limit).expect("u32 always fits in usize on supported targets"),
        );

        match capacity {
            Some(capacity) => Processor::new(Sequencer::new(
                BoundedQueue::new(capacity),
                self.executor,
                self.error_policy,
                settings,
            )),
            None => Processor::new(Sequencer::new(
                UnboundedQueue::new(),
                self.executor,
                self.error_policy,
                settings,
            )),
        }
    }
}

impl fmt::Debug for ProcessorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorBuilder")
            .field("multi_source", &self.multi_source)
            .field("limit", &self.limit)
            .field("batch_size", &self.batch_size)
            .field("blocking", &self.blocking)
            .finish_non_exhaustive()
    }
}

impl Processor {
    /// Starts building a processor that runs its tasks on the given executor.
    pub fn builder(executor: Arc<dyn Executor>) -> ProcessorBuilder {
        ProcessorBuilder::new(executor)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;
    use std::time::Duration;

    use parking_lot::Mutex;
    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;
    use crate::{Job, MockExecutor, ProcessorState, ThreadPool};

    assert_impl_all!(ProcessorBuilder: Send, fmt::Debug);

    fn idle_executor() -> Arc<dyn Executor> {
        let mut mock = MockExecutor::new();
        mock.expect_execute().never();
        Arc::new(mock)
    }

    #[test]
    fn defaults() {
        let builder = Processor::builder(idle_executor());

        assert!(builder.multi_source);
        assert_eq!(builder.limit, 0);
        assert_eq!(builder.batch_size, nz!(1));
        assert!(!builder.blocking);
    }

    #[test]
    fn built_processor_starts_idle() {
        let processor = Processor::builder(idle_executor()).limit(4).build();

        assert_eq!(processor.state(), ProcessorState::Idle);
        assert_eq!(processor.size(), 0);
        assert!(processor.is_idle());
        assert!(!processor.is_aborted());
    }

    #[test]
    fn blocking_without_limit_is_ignored() {
        let processor = Processor::builder(idle_executor()).blocking(true).build();

        assert!(!format!("{processor:?}").contains("blocking: true"));
    }

    #[test]
    fn limit_rejects_overflow() {
        let jobs = Arc::new(Mutex::new(Vec::<Job>::new()));

        let mut mock = MockExecutor::new();
        mock.expect_execute().times(1).returning({
            let jobs = Arc::clone(&jobs);
            move |job| {
                jobs.lock().push(job);
                Ok(())
            }
        });

        let processor = Processor::builder(Arc::new(mock)).limit(2).build();

        assert!(processor.add(|| Ok(())));
        assert!(processor.add(|| Ok(())));
        assert!(!processor.add(|| Ok(())));
        assert_eq!(processor.size(), 2);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn blocking_limit_waits_for_room() {
        with_watchdog(|| {
            let pool = Arc::new(ThreadPool::builder().thread_count(nz!(1)).build());
            let processor = Processor::builder(pool).limit(1).blocking(true).build();
            let (release_tx, release_rx) = crossbeam::channel::unbounded::<()>();

            // The first task occupies the only worker, the second fills the queue.
            for _ in 0..2 {
                let release_rx = release_rx.clone();
                assert!(processor.add(move || {
                    release_rx.recv()?;
                    Ok(())
                }));
            }

            let producer = thread::spawn({
                let processor = processor.clone();
                move || processor.add(|| Ok(()))
            });

            thread::sleep(Duration::from_millis(10));
            assert!(!producer.is_finished());

            release_tx.send(()).unwrap();
            release_tx.send(()).unwrap();

            assert!(producer.join().unwrap());
            processor.await_finish();
            assert!(processor.is_idle());
        });
    }
}
