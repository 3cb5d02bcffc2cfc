//! The thread pool collaborator that processors submit their batch runners to.

use std::borrow::Cow;
use std::sync::Arc;

use thiserror::Error;

/// A zero-argument job submitted to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A pool of threads that processors share.
///
/// A processor submits at most one job at a time to its executor. The job runs some of the
/// processor's tasks and, before returning, reports back to the processor, which may then submit
/// the next job. Jobs may run on any thread of the pool and in any order relative to jobs of other
/// processors.
///
/// [`ThreadPool`][crate::ThreadPool] is the implementation shipped with this crate. Any other pool
/// can be plugged in by implementing this trait.
#[cfg_attr(test, mockall::automock)]
pub trait Executor: Send + Sync + 'static {
    /// Schedules the job to run on some thread of the pool.
    ///
    /// The job must eventually be executed exactly once unless an error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError`] if the pool no longer accepts work. The processor that submitted
    /// the job treats this as fatal and aborts.
    fn execute(&self, job: Job) -> Result<(), ExecuteError>;
}

impl<E> Executor for Arc<E>
where
    E: Executor + ?Sized,
{
    fn execute(&self, job: Job) -> Result<(), ExecuteError> {
        (**self).execute(job)
    }
}

/// An [`Executor`] refused to accept a job.
#[derive(Debug, Error)]
#[error("executor refused the job: {reason}")]
pub struct ExecuteError {
    reason: Cow<'static, str>,
}

impl ExecuteError {
    /// Creates an error with a human-readable reason for the refusal.
    #[must_use]
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason the executor gave for the refusal.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}
