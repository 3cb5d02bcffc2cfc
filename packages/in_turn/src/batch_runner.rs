//! Draining a bounded batch of tasks from a work queue on the current thread.

use std::num::NonZero;

use crate::{Failure, WorkQueue, run_task};

#[derive(Debug)]
pub(crate) struct BatchOutcome {
    /// How many tasks were taken from the queue and run, including a failed one.
    pub(crate) executed: u32,

    /// The failure of the last task run, if it failed. The batch stops at the first failure.
    pub(crate) failure: Option<Failure>,
}

/// Runs up to `batch_size` tasks from the queue, one after another, on the current thread.
///
/// `on_pop` is called after each task is removed from the queue and before it runs, which lets
/// the caller release producers waiting for room in the queue as early as possible.
///
/// Tasks are taken one at a time, so stopping at a failed task leaves every later task in the
/// queue untouched.
pub(crate) fn run_batch<Q>(
    queue: &Q,
    batch_size: NonZero<u32>,
    mut on_pop: impl FnMut(),
) -> BatchOutcome
where
    Q: WorkQueue + ?Sized,
{
    let mut executed: u32 = 0;

    while executed < batch_size.get() {
        let Some(task) = queue.poll() else {
            break;
        };

        on_pop();
        executed = executed.saturating_add(1);

        if let Err(failure) = run_task(task) {
            return BatchOutcome {
                executed,
                failure: Some(failure),
            };
        }
    }

    BatchOutcome {
        executed,
        failure: None,
    }
}
