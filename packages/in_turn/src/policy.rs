//! Deciding what a processor does after one of its tasks fails.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::Failure;

/// What a processor should do after one of its tasks failed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Decision {
    /// Drop the failed task and keep processing the rest of the queue.
    Continue,

    /// Move the processor into its terminal aborted state, discarding all queued tasks and
    /// rejecting all future ones.
    Abort,
}

/// The error policy of a processor, shared with the batch runner jobs it submits.
pub(crate) type ErrorPolicy = Arc<dyn Fn(&Failure) -> Decision + Send + Sync + 'static>;

/// The policy used when the caller does not configure one: failures are ignored.
pub(crate) fn continue_always() -> ErrorPolicy {
    Arc::new(|_| Decision::Continue)
}

/// Consults the policy about a failure.
///
/// A policy that itself panics leaves the processor in an unknown condition, so the panic is
/// logged and treated as [`Decision::Abort`].
pub(crate) fn decide(policy: &ErrorPolicy, failure: &Failure) -> Decision {
    panic::catch_unwind(AssertUnwindSafe(|| policy(failure))).unwrap_or_else(|_| {
        error!(%failure, "error policy panicked while handling a task failure");
        Decision::Abort
    })
}
