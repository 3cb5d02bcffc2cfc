//! Units of work accepted by a processor and the failures they can produce.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// The error type a task may return to report failure.
///
/// Any error that is `Send + Sync + 'static` converts into this via `?` or `.into()`.
pub type TaskError = Box<dyn StdError + Send + Sync + 'static>;

/// A task as stored in a work queue.
pub(crate) type Task = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

/// Why a task did not complete successfully.
///
/// Handed to the error policy of the processor that ran the task, on the pool thread that ran it.
#[derive(Debug)]
#[non_exhaustive]
pub enum Failure {
    /// The task returned an error.
    Error(TaskError),

    /// The task panicked. Holds the panic payload.
    Panic(Box<dyn Any + Send + 'static>),
}

impl Failure {
    /// Returns a human-readable description of the failure.
    ///
    /// For panics, this is the panic message if the payload was a string, or a placeholder
    /// otherwise.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Error(error) => error.to_string(),
            Self::Panic(payload) => panic_message(payload.as_ref()).to_owned(),
        }
    }

    /// Whether the task panicked rather than returning an error.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panic(_))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(error) => write!(f, "task returned an error: {error}"),
            Self::Panic(payload) => write!(f, "task panicked: {}", panic_message(payload.as_ref())),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Runs a task to completion on the current thread, converting both returned errors and panics
/// into a [`Failure`].
pub(crate) fn run_task(task: Task) -> Result<(), Failure> {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(Failure::Error(error)),
        Err(payload) => Err(Failure::Panic(payload)),
    }
}
