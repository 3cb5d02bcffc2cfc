//! The crate error type and its `Result` alias.

use thiserror::Error;

/// Errors returned by the blocking operations of a processor.
///
/// Task failures are not reported through this type. They are resolved by the error policy of
/// the processor that ran the task.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The calling thread was parked waiting for the processor and its [`Interrupt`] token was
    /// interrupted. If the call was adding a task, the task was not enqueued.
    ///
    /// [`Interrupt`]: crate::Interrupt
    #[error("the blocking call was interrupted before it could complete")]
    Interrupted,
}

/// A specialized `Result` type for processor operations, returning the crate's [`Error`] type as
/// the error value.
pub type Result<T> = std::result::Result<T, Error>;
