//! A factory that creates processors sharing one executor.

use std::fmt;
use std::sync::Arc;

use crate::{Executor, ProcessorBuilder};

/// Hands out processors that share one executor.
///
/// A dispatcher binds an executor once, so that code creating processors does not need to know
/// which pool they run on. Processors are cheap: one that never receives a task costs nothing
/// beyond its own memory, so creating one per entity (connection, account, document) is the
/// intended usage pattern.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use in_turn::{Dispatcher, ThreadPool};
///
/// let dispatcher = Dispatcher::new(Arc::new(ThreadPool::new()));
///
/// let accounts = (0..1000)
///     .map(|_| dispatcher.processor().build())
///     .collect::<Vec<_>>();
///
/// assert!(accounts.iter().all(|account| account.is_idle()));
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn Executor>,
}

impl Dispatcher {
    /// Creates a dispatcher whose processors submit their batch runners to `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Starts building a processor bound to this dispatcher's executor.
    pub fn processor(&self) -> ProcessorBuilder {
        ProcessorBuilder::new(Arc::clone(&self.executor))
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
