//! Queue strategies holding the pending tasks of a processor.

use std::num::NonZero;

use crossbeam::queue::{ArrayQueue, SegQueue};

use crate::Task;

/// FIFO holding area for the pending tasks of one processor.
///
/// Implementations are safe for any number of concurrent producers and consumers. The sequencer
/// guarantees there is only ever one consumer (the active batch runner) at a time.
pub(crate) trait WorkQueue: Send + Sync + 'static {
    /// Appends a task, handing it back if the queue is at capacity.
    fn offer(&self, task: Task) -> Result<(), Task>;

    /// Removes the oldest task, if any.
    fn poll(&self) -> Option<Task>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool;

    /// The maximum number of tasks the queue can hold, or `None` if unbounded.
    fn capacity(&self) -> Option<usize>;

    /// Discards every queued task, returning how many were discarded.
    fn clear(&self) -> usize {
        let mut discarded: usize = 0;

        while self.poll().is_some() {
            discarded = discarded.saturating_add(1);
        }

        discarded
    }
}

#[derive(Debug, Default)]
pub(crate) struct UnboundedQueue {
    tasks: SegQueue<Task>,
}

impl UnboundedQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl WorkQueue for UnboundedQueue {
    fn offer(&self, task: Task) -> Result<(), Task> {
        self.tasks.push(task);
        Ok(())
    }

    fn poll(&self) -> Option<Task> {
        self.tasks.pop()
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn capacity(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug)]
pub(crate) struct BoundedQueue {
    tasks: ArrayQueue<Task>,
}

impl BoundedQueue {
    pub(crate) fn new(capacity: NonZero<usize>) -> Self {
        Self {
            tasks: ArrayQueue::new(capacity.get()),
        }
    }
}

impl WorkQueue for BoundedQueue {
    fn offer(&self, task: Task) -> Result<(), Task> {
        self.tasks.push(task)
    }

    fn poll(&self) -> Option<Task> {
        self.tasks.pop()
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.tasks.capacity())
    }
}
