//! Serializing producers that share one processor.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// How producers enter a processor.
///
/// The serialized variant holds a lock for the duration of each admission so that tasks from
/// different threads are enqueued in the order the threads acquired the lock. The lock is
/// reentrant: a thread that is already inside an admission (for example a task run inline by an
/// executor that executes jobs on the submitting thread) can add more work to the same processor
/// without deadlocking.
///
/// The unserialized variant skips the lock. Callers promise that a single thread at a time adds
/// to the processor; violating that promise does not break memory safety or lose tasks, but the
/// relative order of tasks from different threads is then unspecified.
#[derive(Debug)]
pub(crate) enum Admission {
    Serialized(ReentrantMutex<()>),
    Unserialized,
}

impl Admission {
    pub(crate) fn new(multi_source: bool) -> Self {
        if multi_source {
            Self::Serialized(ReentrantMutex::new(()))
        } else {
            Self::Unserialized
        }
    }

    /// Enters the admission section, which lasts until the returned guard is dropped.
    #[must_use]
    pub(crate) fn enter(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        match self {
            Self::Serialized(lock) => Some(lock.lock()),
            Self::Unserialized => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_serialized(&self) -> bool {
        matches!(self, Self::Serialized(_))
    }
}
