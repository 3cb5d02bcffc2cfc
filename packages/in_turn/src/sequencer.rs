//! The scheduling state machine behind every processor.
//!
//! A sequencer is in one of three states:
//!
//! * `IDLE` - no batch runner exists. The queue may transiently hold tasks whose producer is about
//!   to schedule a runner, or that a runner going idle is about to take back.
//! * `SCHEDULED` - exactly one batch runner job exists for this sequencer: submitted, running or
//!   about to be resubmitted. Whoever moved the state to `SCHEDULED` owns the runner.
//! * `ABORTED` - terminal. The queue is discarded and nothing is accepted any more.
//!
//! Producers only ever move the state `IDLE -> SCHEDULED`, via compare-exchange, so at most one of
//! them wins and submits a runner. The runner is the only party that moves it
//! `SCHEDULED -> IDLE`, and it re-checks the queue after publishing the transition. Both sides
//! place a `SeqCst` fence between their write (enqueue, or idle store) and their read (state, or
//! queue), so at least one of them observes the other: either the producer sees `IDLE` and
//! schedules a runner, or the runner sees the task and takes the processor back. A task can
//! therefore never be stranded in the queue of an idle processor.

use std::cell::Cell;
use std::num::NonZero;
use std::ptr;
use std::sync::atomic::{self, AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::{
    Admission, Decision, Error, ErrorPolicy, Executor, Failure, Gate, Interrupt, ProcessorState,
    Result, Task, WaitOutcome, WorkQueue, decide, run_batch,
};

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const ABORTED: u8 = 2;

thread_local! {
    /// Identity of the sequencer whose batch runner is executing on this thread, or 0 if none.
    static ACTIVE_RUNNER: Cell<usize> = const { Cell::new(0) };
}

/// The options a sequencer was built with.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Settings {
    pub(crate) batch_size: NonZero<u32>,

    /// Queue capacity, 0 meaning unbounded.
    pub(crate) limit: u32,

    pub(crate) multi_source: bool,

    /// Whether a full bounded queue makes `add()` wait instead of rejecting. Always `false` for
    /// unbounded queues.
    pub(crate) blocking: bool,
}

/// A sequencer with its queue strategy erased, as held by the public processor handle.
pub(crate) trait Sequence: Send + Sync + 'static {
    /// Enqueues a task.
    ///
    /// With a threshold, the caller first waits until the queue holds at most `threshold` tasks.
    /// In blocking mode, the caller also waits for room in a full bounded queue.
    fn admit(
        &self,
        task: Task,
        threshold: Option<usize>,
        interrupt: Option<&Interrupt>,
    ) -> Result<bool>;

    fn size(&self) -> usize;

    fn state(&self) -> ProcessorState;

    /// Waits until the processor is idle with an empty queue, or aborted.
    fn await_settled(
        &self,
        interrupt: Option<&Interrupt>,
        deadline: Option<Instant>,
    ) -> WaitOutcome;

    fn settings(&self) -> &Settings;
}

/// Result of offering a task to the queue without waiting.
enum Offer {
    Accepted,
    Rejected,
    Full(Task),
}

pub(crate) struct Sequencer<Q> {
    /// Lets `&self` methods hand an owning reference to the batch runner jobs they submit.
    this: Weak<Self>,

    queue: Q,
    state: AtomicU8,

    /// Set when an inline executor ran a resubmitted batch runner while the previous one was
    /// still on the stack. The outer runner then runs another batch instead.
    rerun: AtomicBool,

    executor: Arc<dyn Executor>,
    error_policy: ErrorPolicy,
    admission: Admission,
    settings: Settings,

    /// Opened whenever a task leaves the queue or the processor aborts.
    drained: Arc<Gate>,

    /// Opened whenever the processor goes idle or aborts.
    settled: Arc<Gate>,
}

impl<Q> Sequencer<Q>
where
    Q: WorkQueue,
{
    pub(crate) fn new(
        queue: Q,
        executor: Arc<dyn Executor>,
        error_policy: ErrorPolicy,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: Weak::clone(this),
            queue,
            state: AtomicU8::new(IDLE),
            rerun: AtomicBool::new(false),
            executor,
            error_policy,
            admission: Admission::new(settings.multi_source),
            settings,
            drained: Arc::new(Gate::new()),
            settled: Arc::new(Gate::new()),
        })
    }

    /// Enqueues the task without waiting and makes sure a batch runner will see it.
    fn offer(&self, task: Task) -> Offer {
        // Acquire pairs with the store in `abort()`. This is only a shortcut; the authoritative
        // check happens after the task is enqueued.
        if self.state.load(Ordering::Acquire) == ABORTED {
            return Offer::Rejected;
        }

        if let Err(task) = self.queue.offer(task) {
            return Offer::Full(task);
        }

        // Pairs with the fences in `complete_batch()` and `abort()`: the enqueue must not be
        // reordered after the state load below.
        atomic::fence(Ordering::SeqCst);

        loop {
            match self.state.load(Ordering::SeqCst) {
                IDLE => {
                    if self
                        .state
                        .compare_exchange(IDLE, SCHEDULED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return if self.submit_runner() {
                            Offer::Accepted
                        } else {
                            Offer::Rejected
                        };
                    }

                    // A runner going idle took the processor back first. The state is no
                    // longer IDLE, so the next iteration returns.
                }
                SCHEDULED => return Offer::Accepted,
                _ => {
                    // Aborted while we were enqueueing. Nothing will ever drain the queue.
                    self.queue.clear();
                    return Offer::Rejected;
                }
            }
        }
    }

    /// Submits a batch runner job. The caller must own the `SCHEDULED` state.
    ///
    /// Returns `false` if the executor refused the job, in which case the processor is aborted.
    fn submit_runner(&self) -> bool {
        let Some(this) = self.this.upgrade() else {
            // The last handle is being dropped; nobody can observe the queue any more.
            return false;
        };

        match self.executor.execute(Box::new(move || this.drain())) {
            Ok(()) => {
                trace!(queued = self.queue.len(), "batch runner submitted");
                true
            }
            Err(error) => {
                error!(%error, "executor refused the batch runner; aborting processor");
                self.abort();
                false
            }
        }
    }

    /// Body of the batch runner job.
    fn drain(&self) {
        if self.is_runner_thread() {
            // Submitted from our own `complete_batch()` and run inline. Nesting here would grow
            // the stack by one batch per resubmission, so hand the batch to the outer runner.
            self.rerun.store(true, Ordering::Relaxed);
            return;
        }

        // Executors that run jobs inline can nest runners of different sequencers.
        let previous = ACTIVE_RUNNER.replace(self.id());
        let _restore = scopeguard::guard(previous, |previous| ACTIVE_RUNNER.set(previous));

        let release_waiters = || self.drained.open();

        loop {
            let outcome = run_batch(&self.queue, self.settings.batch_size, release_waiters);

            trace!(executed = outcome.executed, "batch finished");

            self.complete_batch(outcome.failure);

            // Only ever set on this thread, by a nested call made from `complete_batch()`.
            if !self.rerun.swap(false, Ordering::Relaxed) {
                break;
            }
        }
    }

    fn complete_batch(&self, failure: Option<Failure>) {
        if let Some(failure) = failure {
            match decide(&self.error_policy, &failure) {
                Decision::Continue => {
                    warn!(%failure, "task failed; error policy lets the processor continue");
                }
                Decision::Abort => {
                    error!(%failure, "task failed; error policy aborts the processor");
                    self.abort();
                    return;
                }
            }
        }

        if !self.queue.is_empty() {
            // Still scheduled. A fresh job rather than a loop gives other processors a turn.
            self.submit_runner();
            return;
        }

        self.state.store(IDLE, Ordering::SeqCst);

        // Pairs with the fence in `offer()`: the idle store must not be reordered after the
        // emptiness check below.
        atomic::fence(Ordering::SeqCst);

        if self.queue.is_empty() {
            debug!("processor is idle");
            self.settled.open();
            return;
        }

        // A producer enqueued between our two emptiness checks and may have seen us still
        // scheduled. Take the processor back unless a producer already did.
        if self
            .state
            .compare_exchange(IDLE, SCHEDULED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.submit_runner();
        }
    }

    fn abort(&self) {
        self.state.store(ABORTED, Ordering::SeqCst);

        // Pairs with the fence in `offer()`: a task enqueued after our clear is guaranteed to
        // find the processor aborted, and its producer discards it.
        atomic::fence(Ordering::SeqCst);

        let discarded = self.queue.clear();
        debug!(discarded, "processor aborted");

        self.drained.open();
        self.settled.open();
    }

    fn is_aborted(&self) -> bool {
        self.state.load(Ordering::Acquire) == ABORTED
    }

    fn is_settled(&self) -> bool {
        match self.state.load(Ordering::SeqCst) {
            IDLE => self.queue.is_empty(),
            ABORTED => true,
            _ => false,
        }
    }

    /// Whether a waiting producer may proceed to enqueue.
    fn has_room(&self, threshold: Option<usize>) -> bool {
        let len = self.queue.len();

        let below_threshold = threshold.is_none_or(|threshold| len <= threshold);
        let below_capacity =
            !self.settings.blocking || self.queue.capacity().is_none_or(|capacity| len < capacity);

        below_threshold && below_capacity
    }

    /// Whether the current thread is running one of this sequencer's batches. Parking such a
    /// thread until the queue drains would deadlock, as only it can drain the queue.
    fn is_runner_thread(&self) -> bool {
        ACTIVE_RUNNER.get() == self.id()
    }

    fn id(&self) -> usize {
        ptr::from_ref(self).addr()
    }
}

impl<Q> Sequence for Sequencer<Q>
where
    Q: WorkQueue,
{
    fn admit(
        &self,
        mut task: Task,
        threshold: Option<usize>,
        interrupt: Option<&Interrupt>,
    ) -> Result<bool> {
        loop {
            {
                let _admitted = self.admission.enter();

                // Covers the window between `abort()` publishing the state and clearing the
                // queue, in which an over-threshold queue would otherwise never reach `offer()`.
                if self.is_aborted() {
                    return Ok(false);
                }

                let may_park = !self.is_runner_thread();
                let over_threshold =
                    threshold.is_some_and(|threshold| self.queue.len() > threshold);

                if !over_threshold || !may_park {
                    match self.offer(task) {
                        Offer::Accepted => return Ok(true),
                        Offer::Rejected => return Ok(false),
                        Offer::Full(returned) if self.settings.blocking && may_park => {
                            task = returned;
                        }
                        Offer::Full(_) => return Ok(false),
                    }
                }
            }

            // The admission section is left before parking, so producers on other threads are
            // never stuck behind a parked one on an uninterruptible lock.
            let ready = || self.is_aborted() || self.has_room(threshold);

            match self.drained.wait_until(ready, interrupt, None) {
                WaitOutcome::Interrupted => return Err(Error::Interrupted),
                WaitOutcome::Ready | WaitOutcome::TimedOut => {}
            }
        }
    }

    fn size(&self) -> usize {
        self.queue.len()
    }

    fn state(&self) -> ProcessorState {
        match self.state.load(Ordering::Acquire) {
            IDLE if self.queue.is_empty() => ProcessorState::Idle,
            ABORTED => ProcessorState::Aborted,
            _ => ProcessorState::Scheduled,
        }
    }

    fn await_settled(
        &self,
        interrupt: Option<&Interrupt>,
        deadline: Option<Instant>,
    ) -> WaitOutcome {
        // A task waiting for its own processor to finish would wait forever. Check once instead.
        let deadline = if self.is_runner_thread() {
            Some(Instant::now())
        } else {
            deadline
        };

        self.settled.wait_until(|| self.is_settled(), interrupt, deadline)
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }
}
