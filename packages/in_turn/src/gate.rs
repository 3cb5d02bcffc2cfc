//! Parking producers and finish-waiters until a processor makes progress.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// How a wait on a [`Gate`] ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WaitOutcome {
    Ready,
    Interrupted,
    TimedOut,
}

/// A condition variable paired with a count of parked threads.
///
/// Whoever changes the state a waiter is interested in calls [`Gate::open()`] afterwards. Opening
/// a gate nobody waits on costs one fence and one atomic load, so the uncontended path never
/// touches the mutex.
pub(crate) struct Gate {
    lock: Mutex<()>,
    condvar: Condvar,
    waiters: AtomicUsize,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Parks the calling thread until `ready` returns `true`, the interrupt token is interrupted
    /// or the deadline passes.
    ///
    /// `ready` is re-evaluated after every wake-up, so spurious wake-ups are harmless. If `ready`
    /// is already `true`, this returns immediately without touching the mutex, even if the token
    /// is interrupted.
    pub(crate) fn wait_until(
        self: &Arc<Self>,
        mut ready: impl FnMut() -> bool,
        interrupt: Option<&Interrupt>,
        deadline: Option<Instant>,
    ) -> WaitOutcome {
        if ready() {
            return WaitOutcome::Ready;
        }

        let _registration = interrupt.map(|interrupt| interrupt.register(self));

        let mut guard = self.lock.lock();

        // SeqCst on the increment and the fence after it pair with the fence in `open()`: either
        // the opener sees us counted, or we see the state change it made before opening.
        self.waiters.fetch_add(1, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);

        let outcome = loop {
            if ready() {
                break WaitOutcome::Ready;
            }

            if interrupt.is_some_and(Interrupt::is_interrupted) {
                break WaitOutcome::Interrupted;
            }

            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                        break if ready() {
                            WaitOutcome::Ready
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                }
                None => self.condvar.wait(&mut guard),
            }
        };

        self.waiters.fetch_sub(1, Ordering::SeqCst);

        outcome
    }

    /// Wakes every thread parked on the gate, if there are any.
    ///
    /// Must be called after the state change that may satisfy the waiters has been published.
    pub(crate) fn open(&self) {
        atomic::fence(Ordering::SeqCst);

        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }

        self.wake_all();
    }

    fn wake_all(&self) {
        // Taking the lock guarantees that a waiter which has already counted itself is inside
        // `Condvar::wait()` by the time we notify, so the notification cannot be missed.
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A token that cancels blocking processor calls made with it.
///
/// Rust threads cannot be interrupted from the outside, so every blocking processor operation has
/// an `_interruptible` variant that takes one of these tokens. Calling [`interrupt()`] wakes every
/// thread currently parked with the token (or a clone of it), and those calls return
/// [`Error::Interrupted`].
///
/// Interruption is sticky: once interrupted, any later call that would need to park returns
/// [`Error::Interrupted`] immediately, until [`reset()`] is called. Calls that can complete
/// without parking are not affected.
///
/// # Example
///
/// ```rust
/// use std::thread;
/// use std::time::Duration;
///
/// use in_turn::Interrupt;
///
/// let interrupt = Interrupt::new();
///
/// let canceller = thread::spawn({
///     let interrupt = interrupt.clone();
///     move || {
///         thread::sleep(Duration::from_millis(10));
///         interrupt.interrupt();
///     }
/// });
///
/// // Pass `&interrupt` to e.g. `Processor::add_with_backpressure_interruptible()`.
/// canceller.join().unwrap();
/// assert!(interrupt.is_interrupted());
/// ```
///
/// [`interrupt()`]: Self::interrupt
/// [`reset()`]: Self::reset
/// [`Error::Interrupted`]: crate::Error::Interrupted
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

#[derive(Default)]
struct InterruptInner {
    interrupted: AtomicBool,

    /// Gates that threads using this token are currently parked on. A gate appears once per
    /// parked thread.
    parked_on: Mutex<Vec<Arc<Gate>>>,
}

impl Interrupt {
    /// Creates a token that is not interrupted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupts every blocking call that uses this token, now or later, until [`reset()`].
    ///
    /// [`reset()`]: Self::reset
    pub fn interrupt(&self) {
        // SeqCst so that a thread registering with the token after we take the snapshot below is
        // guaranteed to observe the flag.
        self.inner.interrupted.store(true, Ordering::SeqCst);

        let parked_on = self.inner.parked_on.lock().clone();

        for gate in parked_on {
            gate.wake_all();
        }
    }

    /// Whether the token is currently interrupted.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Clears the interruption so that the token can be used again.
    pub fn reset(&self) {
        self.inner.interrupted.store(false, Ordering::SeqCst);
    }

    fn register(&self, gate: &Arc<Gate>) -> Registration<'_> {
        self.inner.parked_on.lock().push(Arc::clone(gate));

        Registration {
            interrupt: self,
            gate: Arc::clone(gate),
        }
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("interrupted", &self.is_interrupted())
            .finish_non_exhaustive()
    }
}

/// Keeps a gate registered with an interrupt token for as long as a thread is parked on it.
struct Registration<'a> {
    interrupt: &'a Interrupt,
    gate: Arc<Gate>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut parked_on = self.interrupt.inner.parked_on.lock();

        if let Some(index) = parked_on.iter().position(|g| Arc::ptr_eq(g, &self.gate)) {
            parked_on.swap_remove(index);
        }
    }
}
