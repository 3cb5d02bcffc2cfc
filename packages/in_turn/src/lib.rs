#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Many sequential processors multiplexed over a small shared thread pool.
//!
//! A [`Processor`] is a mailbox: every task added to it runs strictly one at a time and in the
//! order it was added, yet the processor owns no thread. When a processor has work, it submits a
//! single batch runner job to a shared [`Executor`]; when its queue runs dry, it goes idle and
//! costs nothing. Thousands of processors can therefore share a handful of threads, which is the
//! scheduling problem underlying actor systems and per-entity task sequencing.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//!
//! use in_turn::{Dispatcher, ThreadPool};
//!
//! let pool = Arc::new(ThreadPool::new());
//! let dispatcher = Dispatcher::new(pool);
//!
//! let processor = dispatcher.processor().build();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! for i in 0..10 {
//!     let seen = Arc::clone(&seen);
//!     assert!(processor.add(move || {
//!         seen.lock().unwrap().push(i);
//!         Ok(())
//!     }));
//! }
//!
//! processor.await_finish();
//! assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
//! ```
//!
//! # Configuration
//!
//! [`ProcessorBuilder`] selects how a processor admits work:
//!
//! - **Multi-source** (default): producers on different threads may share the processor; their
//!   entry into it is serialized.
//! - **Limit**: a bounded queue that rejects (or, in blocking mode, waits) when full.
//! - **Batch size**: how many tasks one pool visit may run before the thread is handed back.
//! - **Error policy**: decides whether a failed task aborts the processor for good.
//!
//! # Failures
//!
//! A task returns `Result<(), TaskError>`. An error or a panic becomes a [`Failure`] that is
//! handed to the processor's error policy on the pool thread; it never reaches the producer that
//! added the task. A policy that returns [`Decision::Abort`] moves the processor into its terminal
//! aborted state: queued tasks are discarded and every later `add()` returns `false`.
//!
//! # Blocking and interruption
//!
//! [`Processor::add_with_backpressure()`], blocking-mode [`Processor::add()`] and
//! [`Processor::await_finish()`] park the calling thread. Each has an `_interruptible` variant that
//! takes an [`Interrupt`] token; interrupting the token wakes the parked thread, which then returns
//! [`Error::Interrupted`].

mod admission;
mod batch_runner;
mod builder;
mod dispatcher;
mod error;
mod executor;
mod gate;
mod policy;
mod processor;
mod sequencer;
mod task;
mod thread_pool;
mod work_queue;

pub(crate) use admission::*;
pub(crate) use batch_runner::*;
pub use builder::*;
pub use dispatcher::*;
pub use error::*;
pub use executor::*;
pub use gate::Interrupt;
pub(crate) use gate::{Gate, WaitOutcome};
pub use policy::*;
pub use processor::*;
pub(crate) use sequencer::*;
pub use task::*;
pub use thread_pool::*;
pub(crate) use work_queue::*;
