//! Integration tests for processors running on a real thread pool.
//!
//! They are ignored under Miri because they spawn many threads and sleep.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use in_turn::{
    Decision, Dispatcher, Error, ExecuteError, Executor, Failure, Interrupt, Job, Processor,
    ProcessorState, TaskError, ThreadPool,
};
use new_zealand::nz;
use testing::{ConcurrencyProbe, Recorder, with_watchdog};

const SENTINEL: u32 = 666;

fn pool(threads: usize) -> Arc<ThreadPool> {
    Arc::new(
        ThreadPool::builder()
            .thread_count(threads.try_into().unwrap())
            .build(),
    )
}

/// Forwards jobs to a thread pool, counting them.
struct CountingExecutor {
    inner: Arc<ThreadPool>,
    submissions: AtomicUsize,
}

impl CountingExecutor {
    fn new(inner: Arc<ThreadPool>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            submissions: AtomicUsize::new(0),
        })
    }

    fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

impl Executor for CountingExecutor {
    fn execute(&self, job: Job) -> Result<(), ExecuteError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(job)
    }
}

/// Occupies every worker of the pool until the returned sender is dropped or sent to.
fn block_workers(pool: &ThreadPool) -> channel::Sender<()> {
    let (release_tx, release_rx) = channel::unbounded::<()>();

    for _ in 0..pool.thread_count().get() {
        let release_rx = release_rx.clone();
        pool.execute(Box::new(move || {
            // Either a message or a disconnect releases the worker.
            drop(release_rx.recv());
        }))
        .unwrap();
    }

    release_tx
}

/// A task that waits until released, keeping its processor busy.
fn gate_task(
    release_rx: channel::Receiver<()>,
) -> impl FnOnce() -> Result<(), TaskError> + Send + 'static {
    move || {
        drop(release_rx.recv());
        Ok(())
    }
}

#[cfg_attr(miri, ignore)]
#[test]
fn single_source_preserves_order() {
    with_watchdog(|| {
        let processor = Dispatcher::new(pool(4))
            .processor()
            .multi_source(false)
            .build();
        let recorder = Recorder::new();

        for i in 0..1000 {
            let recorder = recorder.clone();
            assert!(processor.add(move || {
                recorder.record(i);
                Ok(())
            }));
        }

        processor.await_finish();

        assert_eq!(recorder.snapshot(), (0..1000).collect::<Vec<_>>());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn multi_source_loses_nothing_and_keeps_per_producer_order() {
    with_watchdog(|| {
        let processor = Dispatcher::new(pool(4)).processor().build();
        let recorder = Recorder::new();

        let producers = (0..4_u32)
            .map(|producer| {
                let processor = processor.clone();
                let recorder = recorder.clone();

                thread::spawn(move || {
                    for i in 0..250_u32 {
                        let recorder = recorder.clone();
                        assert!(processor.add(move || {
                            recorder.record((producer, i));
                            Ok(())
                        }));
                    }
                })
            })
            .collect::<Vec<_>>();

        for producer in producers {
            producer.join().unwrap();
        }

        processor.await_finish();

        let results = recorder.snapshot();
        assert_eq!(results.len(), 1000);

        for producer in 0..4 {
            let own = results
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, i)| *i)
                .collect::<Vec<_>>();

            assert_eq!(own, (0..250).collect::<Vec<_>>());
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn sentinel_failure_aborts() {
    with_watchdog(|| {
        let pool = pool(2);
        let processor = Dispatcher::new(Arc::<ThreadPool>::clone(&pool))
            .processor()
            .error_policy(|failure: &Failure| {
                if failure.message().contains(&SENTINEL.to_string()) {
                    Decision::Abort
                } else {
                    Decision::Continue
                }
            })
            .build();
        let recorder = Recorder::new();

        // Everything is queued before the first task runs, so the abort finds 4 and 5 queued.
        let release = block_workers(&pool);

        for value in [1, 2, 3, SENTINEL, 4, 5] {
            let recorder = recorder.clone();
            assert!(processor.add(move || {
                recorder.record(value);

                if value == SENTINEL || value == 2 {
                    return Err(format!("bad value {value}").into());
                }

                Ok(())
            }));
        }

        drop(release);
        processor.await_finish();

        assert!(processor.is_aborted());
        assert_eq!(processor.size(), 0);
        assert!(!processor.add(|| Ok(())));

        // Value 2 failed too, but the policy let the processor continue past it. The tasks
        // still queued at the abort never ran.
        assert_eq!(recorder.snapshot(), vec![1, 2, 3, SENTINEL]);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn backpressure_bounds_queue_length() {
    with_watchdog(|| {
        let processor = Dispatcher::new(pool(2)).processor().build();
        let mut max_observed = 0;

        for _ in 0..100 {
            assert!(processor.add_with_backpressure(
                || {
                    thread::sleep(Duration::from_micros(200));
                    Ok(())
                },
                5
            ));

            max_observed = max_observed.max(processor.size());
        }

        processor.await_finish();

        assert!(max_observed <= 6, "observed queue length {max_observed}");
        assert!(processor.is_idle());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn batching_reduces_submissions() {
    with_watchdog(|| {
        let pool = pool(1);
        let executor = CountingExecutor::new(Arc::clone(&pool));
        let processor = Processor::builder(Arc::<CountingExecutor>::clone(&executor))
            .batch_size(nz!(100))
            .build();
        let counter = Arc::new(AtomicUsize::new(0));

        // Queue everything up before the first batch runner gets the worker.
        let release = block_workers(&pool);

        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            assert!(processor.add(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }));
        }

        drop(release);
        processor.await_finish();

        assert_eq!(counter.load(Ordering::Relaxed), 1000);
        assert!(executor.submissions() <= 10, "{} submissions", executor.submissions());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn at_most_one_task_of_a_processor_runs_at_a_time() {
    with_watchdog(|| {
        let processor = Dispatcher::new(pool(8))
            .processor()
            .batch_size(nz!(3))
            .build();
        let probe = ConcurrencyProbe::new();

        let producers = (0..4)
            .map(|_| {
                let processor = processor.clone();
                let probe = probe.clone();

                thread::spawn(move || {
                    for _ in 0..200 {
                        let probe = probe.clone();
                        assert!(processor.add(move || {
                            let _inside = probe.enter();
                            thread::yield_now();
                            Ok(())
                        }));
                    }
                })
            })
            .collect::<Vec<_>>();

        for producer in producers {
            producer.join().unwrap();
        }

        processor.await_finish();

        assert_eq!(probe.max_active(), 1);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn tasks_see_effects_of_previous_tasks() {
    with_watchdog(|| {
        let processor = Dispatcher::new(pool(4)).processor().build();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            assert!(processor.add(move || {
                // Deliberately not an atomic increment. Any task hopping threads without a
                // happens-before edge to its predecessor could lose an update here.
                let seen = counter.load(Ordering::Relaxed);
                counter.store(seen.wrapping_add(1), Ordering::Relaxed);
                Ok(())
            }));
        }

        processor.await_finish();

        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn many_processors_share_few_threads() {
    with_watchdog(|| {
        let dispatcher = Dispatcher::new(pool(2));

        let processors = (0..500)
            .map(|_| (dispatcher.processor().build(), Recorder::new()))
            .collect::<Vec<_>>();

        for i in 0..10 {
            for (processor, recorder) in &processors {
                let recorder = recorder.clone();
                assert!(processor.add(move || {
                    recorder.record(i);
                    Ok(())
                }));
            }
        }

        for (processor, recorder) in &processors {
            processor.await_finish();
            assert_eq!(recorder.snapshot(), (0..10).collect::<Vec<_>>());
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn idle_processor_stops_submitting() {
    with_watchdog(|| {
        let executor = CountingExecutor::new(pool(2));
        let processor = Processor::builder(Arc::<CountingExecutor>::clone(&executor)).build();

        assert!(processor.add(|| Ok(())));
        processor.await_finish();
        assert_eq!(processor.state(), ProcessorState::Idle);

        let submissions = executor.submissions();
        thread::sleep(Duration::from_millis(20));

        assert_eq!(executor.submissions(), submissions);
        assert!(processor.is_idle());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn blocked_producer_can_be_interrupted() {
    with_watchdog(|| {
        let processor = Dispatcher::new(pool(1)).processor().build();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        let recorder = Recorder::new();

        assert!(processor.add(gate_task(release_rx)));
        for i in 0..3 {
            let recorder = recorder.clone();
            assert!(processor.add(move || {
                recorder.record(i);
                Ok(())
            }));
        }

        let interrupt = Interrupt::new();

        let producer = thread::spawn({
            let processor = processor.clone();
            let interrupt = interrupt.clone();
            let recorder = recorder.clone();
            move || {
                processor.add_with_backpressure_interruptible(
                    move || {
                        recorder.record(99);
                        Ok(())
                    },
                    1,
                    &interrupt,
                )
            }
        });

        thread::sleep(Duration::from_millis(10));
        interrupt.interrupt();

        assert!(matches!(producer.join().unwrap(), Err(Error::Interrupted)));

        drop(release_tx);
        processor.await_finish();

        // The interrupted task was never enqueued.
        assert_eq!(recorder.snapshot(), vec![0, 1, 2]);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn abort_releases_blocked_producer() {
    with_watchdog(|| {
        let processor = Dispatcher::new(pool(1))
            .processor()
            .error_policy(|_: &Failure| Decision::Abort)
            .build();
        let (release_tx, release_rx) = channel::unbounded::<()>();

        assert!(processor.add(move || {
            drop(release_rx.recv());
            Err("giving up".into())
        }));
        for _ in 0..3 {
            assert!(processor.add(|| Ok(())));
        }

        let producer = thread::spawn({
            let processor = processor.clone();
            move || processor.add_with_backpressure(|| Ok(()), 0)
        });

        thread::sleep(Duration::from_millis(10));
        drop(release_tx);

        assert!(!producer.join().unwrap());
        assert!(processor.is_aborted());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn blocking_mode_add_is_interruptible() {
    with_watchdog(|| {
        let processor = Dispatcher::new(pool(1))
            .processor()
            .limit(1)
            .blocking(true)
            .build();
        let (release_tx, release_rx) = channel::unbounded::<()>();

        assert!(processor.add(gate_task(release_rx.clone())));

        // Wait for the worker to take the gate task, then fill the queue.
        while processor.size() != 0 {
            thread::yield_now();
        }
        assert!(processor.add(gate_task(release_rx)));

        let interrupt = Interrupt::new();
        interrupt.interrupt();

        let result = processor.add_interruptible(|| Ok(()), &interrupt);
        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(processor.size(), 1);

        interrupt.reset();
        drop(release_tx);

        assert!(processor.add_interruptible(|| Ok(()), &interrupt).unwrap());
        processor.await_finish();
        assert!(processor.is_idle());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn pool_shutdown_aborts_processor() {
    with_watchdog(|| {
        let pool = pool(1);
        let processor = Dispatcher::new(Arc::<ThreadPool>::clone(&pool)).processor().build();

        assert!(processor.add(|| Ok(())));
        processor.await_finish();

        pool.shutdown();

        assert!(!processor.add(|| Ok(())));
        assert_eq!(processor.state(), ProcessorState::Aborted);

        // Aborted counts as finished.
        assert!(processor.await_finish_timeout(Duration::from_secs(1)));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn processors_outlive_dropped_handles_until_drained() {
    with_watchdog(|| {
        let recorder = Recorder::new();
        let pool = pool(2);
        let release = block_workers(&pool);

        {
            let processor = Dispatcher::new(Arc::<ThreadPool>::clone(&pool))
                .processor()
                .batch_size(nz!(100))
                .build();

            for i in 0..100 {
                let recorder = recorder.clone();
                assert!(processor.add(move || {
                    recorder.record(i);
                    Ok(())
                }));
            }
        }

        // The single queued batch runner keeps the processor alive and shutdown waits for it.
        drop(release);
        pool.shutdown();

        assert_eq!(recorder.snapshot(), (0..100).collect::<Vec<_>>());
    });
}
