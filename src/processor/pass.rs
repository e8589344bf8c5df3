//! Single-writer processing loop.

use crate::error::{OperationFailure, ProcessingError};
use crate::queue::MutationQueue;
use crate::subscriptions::SubscriptionManager;
use crate::types::{GetOperation, PassId, PassSummary, SetOperation};
use parking_lot::{Mutex, RwLock};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Owns the authoritative state and drains the queue into it.
///
/// At most one pass runs at a time. Callers that find a pass already
/// running return immediately; the running pass re-checks the queue before
/// it finishes, so their work is picked up.
pub struct StateProcessor<S> {
    queue: MutationQueue<S>,
    /// Authoritative state. Only locked by the pass that holds `running`.
    current: Mutex<Arc<S>>,
    /// Latest published snapshot.
    published: RwLock<Arc<S>>,
    subscriptions: SubscriptionManager<S>,
    running: AtomicBool,
    next_pass: AtomicU64,
    totals: Mutex<PassSummary>,
}

/// Clears the running flag even if a pass unwinds.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: Send + Sync + 'static> StateProcessor<S> {
    /// Create a processor seeded with an initial state.
    pub fn new(initial: S) -> Self {
        let initial = Arc::new(initial);
        Self {
            queue: MutationQueue::new(),
            current: Mutex::new(Arc::clone(&initial)),
            published: RwLock::new(initial),
            subscriptions: SubscriptionManager::new(),
            running: AtomicBool::new(false),
            next_pass: AtomicU64::new(1),
            totals: Mutex::new(PassSummary::default()),
        }
    }

    pub fn queue(&self) -> &MutationQueue<S> {
        &self.queue
    }

    pub fn subscriptions(&self) -> &SubscriptionManager<S> {
        &self.subscriptions
    }

    /// Latest published state. May lag behind queued transforms.
    pub fn snapshot(&self) -> Arc<S> {
        Arc::clone(&self.published.read())
    }

    /// True while a pass is executing.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Cumulative counts over every pass run so far.
    pub fn totals(&self) -> PassSummary {
        *self.totals.lock()
    }

    /// Queue a transform. Returns false, dropping the operation, once closed.
    pub fn enqueue_set(&self, op: SetOperation<S>) -> bool {
        self.queue.enqueue_set(op).is_ok()
    }

    /// Queue a read. Returns false, dropping the operation, once closed.
    pub fn enqueue_get(&self, op: GetOperation<S>) -> bool {
        self.queue.enqueue_get(op).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Run passes until the queue is observed empty.
    ///
    /// Returns an idle summary with zero passes if another pass is already
    /// running on a different thread (or further up this thread's stack).
    pub fn process_pending(&self) -> PassSummary {
        let mut summary = PassSummary::default();
        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                trace!("processing pass already running");
                return summary;
            }

            let pass = PassId(self.next_pass.fetch_add(1, Ordering::Relaxed));
            {
                let _guard = RunningGuard(&self.running);
                summary.absorb(self.run_pass(pass));
            }

            // An enqueue that lost the CAS above is visible here.
            if !self.queue.has_pending() {
                return summary;
            }
        }
    }

    fn run_pass(&self, pass: PassId) -> PassSummary {
        let mut summary = PassSummary {
            passes: 1,
            ..Default::default()
        };
        let mut current = self.current.lock();

        loop {
            if let Some(batch) = self.queue.drain_all_sets() {
                summary.batches += 1;
                let mut changed = false;

                for (index, op) in batch.into_iter().enumerate() {
                    let state: &S = &current;
                    match guarded(|| op(state)) {
                        Ok(next) => {
                            *current = Arc::new(next);
                            summary.transforms_applied += 1;
                            changed = true;
                        }
                        Err(failure) => {
                            summary.transforms_failed += 1;
                            self.report(ProcessingError::Transform {
                                pass,
                                index,
                                failure,
                            });
                        }
                    }
                }

                if changed {
                    let previous =
                        mem::replace(&mut *self.published.write(), Arc::clone(&current));
                    // Released outside the lock so readers never wait on a drop of S.
                    drop(previous);
                    self.subscriptions.publish(&current, pass);
                    summary.publications += 1;
                }
            }

            // Stops early once a transform is queued, so no read overtakes it.
            while let Some(op) = self.queue.dequeue_get_if_no_sets() {
                let index = (summary.reads_served + summary.reads_failed) as usize;
                let state: &S = &current;
                match guarded(|| op(state)) {
                    Ok(()) => summary.reads_served += 1,
                    Err(failure) => {
                        summary.reads_failed += 1;
                        self.report(ProcessingError::ReadCallback {
                            pass,
                            index,
                            failure,
                        });
                    }
                }
            }

            if !self.queue.has_pending() {
                break;
            }
        }
        drop(current);

        if summary.is_idle() {
            trace!(%pass, "idle processing pass");
        } else {
            debug!(
                %pass,
                batches = summary.batches,
                applied = summary.transforms_applied,
                failed = summary.failures(),
                reads = summary.reads_served,
                "processing pass complete"
            );
        }
        self.totals.lock().absorb(summary);
        summary
    }

    fn report(&self, error: ProcessingError) {
        warn!(pass = %error.pass(), error = %error, "queued operation failed");
        self.subscriptions.report(&error);
    }

    /// Refuse further operations and drop everything still queued.
    ///
    /// Returns the number of operations dropped, or `None` if already closed.
    pub fn close(&self) -> Option<usize> {
        self.queue.close()
    }
}

/// Run an operation, turning a panic into a failure.
fn guarded<T, F>(op: F) -> Result<T, OperationFailure>
where
    F: FnOnce() -> Result<T, OperationFailure>,
{
    match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(result) => result,
        Err(payload) => Err(OperationFailure::from_panic(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn set(f: impl FnOnce(&i64) -> i64 + Send + 'static) -> SetOperation<i64> {
        Box::new(move |s: &i64| Ok(f(s)))
    }

    fn failing_set(msg: &'static str) -> SetOperation<i64> {
        Box::new(move |_: &i64| Err(OperationFailure::from_error(msg)))
    }

    fn get(f: impl FnOnce(&i64) + Send + 'static) -> GetOperation<i64> {
        Box::new(move |s: &i64| {
            f(s);
            Ok(())
        })
    }

    #[test]
    fn test_transforms_fold_in_order() {
        let processor = StateProcessor::new(1i64);
        processor.enqueue_set(set(|s| s + 2));
        processor.enqueue_set(set(|s| s * 5));
        processor.enqueue_set(set(|s| s - 4));

        let summary = processor.process_pending();
        assert_eq!(*processor.snapshot(), 11);
        assert_eq!(summary.passes, 1);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.transforms_applied, 3);
        assert_eq!(summary.publications, 1);
    }

    #[test]
    fn test_empty_queue_pass_publishes_nothing() {
        let processor = StateProcessor::new(0i64);
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        processor.subscriptions().subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let summary = processor.process_pending();
        assert!(summary.is_idle());
        assert_eq!(summary.publications, 0);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_transform_is_skipped() {
        let processor = StateProcessor::new(0i64);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        processor
            .subscriptions()
            .subscribe_errors(move |e| sink.lock().push(e.clone()));

        processor.enqueue_set(set(|s| s + 1));
        processor.enqueue_set(failing_set("rejected"));
        processor.enqueue_set(set(|s| s * 2));

        let summary = processor.process_pending();
        assert_eq!(*processor.snapshot(), 2);
        assert_eq!(summary.transforms_applied, 2);
        assert_eq!(summary.transforms_failed, 1);

        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ProcessingError::Transform { index: 1, failure: OperationFailure::Error(msg), .. }
                if msg == "rejected"
        ));
    }

    #[test]
    fn test_panicking_transform_keeps_previous_state() {
        let processor = StateProcessor::new(10i64);
        processor.enqueue_set(Box::new(|_: &i64| panic!("bad transform")));

        let summary = processor.process_pending();
        assert_eq!(summary.transforms_failed, 1);
        assert_eq!(summary.publications, 0);
        assert_eq!(*processor.snapshot(), 10);
        assert!(!processor.is_running());
    }

    #[test]
    fn test_reads_see_all_prior_transforms() {
        let processor = StateProcessor::new(0i64);
        let seen = Arc::new(Mutex::new(Vec::new()));

        processor.enqueue_set(set(|s| s + 1));
        let log = Arc::clone(&seen);
        processor.enqueue_get(get(move |s| log.lock().push(*s)));
        processor.enqueue_set(set(|s| s + 10));
        let log = Arc::clone(&seen);
        processor.enqueue_get(get(move |s| log.lock().push(*s)));

        processor.process_pending();
        // Sets are flushed before any read is served
        assert_eq!(*seen.lock(), vec![11, 11]);
    }

    #[test]
    fn test_read_that_enqueues_transform_is_drained_in_same_call() {
        let processor = Arc::new(StateProcessor::new(0i64));
        let inner = Arc::clone(&processor);
        processor.enqueue_get(get(move |_| {
            inner.enqueue_set(set(|s| s + 7));
        }));

        let summary = processor.process_pending();
        assert_eq!(*processor.snapshot(), 7);
        assert_eq!(summary.passes, 1);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.reads_served, 1);
    }

    #[test]
    fn test_read_queued_behind_transform_from_callback() {
        let processor = Arc::new(StateProcessor::new(0i64));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner = Arc::clone(&processor);
        let log = Arc::clone(&seen);
        processor.enqueue_get(get(move |_| {
            inner.enqueue_set(set(|s| s + 1));
            let log = Arc::clone(&log);
            inner.enqueue_get(get(move |s| log.lock().push(*s)));
        }));
        // Already queued before the callback ran
        let log = Arc::clone(&seen);
        processor.enqueue_get(get(move |s| log.lock().push(*s)));

        processor.process_pending();
        assert_eq!(*seen.lock(), vec![1, 1]);
    }

    #[test]
    fn test_reentrant_process_is_noop() {
        let processor = Arc::new(StateProcessor::new(0i64));
        let inner = Arc::clone(&processor);
        let nested = Arc::new(Mutex::new(None));
        let out = Arc::clone(&nested);
        processor.enqueue_get(get(move |_| {
            *out.lock() = Some(inner.process_pending());
        }));

        processor.process_pending();
        let nested = nested.lock().take().unwrap();
        assert_eq!(nested.passes, 0);
    }

    #[test]
    fn test_failing_read_does_not_block_later_reads() {
        let processor = StateProcessor::new(3i64);
        let seen = Arc::new(Mutex::new(Vec::new()));

        processor.enqueue_get(Box::new(|_: &i64| panic!("reader crashed")));
        let log = Arc::clone(&seen);
        processor.enqueue_get(get(move |s| log.lock().push(*s)));

        let summary = processor.process_pending();
        assert_eq!(summary.reads_failed, 1);
        assert_eq!(summary.reads_served, 1);
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn test_closed_processor_refuses_operations() {
        let processor = StateProcessor::new(0i64);
        assert!(processor.enqueue_set(set(|s| s + 1)));
        assert_eq!(processor.close(), Some(1));

        assert!(processor.is_closed());
        assert!(!processor.enqueue_set(set(|s| s + 1)));
        assert!(!processor.enqueue_get(get(|_| {})));
        assert!(processor.process_pending().is_idle());
        assert_eq!(processor.close(), None);
    }

    #[test]
    fn test_snapshot_not_blocked_by_dropping_old_state() {
        use crossbeam_channel::{bounded, Receiver, Sender};
        use std::time::Duration;

        struct Tracked {
            value: i64,
            on_drop: Mutex<Option<(Sender<()>, Receiver<()>)>>,
        }

        impl Drop for Tracked {
            fn drop(&mut self) {
                if let Some((entered, release)) = self.on_drop.lock().take() {
                    let _ = entered.send(());
                    let _ = release.recv();
                }
            }
        }

        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let processor = Arc::new(StateProcessor::new(Tracked {
            value: 0,
            on_drop: Mutex::new(Some((entered_tx, release_rx))),
        }));
        processor.enqueue_set(Box::new(|s: &Tracked| {
            Ok(Tracked {
                value: s.value + 1,
                on_drop: Mutex::new(None),
            })
        }));

        let runner = {
            let processor = Arc::clone(&processor);
            thread::spawn(move || processor.process_pending())
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The old state is mid-drop; readers must still get through
        let (seen_tx, seen_rx) = bounded(1);
        let reader = {
            let processor = Arc::clone(&processor);
            thread::spawn(move || {
                let _ = seen_tx.send(processor.snapshot().value);
            })
        };
        let seen = seen_rx.recv_timeout(Duration::from_secs(5));

        release_tx.send(()).unwrap();
        runner.join().unwrap();
        reader.join().unwrap();
        assert_eq!(seen.unwrap(), 1);
    }

    #[test]
    fn test_concurrent_process_calls_single_writer() {
        let processor = Arc::new(StateProcessor::new(0i64));
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        for _ in 0..200 {
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            processor.enqueue_set(set(move |s| {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                thread::yield_now();
                active.fetch_sub(1, Ordering::SeqCst);
                s + 1
            }));
        }

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let processor = Arc::clone(&processor);
                thread::spawn(move || processor.process_pending())
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        processor.process_pending();

        assert!(!overlap.load(Ordering::SeqCst));
        assert_eq!(*processor.snapshot(), 200);
        assert_eq!(processor.totals().transforms_applied, 200);
    }
}
