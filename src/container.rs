//! Main StateContainer struct tying all components together.

use crate::dispatch::{spawn_worker, Dispatch, Trigger};
use crate::error::{ContainerError, OperationFailure, ProcessingError, Result};
use crate::processor::StateProcessor;
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandle, SubscriptionId};
use crate::types::{ContainerStats, GetOperation, PassSummary, SetOperation};
use crossbeam_channel::{bounded, Receiver};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Container configuration.
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    /// Name used for the worker thread and in log fields.
    pub name: String,

    /// How processing passes are scheduled.
    pub dispatch: Dispatch,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: "state-queue".to_string(),
            dispatch: Dispatch::Dedicated,
        }
    }
}

impl ContainerConfig {
    /// Configuration for a container driven by `run_pending`.
    pub fn manual() -> Self {
        Self {
            dispatch: Dispatch::Manual,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.contains('\0') {
            return Err(ContainerError::InvalidConfig(
                "container name may not contain NUL bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// State shared between the container, its handles and its worker.
pub(crate) struct Shared<S> {
    name: String,
    processor: StateProcessor<S>,
    discarded: AtomicU64,
}

impl<S: Send + Sync + 'static> Shared<S> {
    pub(crate) fn processor(&self) -> &StateProcessor<S> {
        &self.processor
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.processor.is_closed()
    }
}

/// Cloneable producer handle.
///
/// Handles submit operations and read snapshots; they can be moved to other
/// threads or captured by read callbacks. A handle does not keep the
/// container running: once the container shuts down, submissions are
/// dropped.
pub struct StateHandle<S> {
    shared: Arc<Shared<S>>,
    trigger: Trigger,
}

impl<S> Clone for StateHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            trigger: self.trigger.clone(),
        }
    }
}

impl<S: Send + Sync + 'static> StateHandle<S> {
    /// Queue a transform of the state. Never blocks on processing.
    pub fn submit_transform<F>(&self, transform: F)
    where
        F: FnOnce(&S) -> S + Send + 'static,
    {
        self.enqueue_set(Box::new(move |state: &S| Ok(transform(state))));
    }

    /// Queue a transform that may fail.
    ///
    /// An `Err` leaves the state as it was and is reported to error
    /// listeners; later transforms still apply.
    pub fn try_submit_transform<F, E>(&self, transform: F)
    where
        F: FnOnce(&S) -> std::result::Result<S, E> + Send + 'static,
        E: fmt::Display,
    {
        self.enqueue_set(Box::new(move |state: &S| {
            transform(state).map_err(OperationFailure::from_error)
        }));
    }

    /// Queue a read. It observes every transform submitted before it.
    pub fn submit_read<F>(&self, read: F)
    where
        F: FnOnce(&S) + Send + 'static,
    {
        // Dropped and logged after shutdown
        let _ = self.enqueue_get(Box::new(move |state: &S| {
            read(state);
            Ok(())
        }));
    }

    /// Queue a read that may fail.
    pub fn try_submit_read<F, E>(&self, read: F)
    where
        F: FnOnce(&S) -> std::result::Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        let _ = self.enqueue_get(Box::new(move |state: &S| {
            read(state).map_err(OperationFailure::from_error)
        }));
    }

    /// Queue a read whose result is delivered on the returned channel.
    ///
    /// Returns [`ContainerError::Closed`] once the container has shut down.
    /// The channel disconnects without a value if the read is discarded at
    /// teardown or panics.
    pub fn query<T, F>(&self, read: F) -> Result<Receiver<T>>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.enqueue_get(Box::new(move |state: &S| {
            // Receiver may have been dropped by an uninterested caller
            let _ = tx.send(read(state));
            Ok(())
        }))?;
        Ok(rx)
    }

    /// Latest published state, without queueing. May be stale.
    pub fn snapshot(&self) -> Arc<S> {
        self.shared.processor.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    // The closed check and the append happen under the queue lock, so an
    // operation is either discarded by `close` or refused here.
    fn enqueue_set(&self, op: SetOperation<S>) {
        if !self.shared.processor.enqueue_set(op) {
            debug!(container = %self.shared.name, "container shut down, transform dropped");
            return;
        }
        self.trigger.wake();
    }

    fn enqueue_get(&self, op: GetOperation<S>) -> Result<()> {
        if !self.shared.processor.enqueue_get(op) {
            debug!(container = %self.shared.name, "container shut down, read dropped");
            return Err(ContainerError::Closed);
        }
        self.trigger.wake();
        Ok(())
    }
}

/// A state container with an ordered mutation queue.
///
/// Provides a unified interface for:
/// - Submitting transforms and reads from any thread
/// - Subscribing to published state
/// - Observing failed operations
/// - Tearing down the processing context
///
/// # Example
///
/// ```ignore
/// let container = StateContainer::new(Counter { count: 0 })?;
///
/// container.submit_transform(|s| Counter { count: s.count + 1 });
/// container.submit_read(|s| println!("count is {}", s.count));
///
/// let count = container.query(|s| s.count)?.recv()?;
/// ```
pub struct StateContainer<S: Send + Sync + 'static> {
    config: ContainerConfig,
    handle: StateHandle<S>,
    worker: Option<JoinHandle<()>>,
}

impl<S: Send + Sync + 'static> StateContainer<S> {
    /// Create a container with the default configuration (dedicated worker).
    pub fn new(initial: S) -> Result<Self> {
        Self::with_config(initial, ContainerConfig::default())
    }

    /// Create a container.
    pub fn with_config(initial: S, config: ContainerConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            name: config.name.clone(),
            processor: StateProcessor::new(initial),
            discarded: AtomicU64::new(0),
        });

        let (trigger, worker) = match config.dispatch {
            Dispatch::Dedicated => {
                let (trigger, worker) = spawn_worker(&config.name, Arc::clone(&shared))?;
                (trigger, Some(worker))
            }
            Dispatch::Manual => (Trigger::Manual, None),
        };

        debug!(container = %config.name, dispatch = ?config.dispatch, "state container created");
        Ok(Self {
            config,
            handle: StateHandle { shared, trigger },
            worker,
        })
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// A cloneable producer handle.
    pub fn handle(&self) -> StateHandle<S> {
        self.handle.clone()
    }

    // --- Submission ---

    /// Queue a transform of the state. See [`StateHandle::submit_transform`].
    pub fn submit_transform<F>(&self, transform: F)
    where
        F: FnOnce(&S) -> S + Send + 'static,
    {
        self.handle.submit_transform(transform);
    }

    /// Queue a transform that may fail. See [`StateHandle::try_submit_transform`].
    pub fn try_submit_transform<F, E>(&self, transform: F)
    where
        F: FnOnce(&S) -> std::result::Result<S, E> + Send + 'static,
        E: fmt::Display,
    {
        self.handle.try_submit_transform(transform);
    }

    /// Queue a read. See [`StateHandle::submit_read`].
    pub fn submit_read<F>(&self, read: F)
    where
        F: FnOnce(&S) + Send + 'static,
    {
        self.handle.submit_read(read);
    }

    /// Queue a read that may fail. See [`StateHandle::try_submit_read`].
    pub fn try_submit_read<F, E>(&self, read: F)
    where
        F: FnOnce(&S) -> std::result::Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        self.handle.try_submit_read(read);
    }

    /// Queue a read with a result channel. See [`StateHandle::query`].
    pub fn query<T, F>(&self, read: F) -> Result<Receiver<T>>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> T + Send + 'static,
    {
        self.handle.query(read)
    }

    /// Latest published state, without queueing. May be stale.
    pub fn snapshot(&self) -> Arc<S> {
        self.handle.snapshot()
    }

    // --- Subscriptions ---

    /// Call `listener` with every published state, in subscription order.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Arc<S>) + Send + Sync + 'static,
    {
        self.processor().subscriptions().subscribe(listener)
    }

    /// Call `listener` only when the projection chosen by `selector` changes.
    pub fn select_subscribe<T, F, L>(&self, selector: F, listener: L) -> SubscriptionId
    where
        T: PartialEq + Send + 'static,
        F: Fn(&S) -> T + Send + Sync + 'static,
        L: Fn(&T) + Send + Sync + 'static,
    {
        let processor = self.processor();
        processor
            .subscriptions()
            .select_subscribe(|| processor.snapshot(), selector, listener)
    }

    /// Receive published states on a bounded channel.
    pub fn subscribe_channel(&self, config: SubscriptionConfig) -> Result<SubscriptionHandle<S>> {
        let processor = self.processor();
        processor
            .subscriptions()
            .subscribe_channel(config, || processor.snapshot())
    }

    /// Call `listener` for every failed transform or read.
    pub fn subscribe_errors<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ProcessingError) + Send + Sync + 'static,
    {
        self.processor().subscriptions().subscribe_errors(listener)
    }

    /// Remove any kind of subscription. Returns false if the ID was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.processor().subscriptions().unsubscribe(id)
    }

    // --- Processing ---

    /// Run passes on the calling thread until the queue is empty.
    ///
    /// This is how a [`Dispatch::Manual`] container makes progress. With a
    /// dedicated worker it is harmless: if the worker is mid-pass, this
    /// returns an idle summary.
    pub fn run_pending(&self) -> Result<PassSummary> {
        if self.handle.is_closed() {
            return Err(ContainerError::Closed);
        }
        Ok(self.processor().process_pending())
    }

    /// Cumulative counters.
    pub fn stats(&self) -> ContainerStats {
        let processor = self.processor();
        ContainerStats {
            totals: processor.totals(),
            pending_sets: processor.queue().pending_sets(),
            pending_gets: processor.queue().pending_gets(),
            discarded: self.handle.shared.discarded.load(Ordering::Relaxed),
            subscribers: processor.subscriptions().subscription_count(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Tear down: discard queued operations, stop the worker and drop all
    /// subscribers. Also performed on drop.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn processor(&self) -> &StateProcessor<S> {
        &self.handle.shared.processor
    }

    fn close(&mut self) {
        let shared = &self.handle.shared;
        let discarded = match shared.processor.close() {
            Some(discarded) => discarded,
            None => return,
        };
        shared
            .discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
        if discarded > 0 {
            debug!(container = %shared.name, discarded, "discarded queued operations at shutdown");
        }

        // Wake the worker so it observes the closed flag.
        self.handle.trigger.wake();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                // Dropped from one of our own callbacks; the worker loop
                // exits on its next wake-up check.
                debug!(container = %shared.name, "container dropped on its own worker");
            } else if worker.join().is_err() {
                warn!(container = %shared.name, "state worker panicked");
            }
        }

        shared.processor.subscriptions().close();
        debug!(container = %shared.name, "state container shut down");
    }
}

impl<S: Send + Sync + fmt::Debug + 'static> StateContainer<S> {
    /// Log every published state at debug level.
    pub fn log_state_changes(&self) -> SubscriptionId {
        let name = self.config.name.clone();
        self.subscribe(move |state| {
            debug!(container = %name, state = ?state, "state changed");
        })
    }
}

impl<S: Send + Sync + 'static> Drop for StateContainer<S> {
    fn drop(&mut self) {
        self.close();
    }
}
