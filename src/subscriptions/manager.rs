//! Subscription manager for broadcasting published state.

use crate::error::{ContainerError, ProcessingError, Result};
use crate::types::PassId;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{DropReason, StateEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId};

type Listener<S> = Arc<dyn Fn(&Arc<S>) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&ProcessingError) + Send + Sync>;

/// Last projection seen by a selective subscriber.
enum Selected<S, T> {
    /// State at subscription time, projected lazily.
    Seed(Arc<S>),
    Value(T),
}

/// Where a state subscription delivers.
enum Sink<S> {
    Callback(Listener<S>),
    Channel(Sender<StateEvent<S>>),
}

impl<S> Clone for Sink<S> {
    fn clone(&self) -> Self {
        match self {
            Sink::Callback(listener) => Sink::Callback(Arc::clone(listener)),
            Sink::Channel(sender) => Sink::Channel(sender.clone()),
        }
    }
}

/// Manages state and error subscribers.
///
/// Subscribers are notified in subscription order. The subscriber list is
/// copied out before delivery, so a listener may subscribe or unsubscribe
/// from inside its own callback.
pub struct SubscriptionManager<S> {
    /// Active state subscriptions by ID (IDs are monotonic).
    subscriptions: RwLock<BTreeMap<SubscriptionId, Sink<S>>>,
    /// Error listeners by ID.
    error_listeners: RwLock<BTreeMap<SubscriptionId, ErrorListener>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl<S: Send + Sync + 'static> SubscriptionManager<S> {
    /// Create a new subscription manager.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(BTreeMap::new()),
            error_listeners: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a callback invoked with every published state.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Arc<S>) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.subscriptions
            .write()
            .insert(id, Sink::Callback(Arc::new(listener)));
        id
    }

    /// Register a callback that fires only when `selector`'s projection changes.
    ///
    /// `current` is read under the subscriber lock and is the state the
    /// projection is first compared against. A publication racing with this
    /// call is therefore either already in the seed or delivered afterwards.
    pub fn select_subscribe<T, F, L, C>(
        &self,
        current: C,
        selector: F,
        listener: L,
    ) -> SubscriptionId
    where
        T: PartialEq + Send + 'static,
        F: Fn(&S) -> T + Send + Sync + 'static,
        L: Fn(&T) + Send + Sync + 'static,
        C: FnOnce() -> Arc<S>,
    {
        let id = self.allocate_id();
        let mut subs = self.subscriptions.write();
        // The selector is user code; it first runs on delivery, outside this lock.
        let last = Mutex::new(Selected::Seed(current()));
        let listener: Listener<S> = Arc::new(move |state: &Arc<S>| {
            let next = selector(state.as_ref());
            let mut last = last.lock();
            let changed = match &*last {
                Selected::Seed(seed) => selector(seed.as_ref()) != next,
                Selected::Value(value) => *value != next,
            };
            if changed {
                listener(&next);
            }
            *last = Selected::Value(next);
        });
        subs.insert(id, Sink::Callback(listener));
        id
    }

    /// Create a channel subscription.
    ///
    /// Returns an error for a zero-sized buffer, which could never accept an
    /// event. When `replay_current` is set, the state returned by `current`
    /// is sent first; it is read under the subscriber lock, so no publication
    /// can fall between the replay and the first delivered snapshot.
    pub fn subscribe_channel<C>(
        &self,
        config: SubscriptionConfig,
        current: C,
    ) -> Result<SubscriptionHandle<S>>
    where
        C: FnOnce() -> Arc<S>,
    {
        if config.buffer_size == 0 {
            return Err(ContainerError::InvalidConfig(
                "subscription buffer_size must be at least 1".to_string(),
            ));
        }

        let id = self.allocate_id();
        let (sender, receiver) = bounded(config.buffer_size);
        let mut subs = self.subscriptions.write();
        if config.replay_current {
            // Fresh channel with capacity >= 1, cannot be full.
            let _ = sender.try_send(StateEvent::Snapshot {
                state: current(),
                pass: None,
            });
        }
        subs.insert(id, Sink::Channel(sender));
        Ok(SubscriptionHandle { id, receiver })
    }

    /// Register a listener for failed operations.
    pub fn subscribe_errors<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ProcessingError) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.error_listeners.write().insert(id, Arc::new(listener));
        id
    }

    /// Unsubscribe and clean up. Returns false if the ID was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        if let Some(sink) = self.subscriptions.write().remove(&id) {
            if let Sink::Channel(sender) = sink {
                // Best effort
                let _ = sender.try_send(StateEvent::Dropped {
                    reason: DropReason::Unsubscribed,
                });
            }
            return true;
        }
        self.error_listeners.write().remove(&id).is_some()
    }

    /// Get state subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Get error listener count.
    pub fn error_listener_count(&self) -> usize {
        self.error_listeners.read().len()
    }

    // --- Broadcasting ---

    /// Deliver a published state to every subscriber, in subscription order.
    ///
    /// Channel subscribers whose buffer is full are dropped. A panicking
    /// callback is logged and skipped.
    pub fn publish(&self, state: &Arc<S>, pass: PassId) {
        let sinks: Vec<(SubscriptionId, Sink<S>)> = self
            .subscriptions
            .read()
            .iter()
            .map(|(id, sink)| (*id, sink.clone()))
            .collect();

        let mut to_remove = Vec::new();
        for (id, sink) in sinks {
            match sink {
                Sink::Callback(listener) => {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| listener(state)));
                    if result.is_err() {
                        warn!(subscription = id.0, %pass, "state listener panicked");
                    }
                }
                Sink::Channel(sender) => {
                    let event = StateEvent::Snapshot {
                        state: Arc::clone(state),
                        pass: Some(pass),
                    };
                    match sender.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                            to_remove.push(id)
                        }
                    }
                }
            }
        }

        // Remove dropped subscriptions
        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(Sink::Channel(sender)) = subs.remove(&id) {
                    debug!(subscription = id.0, "dropping slow state subscriber");
                    // Try to notify about the drop (might fail, that's ok)
                    let _ = sender.try_send(StateEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }

    /// Deliver a processing error to every error listener.
    pub fn report(&self, error: &ProcessingError) {
        let listeners: Vec<(SubscriptionId, ErrorListener)> = self
            .error_listeners
            .read()
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(error))).is_err() {
                warn!(subscription = id.0, "error listener panicked");
            }
        }
    }

    /// Drop every subscriber, telling channel subscribers why.
    pub fn close(&self) {
        let subs = std::mem::take(&mut *self.subscriptions.write());
        self.error_listeners.write().clear();
        for sink in subs.into_values() {
            if let Sink::Channel(sender) = sink {
                let _ = sender.try_send(StateEvent::Dropped {
                    reason: DropReason::Closed,
                });
            }
        }
    }
}

impl<S: Send + Sync + 'static> Default for SubscriptionManager<S> {
    fn default() -> Self {
        Self::new()
    }
}
