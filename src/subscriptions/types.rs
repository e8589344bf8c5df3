//! Subscription types for published state snapshots.

use crate::types::PassId;
use std::fmt;
use std::sync::Arc;

/// Configuration for a channel subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Send the latest published state as the first event.
    pub replay_current: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            replay_current: false,
        }
    }
}

/// Events delivered to channel subscribers.
pub enum StateEvent<S> {
    /// A new state was published.
    ///
    /// `pass` is `None` for the replayed snapshot sent at subscription time.
    Snapshot { state: Arc<S>, pass: Option<PassId> },

    /// Subscription was dropped; no more events follow.
    Dropped { reason: DropReason },
}

impl<S> StateEvent<S> {
    /// The carried state, if this is a snapshot event.
    pub fn state(&self) -> Option<&Arc<S>> {
        match self {
            StateEvent::Snapshot { state, .. } => Some(state),
            StateEvent::Dropped { .. } => None,
        }
    }
}

impl<S> Clone for StateEvent<S> {
    fn clone(&self) -> Self {
        match self {
            StateEvent::Snapshot { state, pass } => StateEvent::Snapshot {
                state: Arc::clone(state),
                pass: *pass,
            },
            StateEvent::Dropped { reason } => StateEvent::Dropped {
                reason: reason.clone(),
            },
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for StateEvent<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateEvent::Snapshot { state, pass } => f
                .debug_struct("Snapshot")
                .field("state", state)
                .field("pass", pass)
                .finish(),
            StateEvent::Dropped { reason } => {
                f.debug_struct("Dropped").field("reason", reason).finish()
            }
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The owning container shut down.
    Closed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to a channel subscription.
pub struct SubscriptionHandle<S> {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<StateEvent<S>>,
}

impl<S> SubscriptionHandle<S> {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<StateEvent<S>, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<StateEvent<S>, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StateEvent<S>, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
