//! Core types shared by the queue, processor and container.

use crate::error::OperationFailure;
use std::fmt;

/// A queued transform: computes the next state from the current one.
pub type SetOperation<S> = Box<dyn FnOnce(&S) -> Result<S, OperationFailure> + Send>;

/// A queued read: observes the state as it stands when the read is served.
pub type GetOperation<S> = Box<dyn FnOnce(&S) -> Result<(), OperationFailure> + Send>;

/// Sequential number of a processing pass (1-based).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PassId(pub u64);

impl fmt::Debug for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pass({})", self.0)
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pass {}", self.0)
    }
}

/// What one or more processing passes did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Passes executed.
    pub passes: u64,
    /// Non-empty set batches drained.
    pub batches: u64,
    pub transforms_applied: u64,
    pub transforms_failed: u64,
    pub reads_served: u64,
    pub reads_failed: u64,
    /// Snapshots published to subscribers.
    pub publications: u64,
}

impl PassSummary {
    /// True if no operation was executed.
    pub fn is_idle(&self) -> bool {
        self.transforms_applied == 0
            && self.transforms_failed == 0
            && self.reads_served == 0
            && self.reads_failed == 0
    }

    /// Total failed operations.
    pub fn failures(&self) -> u64 {
        self.transforms_failed + self.reads_failed
    }

    /// Add another summary's counts into this one.
    pub fn absorb(&mut self, other: PassSummary) {
        self.passes += other.passes;
        self.batches += other.batches;
        self.transforms_applied += other.transforms_applied;
        self.transforms_failed += other.transforms_failed;
        self.reads_served += other.reads_served;
        self.reads_failed += other.reads_failed;
        self.publications += other.publications;
    }
}

/// Cumulative counters for a container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContainerStats {
    /// Totals over every pass so far.
    pub totals: PassSummary,
    /// Operations currently queued.
    pub pending_sets: usize,
    pub pending_gets: usize,
    /// Operations dropped unexecuted at teardown.
    pub discarded: u64,
    /// Active state subscribers (callback and channel).
    pub subscribers: usize,
}
