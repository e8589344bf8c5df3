//! Mutex-guarded queue of pending transforms and reads.

use crate::types::{GetOperation, SetOperation};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::mem;

struct Pending<S> {
    sets: Vec<SetOperation<S>>,
    gets: VecDeque<GetOperation<S>>,
    /// Set once by `close`; appends are refused from then on.
    closed: bool,
}

/// Ordered buffer of pending set- and get-operations.
///
/// Both sequences and the closed flag sit behind one lock, so an append
/// either lands before `close` (and is counted as discarded) or is handed
/// back to the caller. No operation is ever executed while the lock is held.
pub struct MutationQueue<S> {
    pending: Mutex<Pending<S>>,
}

impl<S> MutationQueue<S> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                sets: Vec::new(),
                gets: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Append a transform. Returns true if no other transform was pending.
    ///
    /// Once the queue is closed the operation is handed back in `Err`.
    pub fn enqueue_set(&self, op: SetOperation<S>) -> Result<bool, SetOperation<S>> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(op);
        }
        let was_empty = pending.sets.is_empty();
        pending.sets.push(op);
        Ok(was_empty)
    }

    /// Append a read. Once the queue is closed the operation is handed back.
    pub fn enqueue_get(&self, op: GetOperation<S>) -> Result<(), GetOperation<S>> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(op);
        }
        pending.gets.push_back(op);
        Ok(())
    }

    /// Take every pending transform as one ordered batch.
    ///
    /// Returns `None` when nothing is pending. The queue is left with an
    /// unallocated sequence, so transforms enqueued afterwards start a new
    /// batch.
    pub fn drain_all_sets(&self) -> Option<Vec<SetOperation<S>>> {
        let mut pending = self.pending.lock();
        if pending.sets.is_empty() {
            return None;
        }
        Some(mem::take(&mut pending.sets))
    }

    /// Take the oldest pending read.
    pub fn dequeue_one_get(&self) -> Option<GetOperation<S>> {
        self.pending.lock().gets.pop_front()
    }

    /// Take the oldest pending read, unless a transform is waiting.
    ///
    /// Both checks happen in one critical section, so a read is never handed
    /// out ahead of a transform that was enqueued before it.
    pub fn dequeue_get_if_no_sets(&self) -> Option<GetOperation<S>> {
        let mut pending = self.pending.lock();
        if !pending.sets.is_empty() {
            return None;
        }
        pending.gets.pop_front()
    }

    /// True if either sequence is non-empty, checked in a single critical section.
    pub fn has_pending(&self) -> bool {
        let pending = self.pending.lock();
        !pending.sets.is_empty() || !pending.gets.is_empty()
    }

    pub fn pending_sets(&self) -> usize {
        self.pending.lock().sets.len()
    }

    pub fn pending_gets(&self) -> usize {
        self.pending.lock().gets.len()
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Refuse further appends and drop every queued operation without
    /// running it.
    ///
    /// Returns how many operations were dropped, or `None` if the queue was
    /// already closed. Captured values are released after the lock is let go.
    pub fn close(&self) -> Option<usize> {
        let (sets, gets) = {
            let mut pending = self.pending.lock();
            if pending.closed {
                return None;
            }
            pending.closed = true;
            (mem::take(&mut pending.sets), mem::take(&mut pending.gets))
        };
        Some(sets.len() + gets.len())
    }
}

impl<S> Default for MutationQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}
