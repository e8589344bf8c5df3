//! Scheduling of processing passes.
//!
//! Producers call [`Trigger::wake`] after every enqueue. With a dedicated
//! worker the wake-up is a capacity-1 channel send: if a wake-up is already
//! pending the send is a no-op, and the worker's next pass will see the new
//! operation. With manual dispatch the owner runs passes itself.

use crate::container::Shared;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// How processing passes are scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Dispatch {
    /// A worker thread owned by the container runs every pass.
    #[default]
    Dedicated,
    /// No thread; passes run when the owner calls `run_pending`.
    Manual,
}

/// Producer-side wake-up for the processing context.
#[derive(Clone)]
pub(crate) enum Trigger {
    Worker(Sender<()>),
    Manual,
}

impl Trigger {
    /// Make sure a pass will run. Idempotent.
    pub(crate) fn wake(&self) {
        if let Trigger::Worker(signal) = self {
            match signal.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    trace!("state worker gone, wake-up ignored");
                }
            }
        }
    }
}

/// Start the worker thread for a container.
///
/// The worker runs passes until the container is closed or every trigger
/// has been dropped.
pub(crate) fn spawn_worker<S: Send + Sync + 'static>(
    name: &str,
    shared: Arc<Shared<S>>,
) -> io::Result<(Trigger, JoinHandle<()>)> {
    let (signal, wakeups) = bounded(1);
    let worker_name = name.to_string();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run_worker(&worker_name, &shared, &wakeups))?;
    Ok((Trigger::Worker(signal), handle))
}

fn run_worker<S: Send + Sync + 'static>(name: &str, shared: &Shared<S>, wakeups: &Receiver<()>) {
    debug!(container = name, "state worker started");
    for () in wakeups.iter() {
        if shared.is_closed() {
            break;
        }
        shared.processor().process_pending();
    }
    debug!(container = name, "state worker stopped");
}
