//! Pending-operation buffer.
//!
//! Producers append transforms and reads from any thread; the processor is
//! the only consumer. Transforms are drained as whole batches, reads one at
//! a time, so a processing pass can re-check for new transforms between
//! reads.

mod mutation;

pub use mutation::MutationQueue;
