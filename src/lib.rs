//! # State Queue
//!
//! An ordered, single-writer mutation queue for reactive state containers.
//!
//! ## Core Concepts
//!
//! - **State**: An immutable value, replaced (never mutated) by transforms
//! - **Transforms**: Pure `&S -> S` functions applied in submission order
//! - **Reads**: Callbacks that observe the state after every earlier transform
//! - **Passes**: One drain of the queue on the single processing context
//! - **Subscriptions**: Fan-out of each published state to listeners
//!
//! Producers never block on processing. A pass applies every pending
//! transform as one batch, publishes once, then serves pending reads.
//!
//! ## Example
//!
//! ```ignore
//! use state_queue::StateContainer;
//!
//! #[derive(Debug)]
//! struct Counter { count: i64 }
//!
//! let container = StateContainer::new(Counter { count: 0 })?;
//! container.log_state_changes();
//!
//! container.submit_transform(|s| Counter { count: s.count + 1 });
//! container.submit_read(|s| println!("count is {}", s.count));
//!
//! // Explicit completion signal instead of a blocking return
//! let count = container.query(|s| s.count)?.recv()?;
//! ```

pub mod container;
pub mod dispatch;
pub mod error;
pub mod processor;
pub mod queue;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use container::{ContainerConfig, StateContainer, StateHandle};
pub use dispatch::Dispatch;
pub use error::{ContainerError, OperationFailure, ProcessingError, Result};
pub use processor::StateProcessor;
pub use queue::MutationQueue;
pub use subscriptions::{
    DropReason, StateEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
    SubscriptionManager,
};
pub use types::*;
