//! Subscription system for published state.
//!
//! This module fans out every published snapshot to:
//! - Callback listeners, in subscription order
//! - Selective listeners that only fire when a projection changes
//! - Bounded channel subscribers, dropped when they fall behind
//!
//! Failed operations are fanned out separately to error listeners.
//!
//! # Example
//!
//! ```ignore
//! let handle = container.subscribe_channel(SubscriptionConfig::default())?;
//!
//! loop {
//!     match handle.recv() {
//!         Ok(StateEvent::Snapshot { state, .. }) => println!("count = {}", state.count),
//!         Ok(StateEvent::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{DropReason, StateEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId};
