//! State processing.
//!
//! A pass drains every pending transform as one batch, applies them in
//! order, publishes once, then serves pending reads one at a time against
//! the updated state. It repeats until both queues are empty in the same
//! sweep.

mod pass;

pub use pass::StateProcessor;
