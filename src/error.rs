//! Error types for the state container.

use crate::types::PassId;
use std::any::Any;
use thiserror::Error;

/// Main error type for container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Container is shut down")]
    Closed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why a single queued operation did not complete.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum OperationFailure {
    /// The operation returned an error.
    #[error("{0}")]
    Error(String),

    /// The operation panicked.
    #[error("panicked: {0}")]
    Panic(String),
}

impl OperationFailure {
    /// Wrap an error value returned by a fallible operation.
    pub fn from_error<E: std::fmt::Display>(error: E) -> Self {
        OperationFailure::Error(error.to_string())
    }

    /// Build a failure from a caught unwind payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        OperationFailure::Panic(message)
    }

    /// Human-readable failure message.
    pub fn message(&self) -> &str {
        match self {
            OperationFailure::Error(msg) | OperationFailure::Panic(msg) => msg,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, OperationFailure::Panic(_))
    }
}

/// An operation that failed inside a processing pass.
///
/// These never reach the producer that submitted the operation; they are
/// delivered to error listeners and logged.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("transform {index} of batch in {pass} failed: {failure}")]
    Transform {
        pass: PassId,
        /// Position of the transform inside its drained batch.
        index: usize,
        failure: OperationFailure,
    },

    #[error("read callback {index} in {pass} failed: {failure}")]
    ReadCallback {
        pass: PassId,
        /// Position of the read among those served by the pass.
        index: usize,
        failure: OperationFailure,
    },
}

impl ProcessingError {
    pub fn pass(&self) -> PassId {
        match self {
            ProcessingError::Transform { pass, .. } | ProcessingError::ReadCallback { pass, .. } => {
                *pass
            }
        }
    }

    pub fn failure(&self) -> &OperationFailure {
        match self {
            ProcessingError::Transform { failure, .. }
            | ProcessingError::ReadCallback { failure, .. } => failure,
        }
    }
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    #[test]
    fn test_panic_payload_messages() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(
            OperationFailure::from_panic(payload),
            OperationFailure::Panic("boom".to_string())
        );

        let payload = panic::catch_unwind(|| panic!("value {}", 7)).unwrap_err();
        assert_eq!(OperationFailure::from_panic(payload).message(), "value 7");

        let payload = panic::catch_unwind(|| std::panic::panic_any(42u32)).unwrap_err();
        assert!(OperationFailure::from_panic(payload).is_panic());
    }

    #[test]
    fn test_processing_error_display() {
        let err = ProcessingError::Transform {
            pass: PassId(3),
            index: 1,
            failure: OperationFailure::from_error("bad input"),
        };
        assert_eq!(
            err.to_string(),
            "transform 1 of batch in pass 3 failed: bad input"
        );
        assert_eq!(err.pass(), PassId(3));
        assert!(!err.failure().is_panic());
    }
}
