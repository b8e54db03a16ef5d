//! Error types for the event bus

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for event bus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by fallible handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the event bus.
///
/// Errors are cheap to clone so that a resolved [`Completion`](crate::Completion)
/// can hand its error list to any number of observers.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A completion was resolved a second time
    #[error("Completion was already resolved")]
    AlreadyCompleted,

    /// A subscriber's handler returned an error or a failed completion
    #[error("Handler for {event_type} failed: {cause}")]
    HandlerFailure {
        /// The event type the failing subscriber was registered for
        event_type: &'static str,
        /// The error raised by the handler
        cause: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// A subscriber's handler panicked while processing an event
    #[error("Handler for {event_type} panicked while processing event")]
    HandlerPanic {
        /// The event type the panicking subscriber was registered for
        event_type: &'static str,
    },

    /// A cancellable event was fired through a type marked for concurrent dispatch
    #[error("{event_type} uses concurrent dispatch and cannot carry a cancellable event")]
    IncompatibleDispatchMode {
        /// The event type marked for concurrent dispatch
        event_type: &'static str,
    },

    /// A dispatch payload did not hold the type its subscribers expect
    #[error("Payload does not hold a value of type {expected}")]
    TypeMismatch {
        /// The type the subscriber was registered for
        expected: &'static str,
    },

    /// The bus was built outside of a tokio runtime and no handle was provided
    #[error("No tokio runtime available to run event workers")]
    NoRuntime,

    /// The event bus is shutting down
    #[error("Event bus is shutting down")]
    Shutdown,
}

impl Error {
    /// Wraps a handler error for the given event type.
    pub fn handler_failure(event_type: &'static str, cause: impl Into<BoxError>) -> Self {
        Self::HandlerFailure {
            event_type,
            cause: Arc::from(cause.into()),
        }
    }

    /// Returns true if this error originated in a subscriber's handler.
    #[must_use]
    pub const fn is_handler_error(&self) -> bool {
        matches!(self, Self::HandlerFailure { .. } | Self::HandlerPanic { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_failure_display() {
        let err = Error::handler_failure("Deposit", "insufficient funds");

        assert_eq!(
            err.to_string(),
            "Handler for Deposit failed: insufficient funds"
        );
        assert!(err.is_handler_error());
        assert!(!Error::Shutdown.is_handler_error());
    }
}
