//! Core traits for the event bus

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::BoxError;
use crate::hierarchy::Related;

/// A value that can be fired through the [`EventBus`](crate::EventBus).
///
/// The concrete type is the dispatch key. Implementors may additionally
/// declare related types (supertypes or capability traits) whose listeners
/// should also observe the event, and may expose the [`Cancellable`]
/// capability.
pub trait Event: Send + Sync + 'static {
    /// Types whose listeners also receive this event, usually built with [`related!`](crate::related).
    ///
    /// Own-type listeners always run before any of these.
    fn related() -> Vec<Related<Self>>
    where
        Self: Sized,
    {
        Vec::new()
    }

    /// The cancellation capability of this event, if it has one.
    fn as_cancellable(&self) -> Option<&dyn Cancellable> {
        None
    }
}

/// Optional event capability consulted on every dispatch step.
///
/// One event value is shared by every listener of a firing, so the flag is
/// set through a shared reference.
pub trait Cancellable: Send + Sync {
    /// Whether the event is currently cancelled.
    fn is_cancelled(&self) -> bool;

    /// Sets or clears the cancelled state.
    fn set_cancelled(&self, cancelled: bool);
}

/// Atomic flag implementing [`Cancellable`], meant to be embedded in events.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    /// Creates a flag in the not-cancelled state.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }
}

impl Cancellable for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set_cancelled(&self, cancelled: bool) {
        self.0.store(cancelled, Ordering::Release);
    }
}

/// Struct-based listener, for handlers that carry their own state.
#[async_trait]
pub trait EventListener<K: ?Sized + Send + Sync + 'static>: Send + Sync + 'static {
    /// Handle an event
    async fn handle(&self, event: Arc<K>) -> Result<(), BoxError>;
}
