//! In-process asynchronous event bus with priority ordering.
//!
//! Subscribers register for an event type (or a capability trait such as
//! `dyn AccountEvent`) with a [`Priority`]. Firing an event walks the
//! subscribers of its type one at a time, lowest priority first, and each
//! subscriber's [`Completion`] gates the next. A failing subscriber stops the
//! chain, and the failure surfaces in the completion returned by
//! [`EventBus::fire`].
//!
//! Every event type is dispatched on its own worker pool, so a busy type
//! never delays another. Events may declare related types through
//! [`Event::related`]; their subscribers observe the event after the
//! event's own type has finished.
//!
//! ```rust,ignore
//! let bus = EventBus::new()?;
//!
//! bus.subscribe(
//!     Subscriber::builder::<Deposit>()
//!         .priority(Priority::High)
//!         .handler(|deposit| ledger.record(deposit)),
//! );
//!
//! bus.fire(Deposit::new("alice", 100)).done().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod bus;
mod caller;
mod completion;
mod config;
mod error;
mod executor;
mod hierarchy;
mod subscriber;
mod traits;
mod types;

pub use bus::{EventBus, EventBusBuilder};
pub use completion::Completion;
pub use config::EventBusConfig;
pub use error::{BoxError, Error, Result};
pub use hierarchy::Related;
pub use subscriber::{Subscriber, SubscriberBuilder, SubscriptionHandle};
pub use traits::{CancelFlag, Cancellable, Event, EventListener};
pub use types::{DispatchMode, Priority, TypeKey, TypeStatsSummary};

// Re-export for implementing `EventListener`
pub use async_trait::async_trait;
