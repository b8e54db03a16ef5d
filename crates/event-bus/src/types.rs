//! Common types used throughout the event bus

use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Priority levels for subscriber invocation.
///
/// Subscribers run in ascending priority: every `Low` subscriber observes an
/// event before any `Normal` one, and `High` subscribers run last so they see
/// the outcome of everything ranked below them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    /// Runs first
    Low,
    /// Default priority
    #[default]
    Normal,
    /// Runs last
    High,
}

/// How an event caller walks its subscribers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchMode {
    /// One subscriber at a time in priority order, stopping at the first failure
    #[default]
    Sequential,
    /// All subscribers at once, joined into one outcome.
    ///
    /// Incompatible with cancellable events, which need an agreed order of observation.
    Concurrent,
}

/// Runtime identity of a dispatch key.
///
/// Works for unsized types too, so `dyn Trait` capabilities can be listened on
/// next to concrete event structs.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Returns the key for `T`.
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// The underlying `TypeId`.
    #[must_use]
    pub const fn id(&self) -> TypeId {
        self.id
    }

    /// The type name, for logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Statistics for a specific event type
#[derive(Debug, Default)]
pub struct TypeStats {
    /// Number of dispatches that reached at least one subscriber
    pub fired_count: AtomicU64,
    /// Number of handler invocations
    pub invoked_count: AtomicU64,
    /// Number of subscribers skipped because the event was cancelled
    pub skipped_count: AtomicU64,
    /// Number of dispatches that resolved with errors
    pub failed_count: AtomicU64,
}

impl TypeStats {
    pub(crate) fn record_fired(&self) {
        self.fired_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invoked(&self) {
        self.invoked_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of the counters.
    pub fn summary(&self) -> TypeStatsSummary {
        TypeStatsSummary {
            fired: self.fired_count.load(Ordering::Relaxed),
            invoked: self.invoked_count.load(Ordering::Relaxed),
            skipped: self.skipped_count.load(Ordering::Relaxed),
            failed: self.failed_count.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`TypeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStatsSummary {
    /// Dispatches that reached at least one subscriber
    pub fired: u64,
    /// Handler invocations
    pub invoked: u64,
    /// Subscribers skipped on cancelled events
    pub skipped: u64,
    /// Dispatches that resolved with errors
    pub failed: u64,
}
