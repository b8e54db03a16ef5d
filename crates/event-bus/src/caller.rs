//! Per-type dispatch
//!
//! An [`EventCaller`] owns the subscribers of one dispatch key and walks them
//! for every firing on that key's worker pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::completion::{Completion, ShutdownGuard};
use crate::error::Error;
use crate::executor::Executor;
use crate::subscriber::{Payload, Subscriber, SubscriptionHandle};
use crate::traits::Event;
use crate::types::{DispatchMode, Priority, TypeKey, TypeStats};

/// One event on its way to one caller.
pub(crate) struct Firing {
    /// The fired event, consulted for cancellation.
    pub(crate) event: Arc<dyn Event>,
    /// The event as the caller's subscribers expect it.
    pub(crate) payload: Payload,
}

pub(crate) struct EventCaller {
    key: TypeKey,
    executor: Executor,
    mode: DispatchMode,
    subscribers: RwLock<BTreeMap<(Priority, u64), Arc<Subscriber>>>,
    stats: TypeStats,
}

impl EventCaller {
    pub(crate) fn new(key: TypeKey, executor: Executor, mode: DispatchMode) -> Self {
        debug!(event_type = %key, ?mode, "Created event caller");

        Self {
            key,
            executor,
            mode,
            subscribers: RwLock::new(BTreeMap::new()),
            stats: TypeStats::default(),
        }
    }

    pub(crate) const fn key(&self) -> TypeKey {
        self.key
    }

    pub(crate) const fn executor(&self) -> &Executor {
        &self.executor
    }

    pub(crate) const fn stats(&self) -> &TypeStats {
        &self.stats
    }

    /// Adds a subscriber; equal priorities keep `sequence` order.
    pub(crate) fn subscribe(&self, subscriber: Subscriber, sequence: u64) -> SubscriptionHandle {
        let handle = SubscriptionHandle::new(self.key, subscriber.priority(), sequence);
        self.subscribers
            .write()
            .insert((subscriber.priority(), sequence), Arc::new(subscriber));
        handle
    }

    pub(crate) fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.subscribers
            .write()
            .remove(&(handle.priority(), handle.sequence()))
            .is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.read().values().cloned().collect()
    }

    /// Dispatches `firing` to the current subscribers.
    ///
    /// The returned completion is owned by this caller's pool. Subscribers
    /// registered or removed after this call do not affect the firing.
    pub(crate) fn dispatch(self: &Arc<Self>, firing: Firing) -> Completion {
        let subscribers = self.snapshot();
        if subscribers.is_empty() {
            return Completion::succeeded();
        }

        if self.mode == DispatchMode::Concurrent && firing.event.as_cancellable().is_some() {
            return Completion::failed([Error::IncompatibleDispatchMode {
                event_type: self.key.name(),
            }]);
        }

        self.stats.record_fired();

        let completion = Completion::owned_by(self.executor.clone());
        let guard = ShutdownGuard(completion.clone());
        let caller = Arc::clone(self);

        let job = async move {
            let errors = match caller.mode {
                DispatchMode::Sequential => caller.run_sequential(&subscribers, &firing).await,
                DispatchMode::Concurrent => caller.run_concurrent(&subscribers, &firing).await,
            };

            let _ = if errors.is_empty() {
                guard.0.complete()
            } else {
                caller.stats.record_failed();
                guard.0.complete_exceptionally(errors)
            };
        };

        if let Err(e) = self.executor.execute_nested(job) {
            completion.fail_if_pending([e]);
        }

        completion
    }

    async fn run_sequential(&self, subscribers: &[Arc<Subscriber>], firing: &Firing) -> Vec<Error> {
        let cancellable = firing.event.as_cancellable();
        let mut errors = Vec::new();

        for subscriber in subscribers {
            if subscriber.skip_if_cancelled() && cancellable.is_some_and(|c| c.is_cancelled()) {
                trace!(
                    event_type = %self.key,
                    priority = ?subscriber.priority(),
                    "Skipping subscriber for cancelled event"
                );
                self.stats.record_skipped();
                continue;
            }

            self.stats.record_invoked();
            if let Err(failed) = subscriber.invoke(&firing.payload).await {
                for error in &failed {
                    warn!(
                        event_type = %self.key,
                        priority = ?subscriber.priority(),
                        "Subscriber failed, stopping dispatch: {error}"
                    );
                }
                errors.extend(failed);
                break;
            }
        }

        errors
    }

    async fn run_concurrent(&self, subscribers: &[Arc<Subscriber>], firing: &Firing) -> Vec<Error> {
        let pending: Vec<_> = subscribers
            .iter()
            .map(|subscriber| {
                self.stats.record_invoked();
                subscriber.invoke(&firing.payload)
            })
            .collect();

        let errors: Vec<Error> = join_all(pending)
            .await
            .into_iter()
            .filter_map(Result::err)
            .flatten()
            .collect();

        for error in &errors {
            warn!(event_type = %self.key, "Subscriber failed: {error}");
        }

        errors
    }
}
