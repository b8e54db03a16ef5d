//! The event bus

use std::any::{TypeId, type_name};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use crate::caller::{EventCaller, Firing};
use crate::completion::Completion;
use crate::config::EventBusConfig;
use crate::error::{BoxError, Error, Result};
use crate::executor::ExecutorRegistry;
use crate::hierarchy::{Related, TypeHierarchyIndex};
use crate::subscriber::{Payload, Subscriber, SubscriptionHandle};
use crate::traits::Event;
use crate::types::{DispatchMode, Priority, TypeKey, TypeStatsSummary};

/// Builder for configuring the event bus
#[derive(Debug, Clone, Default)]
pub struct EventBusBuilder {
    config: EventBusConfig,
    dispatch_modes: HashMap<TypeId, DispatchMode>,
    type_workers: HashMap<TypeId, usize>,
    runtime: Option<Handle>,
}

impl EventBusBuilder {
    /// Create a new event bus builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    #[must_use]
    pub fn config(mut self, config: EventBusConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of workers started for each event type
    #[must_use]
    pub fn workers_per_type(mut self, count: usize) -> Self {
        self.config.workers_per_type = count;
        self
    }

    /// Set the number of workers in the default pool
    #[must_use]
    pub fn default_workers(mut self, count: usize) -> Self {
        self.config.default_workers = count;
        self
    }

    /// Set how long shutdown waits for each worker
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Override the worker count for one event type
    #[must_use]
    pub fn type_workers<K: ?Sized + 'static>(mut self, count: usize) -> Self {
        self.type_workers.insert(TypeId::of::<K>(), count);
        self
    }

    /// Set the dispatch mode for one event type
    #[must_use]
    pub fn dispatch_mode<K: ?Sized + 'static>(mut self, mode: DispatchMode) -> Self {
        self.dispatch_modes.insert(TypeId::of::<K>(), mode);
        self
    }

    /// Dispatch `K` to all of its subscribers at once instead of in priority order
    #[must_use]
    pub fn concurrent<K: ?Sized + 'static>(self) -> Self {
        self.dispatch_mode::<K>(DispatchMode::Concurrent)
    }

    /// Run the worker pools on `handle` instead of the ambient runtime
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Build the event bus with the configured settings
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRuntime`] when called outside a tokio runtime
    /// without a handle set through [`EventBusBuilder::runtime`].
    pub fn build(self) -> Result<EventBus> {
        let handle = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| Error::NoRuntime)?,
        };

        debug!(
            workers_per_type = self.config.workers_per_type,
            default_workers = self.config.default_workers,
            concurrent_types = self.dispatch_modes.len(),
            "Building event bus"
        );

        Ok(EventBus {
            callers: Arc::new(DashMap::new()),
            executors: Arc::new(ExecutorRegistry::new(
                handle,
                &self.config,
                self.type_workers,
            )),
            hierarchy: Arc::new(TypeHierarchyIndex::new()),
            dispatch_modes: Arc::new(self.dispatch_modes),
            sequence: Arc::new(AtomicU64::new(0)),
        })
    }
}

/// In-process event bus with priority-ordered, completion-gated dispatch.
///
/// Cloning is cheap; clones share subscribers and worker pools.
#[derive(Clone)]
pub struct EventBus {
    /// Event callers by dispatch key
    callers: Arc<DashMap<TypeId, Arc<EventCaller>>>,

    /// Worker pools
    executors: Arc<ExecutorRegistry>,

    /// Related types per concrete event type
    hierarchy: Arc<TypeHierarchyIndex>,

    /// Dispatch mode overrides
    dispatch_modes: Arc<HashMap<TypeId, DispatchMode>>,

    /// Registration counter, orders equal-priority subscribers
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus builder
    #[must_use]
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Creates a bus with the default configuration on the ambient runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRuntime`] outside a tokio runtime.
    pub fn new() -> Result<Self> {
        EventBusBuilder::new().build()
    }

    fn mode_of(&self, key: TypeKey) -> DispatchMode {
        self.dispatch_modes
            .get(&key.id())
            .copied()
            .unwrap_or_default()
    }

    fn caller(&self, key: TypeKey) -> Option<Arc<EventCaller>> {
        self.callers
            .get(&key.id())
            .map(|caller| caller.value().clone())
    }

    fn caller_or_create(&self, key: TypeKey) -> Arc<EventCaller> {
        if let Some(caller) = self.caller(key) {
            return caller;
        }

        self.callers
            .entry(key.id())
            .or_insert_with(|| {
                Arc::new(EventCaller::new(
                    key,
                    self.executors.executor_for(key),
                    self.mode_of(key),
                ))
            })
            .clone()
    }

    /// Registers a subscriber for its event type.
    pub fn subscribe(&self, subscriber: Subscriber) -> SubscriptionHandle {
        let key = subscriber.event_type();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let handle = self.caller_or_create(key).subscribe(subscriber, sequence);

        debug!(
            event_type = %key,
            priority = ?handle.priority(),
            sequence,
            "Registered subscriber"
        );
        handle
    }

    /// Registers a side-effecting callback for `K` at `priority`.
    pub fn subscribe_fn<K, F>(&self, priority: Priority, handler: F) -> SubscriptionHandle
    where
        K: ?Sized + Send + Sync + 'static,
        F: Fn(&K) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.subscribe(Subscriber::builder::<K>().priority(priority).handler(handler))
    }

    /// Removes a subscriber. Firings already in progress keep it.
    ///
    /// Returns `false` if it was not registered.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self
            .caller(handle.event_type())
            .is_some_and(|caller| caller.unsubscribe(handle));

        if removed {
            debug!(event_type = %handle.event_type(), "Removed subscriber");
        }
        removed
    }

    /// Number of subscribers registered for `K`.
    #[must_use]
    pub fn subscriber_count<K: ?Sized + 'static>(&self) -> usize {
        self.callers
            .get(&TypeId::of::<K>())
            .map_or(0, |caller| caller.len())
    }

    /// Fires an event.
    ///
    /// Subscribers of the event's own type run first, then those of each
    /// related type in declaration order, every dispatch starting once the
    /// previous one resolved. The returned completion resolves after all of
    /// them with every error they produced.
    ///
    /// Handlers may fire and await events of their own type; see
    /// [`EventBusConfig::workers_per_type`] for the one case that still
    /// needs a free worker.
    #[instrument(skip(self, event), fields(event_type = type_name::<E>()))]
    pub fn fire<E: Event>(&self, event: E) -> Completion {
        self.fire_shared(Arc::new(event))
    }

    /// Fires an event the caller keeps a handle to.
    pub fn fire_shared<E: Event>(&self, event: Arc<E>) -> Completion {
        if self.executors.is_shutdown() {
            return Completion::failed([Error::Shutdown]);
        }

        let own = TypeKey::of::<E>();
        let related = self.hierarchy.related::<E>();

        if event.as_cancellable().is_some() {
            let concurrent = std::iter::once(own)
                .chain(related.iter().map(Related::key))
                .find(|key| self.mode_of(*key) == DispatchMode::Concurrent);

            if let Some(key) = concurrent {
                warn!(event_type = %key, "Cancellable event fired through a concurrent type");
                return Completion::failed([Error::IncompatibleDispatchMode {
                    event_type: key.name(),
                }]);
            }
        }

        let shared: Arc<dyn Event> = event.clone();
        let mut targets = VecDeque::with_capacity(related.len() + 1);

        if let Some(caller) = self.caller(own) {
            targets.push_back((
                caller,
                Firing {
                    event: shared.clone(),
                    payload: Payload::new(event.clone()),
                },
            ));
        }

        for target in related.iter() {
            if let Some(caller) = self.caller(target.key()) {
                targets.push_back((
                    caller,
                    Firing {
                        event: shared.clone(),
                        payload: target.upcast(event.clone()),
                    },
                ));
            }
        }

        targets.retain(|(caller, _)| !caller.is_empty());

        match targets.len() {
            0 => Completion::succeeded(),
            1 => match targets.pop_front() {
                Some((caller, firing)) => caller.dispatch(firing),
                None => Completion::succeeded(),
            },
            _ => {
                let owner = targets.front().map(|(caller, _)| caller.executor().clone());
                let result = Completion::with_executor(owner);
                dispatch_in_turn(targets, Vec::new(), result.clone());
                result
            }
        }
    }

    /// A pending completion owned by the default worker pool.
    #[must_use]
    pub fn completion(&self) -> Completion {
        Completion::owned_by(self.executors.default_executor().clone())
    }

    /// Per-type dispatch statistics, keyed by type name.
    #[must_use]
    pub fn stats(&self) -> HashMap<&'static str, TypeStatsSummary> {
        self.callers
            .iter()
            .map(|entry| {
                let caller = entry.value();
                (caller.key().name(), caller.stats().summary())
            })
            .collect()
    }

    /// Whether [`EventBus::shutdown`] has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.executors.is_shutdown()
    }

    /// Stops every worker pool.
    ///
    /// Dispatches still queued resolve with [`Error::Shutdown`], as does
    /// every later [`EventBus::fire`].
    pub async fn shutdown(&self) {
        debug!("Shutting down event bus");
        self.executors.shutdown().await;
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.callers.len())
            .field("pools", &self.executors.pool_count())
            .field("indexed_types", &self.hierarchy.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Dispatches each target once the previous one resolved, then resolves
/// `result` with the errors of all of them in dispatch order.
fn dispatch_in_turn(
    mut targets: VecDeque<(Arc<EventCaller>, Firing)>,
    errors: Vec<Error>,
    result: Completion,
) {
    let Some((caller, firing)) = targets.pop_front() else {
        let _ = if errors.is_empty() {
            result.complete()
        } else {
            result.complete_exceptionally(errors)
        };
        return;
    };

    caller.dispatch(firing).on_resolved(move |outcome| {
        let mut errors = errors;
        errors.extend_from_slice(outcome.errors());
        dispatch_in_turn(targets, errors, result);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{CancelFlag, Cancellable};
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    struct Ping;

    impl Event for Ping {}

    struct Order {
        cancel: CancelFlag,
    }

    impl Event for Order {
        fn as_cancellable(&self) -> Option<&dyn Cancellable> {
            Some(&self.cancel)
        }
    }

    fn test_bus() -> EventBus {
        EventBus::builder()
            .workers_per_type(2)
            .default_workers(1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        assert_matches!(EventBus::builder().build(), Err(Error::NoRuntime));
    }

    #[test]
    fn test_build_with_explicit_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let bus = EventBus::builder()
            .runtime(runtime.handle().clone())
            .workers_per_type(1)
            .build()
            .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.subscribe_fn::<Ping, _>(Priority::Normal, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let completion = bus.fire(Ping);
        completion.wait();

        assert!(completion.is_success());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fire_without_subscribers_succeeds() {
        let bus = test_bus();

        let completion = bus.fire(Ping);

        assert!(completion.is_success());
        assert!(bus.stats().is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_count_and_unsubscribe() {
        let bus = test_bus();

        let first = bus.subscribe_fn::<Ping, _>(Priority::Low, |_| Ok(()));
        let second = bus.subscribe_fn::<Ping, _>(Priority::Low, |_| Ok(()));
        assert_eq!(bus.subscriber_count::<Ping>(), 2);
        assert!(first.sequence() < second.sequence());

        assert!(bus.unsubscribe(&first));
        assert!(!bus.unsubscribe(&first));
        assert_eq!(bus.subscriber_count::<Ping>(), 1);
        assert_eq!(bus.subscriber_count::<Order>(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_type_rejects_cancellable_event_without_subscribers() {
        let bus = EventBus::builder().concurrent::<Order>().build().unwrap();

        let completion = bus.fire(Order {
            cancel: CancelFlag::new(),
        });

        assert_matches!(
            completion.errors().as_slice(),
            [Error::IncompatibleDispatchMode { .. }]
        );
    }

    #[tokio::test]
    async fn test_stats_track_dispatches() {
        let bus = test_bus();
        bus.subscribe_fn::<Ping, _>(Priority::Normal, |_| Ok(()));
        bus.subscribe_fn::<Ping, _>(Priority::High, |_| Err("rejected".into()));

        bus.fire(Ping).done().await;
        bus.fire(Ping).done().await;

        let stats = bus.stats()[type_name::<Ping>()];
        assert_eq!(stats.fired, 2);
        assert_eq!(stats.invoked, 4);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn test_bus_completion_runs_async_callbacks_on_default_pool() {
        let bus = test_bus();
        let completion = bus.completion();
        let (tx, rx) = tokio::sync::oneshot::channel();

        completion.when_complete_async(move |errors| {
            let _ = tx.send(errors.len());
        });
        completion.complete().unwrap();

        assert_eq!(rx.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fire_after_shutdown_fails() {
        let bus = test_bus();
        bus.subscribe_fn::<Ping, _>(Priority::Normal, |_| Ok(()));

        bus.shutdown().await;

        assert!(bus.is_shutdown());
        assert_matches!(bus.fire(Ping).errors().as_slice(), [Error::Shutdown]);
    }
}
