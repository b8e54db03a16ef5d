//! Subscriber registration
//!
//! A [`Subscriber`] is built for one dispatch key `K`, which is either a
//! concrete event type or a capability such as `dyn AccountEvent`. The
//! builder erases the handler into a uniform shape so that every caller can
//! store its subscribers side by side.

use std::any::{Any, type_name};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture};

use crate::completion::Completion;
use crate::error::{BoxError, Error};
use crate::traits::EventListener;
use crate::types::{Priority, TypeKey};

/// Type-erased event value handed to subscribers.
///
/// Holds an `Arc<K>` for the key `K` the dispatch targets, so unsized
/// capability keys survive the round trip through `Any`.
#[derive(Clone)]
pub(crate) struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    pub(crate) fn new<K>(value: Arc<K>) -> Self
    where
        K: ?Sized + Send + Sync + 'static,
    {
        Self(Arc::new(value))
    }

    pub(crate) fn get<K>(&self) -> Option<Arc<K>>
    where
        K: ?Sized + Send + Sync + 'static,
    {
        self.0.downcast_ref::<Arc<K>>().cloned()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Payload")
    }
}

pub(crate) type HandlerOutcome = Result<(), Vec<Error>>;

type ErasedHandler = dyn Fn(&Payload) -> BoxFuture<'static, HandlerOutcome> + Send + Sync;

/// One registered listener: dispatch key, ordering and the erased handler.
pub struct Subscriber {
    key: TypeKey,
    priority: Priority,
    skip_if_cancelled: bool,
    handler: Arc<ErasedHandler>,
}

impl Subscriber {
    /// Starts building a subscriber for events delivered as `K`.
    #[must_use]
    pub const fn builder<K>() -> SubscriberBuilder<K>
    where
        K: ?Sized + Send + Sync + 'static,
    {
        SubscriberBuilder {
            priority: Priority::Normal,
            skip_if_cancelled: false,
            _key: PhantomData,
        }
    }

    /// The dispatch key this subscriber listens on.
    #[must_use]
    pub const fn event_type(&self) -> TypeKey {
        self.key
    }

    /// Priority
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether the subscriber is skipped for cancelled events.
    #[must_use]
    pub const fn skip_if_cancelled(&self) -> bool {
        self.skip_if_cancelled
    }

    /// Invokes the handler. Synchronous handlers run before this returns.
    pub(crate) fn invoke(&self, payload: &Payload) -> BoxFuture<'static, HandlerOutcome> {
        (self.handler)(payload)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("event_type", &self.key)
            .field("priority", &self.priority)
            .field("skip_if_cancelled", &self.skip_if_cancelled)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Subscriber`]. Each terminal method consumes it.
#[must_use = "a subscriber builder does nothing until a handler is set"]
pub struct SubscriberBuilder<K: ?Sized> {
    priority: Priority,
    skip_if_cancelled: bool,
    _key: PhantomData<fn(Arc<K>)>,
}

impl<K> SubscriberBuilder<K>
where
    K: ?Sized + Send + Sync + 'static,
{
    /// Sets the priority (default [`Priority::Normal`]).
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Skip this subscriber when the event has been cancelled (default `false`).
    pub const fn skip_if_cancelled(mut self, skip: bool) -> Self {
        self.skip_if_cancelled = skip;
        self
    }

    /// Side-effecting callback run on the dispatching worker.
    ///
    /// `Err` fails the chain with [`Error::HandlerFailure`]; a panic fails it
    /// with [`Error::HandlerPanic`].
    pub fn handler<F>(self, handler: F) -> Subscriber
    where
        F: Fn(&K) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.build(move |event: Arc<K>| {
            let outcome = match catch_unwind(AssertUnwindSafe(|| handler(event.as_ref()))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(cause)) => Err(vec![Error::handler_failure(type_name::<K>(), cause)]),
                Err(_) => Err(vec![panicked::<K>()]),
            };
            future::ready(outcome).boxed()
        })
    }

    /// Callback that hands back its own [`Completion`].
    ///
    /// The chain resumes once that completion resolves and fails with its
    /// errors if it failed.
    pub fn completion_handler<F>(self, handler: F) -> Subscriber
    where
        F: Fn(Arc<K>) -> Completion + Send + Sync + 'static,
    {
        self.build(move |event: Arc<K>| {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(completion) => async move {
                    completion.done().await;
                    let errors = completion.errors();
                    if errors.is_empty() { Ok(()) } else { Err(errors) }
                }
                .boxed(),
                Err(_) => future::ready(Err(vec![panicked::<K>()])).boxed(),
            }
        })
    }

    /// Async callback; the chain awaits the returned future in place.
    pub fn async_handler<F, Fut>(self, handler: F) -> Subscriber
    where
        F: Fn(Arc<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.build(move |event: Arc<K>| {
            let fut = handler(event);
            async move {
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(cause)) => Err(vec![Error::handler_failure(type_name::<K>(), cause)]),
                    Err(_) => Err(vec![panicked::<K>()]),
                }
            }
            .boxed()
        })
    }

    /// Struct-based listener, for handlers that carry their own state.
    pub fn listener<L>(self, listener: L) -> Subscriber
    where
        L: EventListener<K>,
    {
        let listener = Arc::new(listener);
        self.async_handler(move |event: Arc<K>| {
            let listener = listener.clone();
            async move { listener.handle(event).await }
        })
    }

    fn build<F>(self, handler: F) -> Subscriber
    where
        F: Fn(Arc<K>) -> BoxFuture<'static, HandlerOutcome> + Send + Sync + 'static,
    {
        let erased = move |payload: &Payload| match payload.get::<K>() {
            Some(event) => handler(event),
            None => future::ready(Err(vec![Error::TypeMismatch {
                expected: type_name::<K>(),
            }]))
            .boxed(),
        };

        Subscriber {
            key: TypeKey::of::<K>(),
            priority: self.priority,
            skip_if_cancelled: self.skip_if_cancelled,
            handler: Arc::new(erased),
        }
    }
}

fn panicked<K: ?Sized>() -> Error {
    Error::HandlerPanic {
        event_type: type_name::<K>(),
    }
}

/// Identifies one registration, for [`EventBus::unsubscribe`](crate::EventBus::unsubscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    key: TypeKey,
    priority: Priority,
    sequence: u64,
}

impl SubscriptionHandle {
    pub(crate) const fn new(key: TypeKey, priority: Priority, sequence: u64) -> Self {
        Self {
            key,
            priority,
            sequence,
        }
    }

    /// The dispatch key of the registration.
    #[must_use]
    pub const fn event_type(&self) -> TypeKey {
        self.key
    }

    /// Priority the subscriber was registered with.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Registration order, unique per bus.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Deposit {
        amount: u64,
    }

    trait Audited: Send + Sync {
        fn label(&self) -> String;
    }

    impl Audited for Deposit {
        fn label(&self) -> String {
            format!("deposit:{}", self.amount)
        }
    }

    fn payload(amount: u64) -> Payload {
        Payload::new(Arc::new(Deposit { amount }))
    }

    #[tokio::test]
    async fn test_sync_handler_runs_before_future_is_polled() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let subscriber = Subscriber::builder::<Deposit>()
            .priority(Priority::High)
            .handler(move |event| {
                counter.store(usize::try_from(event.amount)?, Ordering::SeqCst);
                Ok(())
            });

        let pending = subscriber.invoke(&payload(7));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(pending.await.is_ok());
        assert_eq!(subscriber.priority(), Priority::High);
        assert!(!subscriber.skip_if_cancelled());
    }

    #[tokio::test]
    async fn test_handler_error_becomes_handler_failure() {
        let subscriber =
            Subscriber::builder::<Deposit>().handler(|_| Err("insufficient funds".into()));

        let errors = subscriber.invoke(&payload(1)).await.unwrap_err();

        assert_eq!(errors.len(), 1);
        assert_matches!(&errors[0], Error::HandlerFailure { cause, .. } if cause.to_string() == "insufficient funds");
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let subscriber = Subscriber::builder::<Deposit>().handler(|_| panic!("boom"));

        let errors = subscriber.invoke(&payload(1)).await.unwrap_err();

        assert_matches!(errors.as_slice(), [Error::HandlerPanic { .. }]);
    }

    #[tokio::test]
    async fn test_completion_handler_waits_for_resolution() {
        let pending = Completion::new();
        let returned = pending.clone();
        let subscriber =
            Subscriber::builder::<Deposit>().completion_handler(move |_| returned.clone());

        let outcome = tokio::spawn(subscriber.invoke(&payload(1)));
        tokio::task::yield_now().await;
        assert!(!outcome.is_finished());

        pending.complete_exceptionally([Error::Shutdown]).unwrap();

        let errors = outcome.await.unwrap().unwrap_err();
        assert_matches!(errors.as_slice(), [Error::Shutdown]);
    }

    #[tokio::test]
    async fn test_capability_key_receives_upcast_payload() {
        let labels = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = labels.clone();
        let subscriber = Subscriber::builder::<dyn Audited>().async_handler(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().push(event.label());
                Ok(())
            }
        });

        let event: Arc<dyn Audited> = Arc::new(Deposit { amount: 3 });
        subscriber.invoke(&Payload::new(event)).await.unwrap();

        assert_eq!(subscriber.event_type(), TypeKey::of::<dyn Audited>());
        assert_eq!(*labels.lock(), vec!["deposit:3".to_string()]);
    }

    #[tokio::test]
    async fn test_wrong_payload_is_type_mismatch() {
        let subscriber = Subscriber::builder::<dyn Audited>().handler(|_| Ok(()));

        let errors = subscriber.invoke(&payload(1)).await.unwrap_err();

        assert_matches!(errors.as_slice(), [Error::TypeMismatch { .. }]);
    }

    struct Ledger {
        total: AtomicUsize,
    }

    #[async_trait]
    impl EventListener<Deposit> for Arc<Ledger> {
        async fn handle(&self, event: Arc<Deposit>) -> Result<(), BoxError> {
            self.total
                .fetch_add(usize::try_from(event.amount)?, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_listener_shape() {
        let ledger = Arc::new(Ledger {
            total: AtomicUsize::new(0),
        });
        let subscriber = Subscriber::builder::<Deposit>().listener(ledger.clone());

        subscriber.invoke(&payload(5)).await.unwrap();
        subscriber.invoke(&payload(6)).await.unwrap();

        assert_eq!(ledger.total.load(Ordering::SeqCst), 11);
    }
}
