//! Related-type resolution for hierarchy fan-out
//!
//! Rust has no runtime view of a value's supertypes, so an event lists the
//! types that should also receive it through [`Event::related`]. The index
//! filters that list once per concrete type and memoizes the result.

use std::any::{Any, TypeId, type_name};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::subscriber::Payload;
use crate::traits::{Cancellable, Event};
use crate::types::TypeKey;

type Upcast<E> = dyn Fn(Arc<E>) -> Payload + Send + Sync;

/// A type that also receives events of type `E`.
///
/// Carries the related type's key and the conversion from the fired event to
/// the value its listeners see.
pub struct Related<E> {
    key: TypeKey,
    upcast: Arc<Upcast<E>>,
}

impl<E: Event> Related<E> {
    /// Declares `K` as related to `E`, converting with `upcast`.
    ///
    /// For capability traits the conversion is an unsizing coercion, which
    /// the [`related!`](crate::related) macro writes for you.
    pub fn new<K>(upcast: fn(Arc<E>) -> Arc<K>) -> Self
    where
        K: ?Sized + Send + Sync + 'static,
    {
        Self {
            key: TypeKey::of::<K>(),
            upcast: Arc::new(move |event| Payload::new(upcast(event))),
        }
    }

    /// Key of the related type.
    #[must_use]
    pub const fn key(&self) -> TypeKey {
        self.key
    }

    pub(crate) fn upcast(&self, event: Arc<E>) -> Payload {
        (self.upcast)(event)
    }
}

impl<E> Clone for Related<E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            upcast: self.upcast.clone(),
        }
    }
}

impl<E> fmt::Debug for Related<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Related").field(&self.key).finish()
    }
}

/// Builds the related-type list for an [`Event`] impl from capability traits.
///
/// ```rust,ignore
/// impl Event for Deposit {
///     fn related() -> Vec<Related<Self>> {
///         related![dyn AccountEvent, dyn Audited]
///     }
/// }
/// ```
#[macro_export]
macro_rules! related {
    ($($ty:ty),* $(,)?) => {
        vec![$(
            $crate::Related::new(
                |event: ::std::sync::Arc<Self>| -> ::std::sync::Arc<$ty> { event },
            )
        ),*]
    };
}

/// Memoized related types per concrete event type.
#[derive(Default)]
pub(crate) struct TypeHierarchyIndex {
    entries: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl TypeHierarchyIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Related types of `E`, computed on first lookup.
    ///
    /// Two threads racing on the first lookup may both compute the list; the
    /// first insert wins and both see equal results.
    pub(crate) fn related<E: Event>(&self) -> Arc<Vec<Related<E>>> {
        let id = TypeId::of::<E>();

        if let Some(entry) = self.entries.get(&id) {
            if let Ok(related) = entry.value().clone().downcast::<Vec<Related<E>>>() {
                return related;
            }
        }

        let computed = Arc::new(compute::<E>());
        trace!(
            event_type = type_name::<E>(),
            related = computed.len(),
            "Indexed related event types"
        );

        let entry = self
            .entries
            .entry(id)
            .or_insert_with(|| computed.clone() as Arc<dyn Any + Send + Sync>)
            .clone();

        entry
            .downcast::<Vec<Related<E>>>()
            .unwrap_or(computed)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Declared related types minus the roots, the cancellation capability,
/// the type itself and duplicates.
fn compute<E: Event>() -> Vec<Related<E>> {
    let excluded = [
        TypeKey::of::<E>(),
        TypeKey::of::<dyn Any>(),
        TypeKey::of::<dyn Any + Send>(),
        TypeKey::of::<dyn Any + Send + Sync>(),
        TypeKey::of::<dyn Event>(),
        TypeKey::of::<dyn Cancellable>(),
    ];
    let mut seen = HashSet::new();

    E::related()
        .into_iter()
        .filter(|related| !excluded.contains(&related.key()) && seen.insert(related.key()))
        .collect()
}
