//! Single-resolution completion handle
//!
//! A [`Completion`] starts pending and is resolved exactly once, either
//! successfully or with a list of errors. After resolution it is a read-only
//! record that any number of clones can observe.
//!
//! Observers pick how to wait:
//! - [`Completion::wait`] and [`Completion::when_complete`] block the calling thread.
//! - [`Completion::done`] suspends an async task.
//! - [`Completion::when_complete_async`] never blocks and runs its callback on
//!   the completion's worker pool.
//!
//! There is no timeout. A completion that is never resolved keeps every
//! waiter pending forever; handlers that need bounded latency must enforce
//! it themselves.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::error;

use crate::error::{Error, Result};
use crate::executor::{Executor, spawn_detached};

type Listener = Box<dyn FnOnce(&Outcome) + Send>;

#[derive(Clone, Debug)]
pub(crate) enum Outcome {
    Succeeded,
    Failed(Arc<[Error]>),
}

impl Outcome {
    pub(crate) fn errors(&self) -> &[Error] {
        match self {
            Self::Succeeded => &[],
            Self::Failed(errors) => &**errors,
        }
    }
}

enum State {
    Pending(Vec<Listener>),
    Resolved(Outcome),
}

struct Inner {
    state: Mutex<State>,
    resolved: Condvar,
    notify: Notify,
    executor: Option<Executor>,
}

/// Future-like handle for "done, possibly with errors".
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    /// Creates a pending completion with no owning worker pool.
    #[must_use]
    pub fn new() -> Self {
        Self::with_executor(None)
    }

    pub(crate) fn with_executor(executor: Option<Executor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                resolved: Condvar::new(),
                notify: Notify::new(),
                executor,
            }),
        }
    }

    pub(crate) fn owned_by(executor: Executor) -> Self {
        Self::with_executor(Some(executor))
    }

    /// Creates an already succeeded completion.
    #[must_use]
    pub fn succeeded() -> Self {
        let completion = Self::new();
        *completion.inner.state.lock() = State::Resolved(Outcome::Succeeded);
        completion
    }

    /// Creates an already failed completion.
    #[must_use]
    pub fn failed(errors: impl IntoIterator<Item = Error>) -> Self {
        let completion = Self::new();
        *completion.inner.state.lock() =
            State::Resolved(Outcome::Failed(errors.into_iter().collect()));
        completion
    }

    /// Resolves the completion successfully.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyCompleted`] if it was already resolved; the
    /// existing outcome is left untouched.
    pub fn complete(&self) -> Result<()> {
        self.resolve(Outcome::Succeeded)
    }

    /// Resolves the completion with the given errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyCompleted`] if it was already resolved; the
    /// existing outcome is left untouched.
    pub fn complete_exceptionally(&self, errors: impl IntoIterator<Item = Error>) -> Result<()> {
        self.resolve(Outcome::Failed(errors.into_iter().collect()))
    }

    /// Fails the completion unless something already resolved it.
    pub(crate) fn fail_if_pending(&self, errors: impl IntoIterator<Item = Error>) {
        if !self.is_done() {
            let _ = self.resolve(Outcome::Failed(errors.into_iter().collect()));
        }
    }

    fn resolve(&self, outcome: Outcome) -> Result<()> {
        let previous = {
            let mut state = self.inner.state.lock();
            if matches!(*state, State::Resolved(_)) {
                drop(state);
                error!("Attempted to resolve a completion twice");
                return Err(Error::AlreadyCompleted);
            }
            std::mem::replace(&mut *state, State::Resolved(outcome.clone()))
        };

        self.inner.resolved.notify_all();
        self.inner.notify.notify_waiters();

        if let State::Pending(listeners) = previous {
            for listener in listeners {
                listener(&outcome);
            }
        }

        Ok(())
    }

    fn outcome(&self) -> Option<Outcome> {
        match &*self.inner.state.lock() {
            State::Pending(_) => None,
            State::Resolved(outcome) => Some(outcome.clone()),
        }
    }

    /// Whether the completion has been resolved.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Resolved(_))
    }

    /// Whether the completion resolved successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Resolved(Outcome::Succeeded))
    }

    /// Whether the completion resolved with errors.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(
            *self.inner.state.lock(),
            State::Resolved(Outcome::Failed(_))
        )
    }

    /// The errors the completion resolved with; empty while pending or on success.
    #[must_use]
    pub fn errors(&self) -> Vec<Error> {
        self.outcome()
            .map(|outcome| outcome.errors().to_vec())
            .unwrap_or_default()
    }

    /// Blocks the calling thread until the completion is resolved.
    ///
    /// Read the outcome afterwards through [`Completion::errors`]. Do not call
    /// this from an async task; use [`Completion::done`] there.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while matches!(*state, State::Pending(_)) {
            self.inner.resolved.wait(&mut state);
        }
    }

    /// Waits asynchronously until the completion is resolved.
    pub async fn done(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }

    /// Invokes `callback` with the errors once the completion is resolved.
    ///
    /// **This blocks the calling thread** until resolution. If the completion is
    /// already resolved the callback runs immediately on the calling thread.
    pub fn when_complete<F>(&self, callback: F)
    where
        F: FnOnce(&[Error]),
    {
        self.wait();
        let errors = self.errors();
        callback(errors.as_slice());
    }

    /// Schedules `callback` to run with the errors once the completion is resolved.
    ///
    /// Never blocks. The callback runs on the worker pool that owns this
    /// completion (for dispatch results, the pool of the fired event type).
    /// Completions without a pool, and callbacks a pool refuses because it is
    /// shutting down, spawn on the ambient tokio runtime, or on a new thread
    /// when there is none. The callback never runs on the registering thread.
    pub fn when_complete_async<F>(&self, callback: F)
    where
        F: FnOnce(Vec<Error>) + Send + 'static,
    {
        let executor = self.inner.executor.clone();
        self.on_resolved(move |outcome| {
            let errors = outcome.errors().to_vec();
            schedule(executor.as_ref(), move || callback(errors));
        });
    }

    /// Runs `listener` on the resolving thread, or right away if already resolved.
    pub(crate) fn on_resolved<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let outcome = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                }
                State::Resolved(outcome) => outcome.clone(),
            }
        };

        listener(&outcome);
    }

    /// Combines completions into one that resolves when all of them have.
    ///
    /// The result succeeds only if every input succeeded. Otherwise it fails
    /// with the errors of every failed input, in input order, whatever order
    /// the inputs resolved in. Joining nothing yields a succeeded completion.
    #[must_use]
    pub fn join(completions: impl IntoIterator<Item = Self>) -> Self {
        Self::join_with(None, completions)
    }

    pub(crate) fn join_with(
        executor: Option<Executor>,
        completions: impl IntoIterator<Item = Self>,
    ) -> Self {
        let completions: Vec<Self> = completions.into_iter().collect();
        let joined = Self::with_executor(executor);

        if completions.is_empty() {
            let _ = joined.complete();
            return joined;
        }

        let state = Arc::new(JoinState {
            remaining: AtomicUsize::new(completions.len()),
            failures: Mutex::new(vec![None; completions.len()]),
        });

        for (index, completion) in completions.iter().enumerate() {
            let state = state.clone();
            let joined = joined.clone();

            completion.on_resolved(move |outcome| {
                if let Outcome::Failed(errors) = outcome {
                    state.failures.lock()[index] = Some(errors.clone());
                }

                if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let failures: Vec<Arc<[Error]>> =
                        state.failures.lock().drain(..).flatten().collect();

                    let _ = if failures.is_empty() {
                        joined.complete()
                    } else {
                        joined.complete_exceptionally(
                            failures.iter().flat_map(|errors| errors.iter().cloned()),
                        )
                    };
                }
            });
        }

        joined
    }
}

/// Fails the completion with [`Error::Shutdown`] if it is dropped while still pending.
///
/// Moved into queued jobs so that a job dropped unrun by a stopping pool
/// still resolves its completion.
pub(crate) struct ShutdownGuard(pub(crate) Completion);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.fail_if_pending([Error::Shutdown]);
    }
}

struct JoinState {
    remaining: AtomicUsize,
    failures: Mutex<Vec<Option<Arc<[Error]>>>>,
}

fn schedule<F>(executor: Option<&Executor>, callback: F)
where
    F: FnOnce() + Send + 'static,
{
    match executor {
        Some(executor) => executor.execute_fn(callback),
        None => spawn_detached(callback),
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Completion");
        match self.outcome() {
            None => debug.field("state", &"pending"),
            Some(Outcome::Succeeded) => debug.field("state", &"succeeded"),
            Some(Outcome::Failed(errors)) => debug.field("state", &"failed").field("errors", &errors),
        };
        debug.finish()
    }
}
