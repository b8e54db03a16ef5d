//! Per-event-type worker pools
//!
//! Every event type gets its own [`Executor`]: a fixed set of tokio worker
//! tasks pulling jobs from one shared flume channel. A congested type only
//! ever fills its own queue, so dispatch of one event type is never held up
//! by another.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::EventBusConfig;
use crate::error::{Error, Result};
use crate::types::TypeKey;

type Job = BoxFuture<'static, ()>;

tokio::task_local! {
    /// Pool whose job the current task is running.
    static CURRENT_POOL: Arc<str>;
}

/// Handle to one worker pool
#[derive(Clone)]
pub(crate) struct Executor {
    name: Arc<str>,
    tx: flume::Sender<Job>,
    rx: flume::Receiver<Job>,
    handle: Handle,
    token: CancellationToken,
}

impl Executor {
    fn spawn(
        name: &str,
        workers: usize,
        handle: &Handle,
        token: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let workers = workers.max(1);
        let name: Arc<str> = Arc::from(name);
        let (tx, rx) = flume::unbounded::<Job>();

        let handles = (0..workers)
            .map(|index| handle.spawn(run_worker(name.clone(), index, rx.clone(), token.clone())))
            .collect();

        debug!(pool = %name, workers, "Started worker pool");

        (
            Self {
                name,
                tx,
                rx,
                handle: handle.clone(),
                token,
            },
            handles,
        )
    }

    /// Name of the pool, which is the event type it serves.
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Queues a job on this pool.
    ///
    /// A job that is rejected or dropped unrun because the pool is shutting
    /// down is dropped before this returns `Err(Error::Shutdown)`.
    pub(crate) fn execute<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            return Err(Error::Shutdown);
        }

        self.tx.send(job.boxed()).map_err(|_| Error::Shutdown)?;

        // Shutdown may have drained the queue between the check and the send
        if self.token.is_cancelled() {
            let dropped = self.drain();
            trace!(pool = %self.name, dropped, "Dropped job queued during shutdown");
            return Err(Error::Shutdown);
        }

        Ok(())
    }

    /// Like [`execute`](Self::execute), but a job submitted from one of this
    /// pool's own jobs is spawned beside the pool instead of queued behind it.
    ///
    /// A job waiting on a nested job of the same pool would otherwise hold a
    /// worker the nested job needs.
    pub(crate) fn execute_nested<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let nested = CURRENT_POOL
            .try_with(|pool| Arc::ptr_eq(pool, &self.name))
            .unwrap_or(false);
        if !nested {
            return self.execute(job);
        }

        if self.token.is_cancelled() {
            return Err(Error::Shutdown);
        }

        trace!(pool = %self.name, "Spawning nested job beside the pool");
        let pool = self.name.clone();
        self.handle
            .spawn(CURRENT_POOL.scope(self.name.clone(), run_job(pool, None, job.boxed())));
        Ok(())
    }

    /// Runs a plain callback as a job on this pool.
    ///
    /// The callback is never lost: if the pool refuses or drops the job, the
    /// callback runs through [`spawn_detached`] instead.
    pub(crate) fn execute_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deferred = Deferred(Some(f));
        let job = async move {
            let mut deferred = deferred;
            if let Some(f) = deferred.0.take() {
                f();
            }
        };

        if let Err(e) = self.execute(job) {
            debug!(pool = %self.name, "Running callback off pool: {e}");
        }
    }

    /// Drops every job still queued, returning how many there were.
    fn drain(&self) -> usize {
        self.rx.drain().count()
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name)
            .field("queued", &self.tx.len())
            .finish()
    }
}

/// Callback that runs through [`spawn_detached`] if dropped before it ran.
struct Deferred<F: FnOnce() + Send + 'static>(Option<F>);

impl<F: FnOnce() + Send + 'static> Drop for Deferred<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            spawn_detached(f);
        }
    }
}

/// Runs `callback` away from the current thread: on the ambient tokio
/// runtime when there is one, otherwise on a fresh thread.
pub(crate) fn spawn_detached<F>(callback: F)
where
    F: FnOnce() + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { callback() });
        }
        Err(_) => {
            std::thread::spawn(callback);
        }
    }
}

async fn run_job(pool: Arc<str>, worker: Option<usize>, job: Job) {
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!(pool = %pool, ?worker, "Job panicked on worker");
    }
}

async fn run_worker(
    pool: Arc<str>,
    index: usize,
    rx: flume::Receiver<Job>,
    token: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            () = token.cancelled() => break,
            job = rx.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
        };

        CURRENT_POOL
            .scope(pool.clone(), run_job(pool.clone(), Some(index), job))
            .await;
    }

    trace!(pool = %pool, worker = index, "Worker stopped");
}

/// Lazily creates and caches one worker pool per event type, plus a default pool.
pub(crate) struct ExecutorRegistry {
    handle: Handle,
    default: Executor,
    pools: DashMap<TypeId, Executor>,
    workers_per_type: usize,
    type_workers: HashMap<TypeId, usize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
    token: CancellationToken,
}

impl ExecutorRegistry {
    pub(crate) fn new(
        handle: Handle,
        config: &EventBusConfig,
        type_workers: HashMap<TypeId, usize>,
    ) -> Self {
        let token = CancellationToken::new();
        let (default, workers) =
            Executor::spawn("default", config.default_workers, &handle, token.clone());

        Self {
            handle,
            default,
            pools: DashMap::new(),
            workers_per_type: config.workers_per_type,
            type_workers,
            workers: Mutex::new(workers),
            shutdown_timeout: config.shutdown_timeout,
            token,
        }
    }

    /// The shared pool for work that belongs to no particular event type.
    pub(crate) const fn default_executor(&self) -> &Executor {
        &self.default
    }

    /// Returns the pool for `key`, starting it on first use.
    pub(crate) fn executor_for(&self, key: TypeKey) -> Executor {
        if let Some(executor) = self.pools.get(&key.id()) {
            return executor.clone();
        }

        self.pools
            .entry(key.id())
            .or_insert_with(|| {
                let workers = self
                    .type_workers
                    .get(&key.id())
                    .copied()
                    .unwrap_or(self.workers_per_type);
                let (executor, handles) =
                    Executor::spawn(key.name(), workers, &self.handle, self.token.clone());
                self.workers.lock().extend(handles);
                executor
            })
            .clone()
    }

    /// Number of per-type pools started so far.
    pub(crate) fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stops every pool and waits for their workers, bounded by the shutdown timeout.
    ///
    /// Jobs still queued are dropped once the workers are gone.
    pub(crate) async fn shutdown(&self) {
        self.token.cancel();

        let handles = std::mem::take(&mut *self.workers.lock());
        debug!(workers = handles.len(), "Shutting down worker pools");

        for handle in handles {
            if tokio::time::timeout(self.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!(
                    "Worker did not stop within {:?}",
                    self.shutdown_timeout
                );
            }
        }

        let dropped = self.default.drain()
            + self
                .pools
                .iter()
                .map(|pool| pool.value().drain())
                .sum::<usize>();
        if dropped > 0 {
            debug!(dropped, "Dropped queued jobs on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Deposit;

    fn registry(workers: usize) -> ExecutorRegistry {
        let config = EventBusConfig {
            workers_per_type: workers,
            default_workers: 1,
            ..EventBusConfig::default()
        };
        ExecutorRegistry::new(Handle::current(), &config, HashMap::new())
    }

    #[tokio::test]
    async fn test_executor_is_cached_per_type() {
        let registry = registry(2);

        let first = registry.executor_for(TypeKey::of::<Deposit>());
        let second = registry.executor_for(TypeKey::of::<Deposit>());
        registry.executor_for(TypeKey::of::<u64>());

        assert_eq!(registry.pool_count(), 2);
        assert!(first.tx.same_channel(&second.tx));
        assert!(first.name().contains("Deposit"));
    }

    #[tokio::test]
    async fn test_jobs_run_on_pool() {
        let registry = registry(2);
        let executor = registry.executor_for(TypeKey::of::<Deposit>());
        let ran = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let counter = ran.clone();
        executor
            .execute(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            })
            .unwrap();

        rx.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_keeps_worker_alive() {
        let registry = registry(1);
        let executor = registry.executor_for(TypeKey::of::<Deposit>());
        let (tx, rx) = tokio::sync::oneshot::channel();

        executor.execute_fn(|| panic!("boom"));
        executor.execute_fn(move || {
            let _ = tx.send(());
        });

        rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_after_shutdown_fails() {
        let registry = registry(1);
        let executor = registry.executor_for(TypeKey::of::<Deposit>());

        registry.shutdown().await;

        assert!(registry.is_shutdown());
        assert!(matches!(executor.execute(async {}), Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_jobs() {
        struct Flag(Arc<AtomicUsize>);

        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = registry(1);
        let executor = registry.executor_for(TypeKey::of::<Deposit>());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let dropped = Arc::new(AtomicUsize::new(0));

        executor
            .execute(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            })
            .unwrap();
        started_rx.await.unwrap();

        let flag = Flag(dropped.clone());
        executor
            .execute(async move {
                let _flag = flag;
            })
            .unwrap();

        let _ = release_tx.send(());
        registry.shutdown().await;

        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callback_runs_after_shutdown() {
        let registry = registry(1);
        let executor = registry.executor_for(TypeKey::of::<Deposit>());
        registry.shutdown().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.execute_fn(move || {
            let _ = tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("callback should still run")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jobs_racing_shutdown_are_never_left_queued() {
        let registry = Arc::new(registry(1));
        let executor = registry.executor_for(TypeKey::of::<Deposit>());

        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let executor = executor.clone();
                tokio::task::spawn_blocking(move || {
                    for _ in 0..1_000 {
                        if executor.execute(async {}).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(1)).await;
        registry.shutdown().await;
        for submitter in submitters {
            submitter.await.unwrap();
        }

        assert!(registry.is_shutdown());
        assert!(executor.tx.is_empty());
    }

    #[tokio::test]
    async fn test_nested_job_runs_while_the_only_worker_waits() {
        let registry = registry(1);
        let executor = registry.executor_for(TypeKey::of::<Deposit>());
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let inner = executor.clone();
        executor
            .execute(async move {
                let (tx, rx) = tokio::sync::oneshot::channel();
                inner
                    .execute_nested(async move {
                        let _ = tx.send(());
                    })
                    .unwrap();
                rx.await.unwrap();
                let _ = done_tx.send(());
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("nested job should not wait for the busy worker")
            .unwrap();
    }

    #[tokio::test]
    async fn test_execute_nested_from_outside_the_pool_queues() {
        let registry = registry(1);
        let executor = registry.executor_for(TypeKey::of::<Deposit>());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        executor
            .execute(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            })
            .unwrap();
        started_rx.await.unwrap();

        executor.execute_nested(async {}).unwrap();
        assert_eq!(executor.tx.len(), 1);

        let _ = release_tx.send(());
    }
}
