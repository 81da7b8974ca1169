//! Pool of cooperative workers on one event loop.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{PoolError, Result, TaskError, TaskResult};
use crate::event_loop::EventLoop;
use crate::future::{lock, panic_message, WorkFuture};
use crate::pool::{overflow, InlineSlot, Lifecycle, Overflow, Pool};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Id of the pool whose worker is running the current task.
    static POOL_WORKER: u64;
}

/// Async pool settings.
#[derive(Debug, Clone)]
pub struct AsyncPoolConfig {
    pub name: String,
    /// Upper bound on concurrently running tasks. Zero runs every task inline.
    pub max_workers: usize,
    pub shared: bool,
    pub submit_timeout: Option<Duration>,
}

impl Default for AsyncPoolConfig {
    fn default() -> Self {
        Self {
            name: "async".to_string(),
            max_workers: 64,
            shared: false,
            submit_timeout: None,
        }
    }
}

impl AsyncPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = Some(timeout);
        self
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

enum Job {
    Run(BoxFuture),
    Stop,
}

struct Inner {
    id: u64,
    config: AsyncPoolConfig,
    lifecycle: Lifecycle,
    event_loop: Arc<EventLoop>,
    owns_loop: bool,
    permits: Arc<Semaphore>,
    inline: InlineSlot,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Runs futures on worker tasks of a single event loop.
#[derive(Clone)]
pub struct AsyncPool {
    inner: Arc<Inner>,
}

impl AsyncPool {
    /// A pool with its own event loop thread.
    pub fn new(config: AsyncPoolConfig) -> Result<Self> {
        let event_loop = Arc::new(EventLoop::start(format!("{}-loop", config.name))?);
        Ok(Self::build(config, event_loop, true))
    }

    /// A pool running on an existing loop, which it leaves running on shutdown.
    pub fn with_event_loop(config: AsyncPoolConfig, event_loop: Arc<EventLoop>) -> Self {
        Self::build(config, event_loop, false)
    }

    fn build(config: AsyncPoolConfig, event_loop: Arc<EventLoop>, owns_loop: bool) -> Self {
        let (sender, receiver) = mpsc::channel(config.max_workers.max(1));
        Self {
            inner: Arc::new(Inner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                lifecycle: Lifecycle::new(&config.name),
                event_loop,
                owns_loop,
                permits: Arc::new(Semaphore::new(config.max_workers)),
                inline: InlineSlot::default(),
                sender: Mutex::new(Some(sender)),
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                workers: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &AsyncPoolConfig {
        &self.inner.config
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.inner.event_loop
    }

    /// Worker tasks started so far.
    pub fn worker_count(&self) -> usize {
        lock(&self.inner.workers).len()
    }

    fn in_use(&self) -> usize {
        self.inner
            .config
            .max_workers
            .saturating_sub(self.inner.permits.available_permits())
    }

    fn on_own_worker(&self) -> bool {
        POOL_WORKER
            .try_with(|id| *id == self.inner.id)
            .unwrap_or(false)
    }

    /// Submit from a plain OS thread.
    ///
    /// Queues without blocking when a worker is free. Otherwise the calling
    /// thread blocks on the loop while the task waits for a worker or runs
    /// inline there.
    pub fn submit<T, F, Fut>(&self, context: &Context, f: F, block: bool) -> Result<WorkFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let inner = &self.inner;
        if Handle::try_current().is_ok() {
            return Err(PoolError::DeadlockHazard(inner.config.name.clone()));
        }
        inner.lifecycle.check_open()?;

        if inner.config.max_workers > 0 {
            if let Ok(permit) = inner.permits.clone().try_acquire_owned() {
                let future = WorkFuture::new(inner.config.name.clone());
                self.enqueue(permit, context.child(), f, &future)?;
                context.adopt(future.handle());
                return Ok(future);
            }
        }

        let pool = self.clone();
        let context = context.clone();
        inner
            .event_loop
            .block_on(async move { pool.submit_async(&context, f, block).await })?
    }

    /// Submit from async code.
    ///
    /// With no free worker, `block` waits for one; otherwise the task runs
    /// inline in the calling task (once at a time for shared pools).
    pub async fn submit_async<T, F, Fut>(
        &self,
        context: &Context,
        f: F,
        block: bool,
    ) -> Result<WorkFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let inner = &self.inner;
        inner.lifecycle.check_open()?;

        let future = WorkFuture::new(inner.config.name.clone());
        let task_context = context.child();

        if inner.config.max_workers == 0 {
            run_async_task(task_context, f, &future).await;
            context.adopt(future.handle());
            return Ok(future);
        }

        let permit = match inner.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let inline = if !block && inner.config.shared {
                    inner.inline.try_take()
                } else {
                    None
                };
                match overflow(block, inner.config.shared, inline.is_some()) {
                    Overflow::Inline => {
                        debug!(pool = %inner.config.name, "no free worker, running inline");
                        run_async_task(task_context, f, &future).await;
                        drop(inline);
                        context.adopt(future.handle());
                        return Ok(future);
                    }
                    Overflow::Wait => {
                        if self.on_own_worker() {
                            return Err(PoolError::DeadlockHazard(inner.config.name.clone()));
                        }
                        self.acquire().await?
                    }
                }
            }
        };

        self.enqueue(permit, task_context, f, &future)?;
        context.adopt(future.handle());
        Ok(future)
    }

    /// Hand a task holding `permit` to the workers.
    ///
    /// The queue holds at most one job per permit, so it only refuses jobs
    /// once shutdown has started.
    fn enqueue<T, F, Fut>(
        &self,
        permit: OwnedSemaphorePermit,
        context: Context,
        f: F,
        future: &WorkFuture<T>,
    ) -> Result<()>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let inner = &self.inner;
        self.ensure_worker();

        let job_future = future.clone();
        let job = Job::Run(Box::pin(async move {
            let _permit = permit;
            run_async_task(context, f, &job_future).await;
        }));
        let sender = lock(&inner.sender)
            .clone()
            .ok_or_else(|| PoolError::ShutDown(inner.config.name.clone()))?;
        sender
            .try_send(job)
            .map_err(|_| PoolError::ShutDown(inner.config.name.clone()))
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let inner = &self.inner;
        let acquire = inner.permits.clone().acquire_owned();
        let permit = match inner.config.submit_timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| PoolError::Timeout(timeout))?,
            None => acquire.await,
        };
        permit.map_err(|_| PoolError::ShutDown(inner.config.name.clone()))
    }

    fn ensure_worker(&self) {
        let inner = &self.inner;
        let mut workers = lock(&inner.workers);
        if workers.len() >= self.in_use().min(inner.config.max_workers) {
            return;
        }
        let worker = worker_loop(
            inner.config.name.clone(),
            inner.id,
            inner.receiver.clone(),
        );
        workers.push(inner.event_loop.handle().spawn(worker));
        debug!(pool = %inner.config.name, workers = workers.len(), "started worker task");
    }
}

async fn worker_loop(
    pool: String,
    pool_id: u64,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
) {
    POOL_WORKER
        .scope(pool_id, async {
            loop {
                let job = receiver.lock().await.recv().await;
                match job {
                    Some(Job::Run(run)) => run.await,
                    Some(Job::Stop) | None => break,
                }
            }
        })
        .await;
    debug!(%pool, "worker task stopped");
}

async fn run_async_task<T, F, Fut>(context: Context, f: F, future: &WorkFuture<T>)
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = TaskResult<T>>,
{
    if !future.set_running() {
        return;
    }
    let result = match AssertUnwindSafe(async move { f(context).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => Err(TaskError::Panicked {
            message: panic_message(payload.as_ref()),
        }),
    };
    future.complete(result);
}

impl Pool for AsyncPool {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn open(&self) -> Result<()> {
        self.inner.lifecycle.open()?;
        debug!(pool = %self.inner.config.name, max_workers = self.inner.config.max_workers, "async pool open");
        Ok(())
    }

    /// Queued work drains before the workers see their stop sentinel.
    fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        if !inner.lifecycle.begin_shutdown() {
            return Ok(());
        }

        let workers = std::mem::take(&mut *lock(&inner.workers));
        let sender = lock(&inner.sender).take();
        let name = inner.config.name.clone();
        let drained = inner.event_loop.block_on(async move {
            if let Some(sender) = sender {
                for _ in &workers {
                    let _ = sender.send(Job::Stop).await;
                }
            }
            let joined = futures_util::future::join_all(workers);
            let results = match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, joined).await {
                    Ok(results) => results,
                    Err(_) => return false,
                },
                None => joined.await,
            };
            for result in results {
                if let Err(err) = result {
                    warn!(pool = %name, error = %err, "worker task failed");
                }
            }
            true
        })?;
        inner.permits.close();

        if inner.owns_loop {
            inner.event_loop.stop(timeout)?;
        }
        if !drained {
            warn!(pool = %inner.config.name, "worker tasks still busy after shutdown timeout");
            return Err(PoolError::Timeout(timeout.unwrap_or_default()));
        }
        debug!(pool = %inner.config.name, "async pool shut down");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lifecycle.is_open()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::context::NodeRef;

    fn open_pool(config: AsyncPoolConfig) -> AsyncPool {
        let pool = AsyncPool::new(config).unwrap();
        pool.open().unwrap();
        pool
    }

    #[test]
    fn lifecycle_errors() {
        let pool = AsyncPool::new(AsyncPoolConfig::default()).unwrap();
        let err = pool
            .submit(&Context::root(), |_| async { Ok(()) }, true)
            .unwrap_err();
        assert!(matches!(err, PoolError::NotOpen(_)));

        pool.open().unwrap();
        pool.shutdown(Some(Duration::from_secs(1))).unwrap();
        assert!(matches!(
            pool.submit(&Context::root(), |_| async { Ok(()) }, true),
            Err(PoolError::ShutDown(_))
        ));
    }

    #[test]
    fn runs_on_the_loop_with_child_context() {
        let pool = open_pool(AsyncPoolConfig::default().with_max_workers(2));
        let mut ctx = Context::root().enter(NodeRef::new("case"));
        ctx.set_framework("seed", json!(7));
        ctx.set_local("private", json!(true));

        let future = pool
            .submit(
                &ctx,
                |task_ctx| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok((
                        std::thread::current().name().map(str::to_string),
                        task_ctx.framework("seed").cloned(),
                        task_ctx.local("private").cloned(),
                    ))
                },
                true,
            )
            .unwrap();

        let (thread, seed, private) = future.result().unwrap();
        assert_eq!(thread.as_deref(), Some("async-loop"));
        assert_eq!(seed, Some(json!(7)));
        assert_eq!(private, None);
        assert_eq!(ctx.children().len(), 1);
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown(None).unwrap();
    }

    #[test]
    fn zero_workers_runs_inline() {
        let pool = open_pool(AsyncPoolConfig::default().with_max_workers(0));
        let future = pool
            .submit(&Context::root(), |_| async { Ok(3) }, true)
            .unwrap();
        assert_eq!(future.try_result(), Some(Ok(3)));
        assert_eq!(pool.worker_count(), 0);
        pool.shutdown(None).unwrap();
    }

    #[test]
    fn panics_become_task_errors() {
        let pool = open_pool(AsyncPoolConfig::default().with_max_workers(1));
        let future = pool
            .submit(
                &Context::root(),
                |_| async {
                    if true {
                        panic!("async boom");
                    }
                    Ok(())
                },
                true,
            )
            .unwrap();
        assert!(matches!(
            future.result(),
            Err(TaskError::Panicked { message }) if message == "async boom"
        ));
        pool.shutdown(None).unwrap();
    }

    #[test]
    fn blocking_self_submission_is_a_deadlock_hazard() {
        let pool = open_pool(AsyncPoolConfig::default().with_max_workers(1));
        let inner_pool = pool.clone();
        let future = pool
            .submit(
                &Context::root(),
                move |ctx| async move {
                    let blocking = inner_pool.submit(&ctx, |_| async { Ok(()) }, true);
                    let waiting = inner_pool
                        .submit_async(&ctx, |_| async { Ok(()) }, true)
                        .await;
                    Ok((
                        matches!(blocking, Err(PoolError::DeadlockHazard(_))),
                        matches!(waiting, Err(PoolError::DeadlockHazard(_))),
                    ))
                },
                true,
            )
            .unwrap();
        assert_eq!(future.result(), Ok((true, true)));
        pool.shutdown(None).unwrap();
    }

    #[test]
    fn non_blocking_submit_runs_inline_when_busy() {
        let pool = open_pool(AsyncPoolConfig::default().with_max_workers(1));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let busy = pool
            .submit(
                &Context::root(),
                |_| async move {
                    let _ = release_rx.await;
                    Ok(())
                },
                true,
            )
            .unwrap();

        let inline = pool
            .submit(&Context::root(), |_| async { Ok("inline") }, false)
            .unwrap();
        assert_eq!(inline.try_result(), Some(Ok("inline")));

        release_tx.send(()).unwrap();
        busy.result().unwrap();
        pool.shutdown(None).unwrap();
    }

    #[test]
    fn blocking_submit_honours_timeout() {
        let pool = open_pool(
            AsyncPoolConfig::default()
                .with_max_workers(1)
                .with_submit_timeout(Duration::from_millis(30)),
        );
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let busy = pool
            .submit(
                &Context::root(),
                |_| async move {
                    let _ = release_rx.await;
                    Ok(())
                },
                true,
            )
            .unwrap();

        let err = pool
            .submit(&Context::root(), |_| async { Ok(()) }, true)
            .unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));

        release_tx.send(()).unwrap();
        busy.result().unwrap();
        pool.shutdown(None).unwrap();
    }

    #[test]
    fn shared_event_loop_outlives_the_pool() {
        let event_loop = Arc::new(EventLoop::start("shared-loop").unwrap());
        let pool = AsyncPool::with_event_loop(AsyncPoolConfig::default(), event_loop.clone());
        pool.open().unwrap();
        let future = pool
            .submit(&Context::root(), |_| async { Ok(1 + 1) }, true)
            .unwrap();
        pool.shutdown(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(future.try_result(), Some(Ok(2)));
        assert!(event_loop.is_running());
        event_loop.stop(None).unwrap();
    }
}
