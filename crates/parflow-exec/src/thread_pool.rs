//! Pool of OS threads consuming a shared queue.

use std::collections::HashSet;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{PoolError, Result, TaskResult};
use crate::future::{lock, run_task, WorkFuture};
use crate::pool::{overflow, InlineSlot, Lifecycle, Overflow, Pool, Slots};

/// Thread pool settings.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    pub name: String,
    /// Upper bound on worker threads. Zero runs every task inline.
    pub max_workers: usize,
    /// Reserve a single inline slot instead of running inline freely.
    pub shared: bool,
    /// Bound on waiting for a free worker.
    pub submit_timeout: Option<Duration>,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            name: "threads".to_string(),
            max_workers: thread::available_parallelism().map_or(4, |n| n.get()),
            shared: false,
            submit_timeout: None,
        }
    }
}

impl ThreadPoolConfig {
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

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Stop,
}

struct Inner {
    config: ThreadPoolConfig,
    lifecycle: Lifecycle,
    slots: Arc<Slots>,
    inline: InlineSlot,
    sender: Mutex<Option<mpsc::SyncSender<Job>>>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_threads: Arc<Mutex<HashSet<ThreadId>>>,
}

/// Runs closures on lazily started OS threads.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<Inner>,
}

impl ThreadPool {
    pub fn new(config: ThreadPoolConfig) -> Self {
        let (sender, receiver) = mpsc::sync_channel(config.max_workers.max(1));
        Self {
            inner: Arc::new(Inner {
                lifecycle: Lifecycle::new(&config.name),
                slots: Slots::new(config.max_workers),
                inline: InlineSlot::default(),
                sender: Mutex::new(Some(sender)),
                receiver: Arc::new(Mutex::new(receiver)),
                workers: Mutex::new(Vec::new()),
                worker_threads: Arc::default(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.inner.config
    }

    /// Threads started so far.
    pub fn worker_count(&self) -> usize {
        lock(&self.inner.workers).len()
    }

    fn on_worker_thread(&self) -> bool {
        lock(&self.inner.worker_threads).contains(&thread::current().id())
    }

    /// Run `f` on a worker with a child of `context`.
    ///
    /// With no free worker, `block` waits for one; otherwise the task runs
    /// inline on the caller (once at a time for shared pools).
    pub fn submit<T, F>(&self, context: &Context, f: F, block: bool) -> Result<WorkFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Context) -> TaskResult<T> + Send + 'static,
    {
        let inner = &self.inner;
        inner.lifecycle.check_open()?;

        let future = WorkFuture::new(inner.config.name.clone());
        let task_context = context.child();

        if inner.config.max_workers == 0 {
            run_task(task_context, f, &future);
            context.adopt(future.handle());
            return Ok(future);
        }

        let guard = match inner.slots.try_acquire() {
            Some(guard) => guard,
            None => {
                let inline = if !block && inner.config.shared {
                    inner.inline.try_take()
                } else {
                    None
                };
                match overflow(block, inner.config.shared, inline.is_some()) {
                    Overflow::Inline => {
                        debug!(pool = %inner.config.name, "no free worker, running inline");
                        run_task(task_context, f, &future);
                        drop(inline);
                        context.adopt(future.handle());
                        return Ok(future);
                    }
                    Overflow::Wait => {
                        if self.on_worker_thread() {
                            return Err(PoolError::DeadlockHazard(inner.config.name.clone()));
                        }
                        inner.slots.acquire(
                            inner.config.submit_timeout,
                            || !inner.lifecycle.is_open(),
                            || PoolError::ShutDown(inner.config.name.clone()),
                        )?
                    }
                }
            }
        };

        self.ensure_worker()?;

        let job_future = future.clone();
        let job = Job::Run(Box::new(move || {
            let _slot = guard;
            run_task(task_context, f, &job_future);
        }));
        let sender = lock(&inner.sender)
            .clone()
            .ok_or_else(|| PoolError::ShutDown(inner.config.name.clone()))?;
        sender
            .send(job)
            .map_err(|_| PoolError::ShutDown(inner.config.name.clone()))?;

        context.adopt(future.handle());
        Ok(future)
    }

    /// Start another thread if every started one may be busy.
    fn ensure_worker(&self) -> Result<()> {
        let inner = &self.inner;
        let mut workers = lock(&inner.workers);
        let wanted = inner.slots.in_use().min(inner.config.max_workers);
        if workers.len() >= wanted {
            return Ok(());
        }

        let index = workers.len();
        let pool = inner.config.name.clone();
        let receiver = inner.receiver.clone();
        let worker_threads = inner.worker_threads.clone();
        let handle = thread::Builder::new()
            .name(format!("{pool}-{index}"))
            .spawn(move || worker_loop(pool, receiver, worker_threads))?;
        workers.push(handle);
        debug!(pool = %inner.config.name, workers = workers.len(), "started worker thread");
        Ok(())
    }
}

fn worker_loop(
    pool: String,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    worker_threads: Arc<Mutex<HashSet<ThreadId>>>,
) {
    let id = thread::current().id();
    lock(&worker_threads).insert(id);
    loop {
        let job = lock(&receiver).recv();
        match job {
            Ok(Job::Run(run)) => run(),
            Ok(Job::Stop) | Err(_) => break,
        }
    }
    lock(&worker_threads).remove(&id);
    debug!(%pool, "worker thread stopped");
}

impl Pool for ThreadPool {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn open(&self) -> Result<()> {
        self.inner.lifecycle.open()?;
        debug!(pool = %self.inner.config.name, max_workers = self.inner.config.max_workers, "thread pool open");
        Ok(())
    }

    /// Queued work drains before the workers see their stop sentinel.
    fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        if !inner.lifecycle.begin_shutdown() {
            return Ok(());
        }
        if self.on_worker_thread() {
            return Err(PoolError::DeadlockHazard(inner.config.name.clone()));
        }

        let workers = std::mem::take(&mut *lock(&inner.workers));
        if let Some(sender) = lock(&inner.sender).take() {
            for _ in &workers {
                let _ = sender.send(Job::Stop);
            }
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut stragglers = 0;
        for handle in workers {
            while !handle.is_finished() {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!(pool = %inner.config.name, "worker thread panicked");
                }
            } else {
                stragglers += 1;
            }
        }

        if stragglers > 0 {
            warn!(pool = %inner.config.name, stragglers, "worker threads still busy after shutdown timeout");
            return Err(PoolError::Timeout(timeout.unwrap_or_default()));
        }
        debug!(pool = %inner.config.name, "thread pool shut down");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lifecycle.is_open()
    }
}
