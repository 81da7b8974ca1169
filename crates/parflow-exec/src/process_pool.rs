//! Pool of worker subprocesses fed through a remote work queue.
//!
//! The parent registers a work queue object with the scope's remote
//! object service. Each worker process connects back, pulls serialized
//! [`WorkItem`]s with `get` and reports through a per-item completion
//! object that resolves the parent's [`WorkFuture`]. An item belongs to the
//! worker that pulled it from that moment on, so a worker that dies before
//! reporting still fails its futures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parflow_remote::{Map, ObjectRef, RemoteException, RemoteObject, Value};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::context::{Context, ContextSnapshot};
use crate::error::{PoolError, Result, TaskError};
use crate::future::{lock, run_task, WorkFuture};
use crate::pool::{overflow, InlineSlot, Lifecycle, Overflow, Pool, Slots};
use crate::registry::{Task, TaskRegistry};
use crate::scope::Scope;
use crate::worker::{OUTPUT_TARGET, READY_SENTINEL};

/// Process pool settings.
#[derive(Debug, Clone)]
pub struct ProcessPoolConfig {
    pub name: String,
    /// Executable speaking the worker protocol, such as `parflow-worker`.
    pub worker_program: PathBuf,
    /// Extra arguments placed before the connection arguments.
    pub worker_args: Vec<String>,
    pub max_workers: usize,
    pub shared: bool,
    pub submit_timeout: Option<Duration>,
    /// Bound on a new worker printing its ready line.
    pub start_timeout: Duration,
    /// How long a worker's `get` waits for an item before asking again.
    pub poll_interval: Duration,
    /// Delivered to every task as the `settings` framework value.
    pub settings: Value,
    /// Tasks run inline in the parent.
    pub registry: TaskRegistry,
}

impl ProcessPoolConfig {
    pub fn new(worker_program: impl Into<PathBuf>) -> Self {
        Self {
            name: "processes".to_string(),
            worker_program: worker_program.into(),
            worker_args: Vec::new(),
            max_workers: 2,
            shared: false,
            submit_timeout: None,
            start_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
            settings: Value::Null,
            registry: TaskRegistry::with_builtins(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.worker_args = args.into_iter().map(Into::into).collect();
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

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }
}

/// One unit of work as a worker receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub settings: Value,
    pub context: ContextSnapshot,
    pub task: Task,
    /// Object the worker reports progress and outcome to.
    pub completion: ObjectRef,
}

struct Queued {
    item: WorkItem,
    future: WorkFuture<Value>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Queued>,
    stopping: bool,
}

/// Work items waiting for a worker, exposed as a remote object.
pub(crate) struct WorkQueue {
    pool: String,
    state: Mutex<QueueState>,
    available: Condvar,
    running: Arc<Running>,
}

impl WorkQueue {
    fn new(pool: &str, running: Arc<Running>) -> Self {
        Self {
            pool: pool.to_string(),
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            running,
        }
    }

    fn push(&self, item: WorkItem, future: WorkFuture<Value>) -> bool {
        {
            let mut state = lock(&self.state);
            if state.stopping {
                return false;
            }
            state.items.push_back(Queued { item, future });
        }
        self.available.notify_one();
        true
    }

    /// Next item still worth running, assigned to worker `pid`, waiting up
    /// to `wait`. `None` on timeout, `Some(None)` once stopping.
    ///
    /// A worker already known to be dead gets nothing and the item stays
    /// queued.
    fn pop(&self, wait: Duration, pid: u32) -> Option<Option<WorkItem>> {
        let deadline = Instant::now() + wait;
        let mut state = lock(&self.state);
        loop {
            if state.stopping {
                return Some(None);
            }
            while let Some(queued) = state.items.pop_front() {
                if queued.future.is_done() {
                    continue;
                }
                if !self.running.start(pid, &queued.future) {
                    state.items.push_front(queued);
                    return None;
                }
                return Some(Some(queued.item));
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Refuse new items and cancel the queued ones. Returns how many were cancelled.
    fn stop(&self) -> usize {
        let queued = {
            let mut state = lock(&self.state);
            state.stopping = true;
            std::mem::take(&mut state.items)
        };
        self.available.notify_all();
        queued.into_iter().filter(|queued| queued.future.cancel()).count()
    }

    fn len(&self) -> usize {
        lock(&self.state).items.len()
    }
}

impl RemoteObject for WorkQueue {
    fn type_name(&self) -> &str {
        "WorkQueue"
    }

    fn invoke(
        &self,
        member: &str,
        args: Vec<Value>,
        _kwargs: Map<String, Value>,
    ) -> std::result::Result<Value, RemoteException> {
        match member {
            "get" => {
                let wait_ms = args.first().and_then(Value::as_u64).unwrap_or(0);
                let pid = args
                    .get(1)
                    .and_then(Value::as_u64)
                    .and_then(|pid| u32::try_from(pid).ok())
                    .ok_or_else(|| RemoteException::bad_arguments(member, "expected a worker pid"))?;
                match self.pop(Duration::from_millis(wait_ms), pid) {
                    None => Ok(Value::Null),
                    Some(None) => Ok(json!({ "stop": true })),
                    Some(Some(item)) => serde_json::to_value(item)
                        .map_err(|err| RemoteException::new("SerializationError", err.to_string())),
                }
            }
            "len" => Ok(Value::from(self.len())),
            _ => Err(RemoteException::no_member(self.type_name(), member)),
        }
    }

    fn get_attribute(&self, name: &str) -> std::result::Result<Value, RemoteException> {
        match name {
            "pool" => Ok(Value::from(self.pool.as_str())),
            _ => Err(RemoteException::new(
                "AttributeError",
                format!("'WorkQueue' has no attribute '{name}'"),
            )),
        }
    }
}

#[derive(Default)]
struct RunningState {
    by_pid: HashMap<u32, HashMap<u64, WorkFuture<Value>>>,
    dead: HashSet<u32>,
}

/// Futures handed to each worker process, from `get` until they settle.
#[derive(Default)]
struct Running {
    state: Mutex<RunningState>,
}

impl Running {
    /// Assign `future` to `pid`. False once `pid` has died.
    fn start(&self, pid: u32, future: &WorkFuture<Value>) -> bool {
        let mut state = lock(&self.state);
        if state.dead.contains(&pid) {
            return false;
        }
        state
            .by_pid
            .entry(pid)
            .or_default()
            .insert(future.id(), future.clone());
        true
    }

    fn finish(&self, pid: u32, future: &WorkFuture<Value>) {
        let mut state = lock(&self.state);
        if let Some(futures) = state.by_pid.get_mut(&pid) {
            futures.remove(&future.id());
            if futures.is_empty() {
                state.by_pid.remove(&pid);
            }
        }
    }

    /// Fail whatever was assigned to `pid`. Returns how many futures failed.
    fn worker_died(&self, pid: u32) -> usize {
        let futures = {
            let mut state = lock(&self.state);
            state.dead.insert(pid);
            state.by_pid.remove(&pid).unwrap_or_default()
        };
        futures
            .into_values()
            .filter(|future| future.complete(Err(worker_died_error(pid))))
            .count()
    }
}

fn worker_died_error(pid: u32) -> TaskError {
    TaskError::failed(
        "WorkerDied",
        format!("worker process {pid} exited while running the task"),
    )
}

/// Receives one work item's progress from whichever worker runs it.
struct Completion {
    task: String,
    future: WorkFuture<Value>,
    running: Arc<Running>,
    pid: Mutex<Option<u32>>,
}

impl Completion {
    fn settle(&self, result: std::result::Result<Value, TaskError>) -> bool {
        if let Some(pid) = *lock(&self.pid) {
            self.running.finish(pid, &self.future);
        }
        self.future.complete(result)
    }
}

impl RemoteObject for Completion {
    fn type_name(&self) -> &str {
        "Completion"
    }

    fn invoke(
        &self,
        member: &str,
        args: Vec<Value>,
        _kwargs: Map<String, Value>,
    ) -> std::result::Result<Value, RemoteException> {
        match member {
            "set_running" => {
                let pid = args
                    .first()
                    .and_then(Value::as_u64)
                    .and_then(|pid| u32::try_from(pid).ok())
                    .ok_or_else(|| RemoteException::bad_arguments(member, "expected a worker pid"))?;
                if !self.future.set_running() {
                    self.running.finish(pid, &self.future);
                    return Ok(Value::Bool(false));
                }
                *lock(&self.pid) = Some(pid);
                if !self.running.start(pid, &self.future) {
                    self.future.complete(Err(worker_died_error(pid)));
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(true))
            }
            "set_result" => {
                let value = args.into_iter().next().unwrap_or(Value::Null);
                Ok(Value::Bool(self.settle(Ok(value))))
            }
            "set_exception" => {
                let error = args
                    .into_iter()
                    .next()
                    .ok_or_else(|| RemoteException::bad_arguments(member, "expected an error"))?;
                let error: TaskError = serde_json::from_value(error)
                    .map_err(|err| RemoteException::bad_arguments(member, err))?;
                let pid = *lock(&self.pid);
                Ok(Value::Bool(self.settle(Err(remote_failure(error, &self.task, pid)))))
            }
            _ => Err(RemoteException::no_member(self.type_name(), member)),
        }
    }
}

/// Wrap a worker-side failure with the frame it crossed.
fn remote_failure(error: TaskError, task: &str, pid: Option<u32>) -> TaskError {
    let frame = match pid {
        Some(pid) => format!("in task '{task}' (worker pid {pid})"),
        None => format!("in task '{task}'"),
    };
    let exception = match error {
        TaskError::Cancelled => return TaskError::Cancelled,
        TaskError::Remote { exception } => exception,
        TaskError::Failed { kind, message } => RemoteException::new(kind, message),
        TaskError::Panicked { message } => RemoteException::new("Panic", message),
    };
    TaskError::Remote {
        exception: exception.with_frame(frame),
    }
}

struct Worker {
    pid: u32,
    child: Child,
    forwarders: Vec<JoinHandle<()>>,
}

struct Inner {
    config: ProcessPoolConfig,
    scope: Arc<Scope>,
    lifecycle: Lifecycle,
    slots: Arc<Slots>,
    inline: InlineSlot,
    queue: Arc<WorkQueue>,
    queue_ref: Mutex<Option<ObjectRef>>,
    running: Arc<Running>,
    workers: Mutex<Vec<Worker>>,
    first_failure: Mutex<Option<String>>,
}

/// Runs registry tasks in worker subprocesses.
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<Inner>,
}

impl ProcessPool {
    pub fn new(scope: Arc<Scope>, config: ProcessPoolConfig) -> Self {
        let running = Arc::new(Running::default());
        Self {
            inner: Arc::new(Inner {
                lifecycle: Lifecycle::new(&config.name),
                slots: Slots::new(config.max_workers),
                inline: InlineSlot::default(),
                queue: Arc::new(WorkQueue::new(&config.name, running.clone())),
                queue_ref: Mutex::new(None),
                running,
                workers: Mutex::new(Vec::new()),
                first_failure: Mutex::new(None),
                scope,
                config,
            }),
        }
    }

    pub fn config(&self) -> &ProcessPoolConfig {
        &self.inner.config
    }

    /// Ids of the live worker processes.
    pub fn worker_pids(&self) -> Vec<u32> {
        lock(&self.inner.workers).iter().map(|worker| worker.pid).collect()
    }

    /// Run `task` in a worker process with a snapshot of `context`.
    pub fn submit(&self, context: &Context, task: Task, block: bool) -> Result<WorkFuture<Value>> {
        let inner = &self.inner;
        inner.lifecycle.check_open()?;

        let future = WorkFuture::new(format!("{}:{}", inner.config.name, task.name));
        let task_context = context.child();

        if inner.config.max_workers == 0 {
            self.run_inline(task_context, task, &future);
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
                        debug!(pool = %inner.config.name, task = %task.name, "no free worker, running inline");
                        self.run_inline(task_context, task, &future);
                        drop(inline);
                        context.adopt(future.handle());
                        return Ok(future);
                    }
                    Overflow::Wait => {
                        if inner.scope.event_loop().is_loop_thread() || Handle::try_current().is_ok() {
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

        let completion = Arc::new(Completion {
            task: task.name.clone(),
            future: future.clone(),
            running: inner.running.clone(),
            pid: Mutex::new(None),
        });
        let service = inner.scope.service();
        let completion_ref = service.register(completion)?.reference().clone();

        let completion_id = completion_ref.object_id.clone();
        let release_service = service.clone();
        future.on_done(move || {
            drop(guard);
            release_service.unregister_id(&completion_id);
        });

        let item = WorkItem {
            settings: inner.config.settings.clone(),
            context: task_context.snapshot(),
            task,
            completion: completion_ref,
        };
        debug!(pool = %inner.config.name, task = %item.task.name, future = future.id(), "queued work item");
        if !inner.queue.push(item, future.clone()) {
            future.cancel();
            return Err(PoolError::ShutDown(inner.config.name.clone()));
        }

        context.adopt(future.handle());
        Ok(future)
    }

    fn run_inline(&self, mut context: Context, task: Task, future: &WorkFuture<Value>) {
        let registry = &self.inner.config.registry;
        context.set_framework("settings", self.inner.config.settings.clone());
        run_task(context, |ctx| registry.call(ctx, &task), future);
    }

    fn queue_ref(&self) -> Result<ObjectRef> {
        let mut queue_ref = lock(&self.inner.queue_ref);
        if let Some(reference) = queue_ref.as_ref() {
            return Ok(reference.clone());
        }
        let queue: Arc<dyn RemoteObject> = self.inner.queue.clone();
        let reference = self.inner.scope.service().register(queue)?.reference().clone();
        *queue_ref = Some(reference.clone());
        Ok(reference)
    }

    /// Start another worker if every live one may be busy.
    fn ensure_worker(&self) -> Result<()> {
        let inner = &self.inner;
        let mut workers = lock(&inner.workers);
        workers.retain_mut(|worker| match worker.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(worker.pid, status);
                false
            }
            _ => true,
        });
        let wanted = inner.slots.in_use().min(inner.config.max_workers);
        if workers.len() >= wanted {
            return Ok(());
        }
        let worker = self.spawn_worker()?;
        workers.push(worker);
        Ok(())
    }

    fn spawn_worker(&self) -> Result<Worker> {
        let inner = &self.inner;
        let queue = self.queue_ref()?;
        let address = inner.scope.address();

        let mut child = Command::new(&inner.config.worker_program)
            .args(&inner.config.worker_args)
            .arg("--host")
            .arg(address.ip().to_string())
            .arg("--port")
            .arg(address.port().to_string())
            .arg("--queue-id")
            .arg(&queue.object_id)
            .arg("--poll-ms")
            .arg(inner.config.poll_interval.as_millis().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id();

        let (ready_tx, ready_rx) = mpsc::channel();
        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let pool = self.clone();
            forwarders.push(
                thread::Builder::new()
                    .name(format!("{}-stdout-{pid}", inner.config.name))
                    .spawn(move || {
                        forward_lines(stdout, pid, "stdout", Some(ready_tx));
                        pool.worker_gone(pid);
                    })?,
            );
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(
                thread::Builder::new()
                    .name(format!("{}-stderr-{pid}", inner.config.name))
                    .spawn(move || forward_lines(stderr, pid, "stderr", None))?,
            );
        }

        if ready_rx.recv_timeout(inner.config.start_timeout).is_err() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PoolError::Worker(format!(
                "worker {pid} did not become ready within {:?}",
                inner.config.start_timeout
            )));
        }

        inner.scope.register_pid(pid);
        info!(pool = %inner.config.name, pid, "worker process ready");
        Ok(Worker {
            pid,
            child,
            forwarders,
        })
    }

    /// Called once a worker's stdout closes.
    fn worker_gone(&self, pid: u32) {
        self.inner.scope.unregister_pid(pid);
        let failed = self.inner.running.worker_died(pid);
        if failed > 0 {
            warn!(pool = %self.inner.config.name, pid, failed, "worker process exited with tasks in flight");
        } else {
            debug!(pool = %self.inner.config.name, pid, "worker process output closed");
        }
    }

    fn record_exit(&self, pid: u32, status: ExitStatus) {
        if status.success() {
            debug!(pool = %self.inner.config.name, pid, %status, "worker process exited");
            return;
        }
        warn!(pool = %self.inner.config.name, pid, %status, "worker process failed");
        let mut first_failure = lock(&self.inner.first_failure);
        if first_failure.is_none() {
            *first_failure = Some(format!("worker {pid} exited with {status}"));
        }
    }
}

/// Log each line of a child's output stream, watching for the ready line.
fn forward_lines(
    stream: impl Read,
    pid: u32,
    source: &'static str,
    mut ready: Option<mpsc::Sender<()>>,
) {
    for line in BufReader::new(stream).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                debug!(pid, source, error = %err, "worker output unreadable");
                break;
            }
        };
        if ready.is_some() && line.trim() == READY_SENTINEL {
            if let Some(ready) = ready.take() {
                let _ = ready.send(());
            }
            continue;
        }
        info!(target: OUTPUT_TARGET, pid, source, "{line}");
    }
}

impl Pool for ProcessPool {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn open(&self) -> Result<()> {
        if self.inner.scope.is_torn_down() {
            return Err(PoolError::ShutDown(self.inner.config.name.clone()));
        }
        self.inner.lifecycle.open()?;
        debug!(pool = %self.inner.config.name, max_workers = self.inner.config.max_workers, "process pool open");
        Ok(())
    }

    /// Queued items are cancelled; items already running finish first.
    fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        if !inner.lifecycle.begin_shutdown() {
            return Ok(());
        }
        let cancelled = inner.queue.stop();
        if cancelled > 0 {
            debug!(pool = %inner.config.name, cancelled, "cancelled queued work items");
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let workers = std::mem::take(&mut *lock(&inner.workers));
        let mut forwarders = Vec::new();
        for mut worker in workers {
            let status = loop {
                match worker.child.try_wait() {
                    Ok(Some(status)) => break Some(status),
                    Ok(None) if deadline.is_some_and(|deadline| Instant::now() >= deadline) => {
                        warn!(pool = %inner.config.name, pid = worker.pid, "killing worker after shutdown timeout");
                        let _ = worker.child.kill();
                        break worker.child.wait().ok();
                    }
                    Ok(None) => thread::sleep(Duration::from_millis(10)),
                    Err(err) => {
                        warn!(pool = %inner.config.name, pid = worker.pid, error = %err, "could not wait for worker");
                        break None;
                    }
                }
            };
            if let Some(status) = status {
                self.record_exit(worker.pid, status);
            }
            forwarders.append(&mut worker.forwarders);
        }
        for forwarder in forwarders {
            let _ = forwarder.join();
        }

        if let Some(reference) = lock(&inner.queue_ref).take() {
            inner.scope.service().unregister_id(&reference.object_id);
        }
        debug!(pool = %inner.config.name, "process pool shut down");

        match lock(&inner.first_failure).take() {
            Some(failure) => Err(PoolError::Worker(failure)),
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.inner.lifecycle.is_open()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::context::NodeRef;
    use crate::scope::ScopeConfig;

    fn item(name: &str) -> WorkItem {
        WorkItem {
            settings: Value::Null,
            context: ContextSnapshot::default(),
            task: Task::new(name),
            completion: ObjectRef {
                object_id: "c".into(),
                address: SocketAddr::from(([127, 0, 0, 1], 1)),
            },
        }
    }

    #[test]
    fn queue_skips_cancelled_items() {
        let queue = WorkQueue::new("q", Arc::default());
        let cancelled = WorkFuture::new("a");
        let live = WorkFuture::new("b");
        assert!(queue.push(item("a"), cancelled.clone()));
        assert!(queue.push(item("b"), live));
        cancelled.cancel();

        let next = queue.pop(Duration::from_millis(10), 1);
        assert_eq!(next.flatten().map(|item| item.task.name), Some("b".to_string()));
        assert!(queue.pop(Duration::from_millis(10), 1).is_none());
    }

    #[test]
    fn queue_stop_cancels_and_signals_workers() {
        let queue = WorkQueue::new("q", Arc::default());
        let future = WorkFuture::new("a");
        queue.push(item("a"), future.clone());

        assert_eq!(queue.stop(), 1);
        assert!(future.error().is_some_and(|err| err.is_cancelled()));
        assert!(!queue.push(item("late"), WorkFuture::new("late")));
        assert_eq!(
            queue.invoke("get", vec![json!(10), json!(1)], Map::new()).unwrap(),
            json!({"stop": true})
        );
        assert_eq!(queue.get_attribute("pool").unwrap(), json!("q"));
    }

    #[test]
    fn get_waits_for_a_push() {
        let queue = Arc::new(WorkQueue::new("q", Arc::default()));
        let pusher = queue.clone();
        let thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            pusher.push(item("late"), WorkFuture::new("late"));
        });
        let value = queue.invoke("get", vec![json!(2000), json!(1)], Map::new()).unwrap();
        let item: WorkItem = serde_json::from_value(value).unwrap();
        assert_eq!(item.task.name, "late");
        thread.join().unwrap();
    }

    fn completion(future: &WorkFuture<Value>, running: &Arc<Running>) -> Completion {
        Completion {
            task: "sum".into(),
            future: future.clone(),
            running: running.clone(),
            pid: Mutex::new(None),
        }
    }

    #[test]
    fn completion_reports_results_and_exceptions() {
        let running = Arc::new(Running::default());

        let ok = WorkFuture::new("ok");
        let target = completion(&ok, &running);
        assert_eq!(target.invoke("set_running", vec![json!(77)], Map::new()).unwrap(), json!(true));
        assert_eq!(target.invoke("set_result", vec![json!(5)], Map::new()).unwrap(), json!(true));
        assert_eq!(ok.try_result(), Some(Ok(json!(5))));

        let bad = WorkFuture::new("bad");
        let target = completion(&bad, &running);
        target.invoke("set_running", vec![json!(77)], Map::new()).unwrap();
        let error = serde_json::to_value(TaskError::failed("ValueError", "negative")).unwrap();
        target.invoke("set_exception", vec![error], Map::new()).unwrap();
        match bad.error() {
            Some(TaskError::Remote { exception }) => {
                assert_eq!(exception.kind, "ValueError");
                assert_eq!(exception.traceback, ["in task 'sum' (worker pid 77)"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(lock(&running.state).by_pid.is_empty());
    }

    #[test]
    fn cancelled_item_is_not_started() {
        let running = Arc::new(Running::default());
        let future = WorkFuture::<Value>::new("x");
        future.cancel();
        let target = completion(&future, &running);
        assert_eq!(target.invoke("set_running", vec![json!(1)], Map::new()).unwrap(), json!(false));
    }

    #[test]
    fn dead_worker_fails_its_tasks() {
        let running = Arc::new(Running::default());
        let future = WorkFuture::new("x");
        completion(&future, &running)
            .invoke("set_running", vec![json!(9)], Map::new())
            .unwrap();
        assert_eq!(running.worker_died(9), 1);
        assert_eq!(future.error().map(|err| err.kind().to_string()).as_deref(), Some("WorkerDied"));
        assert_eq!(running.worker_died(9), 0);
    }

    #[test]
    fn pulled_item_fails_if_its_worker_dies_before_starting() {
        let running = Arc::new(Running::default());
        let queue = WorkQueue::new("q", running.clone());
        let future = WorkFuture::new("a");
        queue.push(item("a"), future.clone());

        assert!(queue.pop(Duration::from_millis(10), 4).flatten().is_some());
        assert_eq!(running.worker_died(4), 1);
        assert_eq!(future.error().map(|err| err.kind().to_string()).as_deref(), Some("WorkerDied"));

        let target = completion(&future, &running);
        assert_eq!(target.invoke("set_running", vec![json!(4)], Map::new()).unwrap(), json!(false));
        assert!(lock(&running.state).by_pid.is_empty());
    }

    #[test]
    fn dead_worker_gets_no_items() {
        let running = Arc::new(Running::default());
        let queue = WorkQueue::new("q", running.clone());
        running.worker_died(4);
        let future = WorkFuture::new("a");
        queue.push(item("a"), future.clone());

        assert!(queue.pop(Duration::from_millis(10), 4).is_none());
        assert_eq!(queue.len(), 1);
        assert!(!future.is_done());
        assert!(queue.pop(Duration::from_millis(10), 5).flatten().is_some());
    }

    #[test]
    fn get_requires_a_worker_pid() {
        let queue = WorkQueue::new("q", Arc::default());
        let err = queue.invoke("get", vec![json!(0)], Map::new()).unwrap_err();
        assert_eq!(err.kind, "TypeError");
    }

    #[cfg(unix)]
    #[test]
    fn killed_worker_fails_the_item_it_pulled() {
        let scope = Scope::init(ScopeConfig::default().with_name("killed-scope")).unwrap();
        let script = format!("echo {READY_SENTINEL}; exec sleep 30");
        let pool = ProcessPool::new(
            scope.clone(),
            ProcessPoolConfig::new("/bin/sh")
                .with_worker_args(["-c", script.as_str(), "stand-in-worker"])
                .with_max_workers(1),
        );
        pool.open().unwrap();

        let future = pool.submit(&Context::root(), Task::new("echo"), true).unwrap();
        let pid = pool.worker_pids()[0];
        let pulled = pool
            .inner
            .queue
            .invoke("get", vec![json!(0), json!(pid)], Map::new())
            .unwrap();
        assert_eq!(pulled["task"]["name"], json!("echo"));

        lock(&pool.inner.workers)[0].child.kill().unwrap();
        assert!(future.wait_timeout(Duration::from_secs(3)));
        assert_eq!(future.error().map(|err| err.kind().to_string()).as_deref(), Some("WorkerDied"));

        assert!(matches!(pool.shutdown(Some(Duration::from_secs(1))), Err(PoolError::Worker(_))));
        scope.teardown(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn zero_workers_runs_inline_without_spawning() {
        let scope = Scope::init(ScopeConfig::default().with_name("inline-scope")).unwrap();
        let pool = ProcessPool::new(
            scope.clone(),
            ProcessPoolConfig::new("/nonexistent/parflow-worker")
                .with_max_workers(0)
                .with_settings(json!({"mode": "inline"})),
        );
        assert!(matches!(
            pool.submit(&Context::root(), Task::new("echo"), true),
            Err(PoolError::NotOpen(_))
        ));
        pool.open().unwrap();

        let ctx = Context::root().enter(NodeRef::new("case"));
        let future = pool
            .submit(&ctx, Task::new("sum").with_args(vec![json!(1), json!(2)]), true)
            .unwrap();
        assert_eq!(future.try_result(), Some(Ok(json!(3))));

        let seen = pool.submit(&ctx, Task::new("context"), true).unwrap().result().unwrap();
        assert_eq!(seen["framework"]["settings"], json!({"mode": "inline"}));
        assert_eq!(seen["current"]["name"], json!("case"));

        assert!(pool.worker_pids().is_empty());
        assert_eq!(ctx.children().len(), 2);
        pool.shutdown(None).unwrap();
        assert!(matches!(
            pool.submit(&ctx, Task::new("echo"), true),
            Err(PoolError::ShutDown(_))
        ));
        scope.teardown(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn missing_worker_program_is_an_io_error() {
        let scope = Scope::init(ScopeConfig::default().with_name("missing-scope")).unwrap();
        let pool = ProcessPool::new(
            scope.clone(),
            ProcessPoolConfig::new("/nonexistent/parflow-worker").with_max_workers(1),
        );
        pool.open().unwrap();
        let err = pool.submit(&Context::root(), Task::new("echo"), true).unwrap_err();
        assert!(matches!(err, PoolError::Io(_)));
        pool.shutdown(None).unwrap();
        scope.teardown(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn remote_failure_keeps_existing_traceback() {
        let inner = RemoteException::new("KeyError", "k").with_frame("in lookup");
        let wrapped = remote_failure(TaskError::from(inner), "t", None);
        let TaskError::Remote { exception } = wrapped else {
            panic!("expected a remote error");
        };
        assert_eq!(exception.traceback, ["in lookup", "in task 't'"]);
        assert_eq!(remote_failure(TaskError::Cancelled, "t", Some(1)), TaskError::Cancelled);
    }
}
