//! Completion handle shared by a task and everyone waiting on it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::context::Context;
use crate::error::{TaskError, TaskResult};

static NEXT_FUTURE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of a [`WorkFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Running,
    Done,
    Cancelled,
    Error,
}

impl FutureState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FutureState::Done | FutureState::Cancelled | FutureState::Error
        )
    }
}

enum Slot<T> {
    Pending,
    Running,
    Done(T),
    Error(TaskError),
    Cancelled,
}

impl<T> Slot<T> {
    fn state(&self) -> FutureState {
        match self {
            Slot::Pending => FutureState::Pending,
            Slot::Running => FutureState::Running,
            Slot::Done(_) => FutureState::Done,
            Slot::Error(_) => FutureState::Error,
            Slot::Cancelled => FutureState::Cancelled,
        }
    }
}

type Callback = Box<dyn FnOnce() + Send>;

struct State<T> {
    slot: Slot<T>,
    callbacks: Vec<Callback>,
}

struct Shared<T> {
    id: u64,
    name: String,
    state: Mutex<State<T>>,
    finished: Condvar,
    notify: Notify,
}

/// Result slot of one submitted task. Settles exactly once.
pub struct WorkFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for WorkFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkFuture")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> WorkFuture<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_FUTURE_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                state: Mutex::new(State {
                    slot: Slot::Pending,
                    callbacks: Vec::new(),
                }),
                finished: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> FutureState {
        lock(&self.shared.state).slot.state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Pending to running. False if the future was already cancelled or settled.
    pub fn set_running(&self) -> bool {
        let mut state = lock(&self.shared.state);
        match state.slot {
            Slot::Pending => {
                state.slot = Slot::Running;
                true
            }
            _ => false,
        }
    }

    /// Settle with `result`. Only the first settlement takes effect.
    pub fn complete(&self, result: TaskResult<T>) -> bool {
        self.settle(match result {
            Ok(value) => Slot::Done(value),
            Err(TaskError::Cancelled) => Slot::Cancelled,
            Err(err) => Slot::Error(err),
        })
    }

    /// Cancel a future that has not started running.
    pub fn cancel(&self) -> bool {
        self.settle_if(Slot::Cancelled, |slot| matches!(slot, Slot::Pending))
    }

    fn settle(&self, slot: Slot<T>) -> bool {
        self.settle_if(slot, |current| !current.state().is_terminal())
    }

    fn settle_if(&self, slot: Slot<T>, allowed: impl FnOnce(&Slot<T>) -> bool) -> bool {
        let callbacks = {
            let mut state = lock(&self.shared.state);
            if !allowed(&state.slot) {
                return false;
            }
            state.slot = slot;
            std::mem::take(&mut state.callbacks)
        };
        self.shared.finished.notify_all();
        self.shared.notify.notify_waiters();
        for callback in callbacks {
            callback();
        }
        true
    }

    /// Run `callback` once the future settles (immediately if it already has).
    pub fn on_done(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = lock(&self.shared.state);
            if !state.slot.state().is_terminal() {
                state.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Block until settled.
    pub fn wait(&self) {
        let mut state = lock(&self.shared.state);
        while !state.slot.state().is_terminal() {
            state = self
                .shared
                .finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until settled or `timeout` passes. Returns whether it settled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        while !state.slot.state().is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .finished
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Suspend until settled.
    pub async fn wait_async(&self) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }

    /// The failure, if the future settled with one.
    pub fn error(&self) -> Option<TaskError> {
        match &lock(&self.shared.state).slot {
            Slot::Error(err) => Some(err.clone()),
            Slot::Cancelled => Some(TaskError::Cancelled),
            _ => None,
        }
    }

    /// Type-erased handle for joins and context bookkeeping.
    pub fn handle(&self) -> Arc<dyn Joinable>
    where
        T: Send + 'static,
    {
        Arc::new(self.clone())
    }
}

impl<T: Clone> WorkFuture<T> {
    /// The outcome, if settled.
    pub fn try_result(&self) -> Option<TaskResult<T>> {
        match &lock(&self.shared.state).slot {
            Slot::Pending | Slot::Running => None,
            Slot::Done(value) => Some(Ok(value.clone())),
            Slot::Error(err) => Some(Err(err.clone())),
            Slot::Cancelled => Some(Err(TaskError::Cancelled)),
        }
    }

    /// Block until settled and return the outcome.
    pub fn result(&self) -> TaskResult<T> {
        self.wait();
        self.try_result().unwrap_or(Err(TaskError::Cancelled))
    }

    /// Suspend until settled and return the outcome.
    pub async fn result_async(&self) -> TaskResult<T> {
        self.wait_async().await;
        self.try_result().unwrap_or(Err(TaskError::Cancelled))
    }
}

/// What joins and contexts need from a future, independent of its value type.
pub trait Joinable: Send + Sync {
    fn id(&self) -> u64;
    fn name(&self) -> &str;
    fn state(&self) -> FutureState;
    fn error(&self) -> Option<TaskError>;
    fn cancel(&self) -> bool;
    fn on_done(&self, callback: Box<dyn FnOnce() + Send>);
}

impl<T: Send + 'static> Joinable for WorkFuture<T> {
    fn id(&self) -> u64 {
        WorkFuture::id(self)
    }

    fn name(&self) -> &str {
        WorkFuture::name(self)
    }

    fn state(&self) -> FutureState {
        WorkFuture::state(self)
    }

    fn error(&self) -> Option<TaskError> {
        WorkFuture::error(self)
    }

    fn cancel(&self) -> bool {
        WorkFuture::cancel(self)
    }

    fn on_done(&self, callback: Box<dyn FnOnce() + Send>) {
        WorkFuture::on_done(self, callback)
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}

/// Run `f` as the body of `future`, unless it was cancelled first.
pub(crate) fn run_task<T, F>(context: Context, f: F, future: &WorkFuture<T>)
where
    F: FnOnce(&Context) -> TaskResult<T>,
{
    if !future.set_running() {
        return;
    }
    let result = match catch_unwind(AssertUnwindSafe(|| f(&context))) {
        Ok(result) => result,
        Err(payload) => Err(TaskError::Panicked {
            message: panic_message(payload.as_ref()),
        }),
    };
    future.complete(result);
}
