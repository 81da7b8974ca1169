//! A tokio runtime on its own thread, reachable from any OS thread.

use std::future::Future;
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{PoolError, Result};
use crate::future::lock;

/// Single-threaded event loop running on a dedicated thread.
#[derive(Debug)]
pub struct EventLoop {
    name: String,
    handle: Handle,
    thread_id: ThreadId,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let loop_name = name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let runtime = match Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(runtime.handle().clone()));
            runtime.block_on(async {
                let _ = stop_rx.await;
            });
            runtime.shutdown_timeout(Duration::from_millis(200));
            debug!(event_loop = %loop_name, "event loop stopped");
        })?;

        let handle = ready_rx
            .recv()
            .map_err(|_| PoolError::Worker(format!("event loop '{name}' exited during startup")))??;
        debug!(event_loop = %name, "event loop started");

        Ok(Self {
            thread_id: thread.thread().id(),
            name,
            handle,
            stop: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_running(&self) -> bool {
        lock(&self.stop).is_some()
    }

    /// Run `future` on the loop and block the calling thread for its output.
    ///
    /// Refused from inside any async runtime, the loop's own included.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_loop_thread() || Handle::try_current().is_ok() {
            return Err(PoolError::DeadlockHazard(self.name.clone()));
        }
        if !self.is_running() {
            return Err(PoolError::ShutDown(self.name.clone()));
        }
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.blocking_recv()
            .map_err(|_| PoolError::ShutDown(self.name.clone()))
    }

    /// Stop the loop and wait for its thread, at most `timeout` when given.
    pub fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        if self.is_loop_thread() {
            return Err(PoolError::DeadlockHazard(self.name.clone()));
        }
        if let Some(stop) = lock(&self.stop).take() {
            let _ = stop.send(());
        }
        let Some(thread) = lock(&self.thread).take() else {
            return Ok(());
        };

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while !thread.is_finished() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(event_loop = %self.name, "event loop thread still running after stop timeout");
                return Err(PoolError::Timeout(timeout.unwrap_or_default()));
            }
            thread::sleep(Duration::from_millis(5));
        }
        if thread.join().is_err() {
            return Err(PoolError::Worker(format!("event loop '{}' panicked", self.name)));
        }
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(stop) = lock(&self.stop).take() {
            let _ = stop.send(());
        }
    }
}
