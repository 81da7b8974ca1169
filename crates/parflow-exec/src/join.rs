//! Waiting on groups of futures.

use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::debug;

use crate::context::Context;
use crate::error::{JoinError, TaskError};
use crate::future::Joinable;

/// How [`join`] behaves.
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Wait for every future even after one fails.
    pub all: bool,
    /// Cancel futures that have not started once the join gives up.
    pub cancel_pending: bool,
    /// Overall bound on the wait.
    pub timeout: Option<Duration>,
}

impl JoinOptions {
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn with_cancel_pending(mut self) -> Self {
        self.cancel_pending = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn cancel_unsettled(futures: &[Arc<dyn Joinable>]) {
    for future in futures {
        if future.cancel() {
            debug!(future = future.name(), "cancelled by join");
        }
    }
}

/// Tracks completions in the order they happen.
struct Progress<'a> {
    futures: &'a [Arc<dyn Joinable>],
    options: &'a JoinOptions,
    remaining: usize,
    first_error: Option<TaskError>,
}

impl<'a> Progress<'a> {
    fn new(futures: &'a [Arc<dyn Joinable>], options: &'a JoinOptions) -> Self {
        Self {
            futures,
            options,
            remaining: futures.len(),
            first_error: None,
        }
    }

    /// Record that future `index` settled. Returns true when the join is over.
    fn settled(&mut self, index: usize) -> bool {
        self.remaining -= 1;
        if let Some(err) = self.futures[index].error() {
            if self.first_error.is_none() {
                self.first_error = Some(err);
            }
            if !self.options.all {
                return true;
            }
        }
        self.remaining == 0
    }

    fn finish(self) -> Result<(), JoinError> {
        match self.first_error {
            Some(err) => {
                if self.options.cancel_pending {
                    cancel_unsettled(self.futures);
                }
                Err(JoinError::Task(err))
            }
            None => Ok(()),
        }
    }

    fn timed_out(self, timeout: Duration) -> JoinError {
        if self.options.cancel_pending {
            cancel_unsettled(self.futures);
        }
        JoinError::Timeout(timeout)
    }
}

/// Block until the futures settle and return the first failure, if any.
///
/// Without `all`, returns as soon as one future fails. Must not be called
/// from inside an async runtime; use [`join_async`] there.
pub fn join(futures: &[Arc<dyn Joinable>], options: &JoinOptions) -> Result<(), JoinError> {
    if Handle::try_current().is_ok() {
        return Err(JoinError::DeadlockHazard);
    }
    if futures.is_empty() {
        return Ok(());
    }

    let (tx, rx) = mpsc::channel();
    for (index, future) in futures.iter().enumerate() {
        let tx = tx.clone();
        future.on_done(Box::new(move || {
            let _ = tx.send(index);
        }));
    }
    drop(tx);

    let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
    let mut progress = Progress::new(futures, options);
    loop {
        let index = match deadline {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(index) => index,
                    Err(_) => return Err(progress.timed_out(options.timeout.unwrap_or(wait))),
                }
            }
            None => match rx.recv() {
                Ok(index) => index,
                Err(_) => break,
            },
        };
        if progress.settled(index) {
            break;
        }
    }
    progress.finish()
}

/// Suspend until the futures settle. Same semantics as [`join`].
pub async fn join_async(
    futures: &[Arc<dyn Joinable>],
    options: &JoinOptions,
) -> Result<(), JoinError> {
    if futures.is_empty() {
        return Ok(());
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for (index, future) in futures.iter().enumerate() {
        let tx = tx.clone();
        future.on_done(Box::new(move || {
            let _ = tx.send(index);
        }));
    }
    drop(tx);

    let mut progress = Progress::new(futures, options);
    let wait = async {
        while let Some(index) = rx.recv().await {
            if progress.settled(index) {
                break;
            }
        }
    };
    match options.timeout {
        Some(timeout) => {
            if tokio::time::timeout(timeout, wait).await.is_err() {
                return Err(progress.timed_out(timeout));
            }
        }
        None => wait.await,
    }
    progress.finish()
}

/// [`join`] over the futures submitted from `context`.
pub fn join_children(context: &Context, options: &JoinOptions) -> Result<(), JoinError> {
    join(&context.children(), options)
}

/// [`join_async`] over the futures submitted from `context`.
pub async fn join_children_async(context: &Context, options: &JoinOptions) -> Result<(), JoinError> {
    join_async(&context.children(), options).await
}
