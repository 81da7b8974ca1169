use std::time::Duration;

use parflow_remote::{RemoteError, RemoteException};
use serde::{Deserialize, Serialize};

/// Why a task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum TaskError {
    /// The task returned an error.
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },

    /// The task panicked.
    #[error("task panicked: {message}")]
    Panicked { message: String },

    /// The task was cancelled before it started.
    #[error("task cancelled")]
    Cancelled,

    /// The task failed in another process.
    #[error("{exception}")]
    Remote { exception: RemoteException },
}

impl TaskError {
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// An untyped failure.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::failed("Error", message)
    }

    pub fn kind(&self) -> &str {
        match self {
            TaskError::Failed { kind, .. } => kind,
            TaskError::Panicked { .. } => "Panic",
            TaskError::Cancelled => "Cancelled",
            TaskError::Remote { exception } => &exception.kind,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

impl From<RemoteException> for TaskError {
    fn from(exception: RemoteException) -> Self {
        TaskError::Remote { exception }
    }
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// Pool lifecycle and plumbing errors. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool '{0}' is not open")]
    NotOpen(String),

    #[error("pool '{0}' has been shut down")]
    ShutDown(String),

    /// Waiting for a slot from the thread that would free it.
    #[error("blocking submission to pool '{0}' from its own worker would deadlock")]
    DeadlockHazard(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A worker failed outside of any task.
    #[error("worker error: {0}")]
    Worker(String),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors from [`crate::join`].
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// The first failure among the joined futures.
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("join timed out after {0:?}")]
    Timeout(Duration),

    /// Blocking join from inside an async runtime; use `join_async`.
    #[error("blocking join inside an async runtime would deadlock; use join_async")]
    DeadlockHazard,
}
