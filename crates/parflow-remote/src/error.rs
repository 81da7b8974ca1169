use std::time::Duration;

use crate::object::RemoteException;

/// Errors from remote object operations.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("channel error: {0}")]
    Channel(#[from] parflow_channel::ChannelError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote member raised. Carries the remote stack.
    #[error("{0}")]
    Exception(RemoteException),

    /// No reply arrived within the call timeout.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The service was shut down while the call was outstanding.
    #[error("remote service closed")]
    ServiceClosed,

    /// Registration needs a bound service.
    #[error("service is not bound; objects can only be registered on a bound service")]
    NotServing,

    /// A blocking call was made from inside an async runtime.
    #[error("blocking remote call from inside an async runtime would deadlock; use the async call")]
    DeadlockHazard,

    /// The service was created outside a tokio runtime.
    #[error("remote services must be created inside a tokio runtime")]
    NoRuntime,
}

impl RemoteError {
    /// The remote exception, if this error carries one.
    pub fn exception(&self) -> Option<&RemoteException> {
        match self {
            RemoteError::Exception(exception) => Some(exception),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;
