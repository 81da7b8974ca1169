use std::net::SocketAddr;
use std::time::Duration;

use crate::identity::Identity;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] parflow_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] parflow_frame::FrameError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Handshake failed locally.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The remote side refused the handshake.
    #[error("handshake rejected by peer: {0}")]
    HandshakeRejected(String),

    /// The peer presented a different identity than the one expected.
    #[error("identity mismatch (expected '{expected}', got '{actual}')")]
    IdentityMismatch { expected: Identity, actual: Identity },

    /// A connection with this identity already exists on the channel.
    #[error("duplicate identity '{0}'")]
    DuplicateIdentity(Identity),

    /// An operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A non-permanent connect gave up.
    #[error("could not connect to {addr} within {timeout:?}: {last_error}")]
    ConnectTimeout {
        addr: SocketAddr,
        timeout: Duration,
        last_error: String,
    },

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// The peer stayed silent for longer than the heartbeat timeout.
    #[error("no traffic from peer for {0:?}")]
    HeartbeatTimeout(Duration),

    /// No connection is available to carry the message.
    #[error("no connections available")]
    NoConnections,

    /// The addressed identity is not connected.
    #[error("identity '{0}' is not connected")]
    NotConnected(Identity),

    /// A tracked message was never acknowledged.
    #[error("message {0} was not acknowledged")]
    Undelivered(String),

    /// The channel is already listening.
    #[error("channel already bound to {0}")]
    AlreadyBound(SocketAddr),

    /// The channel has been closed.
    #[error("channel closed")]
    Closed,

    /// The channel was created outside a tokio runtime.
    #[error("message channels must be created inside a tokio runtime")]
    NoRuntime,
}

impl ChannelError {
    /// Errors that must not be retried by a reconnecting link.
    pub fn is_fatal_for_connect(&self) -> bool {
        matches!(self, ChannelError::IdentityMismatch { .. } | ChannelError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
