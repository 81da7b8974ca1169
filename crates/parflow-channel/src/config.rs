//! Channel and connect configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parflow_frame::FrameConfig;

use crate::handshake::HandshakeConfig;
use crate::identity::Identity;

/// Delivery guarantee applied to every send on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Enqueue and forget.
    AtMostOnce,
    /// Track with a correlation id and resend until acknowledged.
    AtLeastOnce,
}

/// How sends without an explicit target pick their connection(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Next connection in rotation, skipping saturated ones.
    RoundRobin,
    /// Every current connection, best-effort per connection.
    Publish,
}

/// Resend policy for at-least-once delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time to wait for a reply before resending.
    pub interval: Duration,
    /// Total send attempts before the message is dropped.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

/// Channel behavior.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Local identity. A random one is generated when unset.
    pub identity: Option<Identity>,
    pub delivery: Delivery,
    pub distribution: Distribution,
    pub retry: RetryPolicy,
    /// Idle time after which an outbound link sends a heartbeat. Zero disables.
    pub heartbeat_interval: Duration,
    /// Silence after which an inbound link is considered dead. Zero disables.
    pub heartbeat_timeout: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// Capacity of the shared receive queue.
    pub recv_capacity: usize,
    /// How long a connection waits for room in the receive queue before
    /// dropping an inbound payload.
    pub deliver_timeout: Duration,
    /// Number of recently acknowledged correlation ids remembered for
    /// duplicate suppression.
    pub dedup_window: usize,
    pub frame: FrameConfig,
    pub handshake: HandshakeConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            identity: None,
            delivery: Delivery::AtMostOnce,
            distribution: Distribution::RoundRobin,
            retry: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
            outbound_capacity: 1024,
            recv_capacity: 4096,
            deliver_timeout: Duration::from_secs(1),
            dedup_window: 1024,
            frame: FrameConfig::default(),
            handshake: HandshakeConfig::default(),
        }
    }
}

impl ChannelConfig {
    pub fn with_identity(mut self, identity: impl Into<Identity>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn with_retry(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.retry = RetryPolicy {
            interval,
            max_attempts: max_attempts.max(1),
        };
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    pub fn with_recv_capacity(mut self, capacity: usize) -> Self {
        self.recv_capacity = capacity.max(1);
        self
    }

    pub fn with_deliver_timeout(mut self, timeout: Duration) -> Self {
        self.deliver_timeout = timeout;
        self
    }
}

/// Delay before reconnect attempt `n` (1-based).
pub type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Doubling delay starting at `initial`, capped at `max`.
pub fn exponential_backoff(initial: Duration, max: Duration) -> Backoff {
    Arc::new(move |attempt| {
        let shift = attempt.saturating_sub(1).min(16);
        initial.saturating_mul(1u32 << shift).min(max)
    })
}

/// The same delay before every attempt.
pub fn constant_backoff(delay: Duration) -> Backoff {
    Arc::new(move |_| delay)
}

/// Options for [`crate::MessageChannel::connect`].
#[derive(Clone)]
pub struct ConnectOptions {
    pub backoff: Backoff,
    /// Give-up deadline for non-permanent links.
    pub timeout: Duration,
    /// Retry forever and reconnect after every loss until the channel closes.
    pub permanent: bool,
    /// Fail (without retrying) if the peer presents a different identity.
    pub expected_identity: Option<Identity>,
    /// Bound on each individual TCP connect.
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            backoff: exponential_backoff(Duration::from_millis(100), Duration::from_secs(5)),
            timeout: Duration::from_secs(10),
            permanent: false,
            expected_identity: None,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl ConnectOptions {
    /// A link that is retried until the channel closes.
    pub fn permanent() -> Self {
        Self {
            permanent: true,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_expected_identity(mut self, identity: impl Into<Identity>) -> Self {
        self.expected_identity = Some(identity.into());
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("timeout", &self.timeout)
            .field("permanent", &self.permanent)
            .field("expected_identity", &self.expected_identity)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}
