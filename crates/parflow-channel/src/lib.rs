//! Duplex message channel over TCP.
//!
//! A [`MessageChannel`] owns any number of peer connections: inbound ones
//! accepted after [`MessageChannel::bind`] and outbound ones established by
//! [`MessageChannel::connect`]. Payloads are opaque bytes. Delivery is
//! at-most-once or at-least-once (request/reply envelopes with retries),
//! and unaddressed sends are distributed round-robin or published to every
//! connection.

pub mod channel;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod listener;
pub mod pending;

pub use channel::{MessageChannel, Receipt, SendStatus};
pub use config::{
    constant_backoff, exponential_backoff, Backoff, ChannelConfig, ConnectOptions, Delivery,
    Distribution, RetryPolicy,
};
pub use connection::{ConnectionEnd, Role};
pub use error::{ChannelError, Result};
pub use handshake::{HandshakeConfig, HandshakeRequest, HandshakeResponse};
pub use identity::{new_correlation_id, Identity};
pub use pending::AckOutcome;
