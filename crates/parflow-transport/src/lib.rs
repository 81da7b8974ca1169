//! TCP stream transport.
//!
//! This is the lowest layer of parflow. Message channels bind and connect
//! through the [`Listener`] and [`connect`] helpers provided here; every
//! stream handed upward has Nagle's algorithm disabled.

pub mod error;
pub mod tcp;

pub use error::{Result, TransportError};
pub use tcp::{connect, resolve, Listener};
