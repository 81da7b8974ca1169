//! Length-prefixed framing and the request/reply Header Protocol.
//!
//! Every message on a parflow stream is framed with:
//! - A 2-byte magic number ("PF") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian frame kind
//!
//! Frame kinds separate connection control (handshake, heartbeat,
//! disconnect) from application payloads, and headerless payloads from
//! [`Header`] envelopes that carry a correlation id.

pub mod codec;
pub mod error;
pub mod header;
pub mod kind;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameCodec, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use header::{Header, HeaderType, Message, HEADER_MAGIC};
pub use kind::{DATA, DISCONNECT, ENVELOPE, HANDSHAKE, HEARTBEAT, USER_KIND_START};
