//! Built-in frame kinds.
//!
//! Kinds 0-255 are reserved for built-in use.
//! Kinds 256-65535 are available for application-defined use.

/// Identity exchange before any application traffic.
pub const HANDSHAKE: u16 = 0;

/// Liveness signal sent by an idle outbound link. Empty payload.
pub const HEARTBEAT: u16 = 1;

/// Graceful end-of-stream signal. Empty payload.
pub const DISCONNECT: u16 = 2;

/// Headerless application payload, passed through untouched.
pub const DATA: u16 = 3;

/// Payload wrapped in a request/reply [`crate::Header`].
pub const ENVELOPE: u16 = 4;

/// First user-defined frame kind.
pub const USER_KIND_START: u16 = 256;

/// Returns a human-readable name for a frame kind.
pub fn kind_name(kind: u16) -> &'static str {
    match kind {
        HANDSHAKE => "HANDSHAKE",
        HEARTBEAT => "HEARTBEAT",
        DISCONNECT => "DISCONNECT",
        DATA => "DATA",
        ENVELOPE => "ENVELOPE",
        5..=255 => "RESERVED",
        _ => "USER",
    }
}

/// Returns true if the kind is in the reserved range.
pub fn is_reserved(kind: u16) -> bool {
    kind < USER_KIND_START
}
