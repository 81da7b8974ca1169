//! Request/reply envelopes.
//!
//! A message is either headerless (carried in a `DATA` frame and passed
//! through untouched) or wrapped in a [`Header`] inside an `ENVELOPE`
//! frame. The header is self-delimiting:
//!
//! ```text
//! ┌────────────┬──────────┬─────────────┬──────────┬──────────────┬─────────┐
//! │ "PFH1" (4B)│ type (1B)│ id len (2B) │ id bytes │ len (4B LE)  │ payload │
//! └────────────┴──────────┴─────────────┴──────────┴──────────────┴─────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::Frame;
use crate::error::{FrameError, Result};
use crate::kind::{DATA, ENVELOPE};

/// Magic prefix of an encoded header.
pub const HEADER_MAGIC: [u8; 4] = *b"PFH1";

const MAX_CORRELATION_ID_LEN: usize = 256;

/// Envelope type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    /// Payload that expects an acknowledging reply.
    Request,
    /// Acknowledgment for a request with the same correlation id.
    Reply,
}

impl HeaderType {
    fn as_byte(self) -> u8 {
        match self {
            HeaderType::Request => 1,
            HeaderType::Reply => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(HeaderType::Request),
            2 => Ok(HeaderType::Reply),
            other => Err(FrameError::MalformedHeader(format!(
                "unknown header type {other}"
            ))),
        }
    }
}

/// A request/reply envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub header_type: HeaderType,
    pub correlation_id: String,
    pub payload: Bytes,
}

impl Header {
    /// A request carrying `payload`.
    pub fn request(correlation_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            header_type: HeaderType::Request,
            correlation_id: correlation_id.into(),
            payload: payload.into(),
        }
    }

    /// An empty reply acknowledging `correlation_id`.
    pub fn reply(correlation_id: impl Into<String>) -> Self {
        Self {
            header_type: HeaderType::Reply,
            correlation_id: correlation_id.into(),
            payload: Bytes::new(),
        }
    }

    /// Encode into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let id = self.correlation_id.as_bytes();
        if id.is_empty() || id.len() > MAX_CORRELATION_ID_LEN {
            return Err(FrameError::MalformedHeader(format!(
                "invalid correlation id length: {}",
                id.len()
            )));
        }
        if self.payload.len() > u32::MAX as usize {
            return Err(FrameError::PayloadTooLarge {
                size: self.payload.len(),
                max: u32::MAX as usize,
            });
        }

        dst.reserve(HEADER_MAGIC.len() + 1 + 2 + id.len() + 4 + self.payload.len());
        dst.put_slice(&HEADER_MAGIC);
        dst.put_u8(self.header_type.as_byte());
        dst.put_u16_le(id.len() as u16);
        dst.put_slice(id);
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a complete header. Trailing bytes are rejected.
    pub fn decode(mut src: Bytes) -> Result<Self> {
        if src.len() < HEADER_MAGIC.len() || src[..HEADER_MAGIC.len()] != HEADER_MAGIC {
            return Err(FrameError::MalformedHeader("missing header magic".to_string()));
        }
        src.advance(HEADER_MAGIC.len());

        need(&src, 1 + 2, "type and id length")?;
        let header_type = HeaderType::from_byte(src.get_u8())?;
        let id_len = src.get_u16_le() as usize;
        if id_len == 0 || id_len > MAX_CORRELATION_ID_LEN {
            return Err(FrameError::MalformedHeader(format!(
                "invalid correlation id length: {id_len}"
            )));
        }

        need(&src, id_len, "correlation id")?;
        let id = src.split_to(id_len);
        let correlation_id = std::str::from_utf8(&id)
            .map_err(|_| FrameError::MalformedHeader("correlation id is not utf-8".to_string()))?
            .to_string();

        need(&src, 4, "payload length")?;
        let payload_len = src.get_u32_le() as usize;
        need(&src, payload_len, "payload")?;
        let payload = src.split_to(payload_len);

        if !src.is_empty() {
            return Err(FrameError::MalformedHeader(format!(
                "{} trailing bytes after payload",
                src.len()
            )));
        }

        Ok(Self {
            header_type,
            correlation_id,
            payload,
        })
    }
}

fn need(src: &Bytes, len: usize, what: &str) -> Result<()> {
    if src.len() < len {
        return Err(FrameError::MalformedHeader(format!("truncated {what}")));
    }
    Ok(())
}

/// An application-level message as seen by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Headerless payload, delivered without acknowledgment.
    Plain(Bytes),
    /// Payload that must be acknowledged with a [`Message::Reply`].
    Request { correlation_id: String, payload: Bytes },
    /// Acknowledgment of a request.
    Reply { correlation_id: String },
}

impl Message {
    /// Build the frame carrying this message.
    pub fn into_frame(self) -> Result<Frame> {
        match self {
            Message::Plain(payload) => Ok(Frame::new(DATA, payload)),
            Message::Request {
                correlation_id,
                payload,
            } => Ok(Frame::new(
                ENVELOPE,
                Header::request(correlation_id, payload).to_bytes()?,
            )),
            Message::Reply { correlation_id } => {
                Ok(Frame::new(ENVELOPE, Header::reply(correlation_id).to_bytes()?))
            }
        }
    }

    /// Interpret an application frame. Control frames are rejected.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        match frame.kind {
            DATA => Ok(Message::Plain(frame.payload)),
            ENVELOPE => {
                let header = Header::decode(frame.payload)?;
                Ok(match header.header_type {
                    HeaderType::Request => Message::Request {
                        correlation_id: header.correlation_id,
                        payload: header.payload,
                    },
                    HeaderType::Reply => Message::Reply {
                        correlation_id: header.correlation_id,
                    },
                })
            }
            other => Err(FrameError::UnexpectedKind(other)),
        }
    }
}
