//! Connection-level messages: HEL, ACK and ERR.
//!
//! These travel as single final chunks with no secure channel id, security
//! header or sequence header.

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::{
    read_string, read_u32, string_len, write_string, ChunkType, MessageHeader, MessageType,
    StatusCode, WireError, MESSAGE_HEADER_SIZE, PROTOCOL_VERSION,
};

/// Buffer limits one side proposes (HEL) or grants (ACK).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransportLimits {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    /// Zero means no limit.
    pub max_message_size: u32,
    /// Zero means no limit.
    pub max_chunk_count: u32,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: crate::wire::DEFAULT_CHUNK_SIZE as u32,
            send_buffer_size: crate::wire::DEFAULT_CHUNK_SIZE as u32,
            max_message_size: 0,
            max_chunk_count: 0,
        }
    }
}

impl TransportLimits {
    const ENCODED_LEN: usize = 20;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.receive_buffer_size);
        buf.put_u32_le(self.send_buffer_size);
        buf.put_u32_le(self.max_message_size);
        buf.put_u32_le(self.max_chunk_count);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            protocol_version: read_u32(buf)?,
            receive_buffer_size: read_u32(buf)?,
            send_buffer_size: read_u32(buf)?,
            max_message_size: read_u32(buf)?,
            max_chunk_count: read_u32(buf)?,
        })
    }

    /// Limits to use after a HEL/ACK exchange: the smaller of each buffer
    /// size, where zero on either side defers to the other.
    pub fn negotiate(&self, peer: &TransportLimits) -> TransportLimits {
        fn min_nonzero(a: u32, b: u32) -> u32 {
            match (a, b) {
                (0, x) | (x, 0) => x,
                (a, b) => a.min(b),
            }
        }
        TransportLimits {
            protocol_version: self.protocol_version.min(peer.protocol_version),
            receive_buffer_size: self.receive_buffer_size.min(peer.send_buffer_size),
            send_buffer_size: self.send_buffer_size.min(peer.receive_buffer_size),
            max_message_size: min_nonzero(self.max_message_size, peer.max_message_size),
            max_chunk_count: min_nonzero(self.max_chunk_count, peer.max_chunk_count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub limits: TransportLimits,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknowledgeMessage {
    pub limits: TransportLimits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub status: StatusCode,
    pub reason: Option<String>,
}

/// Either handshake message, as handed to the receiver's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Hello(HelloMessage),
    Acknowledge(AcknowledgeMessage),
}

// ── Framing ───────────────────────────────────────────────────────────────────

fn frame(message_type: MessageType, body_len: usize, body: impl FnOnce(&mut BytesMut)) -> Bytes {
    let total = MESSAGE_HEADER_SIZE + body_len;
    let header = MessageHeader {
        message_type,
        chunk_type: ChunkType::Final,
        message_size: total as u32,
    };
    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&header.to_bytes());
    body(&mut buf);
    debug_assert_eq!(buf.len(), total);
    buf.freeze()
}

/// Check the header and return the body slice.
fn unframe(chunk: &[u8], expected: MessageType) -> Result<&[u8], WireError> {
    let header = MessageHeader::decode(chunk)?;
    if header.message_type != expected {
        return Err(WireError::Invalid(format!(
            "expected {expected} message, got {}",
            header.message_type
        )));
    }
    if header.message_size as usize != chunk.len() {
        return Err(WireError::LengthMismatch {
            declared: header.message_size as usize,
            actual: chunk.len(),
        });
    }
    Ok(&chunk[MESSAGE_HEADER_SIZE..])
}

impl HelloMessage {
    pub fn encode(&self) -> Bytes {
        let len = TransportLimits::ENCODED_LEN + string_len(self.endpoint_url.as_deref());
        frame(MessageType::Hello, len, |buf| {
            self.limits.encode(buf);
            write_string(buf, self.endpoint_url.as_deref());
        })
    }

    pub fn decode(chunk: &[u8]) -> Result<Self, WireError> {
        let mut body = unframe(chunk, MessageType::Hello)?;
        Self::decode_body(&mut body)
    }

    pub(crate) fn decode_body(body: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            limits: TransportLimits::decode(body)?,
            endpoint_url: read_string(body)?,
        })
    }
}

impl AcknowledgeMessage {
    pub fn encode(&self) -> Bytes {
        frame(MessageType::Acknowledge, TransportLimits::ENCODED_LEN, |buf| {
            self.limits.encode(buf)
        })
    }

    pub fn decode(chunk: &[u8]) -> Result<Self, WireError> {
        let mut body = unframe(chunk, MessageType::Acknowledge)?;
        Self::decode_body(&mut body)
    }

    pub(crate) fn decode_body(body: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            limits: TransportLimits::decode(body)?,
        })
    }
}

impl ErrorMessage {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: Some(reason.into()),
        }
    }

    pub fn encode(&self) -> Bytes {
        let len = 4 + string_len(self.reason.as_deref());
        frame(MessageType::Error, len, |buf| {
            buf.put_u32_le(self.status.0);
            write_string(buf, self.reason.as_deref());
        })
    }

    pub fn decode(chunk: &[u8]) -> Result<Self, WireError> {
        let mut body = unframe(chunk, MessageType::Error)?;
        Self::decode_body(&mut body)
    }

    /// Status code followed by a reason string; shared with abort chunks.
    pub(crate) fn decode_body(body: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            status: StatusCode(read_u32(body)?),
            reason: read_string(body)?,
        })
    }

    pub(crate) fn encode_body(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.status.0);
        write_string(buf, self.reason.as_deref());
    }
}
