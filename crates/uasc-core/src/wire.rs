//! UA Secure Conversation wire format.
//!
//! Every chunk on the wire starts with an 8-byte message header. Secure
//! message types (OPN, MSG, CLO) follow it with the secure channel id, a
//! security header, and an 8-byte sequence header. All multi-byte integers
//! are little-endian, as OPC-UA Part 6 mandates for the binary encoding.
//!
//! The two fixed-size headers are `#[repr(C)]` zerocopy structs; the
//! variable-length security headers are encoded with the helpers at the
//! bottom of this module. There is no unsafe code in this module.

use bytes::{Buf, BufMut, Bytes};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the message header shared by every message type.
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Message header plus the secure channel id carried by OPN/MSG/CLO.
pub const SECURE_MESSAGE_HEADER_SIZE: usize = 12;

/// Sequence number + request id.
pub const SEQUENCE_HEADER_SIZE: usize = 8;

/// Smallest receive/send buffer a peer may advertise.
pub const MIN_CHUNK_SIZE: usize = 8192;

/// Default chunk size when nothing was negotiated.
pub const DEFAULT_CHUNK_SIZE: usize = 65_535;

/// Protocol version sent in HEL/ACK.
pub const PROTOCOL_VERSION: u32 = 0;

/// Upper bound accepted for a String/ByteString length prefix.
pub const MAX_ENCODED_LENGTH: usize = 16 * 1024 * 1024;

// ── Message type ──────────────────────────────────────────────────────────────

/// The three-letter message type at the start of every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MessageType {
    Hello,
    Acknowledge,
    Error,
    OpenSecureChannel,
    CloseSecureChannel,
    Message,
}

impl MessageType {
    pub const fn tag(self) -> [u8; 3] {
        match self {
            MessageType::Hello => *b"HEL",
            MessageType::Acknowledge => *b"ACK",
            MessageType::Error => *b"ERR",
            MessageType::OpenSecureChannel => *b"OPN",
            MessageType::CloseSecureChannel => *b"CLO",
            MessageType::Message => *b"MSG",
        }
    }

    /// OPN, MSG and CLO carry a channel id, security header and sequence header.
    pub const fn is_secure(self) -> bool {
        matches!(
            self,
            MessageType::OpenSecureChannel | MessageType::CloseSecureChannel | MessageType::Message
        )
    }

    /// Only OPN is secured with the asymmetric algorithms.
    pub const fn uses_asymmetric_security(self) -> bool {
        matches!(self, MessageType::OpenSecureChannel)
    }
}

impl TryFrom<[u8; 3]> for MessageType {
    type Error = WireError;

    fn try_from(tag: [u8; 3]) -> Result<Self, WireError> {
        match &tag {
            b"HEL" => Ok(MessageType::Hello),
            b"ACK" => Ok(MessageType::Acknowledge),
            b"ERR" => Ok(MessageType::Error),
            b"OPN" => Ok(MessageType::OpenSecureChannel),
            b"CLO" => Ok(MessageType::CloseSecureChannel),
            b"MSG" => Ok(MessageType::Message),
            _ => Err(WireError::UnknownMessageType(tag)),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = self.tag();
        f.write_str(std::str::from_utf8(&tag).unwrap_or("???"))
    }
}

// ── Chunk type ────────────────────────────────────────────────────────────────

/// Fourth header byte: whether more chunks of the same message follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// `C`: more chunks follow.
    Intermediate = b'C',
    /// `F`: last chunk of the message.
    Final = b'F',
    /// `A`: sender abandoned the message; body carries a status code and reason.
    Abort = b'A',
}

impl TryFrom<u8> for ChunkType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            b'C' => Ok(ChunkType::Intermediate),
            b'F' => Ok(ChunkType::Final),
            b'A' => Ok(ChunkType::Abort),
            other => Err(WireError::UnknownChunkType(other)),
        }
    }
}

// ── Message header ────────────────────────────────────────────────────────────

/// On-wire layout of the message header.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct RawMessageHeader {
    message_type: [u8; 3],
    chunk_type: u8,
    /// Length of the whole chunk, this header included.
    message_size: U32<LittleEndian>,
}

assert_eq_size!(RawMessageHeader, [u8; MESSAGE_HEADER_SIZE]);

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub chunk_type: ChunkType,
    pub message_size: u32,
}

impl MessageHeader {
    /// Parse the first 8 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let raw = RawMessageHeader::read_from_prefix(buf).ok_or(WireError::Truncated {
            needed: MESSAGE_HEADER_SIZE,
            available: buf.len(),
        })?;
        let message_size = raw.message_size.get();
        if (message_size as usize) < MESSAGE_HEADER_SIZE {
            return Err(WireError::InvalidMessageSize(message_size));
        }
        Ok(Self {
            message_type: MessageType::try_from(raw.message_type)?,
            chunk_type: ChunkType::try_from(raw.chunk_type)?,
            message_size,
        })
    }

    fn raw(&self) -> RawMessageHeader {
        RawMessageHeader {
            message_type: self.message_type.tag(),
            chunk_type: self.chunk_type as u8,
            message_size: U32::new(self.message_size),
        }
    }

    /// Write the header into the first 8 bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), WireError> {
        let available = buf.len();
        self.raw().write_to_prefix(buf).ok_or(WireError::Truncated {
            needed: MESSAGE_HEADER_SIZE,
            available,
        })
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut out = [0u8; MESSAGE_HEADER_SIZE];
        out.copy_from_slice(self.raw().as_bytes());
        out
    }
}

// ── Sequence header ───────────────────────────────────────────────────────────

/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct RawSequenceHeader {
    sequence_number: U32<LittleEndian>,
    request_id: U32<LittleEndian>,
}

assert_eq_size!(RawSequenceHeader, [u8; SEQUENCE_HEADER_SIZE]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub sequence_number: u32,
    pub request_id: u32,
}

impl SequenceHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let raw = RawSequenceHeader::read_from_prefix(buf).ok_or(WireError::Truncated {
            needed: SEQUENCE_HEADER_SIZE,
            available: buf.len(),
        })?;
        Ok(Self {
            sequence_number: raw.sequence_number.get(),
            request_id: raw.request_id.get(),
        })
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), WireError> {
        let raw = RawSequenceHeader {
            sequence_number: U32::new(self.sequence_number),
            request_id: U32::new(self.request_id),
        };
        let available = buf.len();
        raw.write_to_prefix(buf).ok_or(WireError::Truncated {
            needed: SEQUENCE_HEADER_SIZE,
            available,
        })
    }
}

// ── Security headers ──────────────────────────────────────────────────────────

/// Security header of an OPN chunk.
///
/// The certificate travels in clear so the receiver can verify the
/// signature; a present thumbprint means the remainder of the chunk was
/// encrypted with the receiver's public key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsymmetricSecurityHeader {
    pub security_policy_uri: String,
    pub sender_certificate: Option<Bytes>,
    pub receiver_certificate_thumbprint: Option<Bytes>,
}

/// Security header of MSG and CLO chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymmetricSecurityHeader {
    pub token_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityHeader {
    Asymmetric(AsymmetricSecurityHeader),
    Symmetric(SymmetricSecurityHeader),
}

impl SecurityHeader {
    pub fn encoded_len(&self) -> usize {
        match self {
            SecurityHeader::Asymmetric(h) => {
                string_len(Some(h.security_policy_uri.as_str()))
                    + byte_string_len(h.sender_certificate.as_deref())
                    + byte_string_len(h.receiver_certificate_thumbprint.as_deref())
            }
            SecurityHeader::Symmetric(_) => 4,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            SecurityHeader::Asymmetric(h) => {
                write_string(buf, Some(&h.security_policy_uri));
                write_byte_string(buf, h.sender_certificate.as_deref());
                write_byte_string(buf, h.receiver_certificate_thumbprint.as_deref());
            }
            SecurityHeader::Symmetric(h) => buf.put_u32_le(h.token_id),
        }
    }

    /// Decode the variant dictated by `message_type`.
    pub fn decode(message_type: MessageType, buf: &mut &[u8]) -> Result<Self, WireError> {
        match message_type {
            MessageType::OpenSecureChannel => {
                Ok(SecurityHeader::Asymmetric(AsymmetricSecurityHeader {
                    security_policy_uri: read_string(buf)?.unwrap_or_default(),
                    sender_certificate: read_byte_string(buf)?,
                    receiver_certificate_thumbprint: read_byte_string(buf)?,
                }))
            }
            MessageType::Message | MessageType::CloseSecureChannel => {
                Ok(SecurityHeader::Symmetric(SymmetricSecurityHeader {
                    token_id: read_u32(buf)?,
                }))
            }
            other => Err(WireError::NoSecurityHeader(other)),
        }
    }

    pub fn token_id(&self) -> Option<u32> {
        match self {
            SecurityHeader::Symmetric(h) => Some(h.token_id),
            SecurityHeader::Asymmetric(_) => None,
        }
    }
}

// ── Status codes ──────────────────────────────────────────────────────────────

/// OPC-UA status code. Only the codes this layer produces are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    pub const BAD_INTERNAL_ERROR: StatusCode = StatusCode(0x8002_0000);
    pub const BAD_DECODING_ERROR: StatusCode = StatusCode(0x8007_0000);
    pub const BAD_ENCODING_LIMITS_EXCEEDED: StatusCode = StatusCode(0x8008_0000);
    pub const BAD_SECURITY_CHECKS_FAILED: StatusCode = StatusCode(0x8013_0000);
    pub const BAD_NOT_SUPPORTED: StatusCode = StatusCode(0x803D_0000);
    pub const BAD_SECURITY_POLICY_REJECTED: StatusCode = StatusCode(0x8055_0000);
    pub const BAD_TCP_MESSAGE_TYPE_INVALID: StatusCode = StatusCode(0x807E_0000);
    pub const BAD_TCP_SECURE_CHANNEL_UNKNOWN: StatusCode = StatusCode(0x807F_0000);
    pub const BAD_TCP_MESSAGE_TOO_LARGE: StatusCode = StatusCode(0x8080_0000);
    pub const BAD_TCP_INTERNAL_ERROR: StatusCode = StatusCode(0x8082_0000);
    pub const BAD_REQUEST_INTERRUPTED: StatusCode = StatusCode(0x8084_0000);
    pub const BAD_SECURE_CHANNEL_TOKEN_UNKNOWN: StatusCode = StatusCode(0x8087_0000);
    pub const BAD_SEQUENCE_NUMBER_INVALID: StatusCode = StatusCode(0x8088_0000);

    pub fn is_bad(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            StatusCode::GOOD => "Good",
            StatusCode::BAD_INTERNAL_ERROR => "BadInternalError",
            StatusCode::BAD_DECODING_ERROR => "BadDecodingError",
            StatusCode::BAD_ENCODING_LIMITS_EXCEEDED => "BadEncodingLimitsExceeded",
            StatusCode::BAD_SECURITY_CHECKS_FAILED => "BadSecurityChecksFailed",
            StatusCode::BAD_NOT_SUPPORTED => "BadNotSupported",
            StatusCode::BAD_SECURITY_POLICY_REJECTED => "BadSecurityPolicyRejected",
            StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID => "BadTcpMessageTypeInvalid",
            StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN => "BadTcpSecureChannelUnknown",
            StatusCode::BAD_TCP_MESSAGE_TOO_LARGE => "BadTcpMessageTooLarge",
            StatusCode::BAD_TCP_INTERNAL_ERROR => "BadTcpInternalError",
            StatusCode::BAD_REQUEST_INTERRUPTED => "BadRequestInterrupted",
            StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN => "BadSecureChannelTokenUnknown",
            StatusCode::BAD_SEQUENCE_NUMBER_INVALID => "BadSequenceNumberInvalid",
            _ => return None,
        })
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08X})", self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

// ── Primitive codec ───────────────────────────────────────────────────────────

fn ensure(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

pub fn read_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub fn read_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn read_i32(buf: &mut &[u8]) -> Result<i32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

/// Length-prefixed bytes; a negative length encodes null.
pub fn read_byte_string(buf: &mut &[u8]) -> Result<Option<Bytes>, WireError> {
    let len = read_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if len > MAX_ENCODED_LENGTH {
        return Err(WireError::LengthTooLarge(len));
    }
    ensure(buf, len)?;
    Ok(Some(buf.copy_to_bytes(len)))
}

pub fn read_string(buf: &mut &[u8]) -> Result<Option<String>, WireError> {
    match read_byte_string(buf)? {
        None => Ok(None),
        Some(raw) => String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| WireError::InvalidUtf8),
    }
}

pub fn write_byte_string(buf: &mut impl BufMut, value: Option<&[u8]>) {
    match value {
        None => buf.put_i32_le(-1),
        Some(v) => {
            buf.put_i32_le(v.len() as i32);
            buf.put_slice(v);
        }
    }
}

pub fn write_string(buf: &mut impl BufMut, value: Option<&str>) {
    write_byte_string(buf, value.map(str::as_bytes));
}

pub fn byte_string_len(value: Option<&[u8]>) -> usize {
    4 + value.map_or(0, <[u8]>::len)
}

pub fn string_len(value: Option<&str>) -> usize {
    byte_string_len(value.map(str::as_bytes))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("need {needed} bytes, only {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unknown message type {}", String::from_utf8_lossy(.0))]
    UnknownMessageType([u8; 3]),

    #[error("unknown chunk type byte: 0x{0:02x}")]
    UnknownChunkType(u8),

    #[error("message size {0} is smaller than the message header")]
    InvalidMessageSize(u32),

    #[error("header declares {declared} bytes but the chunk has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("{0} messages carry no security header")]
    NoSecurityHeader(MessageType),

    #[error("encoded length {0} exceeds the decoder limit")]
    LengthTooLarge(usize),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unsupported node id encoding: 0x{0:02x}")]
    UnsupportedNodeIdEncoding(u8),

    #[error("invalid encoding: {0}")]
    Invalid(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
