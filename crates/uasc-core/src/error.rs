//! Channel-level error taxonomy.
//!
//! Every variant maps onto the OPC-UA status code a peer would see in an
//! ERR message or abort chunk.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::node_id::ExpandedNodeId;
use crate::wire::{MessageType, StatusCode, WireError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("malformed header: {0}")]
    MalformedHeader(WireError),

    #[error("unsupported security policy: {0}")]
    UnsupportedSecurityPolicy(String),

    #[error("decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("invalid signature on {0} chunk")]
    SignatureInvalid(MessageType),

    #[error("unknown security token {0}")]
    UnknownSecurityToken(u32),

    #[error("security token {0} has expired")]
    ExpiredSecurityToken(u32),

    #[error("sequence number gap: expected {expected}, got {actual}")]
    SequenceNumberGap { expected: u32, actual: u32 },

    #[error("unknown message type {0}")]
    UnknownMessageType(String),

    #[error("decoding failed: {0}")]
    Decoding(WireError),

    #[error("no constructor registered for {0}")]
    NoConstructor(ExpandedNodeId),

    #[error("remote error {status}: {reason}")]
    RemoteError { status: StatusCode, reason: String },

    #[error("message aborted by sender: {status}: {reason}")]
    Aborted { status: StatusCode, reason: String },

    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("message needs {count} chunks, limit is {limit}")]
    TooManyChunks { count: usize, limit: usize },

    #[error("secure channel id {actual} does not match {expected}")]
    ChannelIdMismatch { expected: u32, actual: u32 },

    #[error("request id {actual} in the middle of request {expected}")]
    RequestIdMismatch { expected: u32, actual: u32 },

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid chunk layout: {0}")]
    InvalidLayout(String),

    #[error("{0} is not a secure message type")]
    NotSecure(MessageType),

    #[error("chunk receiver closed")]
    SinkClosed,
}

impl ChannelError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChannelError::MalformedHeader(_) => StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
            ChannelError::UnsupportedSecurityPolicy(_) => StatusCode::BAD_SECURITY_POLICY_REJECTED,
            ChannelError::DecryptionFailure(_) | ChannelError::SignatureInvalid(_) => {
                StatusCode::BAD_SECURITY_CHECKS_FAILED
            }
            ChannelError::UnknownSecurityToken(_) | ChannelError::ExpiredSecurityToken(_) => {
                StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN
            }
            ChannelError::SequenceNumberGap { .. } => StatusCode::BAD_SEQUENCE_NUMBER_INVALID,
            ChannelError::UnknownMessageType(_) => StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
            ChannelError::Decoding(_) | ChannelError::NoConstructor(_) => {
                StatusCode::BAD_DECODING_ERROR
            }
            ChannelError::RemoteError { status, .. } | ChannelError::Aborted { status, .. } => {
                *status
            }
            ChannelError::MessageTooLarge { .. } | ChannelError::TooManyChunks { .. } => {
                StatusCode::BAD_TCP_MESSAGE_TOO_LARGE
            }
            ChannelError::ChannelIdMismatch { .. } => StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN,
            ChannelError::RequestIdMismatch { .. } => StatusCode::BAD_TCP_INTERNAL_ERROR,
            ChannelError::Crypto(_) => StatusCode::BAD_SECURITY_CHECKS_FAILED,
            ChannelError::InvalidLayout(_) | ChannelError::SinkClosed => {
                StatusCode::BAD_INTERNAL_ERROR
            }
            ChannelError::NotSecure(_) => StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
        }
    }
}

impl From<WireError> for ChannelError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::UnknownMessageType(tag) => {
                ChannelError::UnknownMessageType(String::from_utf8_lossy(&tag).into_owned())
            }
            WireError::UnknownChunkType(_)
            | WireError::InvalidMessageSize(_)
            | WireError::LengthMismatch { .. } => ChannelError::MalformedHeader(e),
            other => ChannelError::Decoding(other),
        }
    }
}
