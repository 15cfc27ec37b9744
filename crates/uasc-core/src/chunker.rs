//! Message → chunks.
//!
//! A [`MessageChunker`] belongs to one direction of one secure channel. It
//! owns the channel's sequence number generator and its current security
//! configuration, and runs a fresh [`ChunkManager`] for every message.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::chunk_manager::{ChunkHooks, ChunkLayout, ChunkManager};
use crate::crypto::{
    AsymmetricCrypto, CryptoError, DerivedKeys, MessageSecurityMode, SecurityPolicy,
    AES_BLOCK_SIZE,
};
use crate::error::ChannelError;
use crate::message::{encode_message, UaMessage};
use crate::sequence::SequenceNumberGenerator;
use crate::transport::ErrorMessage;
use crate::wire::{
    AsymmetricSecurityHeader, ChunkType, MessageHeader, MessageType, SecurityHeader,
    SequenceHeader, StatusCode, SymmetricSecurityHeader, DEFAULT_CHUNK_SIZE,
    MESSAGE_HEADER_SIZE, SECURE_MESSAGE_HEADER_SIZE, SEQUENCE_HEADER_SIZE,
};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Per-message parameters.
#[derive(Debug, Clone)]
pub struct ChunkingOptions {
    pub request_id: u32,
    pub secure_channel_id: u32,
    pub chunk_size: usize,
    /// Token id for MSG/CLO chunks.
    pub token_id: u32,
    /// Security header for OPN chunks. When absent one is built from the
    /// chunker's policy with no certificate.
    pub security_header: Option<AsymmetricSecurityHeader>,
    /// Zero means no limit.
    pub max_message_size: usize,
    /// Zero means no limit.
    pub max_chunk_count: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            request_id: 0,
            secure_channel_id: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            token_id: 0,
            security_header: None,
            max_message_size: 0,
            max_chunk_count: 0,
        }
    }
}

/// Security configuration shared by all messages a chunker sends.
#[derive(Clone)]
pub struct SecuritySettings {
    pub mode: MessageSecurityMode,
    pub policy: SecurityPolicy,
    /// Keys securing MSG/CLO chunks; required when `mode` signs.
    pub keys: Option<Arc<DerivedKeys>>,
    /// RSA operations for OPN chunks; required when `policy` is not None.
    pub asymmetric: Option<Arc<dyn AsymmetricCrypto>>,
}

impl SecuritySettings {
    pub fn none() -> Self {
        Self {
            mode: MessageSecurityMode::None,
            policy: SecurityPolicy::None,
            keys: None,
            asymmetric: None,
        }
    }

    pub fn symmetric(
        mode: MessageSecurityMode,
        policy: SecurityPolicy,
        keys: Arc<DerivedKeys>,
    ) -> Self {
        Self {
            mode,
            policy,
            keys: Some(keys),
            asymmetric: None,
        }
    }

    fn secured(&self) -> bool {
        self.mode.signs() && self.policy != SecurityPolicy::None
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for SecuritySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuritySettings")
            .field("mode", &self.mode)
            .field("policy", &self.policy)
            .field("keys", &self.keys.is_some())
            .field("asymmetric", &self.asymmetric.is_some())
            .finish()
    }
}

// ── Hooks ─────────────────────────────────────────────────────────────────────

enum Protection<'a> {
    Clear,
    Symmetric(&'a DerivedKeys),
    Asymmetric(&'a dyn AsymmetricCrypto),
}

struct SecureChunkHooks<'a> {
    message_type: MessageType,
    secure_channel_id: u32,
    request_id: u32,
    security_header: &'a SecurityHeader,
    sequence: &'a mut SequenceNumberGenerator,
    protection: Protection<'a>,
}

impl ChunkHooks for SecureChunkHooks<'_> {
    fn write_header(
        &mut self,
        header: &mut [u8],
        chunk_type: ChunkType,
        chunk_length: usize,
    ) -> Result<(), ChannelError> {
        let message_size = u32::try_from(chunk_length).map_err(|_| ChannelError::MessageTooLarge {
            size: chunk_length,
            limit: u32::MAX as usize,
        })?;
        MessageHeader {
            message_type: self.message_type,
            chunk_type,
            message_size,
        }
        .encode_into(header)?;
        header[MESSAGE_HEADER_SIZE..SECURE_MESSAGE_HEADER_SIZE]
            .copy_from_slice(&self.secure_channel_id.to_le_bytes());
        let mut rest = &mut header[SECURE_MESSAGE_HEADER_SIZE..];
        self.security_header.encode(&mut rest);
        Ok(())
    }

    fn write_sequence_header(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        SequenceHeader {
            sequence_number: self.sequence.next(),
            request_id: self.request_id,
        }
        .encode_into(buf)?;
        Ok(())
    }

    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, ChannelError> {
        match self.protection {
            Protection::Clear => Err(CryptoError::NotConfigured("signing").into()),
            Protection::Symmetric(keys) => Ok(keys.sign(data)?),
            Protection::Asymmetric(crypto) => Ok(crypto.sign(data)?),
        }
    }

    fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>, ChannelError> {
        match self.protection {
            Protection::Clear => Err(CryptoError::NotConfigured("encryption").into()),
            Protection::Symmetric(keys) => Ok(keys.encrypt(plain)?),
            Protection::Asymmetric(crypto) => Ok(crypto.encrypt(plain)?),
        }
    }
}

// ── Chunker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MessageChunker {
    sequence: SequenceNumberGenerator,
    security: SecuritySettings,
}

impl MessageChunker {
    pub fn new(security: SecuritySettings) -> Self {
        Self {
            sequence: SequenceNumberGenerator::new(),
            security,
        }
    }

    pub fn with_sequence(security: SecuritySettings, sequence: SequenceNumberGenerator) -> Self {
        Self { sequence, security }
    }

    /// Swap the security configuration. The sequence counter carries on.
    pub fn update(&mut self, security: SecuritySettings) {
        debug!(
            mode = ?security.mode,
            policy = %security.policy,
            "chunker security updated"
        );
        self.security = security;
    }

    pub fn security(&self) -> &SecuritySettings {
        &self.security
    }

    pub fn sequence(&self) -> &SequenceNumberGenerator {
        &self.sequence
    }

    /// Encode `message` and cut it into chunks. Returns the chunk count.
    pub fn chunk_message<M: UaMessage + ?Sized>(
        &mut self,
        message_type: MessageType,
        message: &M,
        options: &ChunkingOptions,
        sink: impl FnMut(Bytes),
    ) -> Result<usize, ChannelError> {
        let body = encode_message(message);
        self.chunk_encoded(message_type, &body, options, sink)
    }

    /// Cut an already encoded body (type id included) into chunks.
    pub fn chunk_encoded(
        &mut self,
        message_type: MessageType,
        body: &[u8],
        options: &ChunkingOptions,
        mut sink: impl FnMut(Bytes),
    ) -> Result<usize, ChannelError> {
        let security_header = self.security_header(message_type, options)?;
        let layout = self.layout(&security_header, options.chunk_size)?;
        check_limits(&layout, body.len(), options)?;

        let hooks = self.hooks(message_type, &security_header, options)?;
        let mut manager = ChunkManager::new(layout, hooks)?;
        let mut forward = |chunk: Bytes, _last: bool| sink(chunk);
        manager.write(body, &mut forward)?;
        manager.end(&mut forward)?;

        let count = manager.chunks_emitted();
        debug!(
            msg_type = %message_type,
            request_id = options.request_id,
            len = body.len(),
            chunks = count,
            "message chunked"
        );
        Ok(count)
    }

    /// Like [`chunk_encoded`](Self::chunk_encoded), delivering each chunk as
    /// `Some(chunk)` and finishing with `None`.
    pub fn chunk_to_channel(
        &mut self,
        message_type: MessageType,
        body: &[u8],
        options: &ChunkingOptions,
        tx: &UnboundedSender<Option<Bytes>>,
    ) -> Result<usize, ChannelError> {
        let mut closed = false;
        let count = self.chunk_encoded(message_type, body, options, |chunk| {
            closed |= tx.send(Some(chunk)).is_err();
        })?;
        if closed || tx.send(None).is_err() {
            return Err(ChannelError::SinkClosed);
        }
        Ok(count)
    }

    /// Send a single abort chunk telling the receiver to drop request
    /// `options.request_id`.
    pub fn abort_message(
        &mut self,
        message_type: MessageType,
        status: StatusCode,
        reason: &str,
        options: &ChunkingOptions,
        mut sink: impl FnMut(Bytes),
    ) -> Result<usize, ChannelError> {
        let mut body = BytesMut::new();
        ErrorMessage::new(status, reason).encode_body(&mut body);

        let security_header = self.security_header(message_type, options)?;
        let layout = self.layout(&security_header, options.chunk_size)?;
        let hooks = self.hooks(message_type, &security_header, options)?;
        let mut manager = ChunkManager::new(layout, hooks)?;
        let mut forward = |chunk: Bytes, _last: bool| sink(chunk);
        manager.write(&body, &mut forward)?;
        manager.abort(&mut forward)?;

        debug!(
            msg_type = %message_type,
            request_id = options.request_id,
            status = %status,
            "message aborted"
        );
        Ok(manager.chunks_emitted())
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn security_header(
        &self,
        message_type: MessageType,
        options: &ChunkingOptions,
    ) -> Result<SecurityHeader, ChannelError> {
        match message_type {
            MessageType::OpenSecureChannel => Ok(SecurityHeader::Asymmetric(
                options.security_header.clone().unwrap_or_else(|| {
                    AsymmetricSecurityHeader {
                        security_policy_uri: self.security.policy.uri(),
                        sender_certificate: None,
                        receiver_certificate_thumbprint: None,
                    }
                }),
            )),
            MessageType::Message | MessageType::CloseSecureChannel => {
                Ok(SecurityHeader::Symmetric(SymmetricSecurityHeader {
                    token_id: options.token_id,
                }))
            }
            other => Err(ChannelError::NotSecure(other)),
        }
    }

    fn asymmetric(&self) -> Result<&dyn AsymmetricCrypto, ChannelError> {
        self.security
            .asymmetric
            .as_deref()
            .ok_or(CryptoError::NotConfigured("asymmetric crypto").into())
    }

    fn keys(&self) -> Result<&DerivedKeys, ChannelError> {
        self.security
            .keys
            .as_deref()
            .ok_or(CryptoError::NotConfigured("symmetric keys").into())
    }

    fn layout(
        &self,
        security_header: &SecurityHeader,
        chunk_size: usize,
    ) -> Result<ChunkLayout, ChannelError> {
        let mut layout = ChunkLayout {
            chunk_size,
            header_size: SECURE_MESSAGE_HEADER_SIZE + security_header.encoded_len(),
            sequence_header_size: SEQUENCE_HEADER_SIZE,
            ..Default::default()
        };
        if !self.security.secured() {
            return Ok(layout);
        }
        match security_header {
            SecurityHeader::Asymmetric(header) => {
                let crypto = self.asymmetric()?;
                layout.signature_length = crypto.signature_length();
                if header.receiver_certificate_thumbprint.is_some() {
                    layout.plain_block_size = crypto.plain_block_size();
                    layout.cipher_block_size = crypto.cipher_block_size();
                }
            }
            SecurityHeader::Symmetric(_) => {
                let keys = self.keys()?;
                layout.signature_length = keys.signature_length();
                if self.security.mode.encrypts() {
                    layout.plain_block_size = AES_BLOCK_SIZE;
                    layout.cipher_block_size = AES_BLOCK_SIZE;
                }
            }
        }
        Ok(layout)
    }

    fn hooks<'a>(
        &'a mut self,
        message_type: MessageType,
        security_header: &'a SecurityHeader,
        options: &ChunkingOptions,
    ) -> Result<SecureChunkHooks<'a>, ChannelError> {
        let protection = if !self.security.secured() {
            Protection::Clear
        } else if message_type.uses_asymmetric_security() {
            Protection::Asymmetric(
                self.security
                    .asymmetric
                    .as_deref()
                    .ok_or(CryptoError::NotConfigured("asymmetric crypto"))?,
            )
        } else {
            Protection::Symmetric(
                self.security
                    .keys
                    .as_deref()
                    .ok_or(CryptoError::NotConfigured("symmetric keys"))?,
            )
        };
        Ok(SecureChunkHooks {
            message_type,
            secure_channel_id: options.secure_channel_id,
            request_id: options.request_id,
            security_header,
            sequence: &mut self.sequence,
            protection,
        })
    }
}

fn check_limits(
    layout: &ChunkLayout,
    body_len: usize,
    options: &ChunkingOptions,
) -> Result<(), ChannelError> {
    if options.max_message_size > 0 && body_len > options.max_message_size {
        return Err(ChannelError::MessageTooLarge {
            size: body_len,
            limit: options.max_message_size,
        });
    }
    let count = layout.chunk_count(body_len)?;
    if options.max_chunk_count > 0 && count > options.max_chunk_count {
        return Err(ChannelError::TooManyChunks {
            count,
            limit: options.max_chunk_count,
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
