//! Chunks → messages.
//!
//! A [`MessageBuilder`] is fed raw chunks in arrival order. For every chunk
//! it parses the headers, resolves the security configuration, decrypts and
//! verifies, checks sequence continuity and appends the body. When the
//! final chunk of a message arrives the body is decoded through an
//! [`ObjectFactory`] and handed to a [`MessageHandler`].
//!
//! Nothing is returned across the chunk boundary: every outcome, good or
//! bad, goes to the handler. After any failure the builder is back in
//! [`BuilderState::Idle`] with no partial body, and the rest of the failed
//! message is dropped as it arrives.

use std::borrow::Cow;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::crypto::{
    AsymmetricCrypto, CryptoError, DerivedKeys, MessageSecurityMode, SecurityPolicy,
    RSA_SIGNATURE_LENGTHS,
};
use crate::error::ChannelError;
use crate::message::ObjectFactory;
use crate::node_id::ExpandedNodeId;
use crate::sequence::{is_successor, FIRST_SEQUENCE_NUMBER, MAX_SEQUENCE_NUMBER};
use crate::token::{SecurityToken, TokenStack};
use crate::transport::{AcknowledgeMessage, ErrorMessage, HelloMessage, TransportMessage};
use crate::wire::{
    read_u32, AsymmetricSecurityHeader, ChunkType, MessageHeader, MessageType, SecurityHeader,
    SequenceHeader, WireError, MESSAGE_HEADER_SIZE, SEQUENCE_HEADER_SIZE,
};

// ── Public types ──────────────────────────────────────────────────────────────

/// Where the builder is within the current chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    Idle,
    HeaderRead,
    SecurityResolved,
    Decrypted,
    SequenceValidated,
    BodyAccumulating,
    Dispatched,
}

/// What to do when a sequence number is not the expected successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceGapPolicy {
    /// Report through the handler and keep going.
    #[default]
    Notify,
    /// Report, then fail the chunk.
    Reject,
}

#[derive(Debug, Clone, Default)]
pub struct BuilderOptions {
    /// Largest reassembled body accepted. Zero means no limit.
    pub max_message_size: usize,
    /// Most chunks one message may span. Zero means no limit.
    pub max_chunk_count: usize,
    /// Reject chunks for any other secure channel.
    pub expected_channel_id: Option<u32>,
    pub sequence_gap_policy: SequenceGapPolicy,
}

/// A fully reassembled and decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage<T> {
    pub message_type: MessageType,
    pub request_id: u32,
    pub secure_channel_id: u32,
    /// Security header of the first chunk.
    pub security_header: SecurityHeader,
    pub chunk_count: usize,
    pub object: T,
}

/// Receives everything the builder produces.
pub trait MessageHandler<T> {
    fn on_message(&mut self, message: DecodedMessage<T>);

    /// `request_id` is known once the sequence header has been read.
    fn on_error(&mut self, error: ChannelError, request_id: Option<u32>);

    fn on_invalid_sequence_number(&mut self, _expected: u32, _actual: u32) {}

    /// A chunk used a newer token and the older ones were dropped.
    fn on_new_token(&mut self, _token_id: u32) {}

    fn on_transport_message(&mut self, _message: TransportMessage) {}

    /// Raw chunk, called after the message header checked out.
    fn on_chunk(&mut self, _chunk: &[u8]) {}
}

/// Handler output captured as values.
#[derive(Debug, Clone, PartialEq)]
pub enum BuilderEvent<T> {
    Message(DecodedMessage<T>),
    Error {
        error: ChannelError,
        request_id: Option<u32>,
    },
    InvalidSequenceNumber {
        expected: u32,
        actual: u32,
    },
    NewToken(u32),
    Transport(TransportMessage),
}

impl<T> MessageHandler<T> for Vec<BuilderEvent<T>> {
    fn on_message(&mut self, message: DecodedMessage<T>) {
        self.push(BuilderEvent::Message(message));
    }

    fn on_error(&mut self, error: ChannelError, request_id: Option<u32>) {
        self.push(BuilderEvent::Error { error, request_id });
    }

    fn on_invalid_sequence_number(&mut self, expected: u32, actual: u32) {
        self.push(BuilderEvent::InvalidSequenceNumber { expected, actual });
    }

    fn on_new_token(&mut self, token_id: u32) {
        self.push(BuilderEvent::NewToken(token_id));
    }

    fn on_transport_message(&mut self, message: TransportMessage) {
        self.push(BuilderEvent::Transport(message));
    }
}

// ── Internal state ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PartialMessage {
    message_type: MessageType,
    request_id: u32,
    secure_channel_id: u32,
    security_header: SecurityHeader,
    body: BytesMut,
    chunks: usize,
}

/// Leftovers of a failed message still to be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discard {
    Request(u32),
    /// The failure happened before the request id could be read.
    UntilFinal,
}

/// What is known about the chunk being processed, for error reporting.
#[derive(Debug, Default)]
struct ChunkContext {
    chunk_type: Option<ChunkType>,
    request_id: Option<u32>,
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct MessageBuilder<F> {
    factory: F,
    options: BuilderOptions,
    /// `None` until configured; unknown mode still runs OPN crypto.
    mode: Option<MessageSecurityMode>,
    policy: Option<SecurityPolicy>,
    asymmetric: Option<Arc<dyn AsymmetricCrypto>>,
    tokens: TokenStack,
    state: BuilderState,
    previous_sequence: Option<u32>,
    current: Option<PartialMessage>,
    discard: Option<Discard>,
}

impl<F: std::fmt::Debug> std::fmt::Debug for MessageBuilder<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuilder")
            .field("factory", &self.factory)
            .field("mode", &self.mode)
            .field("policy", &self.policy)
            .field("tokens", &self.tokens.token_ids())
            .field("state", &self.state)
            .field("previous_sequence", &self.previous_sequence)
            .finish_non_exhaustive()
    }
}

impl<F: ObjectFactory> MessageBuilder<F> {
    pub fn new(factory: F, options: BuilderOptions) -> Self {
        Self {
            factory,
            options,
            mode: None,
            policy: None,
            asymmetric: None,
            tokens: TokenStack::new(),
            state: BuilderState::Idle,
            previous_sequence: None,
            current: None,
            discard: None,
        }
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    pub fn security_mode(&self) -> Option<MessageSecurityMode> {
        self.mode
    }

    pub fn security_policy(&self) -> Option<SecurityPolicy> {
        self.policy
    }

    pub fn tokens(&self) -> &TokenStack {
        &self.tokens
    }

    /// Switch security configuration. Tokens and sequence tracking survive.
    pub fn set_security(&mut self, mode: MessageSecurityMode, policy: SecurityPolicy) {
        debug!(mode = ?mode, policy = %policy, "builder security updated");
        self.mode = Some(mode);
        self.policy = Some(policy);
    }

    pub fn set_asymmetric_crypto(&mut self, crypto: Arc<dyn AsymmetricCrypto>) {
        self.asymmetric = Some(crypto);
    }

    /// Register the token issued by the latest OPN exchange.
    pub fn push_new_token(&mut self, token: SecurityToken, keys: DerivedKeys) {
        debug!(token_id = token.token_id, channel_id = token.channel_id, "token registered");
        self.tokens.push(token, keys);
    }

    pub fn expire_token(&mut self, token_id: u32) -> bool {
        self.tokens.expire(token_id)
    }

    /// Drop any partial message and forget the last sequence number.
    pub fn reset(&mut self) {
        self.current = None;
        self.discard = None;
        self.previous_sequence = None;
        self.state = BuilderState::Idle;
    }

    pub fn push_chunks<'a>(
        &mut self,
        chunks: impl IntoIterator<Item = &'a [u8]>,
        handler: &mut impl MessageHandler<F::Object>,
    ) {
        for chunk in chunks {
            self.push_chunk(chunk, handler);
        }
    }

    /// Process one complete chunk.
    pub fn push_chunk(&mut self, chunk: &[u8], handler: &mut impl MessageHandler<F::Object>) {
        let mut ctx = ChunkContext::default();
        if let Err(error) = self.process(chunk, &mut ctx, handler) {
            self.fail(error, ctx, handler);
        }
    }

    fn fail(
        &mut self,
        error: ChannelError,
        ctx: ChunkContext,
        handler: &mut impl MessageHandler<F::Object>,
    ) {
        let partial = self.current.take();
        let request_id = ctx.request_id.or(partial.as_ref().map(|p| p.request_id));
        self.discard = match ctx.chunk_type {
            Some(ChunkType::Intermediate) => Some(match ctx.request_id {
                Some(id) => Discard::Request(id),
                None => Discard::UntilFinal,
            }),
            _ => None,
        };
        self.state = BuilderState::Idle;
        warn!(
            error = %error,
            request_id = ?request_id,
            status = %error.status_code(),
            "chunk rejected"
        );
        handler.on_error(error, request_id);
    }

    fn process(
        &mut self,
        chunk: &[u8],
        ctx: &mut ChunkContext,
        handler: &mut impl MessageHandler<F::Object>,
    ) -> Result<(), ChannelError> {
        self.state = BuilderState::Idle;
        let header = MessageHeader::decode(chunk).map_err(|e| match e {
            WireError::UnknownMessageType(_) => ChannelError::from(e),
            other => ChannelError::MalformedHeader(other),
        })?;
        ctx.chunk_type = Some(header.chunk_type);
        if header.message_size as usize != chunk.len() {
            return Err(ChannelError::MalformedHeader(WireError::LengthMismatch {
                declared: header.message_size as usize,
                actual: chunk.len(),
            }));
        }
        self.state = BuilderState::HeaderRead;
        handler.on_chunk(chunk);

        match header.message_type {
            MessageType::Hello | MessageType::Acknowledge => {
                return self.dispatch_transport(header, chunk, handler);
            }
            MessageType::Error => {
                let mut body = &chunk[MESSAGE_HEADER_SIZE..];
                let err = ErrorMessage::decode_body(&mut body)?;
                return Err(ChannelError::RemoteError {
                    status: err.status,
                    reason: err.reason.unwrap_or_default(),
                });
            }
            _ => {}
        }

        if self.discard == Some(Discard::UntilFinal) {
            if header.chunk_type != ChunkType::Intermediate {
                self.discard = None;
            }
            trace!(msg_type = %header.message_type, "dropping chunk of failed message");
            self.state = BuilderState::Idle;
            return Ok(());
        }

        let mut cursor = &chunk[MESSAGE_HEADER_SIZE..];
        let secure_channel_id = read_u32(&mut cursor).map_err(ChannelError::MalformedHeader)?;
        if let Some(expected) = self.options.expected_channel_id {
            if secure_channel_id != expected {
                return Err(ChannelError::ChannelIdMismatch {
                    expected,
                    actual: secure_channel_id,
                });
            }
        }
        let security_header = SecurityHeader::decode(header.message_type, &mut cursor)
            .map_err(ChannelError::MalformedHeader)?;
        let header_len = chunk.len() - cursor.len();

        let plain = match &security_header {
            SecurityHeader::Asymmetric(h) => self.open_asymmetric(chunk, header_len, h)?,
            SecurityHeader::Symmetric(h) => {
                self.open_symmetric(header.message_type, chunk, header_len, h.token_id, handler)?
            }
        };

        let sequence = SequenceHeader::decode(&plain)?;
        ctx.request_id = Some(sequence.request_id);
        let body = &plain[SEQUENCE_HEADER_SIZE..];
        self.validate_sequence(sequence.sequence_number, handler)?;
        self.state = BuilderState::SequenceValidated;
        debug!(
            msg_type = %header.message_type,
            chunk_type = ?header.chunk_type,
            request_id = sequence.request_id,
            sequence_number = sequence.sequence_number,
            len = chunk.len(),
            "chunk accepted"
        );

        if let Some(Discard::Request(id)) = self.discard {
            if id == sequence.request_id {
                if header.chunk_type != ChunkType::Intermediate {
                    self.discard = None;
                }
                trace!(request_id = id, "dropping chunk of failed message");
                self.state = BuilderState::Idle;
                return Ok(());
            }
            self.discard = None;
        }

        if header.chunk_type == ChunkType::Abort {
            self.current = None;
            let mut abort_body = body;
            let err = ErrorMessage::decode_body(&mut abort_body)?;
            return Err(ChannelError::Aborted {
                status: err.status,
                reason: err.reason.unwrap_or_default(),
            });
        }

        let partial = self.current.get_or_insert_with(|| PartialMessage {
            message_type: header.message_type,
            request_id: sequence.request_id,
            secure_channel_id,
            security_header: security_header.clone(),
            body: BytesMut::new(),
            chunks: 0,
        });
        if partial.request_id != sequence.request_id {
            return Err(ChannelError::RequestIdMismatch {
                expected: partial.request_id,
                actual: sequence.request_id,
            });
        }
        partial.chunks += 1;
        if self.options.max_chunk_count > 0 && partial.chunks > self.options.max_chunk_count {
            return Err(ChannelError::TooManyChunks {
                count: partial.chunks,
                limit: self.options.max_chunk_count,
            });
        }
        partial.body.extend_from_slice(body);
        if self.options.max_message_size > 0 && partial.body.len() > self.options.max_message_size
        {
            return Err(ChannelError::MessageTooLarge {
                size: partial.body.len(),
                limit: self.options.max_message_size,
            });
        }
        self.state = BuilderState::BodyAccumulating;

        if header.chunk_type == ChunkType::Intermediate {
            return Ok(());
        }
        match self.current.take() {
            Some(message) => self.dispatch(message, handler),
            None => Ok(()),
        }
    }

    fn dispatch_transport(
        &mut self,
        header: MessageHeader,
        chunk: &[u8],
        handler: &mut impl MessageHandler<F::Object>,
    ) -> Result<(), ChannelError> {
        if header.chunk_type != ChunkType::Final {
            return Err(ChannelError::MalformedHeader(WireError::Invalid(format!(
                "{} must be a single final chunk",
                header.message_type
            ))));
        }
        let mut body = &chunk[MESSAGE_HEADER_SIZE..];
        let message = match header.message_type {
            MessageType::Hello => TransportMessage::Hello(HelloMessage::decode_body(&mut body)?),
            _ => TransportMessage::Acknowledge(AcknowledgeMessage::decode_body(&mut body)?),
        };
        self.state = BuilderState::Dispatched;
        debug!(msg_type = %header.message_type, "transport message received");
        handler.on_transport_message(message);
        self.state = BuilderState::Idle;
        Ok(())
    }

    fn dispatch(
        &mut self,
        message: PartialMessage,
        handler: &mut impl MessageHandler<F::Object>,
    ) -> Result<(), ChannelError> {
        let body = message.body.freeze();
        let mut cursor = &body[..];
        let type_id = ExpandedNodeId::decode(&mut cursor).map_err(ChannelError::Decoding)?;
        if !self.factory.has_constructor(&type_id) {
            return Err(ChannelError::NoConstructor(type_id));
        }
        let object = self
            .factory
            .decode_object(&type_id, &mut cursor)
            .map_err(ChannelError::Decoding)?;

        self.state = BuilderState::Dispatched;
        debug!(
            msg_type = %message.message_type,
            request_id = message.request_id,
            type_id = %type_id,
            chunks = message.chunks,
            len = body.len(),
            "message dispatched"
        );
        handler.on_message(DecodedMessage {
            message_type: message.message_type,
            request_id: message.request_id,
            secure_channel_id: message.secure_channel_id,
            security_header: message.security_header,
            chunk_count: message.chunks,
            object,
        });
        self.state = BuilderState::Idle;
        Ok(())
    }

    // ── Security ──────────────────────────────────────────────────────────────

    /// Returns the sequence header and body of an OPN chunk.
    fn open_asymmetric<'c>(
        &mut self,
        chunk: &'c [u8],
        header_len: usize,
        header: &AsymmetricSecurityHeader,
    ) -> Result<Cow<'c, [u8]>, ChannelError> {
        let uri = &header.security_policy_uri;
        let policy = SecurityPolicy::from_uri(uri)
            .ok()
            .filter(|p| !p.is_deprecated())
            .ok_or_else(|| ChannelError::UnsupportedSecurityPolicy(uri.clone()))?;
        let secured_mode = self.mode.is_some_and(|m| m != MessageSecurityMode::None);
        if secured_mode && policy == SecurityPolicy::None {
            return Err(ChannelError::UnsupportedSecurityPolicy(uri.clone()));
        }
        self.state = BuilderState::SecurityResolved;

        if policy == SecurityPolicy::None || self.mode == Some(MessageSecurityMode::None) {
            self.policy = Some(policy);
            self.state = BuilderState::Decrypted;
            return Ok(Cow::Borrowed(&chunk[header_len..]));
        }

        let crypto = self
            .asymmetric
            .clone()
            .ok_or(CryptoError::MissingPrivateKey)?;
        let encrypted = header.receiver_certificate_thumbprint.is_some();
        let mut plain = Vec::with_capacity(chunk.len());
        plain.extend_from_slice(&chunk[..header_len]);
        if encrypted {
            let decrypted = crypto
                .decrypt(&chunk[header_len..])
                .map_err(|e| ChannelError::DecryptionFailure(e.to_string()))?;
            plain.extend_from_slice(&decrypted);
        } else {
            plain.extend_from_slice(&chunk[header_len..]);
        }

        let certificate = header
            .sender_certificate
            .as_deref()
            .ok_or(ChannelError::SignatureInvalid(MessageType::OpenSecureChannel))?;
        let signature_length = crypto.certificate_key_length(certificate)?;
        if !RSA_SIGNATURE_LENGTHS.contains(&signature_length) {
            return Err(CryptoError::UnsupportedSignatureLength(signature_length).into());
        }
        let signed_len = signed_length(&plain, header_len, signature_length)?;
        crypto
            .verify(certificate, &plain[..signed_len], &plain[signed_len..])
            .map_err(|_| ChannelError::SignatureInvalid(MessageType::OpenSecureChannel))?;
        plain.truncate(signed_len);

        if encrypted {
            let extra = crypto.local_plain_block_size() > 256;
            let unpadded = strip_padding(&plain[header_len..], extra)?;
            plain.truncate(header_len + unpadded);
        }
        trace!(signature_length, encrypted, "OPN chunk verified");
        plain.drain(..header_len);
        self.policy = Some(policy);
        self.state = BuilderState::Decrypted;
        Ok(Cow::Owned(plain))
    }

    /// Returns the sequence header and body of a MSG/CLO chunk.
    fn open_symmetric<'c>(
        &mut self,
        message_type: MessageType,
        chunk: &'c [u8],
        header_len: usize,
        token_id: u32,
        handler: &mut impl MessageHandler<F::Object>,
    ) -> Result<Cow<'c, [u8]>, ChannelError> {
        let mode = match self.mode {
            Some(mode) if mode.signs() => mode,
            _ => {
                self.state = BuilderState::Decrypted;
                return Ok(Cow::Borrowed(&chunk[header_len..]));
            }
        };
        match self.policy {
            Some(policy) if policy != SecurityPolicy::None => {}
            other => {
                let uri = other.map(|p| p.uri()).unwrap_or_default();
                return Err(ChannelError::UnsupportedSecurityPolicy(uri));
            }
        }

        let selected = self
            .tokens
            .select(token_id)
            .ok_or(ChannelError::UnknownSecurityToken(token_id))?;
        if !selected.evicted.is_empty() {
            warn!(token_id, evicted = ?selected.evicted, "peer switched to new security token");
            handler.on_new_token(token_id);
        }
        if selected.token.is_expired() {
            return Err(ChannelError::ExpiredSecurityToken(token_id));
        }
        let keys = selected.keys;
        self.state = BuilderState::SecurityResolved;

        let encrypted = mode.encrypts();
        let mut plain = Vec::with_capacity(chunk.len());
        plain.extend_from_slice(&chunk[..header_len]);
        if encrypted {
            let decrypted = keys
                .decrypt(&chunk[header_len..])
                .map_err(|e| ChannelError::DecryptionFailure(e.to_string()))?;
            plain.extend_from_slice(&decrypted);
        } else {
            plain.extend_from_slice(&chunk[header_len..]);
        }

        let signed_len = signed_length(&plain, header_len, keys.signature_length())?;
        keys.verify(&plain[..signed_len], &plain[signed_len..])
            .map_err(|_| ChannelError::SignatureInvalid(message_type))?;
        plain.truncate(signed_len);
        if encrypted {
            let unpadded = strip_padding(&plain[header_len..], false)?;
            plain.truncate(header_len + unpadded);
        }
        plain.drain(..header_len);
        self.state = BuilderState::Decrypted;
        Ok(Cow::Owned(plain))
    }

    fn validate_sequence(
        &mut self,
        actual: u32,
        handler: &mut impl MessageHandler<F::Object>,
    ) -> Result<(), ChannelError> {
        let previous = self.previous_sequence.replace(actual);
        if is_successor(previous, actual) {
            return Ok(());
        }
        let expected = match previous {
            Some(p) if p >= MAX_SEQUENCE_NUMBER => FIRST_SEQUENCE_NUMBER,
            Some(p) => p + 1,
            None => actual,
        };
        warn!(expected, actual, "sequence number gap");
        handler.on_invalid_sequence_number(expected, actual);
        match self.options.sequence_gap_policy {
            SequenceGapPolicy::Notify => Ok(()),
            SequenceGapPolicy::Reject => Err(ChannelError::SequenceNumberGap { expected, actual }),
        }
    }
}

/// Length of `plain` without its trailing signature, checking that a
/// sequence header fits in front of it.
fn signed_length(
    plain: &[u8],
    header_len: usize,
    signature_length: usize,
) -> Result<usize, ChannelError> {
    let min = header_len + SEQUENCE_HEADER_SIZE + signature_length;
    if plain.len() < min {
        return Err(ChannelError::Decoding(WireError::Truncated {
            needed: min,
            available: plain.len(),
        }));
    }
    Ok(plain.len() - signature_length)
}

/// Length of `region` without its trailing padding. Every padding byte must
/// hold the padding size.
fn strip_padding(region: &[u8], extra: bool) -> Result<usize, ChannelError> {
    let invalid = || ChannelError::DecryptionFailure("invalid padding".into());
    let len = region.len();
    let (size, overhead) = if extra {
        if len < 2 {
            return Err(invalid());
        }
        let high = region[len - 1] as usize;
        let low = region[len - 2] as usize;
        ((high << 8) | low, 2)
    } else {
        match region.last() {
            Some(&last) => (last as usize, 1),
            None => return Err(invalid()),
        }
    };
    let total = size + overhead;
    if total > len {
        return Err(invalid());
    }
    let fill = (size & 0xff) as u8;
    let padding = &region[len - total..len - (overhead - 1)];
    if padding.iter().any(|&b| b != fill) {
        return Err(invalid());
    }
    Ok(len - total)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
