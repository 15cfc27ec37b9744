//! uasc integration test harness.
//!
//! Every test drives a `MessageChunker` (the sending end) into a
//! `MessageBuilder` (the receiving end) the way a connection would, with
//! nothing but bytes between them. No sockets are involved.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use uasc_core::builder::BuilderEvent;
use uasc_core::crypto::{AsymmetricCrypto, ChannelKeys, CryptoError};
use uasc_core::{
    BuilderOptions, ChannelError, ChunkingOptions, DecodedMessage, MessageBuilder, MessageChunker,
    MessageSecurityMode, MessageType, NodeId, RawMessage, RawObjectFactory, SecurityPolicy,
    SecuritySettings, SecurityToken,
};

mod failures;
mod properties;
mod roundtrip;
mod secure_channel;
mod stream;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const CHANNEL_ID: u32 = 7;
pub const POLICY: SecurityPolicy = SecurityPolicy::Basic256Sha256;

pub type Events = Vec<BuilderEvent<RawMessage>>;

/// A message of `len` body bytes with a recognisable pattern.
pub fn raw(len: usize) -> RawMessage {
    RawMessage {
        type_id: NodeId::numeric(0, 631).into(),
        body: (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into(),
    }
}

pub fn options(request_id: u32, token_id: u32, chunk_size: usize) -> ChunkingOptions {
    ChunkingOptions {
        request_id,
        secure_channel_id: CHANNEL_ID,
        chunk_size,
        token_id,
        ..ChunkingOptions::default()
    }
}

/// Keys for token `token_id`. Different tokens get different nonces.
/// Returns the client's sending keys and the server's receiving keys.
pub fn token_keys(token_id: u32) -> (uasc_core::DerivedKeys, uasc_core::DerivedKeys) {
    let client_nonce = [token_id as u8; 32];
    let server_nonce = [0xF0 ^ token_id as u8; 32];
    let client = ChannelKeys::derive(POLICY, &client_nonce, &server_nonce).expect("client keys");
    let server = ChannelKeys::derive(POLICY, &server_nonce, &client_nonce).expect("server keys");
    (client.local, server.remote)
}

/// A client chunker and a server builder sharing token `token_id`.
pub fn endpoints(
    mode: MessageSecurityMode,
    token_id: u32,
) -> (MessageChunker, MessageBuilder<RawObjectFactory>) {
    endpoints_with(mode, token_id, BuilderOptions::default())
}

pub fn endpoints_with(
    mode: MessageSecurityMode,
    token_id: u32,
    builder_options: BuilderOptions,
) -> (MessageChunker, MessageBuilder<RawObjectFactory>) {
    let mut builder = MessageBuilder::new(RawObjectFactory::any(), builder_options);
    if mode == MessageSecurityMode::None {
        builder.set_security(mode, SecurityPolicy::None);
        return (MessageChunker::default(), builder);
    }
    let (client, server) = token_keys(token_id);
    builder.set_security(mode, POLICY);
    builder.push_new_token(
        SecurityToken::new(CHANNEL_ID, token_id, Duration::from_secs(600)),
        server,
    );
    let chunker = MessageChunker::new(SecuritySettings::symmetric(mode, POLICY, Arc::new(client)));
    (chunker, builder)
}

pub fn send(
    chunker: &mut MessageChunker,
    message_type: MessageType,
    message: &RawMessage,
    options: &ChunkingOptions,
) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    chunker
        .chunk_message(message_type, message, options, |c| chunks.push(c))
        .expect("chunking failed");
    chunks
}

pub fn deliver(builder: &mut MessageBuilder<RawObjectFactory>, chunks: &[Bytes]) -> Events {
    let mut events = Events::new();
    builder.push_chunks(chunks.iter().map(|c| &c[..]), &mut events);
    events
}

pub fn messages(events: &Events) -> Vec<&DecodedMessage<RawMessage>> {
    events
        .iter()
        .filter_map(|e| match e {
            BuilderEvent::Message(m) => Some(m),
            _ => None,
        })
        .collect()
}

pub fn errors(events: &Events) -> Vec<&ChannelError> {
    events
        .iter()
        .filter_map(|e| match e {
            BuilderEvent::Error { error, .. } => Some(error),
            _ => None,
        })
        .collect()
}

// ── Fake RSA ──────────────────────────────────────────────────────────────────

/// Stand-in for RSA with a 1024-bit key and OAEP-SHA1 padding: 86 plain
/// bytes per 128-byte cipher block, 128-byte signatures.
///
/// "Encryption" is a XOR plus filler and signatures are an FNV-1a digest
/// stretched to the key length. Enough to exercise the framing.
#[derive(Debug, Clone)]
pub struct FakeRsa {
    pub key_length: usize,
    pub plain_block: usize,
}

impl Default for FakeRsa {
    fn default() -> Self {
        Self {
            key_length: 128,
            plain_block: 86,
        }
    }
}

pub const FAKE_CERTIFICATE: &[u8] = b"-----FAKE CERTIFICATE-----";
pub const FAKE_THUMBPRINT: [u8; 20] = [0xAB; 20];

fn fnv1a(data: &[u8], seed: u64) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325 ^ seed, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

impl AsymmetricCrypto for FakeRsa {
    fn signature_length(&self) -> usize {
        self.key_length
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok((0..self.key_length / 8)
            .flat_map(|i| fnv1a(data, i as u64).to_le_bytes())
            .collect())
    }

    fn plain_block_size(&self) -> usize {
        self.plain_block
    }

    fn cipher_block_size(&self) -> usize {
        self.key_length
    }

    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plain.len() % self.plain_block != 0 {
            return Err(CryptoError::NotBlockAligned(plain.len()));
        }
        let filler = self.key_length - self.plain_block;
        Ok(plain
            .chunks(self.plain_block)
            .flat_map(|block| {
                block
                    .iter()
                    .map(|b| b ^ 0xA5)
                    .chain(std::iter::repeat(0xEE).take(filler))
                    .collect::<Vec<u8>>()
            })
            .collect())
    }

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if cipher.len() % self.key_length != 0 {
            return Err(CryptoError::NotBlockAligned(cipher.len()));
        }
        Ok(cipher
            .chunks(self.key_length)
            .flat_map(|block| block[..self.plain_block].iter().map(|b| b ^ 0xA5))
            .collect())
    }

    fn certificate_key_length(&self, certificate: &[u8]) -> Result<usize, CryptoError> {
        if certificate != FAKE_CERTIFICATE {
            return Err(CryptoError::Asymmetric("unknown certificate".into()));
        }
        Ok(self.key_length)
    }

    fn verify(&self, _certificate: &[u8], data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        if self.sign(data)? == signature {
            Ok(())
        } else {
            Err(CryptoError::SignatureMismatch)
        }
    }
}
