//! Chunk a file as one MSG and feed the chunks back through a builder.
//!
//! Sender and receiver run as separate tasks joined by an unbounded
//! channel, the same way a connection's writer and reader would be.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use uasc_core::builder::BuilderEvent;
use uasc_core::crypto::{generate_nonce, ChannelKeys};
use uasc_core::message::encode_message;
use uasc_core::{
    ChunkingOptions, MessageBuilder, MessageChunker, MessageSecurityMode, MessageType, NodeId,
    RawMessage, RawObjectFactory, SecurityPolicy, SecuritySettings, SecurityToken, UascConfig,
};

/// ReadRequest binary encoding; any numeric id would do.
const LOOPBACK_TYPE_ID: u32 = 631;
const CHANNEL_ID: u32 = 1;
const TOKEN_ID: u32 = 1;
const REQUEST_ID: u32 = 1;

#[derive(Debug, Default)]
pub struct Overrides {
    pub policy: Option<String>,
    pub mode: Option<String>,
    pub chunk_size: Option<usize>,
}

fn parse_policy(value: &str) -> Result<SecurityPolicy> {
    if let Ok(policy) = SecurityPolicy::from_uri(value) {
        return Ok(policy);
    }
    SecurityPolicy::ALL
        .into_iter()
        .find(|p| p.uri().ends_with(&format!("#{value}")))
        .with_context(|| format!("unknown security policy: {value}"))
}

fn parse_mode(value: &str) -> Result<MessageSecurityMode> {
    match value {
        "None" | "none" => Ok(MessageSecurityMode::None),
        "Sign" | "sign" => Ok(MessageSecurityMode::Sign),
        "SignAndEncrypt" | "sign_and_encrypt" => Ok(MessageSecurityMode::SignAndEncrypt),
        other => bail!("unknown security mode: {other}"),
    }
}

pub async fn cmd_loopback(path: &str, overrides: Overrides) -> Result<()> {
    let config = UascConfig::load().context("failed to load config")?;
    let policy = match &overrides.policy {
        Some(value) => parse_policy(value)?,
        None => config.security_policy()?,
    };
    if policy.is_deprecated() {
        bail!("security policy {} is deprecated", policy.uri());
    }
    let mode = match &overrides.mode {
        Some(value) => parse_mode(value)?,
        None => config.security.mode,
    };
    if mode.signs() && policy == SecurityPolicy::None {
        bail!("security mode {mode:?} needs a security policy other than None");
    }
    let secured = mode.signs();
    let chunk_size = overrides.chunk_size.unwrap_or(config.limits.chunk_size);

    let data = std::fs::read(path).with_context(|| format!("failed to read file: {}", path))?;
    let message = RawMessage {
        type_id: NodeId::numeric(0, LOOPBACK_TYPE_ID).into(),
        body: Bytes::from(data),
    };
    let body = encode_message(&message);

    // Both ends derive from the same nonce pair, so the sender's local keys
    // are the receiver's remote keys.
    let mut builder = MessageBuilder::new(RawObjectFactory::any(), config.builder_options());
    builder.set_security(mode, policy);
    let security = if secured {
        let client_nonce = generate_nonce(policy.nonce_length());
        let server_nonce = generate_nonce(policy.nonce_length());
        let client = ChannelKeys::derive(policy, &client_nonce, &server_nonce)?;
        let server = ChannelKeys::derive(policy, &server_nonce, &client_nonce)?;
        builder.push_new_token(
            SecurityToken::new(CHANNEL_ID, TOKEN_ID, Duration::from_secs(3600)),
            server.remote,
        );
        SecuritySettings::symmetric(mode, policy, Arc::new(client.local))
    } else {
        SecuritySettings::none()
    };

    let options = ChunkingOptions {
        request_id: REQUEST_ID,
        secure_channel_id: CHANNEL_ID,
        chunk_size,
        token_id: TOKEN_ID,
        max_message_size: config.limits.max_message_size,
        max_chunk_count: config.limits.max_chunk_count,
        ..ChunkingOptions::default()
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Option<Bytes>>();
    let started = Instant::now();

    let sender = tokio::spawn(async move {
        let mut chunker = MessageChunker::new(security);
        chunker.chunk_to_channel(MessageType::Message, &body, &options, &tx)
    });

    let receiver = tokio::spawn(async move {
        let mut events: Vec<BuilderEvent<RawMessage>> = Vec::new();
        let mut wire_bytes = 0usize;
        while let Some(Some(chunk)) = rx.recv().await {
            wire_bytes += chunk.len();
            builder.push_chunk(&chunk, &mut events);
        }
        (events, wire_bytes)
    });

    let sent = sender.await.context("sender task panicked")??;
    let (events, wire_bytes) = receiver.await.context("receiver task panicked")?;
    let elapsed = started.elapsed();

    let mut received = None;
    for event in events {
        match event {
            BuilderEvent::Message(decoded) => received = Some(decoded),
            BuilderEvent::Error { error, request_id } => {
                bail!("request {:?} failed: {} ({})", request_id, error, error.status_code())
            }
            BuilderEvent::InvalidSequenceNumber { expected, actual } => {
                bail!("sequence gap: expected {expected}, got {actual}")
            }
            BuilderEvent::NewToken(_) | BuilderEvent::Transport(_) => {}
        }
    }
    let received = received.context("no message was reassembled")?;
    if received.object != message {
        bail!("reassembled message differs from the original");
    }

    println!("═══════════════════════════════════════");
    println!("  Loopback");
    println!("═══════════════════════════════════════");
    println!("  Policy     : {}", policy);
    println!("  Mode       : {:?}", mode);
    println!("  Chunk size : {}", chunk_size);
    println!("  Payload    : {} bytes", message.body.len());
    println!("  On wire    : {} bytes in {} chunks", wire_bytes, sent);
    println!("  Reassembled: {} chunks, request {}", received.chunk_count, received.request_id);
    println!("  Elapsed    : {:.1} ms", elapsed.as_secs_f64() * 1000.0);

    Ok(())
}
