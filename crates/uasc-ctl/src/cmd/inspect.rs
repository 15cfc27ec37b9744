//! Frame a captured byte stream and describe each chunk.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Serialize;
use uasc_core::wire::{read_u32, MessageHeader, SecurityHeader, SequenceHeader};
use uasc_core::{PacketAssembler, UascConfig};

#[derive(Debug, Serialize)]
struct ChunkSummary {
    offset: usize,
    message_type: String,
    chunk_type: char,
    size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    secure_channel_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    policy_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_thumbprint: Option<String>,
    /// Only meaningful when the chunk is not encrypted.
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<u32>,
}

fn summarize(offset: usize, chunk: &[u8]) -> Result<ChunkSummary> {
    let header = MessageHeader::decode(chunk)?;
    let mut summary = ChunkSummary {
        offset,
        message_type: header.message_type.to_string(),
        chunk_type: header.chunk_type as u8 as char,
        size: header.message_size,
        secure_channel_id: None,
        token_id: None,
        policy_uri: None,
        certificate_thumbprint: None,
        sequence_number: None,
        request_id: None,
    };
    if !header.message_type.is_secure() {
        return Ok(summary);
    }

    let mut cursor = &chunk[uasc_core::wire::MESSAGE_HEADER_SIZE..];
    summary.secure_channel_id = Some(read_u32(&mut cursor)?);
    match SecurityHeader::decode(header.message_type, &mut cursor)? {
        SecurityHeader::Asymmetric(h) => {
            summary.policy_uri = Some(h.security_policy_uri);
            summary.certificate_thumbprint = h.receiver_certificate_thumbprint.map(hex::encode);
        }
        SecurityHeader::Symmetric(h) => summary.token_id = Some(h.token_id),
    }
    if let Ok(sequence) = SequenceHeader::decode(cursor) {
        summary.sequence_number = Some(sequence.sequence_number);
        summary.request_id = Some(sequence.request_id);
    }
    Ok(summary)
}

/// Captures may be raw bytes or a hex dump (whitespace ignored).
fn decode_capture(raw: Vec<u8>) -> Vec<u8> {
    let decoded = std::str::from_utf8(&raw)
        .ok()
        .and_then(|text| hex::decode(text.split_whitespace().collect::<String>()).ok());
    decoded.unwrap_or(raw)
}

pub fn cmd_inspect(path: &str, json: bool) -> Result<()> {
    let config = UascConfig::load().context("failed to load config")?;
    let raw = std::fs::read(path).with_context(|| format!("failed to read file: {}", path))?;
    let data = decode_capture(raw);

    let mut assembler = PacketAssembler::new(config.limits.max_chunk_size);
    let mut chunks: Vec<Bytes> = Vec::new();
    assembler
        .feed(&data, |chunk| chunks.push(chunk))
        .with_context(|| format!("stream framing failed after {} chunks", chunks.len()))?;
    tracing::debug!(chunks = chunks.len(), trailing = assembler.buffered(), "stream framed");

    let mut offset = 0;
    let mut summaries = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        summaries.push(summarize(offset, chunk)?);
        offset += chunk.len();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  {} ({} chunks)", path, summaries.len());
    println!("═══════════════════════════════════════");
    for s in &summaries {
        println!("  ┌─ {}{} @ {} ({} bytes)", s.message_type, s.chunk_type, s.offset, s.size);
        if let Some(id) = s.secure_channel_id {
            println!("  │  channel  : {}", id);
        }
        if let Some(token) = s.token_id {
            println!("  │  token    : {}", token);
        }
        if let Some(uri) = &s.policy_uri {
            println!("  │  policy   : {}", uri);
        }
        if let Some(thumbprint) = &s.certificate_thumbprint {
            println!("  │  receiver : {}", thumbprint);
        }
        match (s.sequence_number, s.request_id) {
            (Some(seq), Some(req)) => println!("  └─ sequence : {} (request {})", seq, req),
            _ => println!("  └─"),
        }
    }
    if assembler.buffered() > 0 {
        println!("\n  {} trailing bytes do not form a chunk.", assembler.buffered());
    }

    Ok(())
}
