use crate::*;

use uasc_core::wire::{MessageHeader, SecurityHeader, SymmetricSecurityHeader};
use uasc_core::ChunkType;

const MODES: [MessageSecurityMode; 3] = [
    MessageSecurityMode::None,
    MessageSecurityMode::Sign,
    MessageSecurityMode::SignAndEncrypt,
];

#[test]
fn test_message_round_trip_in_every_mode() {
    for mode in MODES {
        for len in [0, 1, 300, 8_000, 50_000] {
            let (mut chunker, mut builder) = endpoints(mode, 1);
            let message = raw(len);
            let chunks = send(&mut chunker, MessageType::Message, &message, &options(11, 1, 8192));
            let events = deliver(&mut builder, &chunks);

            assert_eq!(events.len(), 1, "{mode:?} len {len}: {events:?}");
            let received = messages(&events)[0];
            assert_eq!(received.object, message, "{mode:?} len {len}");
            assert_eq!(received.request_id, 11);
            assert_eq!(received.secure_channel_id, CHANNEL_ID);
            assert_eq!(received.chunk_count, chunks.len());
        }
    }
}

#[test]
fn test_chunk_sequence_shape() {
    let (mut chunker, _) = endpoints(MessageSecurityMode::Sign, 1);
    let chunks = send(&mut chunker, MessageType::Message, &raw(30_000), &options(1, 1, 8192));
    assert_eq!(chunks.len(), 4);

    for (i, chunk) in chunks.iter().enumerate() {
        let header = MessageHeader::decode(chunk).unwrap();
        assert_eq!(header.message_size as usize, chunk.len());
        assert!(chunk.len() <= 8192);
        let expected = if i + 1 == chunks.len() {
            ChunkType::Final
        } else {
            ChunkType::Intermediate
        };
        assert_eq!(header.chunk_type, expected, "chunk {i}");
    }
}

#[test]
fn test_exact_multiple_has_no_trailing_empty_chunk() {
    // 8192 - 16 header - 8 sequence header leaves 8168 body bytes per chunk;
    // the four-byte type id is part of the body.
    let (mut chunker, mut builder) = endpoints(MessageSecurityMode::None, 1);
    let message = raw(8168 * 2 - 4);
    let chunks = send(&mut chunker, MessageType::Message, &message, &options(3, 1, 8192));
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.len() == 8192));

    let events = deliver(&mut builder, &chunks);
    assert_eq!(messages(&events)[0].object, message);
}

#[test]
fn test_close_secure_channel_round_trip() {
    let (mut chunker, mut builder) = endpoints(MessageSecurityMode::SignAndEncrypt, 1);
    let message = raw(16);
    let chunks = send(
        &mut chunker,
        MessageType::CloseSecureChannel,
        &message,
        &options(90, 1, 8192),
    );
    let events = deliver(&mut builder, &chunks);
    let received = messages(&events)[0];
    assert_eq!(received.message_type, MessageType::CloseSecureChannel);
    assert_eq!(
        received.security_header,
        SecurityHeader::Symmetric(SymmetricSecurityHeader { token_id: 1 })
    );
}

#[test]
fn test_interleaved_requests_are_delivered_in_order() {
    let (mut chunker, mut builder) = endpoints(MessageSecurityMode::Sign, 1);
    let mut all = Vec::new();
    for request_id in 1..=5 {
        all.extend(send(
            &mut chunker,
            MessageType::Message,
            &raw(request_id as usize * 1_000),
            &options(request_id, 1, 1024),
        ));
    }
    let events = deliver(&mut builder, &all);
    let ids: Vec<u32> = messages(&events).iter().map(|m| m.request_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert!(errors(&events).is_empty());
}

#[tokio::test]
async fn test_chunks_over_a_task_channel() {
    let (mut chunker, mut builder) = endpoints(MessageSecurityMode::SignAndEncrypt, 1);
    let message = raw(40_000);
    let body = uasc_core::message::encode_message(&message);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let sender = tokio::spawn(async move {
        chunker.chunk_to_channel(MessageType::Message, &body, &options(5, 1, 8192), &tx)
    });
    let receiver = tokio::spawn(async move {
        let mut events = Events::new();
        while let Some(Some(chunk)) = rx.recv().await {
            builder.push_chunk(&chunk, &mut events);
        }
        events
    });

    let sent = sender.await.unwrap().unwrap();
    let events = receiver.await.unwrap();
    let received = messages(&events)[0];
    assert_eq!(received.object, message);
    assert_eq!(received.chunk_count, sent);
}
