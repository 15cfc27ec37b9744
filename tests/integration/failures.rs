use crate::*;

use uasc_core::transport::ErrorMessage;
use uasc_core::wire::StatusCode;
use uasc_core::SequenceGapPolicy;

fn tamper(chunk: &Bytes, index: usize) -> Bytes {
    let mut bytes = chunk.to_vec();
    bytes[index] ^= 0x40;
    bytes.into()
}

#[test]
fn test_tampered_chunk_fails_verification() {
    for mode in [MessageSecurityMode::Sign, MessageSecurityMode::SignAndEncrypt] {
        let (mut chunker, mut builder) = endpoints(mode, 1);
        let chunks = send(&mut chunker, MessageType::Message, &raw(200), &options(1, 1, 8192));
        let tampered = vec![tamper(&chunks[0], 40)];

        let events = deliver(&mut builder, &tampered);
        let errs = errors(&events);
        assert_eq!(errs.len(), 1, "{mode:?}");
        assert_eq!(*errs[0], ChannelError::SignatureInvalid(MessageType::Message));
        assert_eq!(errs[0].status_code(), StatusCode::BAD_SECURITY_CHECKS_FAILED);
        assert!(messages(&events).is_empty());
    }
}

#[test]
fn test_failed_message_is_discarded_and_channel_recovers() {
    let (mut chunker, mut builder) = endpoints(MessageSecurityMode::Sign, 1);
    let mut chunks = send(&mut chunker, MessageType::Message, &raw(3_000), &options(1, 1, 1024));
    assert!(chunks.len() >= 3);
    chunks[0] = tamper(&chunks[0], 30);
    let events = deliver(&mut builder, &chunks);
    assert_eq!(errors(&events).len(), 1);
    assert!(messages(&events).is_empty());

    let next = send(&mut chunker, MessageType::Message, &raw(10), &options(2, 1, 1024));
    let events = deliver(&mut builder, &next);
    assert_eq!(messages(&events)[0].request_id, 2);
}

#[test]
fn test_sequence_gap_is_reported() {
    let (mut chunker, mut builder) = endpoints(MessageSecurityMode::Sign, 1);
    let mut chunks = send(&mut chunker, MessageType::Message, &raw(100), &options(1, 1, 8192));
    chunks.extend(send(&mut chunker, MessageType::Message, &raw(100), &options(2, 1, 8192)));
    chunks.extend(send(&mut chunker, MessageType::Message, &raw(100), &options(3, 1, 8192)));
    chunks.remove(1);

    let events = deliver(&mut builder, &chunks);
    assert!(events.contains(&BuilderEvent::InvalidSequenceNumber {
        expected: 2,
        actual: 3
    }));
    // The default policy only notifies.
    let ids: Vec<u32> = messages(&events).iter().map(|m| m.request_id).collect();
    assert_eq!(ids, vec![1, 3]);
}

#[test]
fn test_sequence_gap_rejected_drops_rest_of_message() {
    let builder_options = BuilderOptions {
        sequence_gap_policy: SequenceGapPolicy::Reject,
        ..BuilderOptions::default()
    };
    let (mut chunker, mut builder) =
        endpoints_with(MessageSecurityMode::Sign, 1, builder_options);
    let mut chunks = send(&mut chunker, MessageType::Message, &raw(3_000), &options(1, 1, 1024));
    assert_eq!(chunks.len(), 4);
    chunks.remove(1);

    let events = deliver(&mut builder, &chunks);
    assert_eq!(
        errors(&events),
        vec![&ChannelError::SequenceNumberGap {
            expected: 2,
            actual: 3
        }]
    );
    assert!(messages(&events).is_empty());

    let next = send(&mut chunker, MessageType::Message, &raw(10), &options(2, 1, 1024));
    let events = deliver(&mut builder, &next);
    assert_eq!(messages(&events)[0].request_id, 2);
    assert!(errors(&events).is_empty());
}

#[test]
fn test_receive_limits() {
    let builder_options = BuilderOptions {
        max_message_size: 2_000,
        ..BuilderOptions::default()
    };
    let (mut chunker, mut builder) =
        endpoints_with(MessageSecurityMode::None, 1, builder_options);
    let chunks = send(&mut chunker, MessageType::Message, &raw(5_000), &options(1, 1, 1024));
    let events = deliver(&mut builder, &chunks);
    let errs = errors(&events);
    assert_eq!(errs.len(), 1);
    assert!(matches!(
        errs[0],
        ChannelError::MessageTooLarge { limit: 2_000, .. }
    ));

    let builder_options = BuilderOptions {
        max_chunk_count: 2,
        ..BuilderOptions::default()
    };
    let (mut chunker, mut builder) =
        endpoints_with(MessageSecurityMode::None, 1, builder_options);
    let chunks = send(&mut chunker, MessageType::Message, &raw(5_000), &options(1, 1, 1024));
    let events = deliver(&mut builder, &chunks);
    assert_eq!(
        *errors(&events)[0],
        ChannelError::TooManyChunks { count: 3, limit: 2 }
    );
}

#[test]
fn test_send_limits_emit_nothing() {
    let (mut chunker, _) = endpoints(MessageSecurityMode::Sign, 1);
    let limited = ChunkingOptions {
        max_chunk_count: 2,
        ..options(1, 1, 1024)
    };
    let mut emitted = 0;
    let err = chunker
        .chunk_message(MessageType::Message, &raw(5_000), &limited, |_| emitted += 1)
        .unwrap_err();
    assert!(matches!(err, ChannelError::TooManyChunks { limit: 2, .. }));
    assert_eq!(emitted, 0);
    assert_eq!(chunker.sequence().peek(), 1);
}

#[test]
fn test_aborted_message() {
    let (mut chunker, mut builder) = endpoints(MessageSecurityMode::SignAndEncrypt, 1);
    let mut chunks = send(&mut chunker, MessageType::Message, &raw(3_000), &options(8, 1, 1024));
    chunks.truncate(2);
    // The chunks cut off above leave a sequence gap, which only notifies.
    let mut abort = Vec::new();
    chunker
        .abort_message(
            MessageType::Message,
            StatusCode::BAD_REQUEST_INTERRUPTED,
            "client gave up",
            &options(8, 1, 1024),
            |c| abort.push(c),
        )
        .unwrap();
    assert_eq!(abort.len(), 1);
    chunks.extend(abort);

    let events = deliver(&mut builder, &chunks);
    assert!(messages(&events).is_empty());
    let aborted = errors(&events)
        .into_iter()
        .find(|e| matches!(e, ChannelError::Aborted { .. }))
        .expect("abort reported");
    assert_eq!(aborted.status_code(), StatusCode::BAD_REQUEST_INTERRUPTED);
    assert!(events.iter().any(|e| matches!(
        e,
        BuilderEvent::Error { error: ChannelError::Aborted { reason, .. }, request_id: Some(8) }
            if reason == "client gave up"
    )));
}

#[test]
fn test_wrong_channel_is_rejected() {
    let builder_options = BuilderOptions {
        expected_channel_id: Some(CHANNEL_ID + 1),
        ..BuilderOptions::default()
    };
    let (mut chunker, mut builder) =
        endpoints_with(MessageSecurityMode::None, 1, builder_options);
    let chunks = send(&mut chunker, MessageType::Message, &raw(10), &options(1, 1, 8192));
    let events = deliver(&mut builder, &chunks);
    assert_eq!(
        *errors(&events)[0],
        ChannelError::ChannelIdMismatch {
            expected: CHANNEL_ID + 1,
            actual: CHANNEL_ID
        }
    );
}

#[test]
fn test_unknown_message_type_id() {
    let mut chunker = MessageChunker::default();
    let mut builder = MessageBuilder::new(
        RawObjectFactory::accepting([NodeId::numeric(0, 446).into()]),
        BuilderOptions::default(),
    );
    let chunks = send(&mut chunker, MessageType::Message, &raw(10), &options(1, 1, 8192));
    let events = deliver(&mut builder, &chunks);
    let errs = errors(&events);
    assert!(matches!(errs[0], ChannelError::NoConstructor(id) if id.node_id.identifier == 631));
    assert_eq!(errs[0].status_code(), StatusCode::BAD_DECODING_ERROR);
}

#[test]
fn test_remote_error_message() {
    let mut builder = MessageBuilder::new(RawObjectFactory::any(), BuilderOptions::default());
    let err = ErrorMessage::new(StatusCode::BAD_TCP_MESSAGE_TOO_LARGE, "too big").encode();
    let events = deliver(&mut builder, &[err]);
    assert_eq!(
        *errors(&events)[0],
        ChannelError::RemoteError {
            status: StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
            reason: "too big".into()
        }
    );
}

#[test]
fn test_closed_receiver_is_reported() {
    let (mut chunker, _) = endpoints(MessageSecurityMode::None, 1);
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    drop(rx);
    let body = uasc_core::message::encode_message(&raw(10));
    let err = chunker
        .chunk_to_channel(MessageType::Message, &body, &options(1, 1, 8192), &tx)
        .unwrap_err();
    assert_eq!(err, ChannelError::SinkClosed);
}
