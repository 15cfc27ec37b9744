use crate::*;

use uasc_core::transport::{HelloMessage, TransportLimits, TransportMessage};
use uasc_core::PacketAssembler;

#[test]
fn test_stream_framing_into_builder() {
    let hello = HelloMessage {
        limits: TransportLimits::default(),
        endpoint_url: Some("opc.tcp://localhost:4840".into()),
    };
    let (mut chunker, mut builder) = endpoints(MessageSecurityMode::SignAndEncrypt, 1);
    let message = raw(20_000);

    let mut stream = hello.encode().to_vec();
    for chunk in send(&mut chunker, MessageType::Message, &message, &options(4, 1, 8192)) {
        stream.extend_from_slice(&chunk);
    }

    let mut assembler = PacketAssembler::new(8192);
    let mut events = Events::new();
    for read in stream.chunks(7) {
        assembler
            .feed(read, |chunk| builder.push_chunk(&chunk, &mut events))
            .unwrap();
    }
    assert_eq!(assembler.buffered(), 0);

    assert_eq!(events[0], BuilderEvent::Transport(TransportMessage::Hello(hello)));
    assert_eq!(messages(&events)[0].object, message);
    assert!(errors(&events).is_empty());
}

#[test]
fn test_oversized_chunk_on_stream() {
    let (mut chunker, _) = endpoints(MessageSecurityMode::None, 1);
    let chunks = send(&mut chunker, MessageType::Message, &raw(10_000), &options(1, 1, 8192));
    let mut assembler = PacketAssembler::new(4096);
    let err = assembler.feed(&chunks[0], |_| {}).unwrap_err();
    assert!(matches!(err, ChannelError::MessageTooLarge { size: 8192, limit: 4096 }));
}
