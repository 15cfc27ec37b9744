use crate::*;

use proptest::prelude::*;
use uasc_core::wire::MessageHeader;
use uasc_core::ChunkType;

fn mode_strategy() -> impl Strategy<Value = MessageSecurityMode> {
    prop_oneof![
        Just(MessageSecurityMode::None),
        Just(MessageSecurityMode::Sign),
        Just(MessageSecurityMode::SignAndEncrypt),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_any_message_survives_chunking(
        len in 0usize..12_000,
        chunk_size in 64usize..2_048,
        mode in mode_strategy(),
    ) {
        let (mut chunker, mut builder) = endpoints(mode, 1);
        let message = raw(len);
        let chunks = send(&mut chunker, MessageType::Message, &message, &options(1, 1, chunk_size));

        let events = deliver(&mut builder, &chunks);
        prop_assert_eq!(events.len(), 1);
        prop_assert_eq!(&messages(&events)[0].object, &message);
    }

    #[test]
    fn prop_exactly_one_final_chunk_and_it_is_last(
        len in 0usize..12_000,
        chunk_size in 64usize..2_048,
        mode in mode_strategy(),
    ) {
        let (mut chunker, _) = endpoints(mode, 1);
        let chunks = send(&mut chunker, MessageType::Message, &raw(len), &options(1, 1, chunk_size));
        let types: Vec<ChunkType> = chunks
            .iter()
            .map(|c| MessageHeader::decode(c).unwrap().chunk_type)
            .collect();
        prop_assert_eq!(types.iter().filter(|t| **t == ChunkType::Final).count(), 1);
        prop_assert_eq!(types.last(), Some(&ChunkType::Final));
        prop_assert!(chunks.iter().all(|c| c.len() <= chunk_size));
    }

    #[test]
    fn prop_clear_bodies_sum_to_message(
        len in 0usize..12_000,
        chunk_size in 64usize..2_048,
    ) {
        let (mut chunker, _) = endpoints(MessageSecurityMode::None, 1);
        let message = raw(len);
        let chunks = send(&mut chunker, MessageType::Message, &message, &options(1, 1, chunk_size));
        // 16 bytes of headers plus 8 of sequence header per chunk.
        let carried: usize = chunks.iter().map(|c| c.len() - 24).sum();
        prop_assert_eq!(carried, uasc_core::message::encode_message(&message).len());
    }

    #[test]
    fn prop_encrypted_region_is_block_aligned(
        len in 0usize..12_000,
        chunk_size in 64usize..2_048,
    ) {
        let (mut chunker, _) = endpoints(MessageSecurityMode::SignAndEncrypt, 1);
        let chunks = send(&mut chunker, MessageType::Message, &raw(len), &options(1, 1, chunk_size));
        prop_assert!(chunks.iter().all(|c| (c.len() - 16) % 16 == 0));
    }
}
