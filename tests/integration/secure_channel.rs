use crate::*;

use uasc_core::sequence::{SequenceNumberGenerator, MAX_SEQUENCE_NUMBER};
use uasc_core::wire::{AsymmetricSecurityHeader, SecurityHeader, StatusCode};

// ── OpenSecureChannel ─────────────────────────────────────────────────────────

fn opn_endpoints(
    thumbprint: Option<&[u8]>,
) -> (MessageChunker, MessageBuilder<RawObjectFactory>, ChunkingOptions) {
    opn_endpoints_with(FakeRsa::default(), thumbprint)
}

fn opn_endpoints_with(
    rsa: FakeRsa,
    thumbprint: Option<&[u8]>,
) -> (MessageChunker, MessageBuilder<RawObjectFactory>, ChunkingOptions) {
    let rsa: Arc<dyn AsymmetricCrypto> = Arc::new(rsa);
    let chunker = MessageChunker::new(SecuritySettings {
        mode: MessageSecurityMode::SignAndEncrypt,
        policy: POLICY,
        keys: None,
        asymmetric: Some(rsa.clone()),
    });
    let mut builder = MessageBuilder::new(RawObjectFactory::any(), BuilderOptions::default());
    builder.set_security(MessageSecurityMode::SignAndEncrypt, POLICY);
    builder.set_asymmetric_crypto(rsa);

    let options = ChunkingOptions {
        security_header: Some(AsymmetricSecurityHeader {
            security_policy_uri: POLICY.uri(),
            sender_certificate: Some(Bytes::from_static(FAKE_CERTIFICATE)),
            receiver_certificate_thumbprint: thumbprint.map(Bytes::copy_from_slice),
        }),
        ..options(1, 0, 8192)
    };
    (chunker, builder, options)
}

#[test]
fn test_open_secure_channel_encrypted() {
    let (mut chunker, mut builder, options) = opn_endpoints(Some(&FAKE_THUMBPRINT));
    let message = raw(20_000);
    let chunks = send(&mut chunker, MessageType::OpenSecureChannel, &message, &options);
    assert!(chunks.len() > 1);

    // Everything after the clear headers is whole RSA blocks.
    let security_header = SecurityHeader::Asymmetric(options.security_header.clone().unwrap());
    let clear = 12 + security_header.encoded_len();
    for chunk in &chunks {
        assert_eq!((chunk.len() - clear) % 128, 0);
        assert!(chunk.len() <= 8192);
    }

    let events = deliver(&mut builder, &chunks);
    assert!(errors(&events).is_empty(), "{events:?}");
    let received = messages(&events)[0];
    assert_eq!(received.object, message);
    assert_eq!(received.message_type, MessageType::OpenSecureChannel);
    match &received.security_header {
        SecurityHeader::Asymmetric(h) => assert_eq!(h.security_policy_uri, POLICY.uri()),
        other => panic!("unexpected header {other:?}"),
    }
}

#[test]
fn test_open_secure_channel_with_4096_bit_key() {
    // 470 plain bytes per block: padding carries a second size byte.
    let rsa = FakeRsa {
        key_length: 512,
        plain_block: 470,
    };
    let (mut chunker, mut builder, options) = opn_endpoints_with(rsa, Some(&FAKE_THUMBPRINT));
    let security_header = SecurityHeader::Asymmetric(options.security_header.clone().unwrap());
    let clear = 12 + security_header.encoded_len();

    for len in [1, 100, 5_000, 20_000] {
        let message = raw(len);
        let chunks = send(&mut chunker, MessageType::OpenSecureChannel, &message, &options);
        for chunk in &chunks {
            assert_eq!((chunk.len() - clear) % 512, 0, "len {len}");
            assert!(chunk.len() <= 8192);
        }
        let events = deliver(&mut builder, &chunks);
        assert!(errors(&events).is_empty(), "len {len}: {events:?}");
        assert_eq!(messages(&events)[0].object, message, "len {len}");
    }
}

#[test]
fn test_none_policy_open_cannot_downgrade_channel() {
    let (_, mut builder) = endpoints(MessageSecurityMode::Sign, 1);
    let mut plain = MessageChunker::default();
    let downgrade = ChunkingOptions {
        security_header: Some(AsymmetricSecurityHeader {
            security_policy_uri: SecurityPolicy::None.uri(),
            ..Default::default()
        }),
        ..options(1, 0, 8192)
    };
    let events = deliver(
        &mut builder,
        &send(&mut plain, MessageType::OpenSecureChannel, &raw(16), &downgrade),
    );
    assert_eq!(
        *errors(&events)[0],
        ChannelError::UnsupportedSecurityPolicy(SecurityPolicy::None.uri())
    );
    assert!(messages(&events).is_empty());

    let forged = send(&mut plain, MessageType::Message, &raw(64), &options(2, 1, 8192));
    let events = deliver(&mut builder, &forged);
    assert!(messages(&events).is_empty(), "{events:?}");
    assert_eq!(
        *errors(&events)[0],
        ChannelError::SignatureInvalid(MessageType::Message)
    );
}

#[test]
fn test_open_secure_channel_signed_only() {
    let (mut chunker, mut builder, options) = opn_endpoints(None);
    let message = raw(500);
    let chunks = send(&mut chunker, MessageType::OpenSecureChannel, &message, &options);
    assert_eq!(chunks.len(), 1);
    // Signed but readable: the body is in clear right after the sequence header.
    assert!(chunks[0].windows(16).any(|w| w == &message.body[..16]));

    let events = deliver(&mut builder, &chunks);
    assert_eq!(messages(&events)[0].object, message);
}

#[test]
fn test_open_secure_channel_tampered_signature() {
    let (mut chunker, mut builder, options) = opn_endpoints(None);
    let mut chunks = send(&mut chunker, MessageType::OpenSecureChannel, &raw(64), &options);
    let mut bad = chunks[0].to_vec();
    let last = bad.len() - 1;
    bad[last] ^= 0x01;
    chunks[0] = bad.into();

    let events = deliver(&mut builder, &chunks);
    let errs = errors(&events);
    assert_eq!(errs.len(), 1);
    assert_eq!(*errs[0], ChannelError::SignatureInvalid(MessageType::OpenSecureChannel));
    assert_eq!(errs[0].status_code(), StatusCode::BAD_SECURITY_CHECKS_FAILED);
}

#[test]
fn test_open_secure_channel_rejects_unknown_policy() {
    let (mut chunker, mut builder, mut options) = opn_endpoints(None);
    if let Some(header) = options.security_header.as_mut() {
        header.security_policy_uri = SecurityPolicy::Basic256.uri();
    }
    let chunks = send(&mut chunker, MessageType::OpenSecureChannel, &raw(64), &options);
    let events = deliver(&mut builder, &chunks);
    assert_eq!(
        *errors(&events)[0],
        ChannelError::UnsupportedSecurityPolicy(SecurityPolicy::Basic256.uri())
    );
}

// ── Tokens ────────────────────────────────────────────────────────────────────

#[test]
fn test_token_renewal_switches_keys() {
    let (mut chunker, mut builder) = endpoints(MessageSecurityMode::SignAndEncrypt, 1);
    let (client2, server2) = token_keys(2);
    builder.push_new_token(
        SecurityToken::new(CHANNEL_ID, 2, Duration::from_secs(600)),
        server2,
    );

    // Old token still works until the peer uses the new one.
    let first = send(&mut chunker, MessageType::Message, &raw(100), &options(1, 1, 8192));
    let events = deliver(&mut builder, &first);
    assert_eq!(messages(&events).len(), 1);
    assert_eq!(builder.tokens().token_ids(), vec![1, 2]);

    chunker.update(SecuritySettings::symmetric(
        MessageSecurityMode::SignAndEncrypt,
        POLICY,
        Arc::new(client2),
    ));
    let second = send(&mut chunker, MessageType::Message, &raw(100), &options(2, 2, 8192));
    let events = deliver(&mut builder, &second);
    assert!(events.contains(&BuilderEvent::NewToken(2)));
    assert_eq!(messages(&events)[0].request_id, 2);
    assert_eq!(builder.tokens().token_ids(), vec![2]);

    // No sequence gap across the key change.
    assert!(!events
        .iter()
        .any(|e| matches!(e, BuilderEvent::InvalidSequenceNumber { .. })));
}

#[test]
fn test_retired_token_is_unknown() {
    let (mut chunker, mut builder) = endpoints(MessageSecurityMode::Sign, 1);
    let (client2, server2) = token_keys(2);
    builder.push_new_token(
        SecurityToken::new(CHANNEL_ID, 2, Duration::from_secs(600)),
        server2,
    );
    let mut renewed = MessageChunker::new(SecuritySettings::symmetric(
        MessageSecurityMode::Sign,
        POLICY,
        Arc::new(client2),
    ));
    deliver(
        &mut builder,
        &send(&mut renewed, MessageType::Message, &raw(10), &options(1, 2, 8192)),
    );

    let stale = send(&mut chunker, MessageType::Message, &raw(10), &options(2, 1, 8192));
    let events = deliver(&mut builder, &stale);
    assert!(errors(&events)
        .iter()
        .any(|e| **e == ChannelError::UnknownSecurityToken(1)));
}

#[test]
fn test_expired_token_is_rejected() {
    let (mut chunker, mut builder) = endpoints(MessageSecurityMode::Sign, 1);
    assert!(builder.expire_token(1));
    let chunks = send(&mut chunker, MessageType::Message, &raw(10), &options(1, 1, 8192));
    let events = deliver(&mut builder, &chunks);
    let errs = errors(&events);
    assert_eq!(*errs[0], ChannelError::ExpiredSecurityToken(1));
    assert_eq!(errs[0].status_code(), StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN);
}

// ── Sequence numbers ──────────────────────────────────────────────────────────

#[test]
fn test_sequence_numbers_wrap_without_gap() {
    let (_, mut builder) = endpoints(MessageSecurityMode::Sign, 1);
    let (client, _) = token_keys(1);
    let mut chunker = MessageChunker::with_sequence(
        SecuritySettings::symmetric(MessageSecurityMode::Sign, POLICY, Arc::new(client)),
        SequenceNumberGenerator::starting_at(MAX_SEQUENCE_NUMBER - 1),
    );

    let message = raw(3_000);
    let chunks = send(&mut chunker, MessageType::Message, &message, &options(1, 1, 1024));
    assert!(chunks.len() > 3);
    assert!(chunker.sequence().peek() < 1024);

    let events = deliver(&mut builder, &chunks);
    assert_eq!(events.len(), 1, "{events:?}");
    assert_eq!(messages(&events)[0].object, message);
}
