//! Property-based tests for frame and payload decoding.
//!
//! The relay parses bytes from unauthenticated peers, so decoding must reject
//! every malformed input with an error rather than a panic.

use bytes::Bytes;
use hush_proto::{
    ConversationId, CorrelationId, Envelope, Frame, FrameHeader, Opcode, Payload, ProtocolError,
    payloads::relay::OutboundMessage,
};
use proptest::prelude::*;

fn arbitrary_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![
        Just(Opcode::Authenticate),
        Just(Opcode::AuthGranted),
        Just(Opcode::AuthDenied),
        Just(Opcode::Hello),
        Just(Opcode::HelloReply),
        Just(Opcode::Ping),
        Just(Opcode::Pong),
        Just(Opcode::Heartbeat),
        Just(Opcode::Goodbye),
        Just(Opcode::Error),
        Just(Opcode::Subscribe),
        Just(Opcode::Unsubscribe),
        Just(Opcode::SubscribeSelf),
        Just(Opcode::SendMessage),
        Just(Opcode::History),
        Just(Opcode::Subscribed),
        Just(Opcode::Unsubscribed),
        Just(Opcode::SelfSubscribed),
        Just(Opcode::Message),
        Just(Opcode::Ack),
        Just(Opcode::HistoryPage),
        Just(Opcode::Expired),
    ]
}

fn arbitrary_frame() -> impl Strategy<Value = Frame> {
    (arbitrary_opcode(), prop::collection::vec(any::<u8>(), 0..1024))
        .prop_map(|(opcode, payload)| Frame::new(FrameHeader::new(opcode), Bytes::from(payload)))
}

#[test]
fn prop_frame_encode_decode_preserves_frame() {
    proptest!(|(frame in arbitrary_frame())| {
        let mut buf = Vec::new();
        frame.encode(&mut buf).expect("encode should succeed");

        prop_assert_eq!(buf.len(), frame.encoded_len());

        let decoded = Frame::decode(&buf).expect("decode should succeed");
        prop_assert_eq!(decoded, frame);
    });
}

#[test]
fn prop_truncated_frame_is_rejected() {
    proptest!(|(frame in arbitrary_frame(), cut in 1usize..64)| {
        prop_assume!(!frame.payload.is_empty());

        let mut buf = Vec::new();
        frame.encode(&mut buf).expect("encode should succeed");
        let cut = cut.min(frame.payload.len());
        buf.truncate(buf.len() - cut);

        let is_truncated = matches!(Frame::decode(&buf), Err(ProtocolError::FrameTruncated { .. }));
        prop_assert!(is_truncated);
    });
}

#[test]
fn prop_arbitrary_bytes_never_panic() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..256))| {
        if let Ok(frame) = Frame::decode(&bytes) {
            let _ = Payload::from_frame(&frame);
        }
    });
}

#[test]
fn prop_arbitrary_payload_bytes_never_panic() {
    proptest!(|(
        opcode in arbitrary_opcode(),
        bytes in prop::collection::vec(any::<u8>(), 0..512)
    )| {
        let _ = Payload::decode(opcode, &bytes);
    });
}

#[test]
fn prop_send_message_survives_framing() {
    proptest!(|(
        conversation in any::<[u8; 32]>(),
        correlation in any::<[u8; 16]>(),
        ciphertext in prop::collection::vec(any::<u8>(), 1..2048),
        nonce in any::<[u8; 12]>(),
        epoch in proptest::option::of(any::<u64>()),
    )| {
        let payload = Payload::SendMessage(OutboundMessage {
            conversation_id: ConversationId(conversation),
            envelope: Envelope { ciphertext, nonce },
            correlation_id: CorrelationId(correlation),
            epoch,
            recipients: Vec::new(),
        });

        let frame = payload.clone().into_frame().expect("encode should succeed");
        let mut buf = Vec::new();
        frame.encode(&mut buf).expect("frame within limits");

        let decoded = Payload::from_frame(&Frame::decode(&buf).expect("decode should succeed"))
            .expect("payload should decode");
        prop_assert_eq!(decoded, payload);
    });
}

#[test]
fn oversized_size_field_rejected_before_payload() {
    let mut bytes = FrameHeader::new(Opcode::SendMessage).to_bytes();
    bytes[8..12].copy_from_slice(&(FrameHeader::MAX_PAYLOAD_SIZE + 1).to_be_bytes());

    assert!(matches!(Frame::decode(&bytes), Err(ProtocolError::PayloadTooLarge { .. })));
}

#[test]
fn wrong_magic_rejected() {
    let mut bytes = FrameHeader::new(Opcode::Ping).to_bytes();
    bytes[0] = b'X';

    assert!(matches!(Frame::decode(&bytes), Err(ProtocolError::InvalidMagic)));
}
