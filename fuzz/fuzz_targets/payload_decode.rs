//! Fuzz target for Payload::from_frame
//!
//! Decodes arbitrary bytes as the body of every known opcode:
//! - Malformed CBOR
//! - Type confusion (a body meant for another opcode)
//! - Oversized strings, envelopes and collections
//! - Identifier validation bypasses
//!
//! Decoding must never panic; invalid input returns an error.

#![no_main]

use bytes::Bytes;
use hush_proto::{Frame, FrameHeader, Opcode, Payload};
use libfuzzer_sys::fuzz_target;

const OPCODES: [Opcode; 22] = [
    Opcode::Authenticate,
    Opcode::AuthGranted,
    Opcode::AuthDenied,
    Opcode::Hello,
    Opcode::HelloReply,
    Opcode::Ping,
    Opcode::Pong,
    Opcode::Heartbeat,
    Opcode::Goodbye,
    Opcode::Error,
    Opcode::Subscribe,
    Opcode::Unsubscribe,
    Opcode::SubscribeSelf,
    Opcode::SendMessage,
    Opcode::History,
    Opcode::Subscribed,
    Opcode::Unsubscribed,
    Opcode::SelfSubscribed,
    Opcode::Message,
    Opcode::Ack,
    Opcode::HistoryPage,
    Opcode::Expired,
];

fuzz_target!(|data: &[u8]| {
    for opcode in OPCODES {
        let frame = Frame::new(FrameHeader::new(opcode), Bytes::copy_from_slice(data));

        // Whatever decodes must survive a trip back onto the wire.
        if let Ok(payload) = Payload::from_frame(&frame) {
            assert_eq!(payload.opcode(), opcode);
            let _ = payload.into_frame();
        }
    }
});
