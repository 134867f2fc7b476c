//! Fuzz target for Frame::decode
//!
//! Feeds arbitrary bytes to the frame decoder looking for:
//! - Parser panics
//! - Integer overflows in size calculations
//! - Buffer over-reads
//! - Headers that bypass the magic, version or size checks
//!
//! The decoder must never panic; invalid input returns an error.

#![no_main]

use hush_proto::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = Frame::decode(data) else {
        return;
    };

    // Accepted frames re-encode to exactly the bytes they came from.
    let mut wire = Vec::with_capacity(frame.encoded_len());
    if frame.encode(&mut wire).is_ok() {
        assert_eq!(wire.as_slice(), &data[..frame.encoded_len()]);
    }
});
