//! Frame type combining header and payload.
//!
//! A `Frame` is `[FrameHeader: 12 bytes] + [payload: CBOR bytes]`. It is a
//! pure data holder; see [`crate::Payload::into_frame`] and
//! [`crate::Payload::from_frame`] for the typed view.

use bytes::{BufMut, Bytes};

use crate::{
    FrameHeader,
    errors::{ProtocolError, Result},
};

/// Complete protocol frame.
///
/// # Invariants
///
/// - `payload.len()` equals `header.payload_size()`. Enforced by
///   [`Frame::new`] and checked again by [`Frame::decode`].
/// - `payload.len()` never exceeds [`FrameHeader::MAX_PAYLOAD_SIZE`] on the
///   wire. Oversized frames can be built but [`Frame::encode`] refuses them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,

    /// Raw payload bytes (CBOR-encoded)
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame, setting the header's payload size from `payload`.
    ///
    /// Payloads larger than `u32::MAX` saturate the size field, which then
    /// fails the limit check in [`Frame::encode`].
    #[must_use]
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let payload_len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        header.payload_size = payload_len.to_be_bytes();

        Self { header, payload }
    }

    /// Total encoded length (header plus payload).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FrameHeader::SIZE + self.payload.len()
    }

    /// Encode the frame into `dst`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if the payload exceeds
    ///   [`FrameHeader::MAX_PAYLOAD_SIZE`]
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        debug_assert_eq!(self.payload.len(), self.header.payload_size() as usize);

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode a frame from wire bytes. Trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// - Header errors from [`FrameHeader::from_bytes`]
    /// - `ProtocolError::FrameTruncated` if fewer payload bytes are present
    ///   than the header claims
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;

        let payload_size = header.payload_size() as usize;
        let total_size = FrameHeader::SIZE + payload_size;

        let Some(payload) = bytes.get(FrameHeader::SIZE..total_size) else {
            return Err(ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            });
        };

        Ok(Self { header: *header, payload: Bytes::copy_from_slice(payload) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Opcode;

    #[test]
    fn frame_with_payload() {
        let frame = Frame::new(FrameHeader::new(Opcode::SendMessage), vec![1, 2, 3, 4]);
        assert_eq!(frame.header.payload_size(), 4);
        assert_eq!(frame.encoded_len(), FrameHeader::SIZE + 4);

        let mut wire = Vec::new();
        frame.encode(&mut wire).expect("should encode");

        let parsed = Frame::decode(&wire).expect("should decode");
        assert_eq!(frame, parsed);
    }

    #[test]
    fn reject_truncated_frame() {
        let frame = Frame::new(FrameHeader::new(Opcode::SendMessage), vec![0u8; 100]);
        let mut wire = Vec::new();
        frame.encode(&mut wire).unwrap();

        let result = Frame::decode(&wire[..FrameHeader::SIZE + 10]);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTruncated { expected: 100, actual: 10 })
        ));
    }

    #[test]
    fn refuse_to_encode_oversized_payload() {
        let payload = vec![0u8; FrameHeader::MAX_PAYLOAD_SIZE as usize + 1];
        let frame = Frame::new(FrameHeader::new(Opcode::SendMessage), payload);

        let mut wire = Vec::new();
        assert!(matches!(frame.encode(&mut wire), Err(ProtocolError::PayloadTooLarge { .. })));
        assert!(wire.is_empty());
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let frame = Frame::new(FrameHeader::new(Opcode::Ping), Vec::new());
        let mut wire = Vec::new();
        frame.encode(&mut wire).unwrap();
        wire.extend_from_slice(b"garbage");

        let parsed = Frame::decode(&wire).unwrap();
        assert!(parsed.payload.is_empty());
    }
}
