//! Frame header with zero-copy parsing.
//!
//! The header is a fixed 12-byte big-endian structure. The relay reads it
//! straight out of the receive buffer to learn the opcode and payload size,
//! which lets it reject garbage and oversized frames before allocating for
//! the payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    Opcode,
    errors::{ProtocolError, Result},
};

/// Fixed 12-byte frame header (big-endian network byte order)
///
/// ```text
/// 0       4    5    6        8              12
/// ┌───────┬────┬────┬────────┬──────────────┐
/// │ magic │ver │rsvd│ opcode │ payload_size │
/// └───────┴────┴────┴────────┴──────────────┘
/// ```
///
/// # Security
///
/// Every field is a byte array, so every 12-byte pattern is a valid value and
/// casting untrusted bytes cannot cause undefined behaviour. Structural
/// validation (magic, version, size) happens in [`FrameHeader::from_bytes`].
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    magic: [u8; 4],
    version: u8,
    reserved: u8,
    pub(crate) opcode: [u8; 2],
    pub(crate) payload_size: [u8; 4],
}

impl FrameHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 12;

    /// Magic number: "HUSH" in ASCII.
    pub const MAGIC: u32 = 0x4855_5348;

    /// Current protocol version.
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (128 KiB). Comfortably holds a maximum-size
    /// ciphertext plus its CBOR wrapping.
    pub const MAX_PAYLOAD_SIZE: u32 = 128 * 1024;

    /// Create a new header for `opcode` with an empty payload.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            reserved: 0,
            opcode: opcode.to_u16().to_be_bytes(),
            payload_size: [0; 4],
        }
    }

    /// Parse a header from the front of `bytes` without copying.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if fewer than 12 bytes are available
    /// - `ProtocolError::InvalidMagic` if the magic number is wrong
    /// - `ProtocolError::UnsupportedVersion` for any version but 1
    /// - `ProtocolError::PayloadTooLarge` if the claimed size exceeds
    ///   [`Self::MAX_PAYLOAD_SIZE`]
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize header to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Operation code as raw u16.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// Operation code as enum. `None` if unrecognized.
    #[must_use]
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }
}

impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("version", &self.version)
            .field("opcode", &format_args!("{:#06x}", self.opcode()))
            .field("payload_size", &self.payload_size())
            .finish()
    }
}

impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_header_parses_back() {
        let header = FrameHeader::new(Opcode::Ping);
        let bytes = header.to_bytes();

        let parsed = FrameHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.opcode_enum(), Some(Opcode::Ping));
        assert_eq!(parsed.payload_size(), 0);
        assert_eq!(parsed.version(), FrameHeader::VERSION);
    }

    #[test]
    fn reject_short_buffer() {
        let result = FrameHeader::from_bytes(&[0u8; 11]);
        assert!(matches!(result, Err(ProtocolError::FrameTooShort { expected: 12, actual: 11 })));
    }

    #[test]
    fn reject_bad_magic() {
        let mut bytes = FrameHeader::new(Opcode::Ping).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(FrameHeader::from_bytes(&bytes), Err(ProtocolError::InvalidMagic)));
    }

    #[test]
    fn reject_unknown_version() {
        let mut bytes = FrameHeader::new(Opcode::Ping).to_bytes();
        bytes[4] = 9;
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(ProtocolError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn reject_oversized_claim() {
        let mut bytes = FrameHeader::new(Opcode::SendMessage).to_bytes();
        bytes[8..12].copy_from_slice(&(FrameHeader::MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
