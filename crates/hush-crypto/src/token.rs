//! HMAC-authenticated session tokens.
//!
//! A token binds a participant id to an expiry and is only meaningful to the
//! relay that issued it. Format: `hex(participant).expires_at.hex(tag)`.

use hmac::{Hmac, Mac};
use hush_proto::ParticipantId;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    /// Participant the token was issued to
    pub participant_id: ParticipantId,
    /// Expiry, Unix seconds
    pub expires_at: u64,
}

/// Relay-held secret for signing session tokens.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TokenKey([u8; 32]);

impl TokenKey {
    /// Wrap raw secret bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Issue a token for `claims`.
    #[must_use]
    pub fn issue(&self, claims: &SessionClaims) -> String {
        let body = format!("{}.{}", hex::encode(claims.participant_id.as_str()), claims.expires_at);
        let tag = self.mac(body.as_bytes()).finalize().into_bytes();
        format!("{body}.{}", hex::encode(tag))
    }

    /// Check a token's tag and expiry.
    ///
    /// # Errors
    ///
    /// - `CryptoError::InvalidToken` if the token is malformed, the tag does
    ///   not verify or `now_secs` is at or past the expiry
    pub fn verify(&self, token: &str, now_secs: u64) -> Result<SessionClaims, CryptoError> {
        let (body, tag_hex) = token.rsplit_once('.').ok_or(CryptoError::InvalidToken)?;
        let tag = hex::decode(tag_hex).map_err(|_| CryptoError::InvalidToken)?;
        self.mac(body.as_bytes()).verify_slice(&tag).map_err(|_| CryptoError::InvalidToken)?;

        let (participant_hex, expiry) = body.split_once('.').ok_or(CryptoError::InvalidToken)?;
        let expires_at: u64 = expiry.parse().map_err(|_| CryptoError::InvalidToken)?;
        if now_secs >= expires_at {
            return Err(CryptoError::InvalidToken);
        }

        let participant = hex::decode(participant_hex).map_err(|_| CryptoError::InvalidToken)?;
        let participant = String::from_utf8(participant).map_err(|_| CryptoError::InvalidToken)?;
        let participant_id =
            ParticipantId::new(participant).map_err(|_| CryptoError::InvalidToken)?;

        Ok(SessionClaims { participant_id, expires_at })
    }

    fn mac(&self, body: &[u8]) -> HmacSha256 {
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&self.0) else {
            unreachable!("HMAC accepts keys of any length");
        };
        mac.update(body);
        mac
    }
}

/// Compare two byte strings in time independent of their contents.
///
/// Lengths are not secret: a length mismatch returns early.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}
