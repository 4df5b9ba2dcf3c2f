//! NIP-44 v2 payload encryption
//!
//! Every NIP-46 envelope passes through this layer. The construction is
//! ECDH + HKDF for keys, ChaCha20 as an unauthenticated stream cipher,
//! HMAC-SHA256 over `nonce || ciphertext`, and length-bucketed padding.
//!
//! Wire format: `base64(version(1) || nonce(32) || ciphertext(N) || mac(32))`

pub mod cipher;
pub mod keys;
pub mod padding;

pub use cipher::{decrypt, encrypt};
pub use keys::ConversationKey;

/// Errors raised by the NIP-44 layer.
///
/// Format errors describe malformed input and are safe to report verbatim.
/// `InvalidMac` and `InvalidPadding` are integrity errors: the payload was
/// tampered with or encrypted under a different key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Nip44Error {
    #[error("invalid plaintext length: {0}")]
    InvalidPlaintextLength(usize),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid conversation key length: {0}")]
    InvalidConversationKeyLength(usize),
    #[error("invalid nonce length: {0}")]
    InvalidNonceLength(usize),
    #[error("unsupported encryption version")]
    UnsupportedVersion,
    #[error("invalid base64")]
    InvalidBase64,
    #[error("invalid payload size: {0}")]
    InvalidPayloadSize(usize),
    #[error("unknown version: {0}")]
    UnknownVersion(u8),
    #[error("invalid MAC")]
    InvalidMac,
    #[error("invalid padding")]
    InvalidPadding,
}

impl Nip44Error {
    /// True for tampering / wrong-key failures, false for format errors.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Nip44Error::InvalidMac | Nip44Error::InvalidPadding)
    }
}
