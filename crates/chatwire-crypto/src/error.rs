//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// HMAC tag did not verify
    #[error("message authentication code mismatch")]
    MacMismatch,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Handshake aborted (authentication failure or rejected peer)
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake step invoked out of order
    #[error("invalid state for operation")]
    InvalidState,

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Nonce overflow (counter exhausted)
    #[error("nonce counter exhausted, rekey required")]
    NonceOverflow,

    /// Ratchet counter already consumed
    #[error("duplicate or expired message counter {0}")]
    DuplicateMessage(u32),

    /// Ratchet counter too far ahead of the receiving chain
    #[error("message counter {counter} exceeds skip limit (current {current})")]
    TooManySkipped {
        /// Counter carried by the message
        counter: u32,
        /// Next expected receiving counter
        current: u32,
    },

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Invalid key material (corrupted or wrong format)
    #[error("invalid key material")]
    InvalidKeyMaterial,
}

impl CryptoError {
    /// Returns true if this error means an authentication check failed.
    ///
    /// These are never recovered from: the frame or message is dropped.
    #[must_use]
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::DecryptionFailed | Self::MacMismatch | Self::HandshakeFailed(_)
        )
    }
}
