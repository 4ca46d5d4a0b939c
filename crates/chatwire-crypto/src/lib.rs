//! # chatwire Crypto
//!
//! Cryptographic primitives for the chatwire session layer.
//!
//! This crate provides:
//! - `Noise_XX_25519_AESGCM_SHA256` handshake producing directional transport keys
//! - HKDF-SHA256 used by the handshake, the ratchet and media key expansion
//! - A symmetric chain-key ratchet for per-message keys
//! - Encrypt-then-MAC media encryption
//! - Password-based encryption of key files (Argon2id + XChaCha20-Poly1305)
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | Transport AEAD | AES-256-GCM | 256-bit key |
//! | Message / Media | AES-256-CBC + HMAC-SHA256 | 256-bit key |
//! | Hash | SHA-256 | 128-bit collision |
//! | KDF | HKDF-SHA256 | 128-bit |
//! | Signatures | Ed25519 | 128-bit |
//! | Key Encryption | Argon2id + XChaCha20-Poly1305 | 256-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod cbc;
pub mod constant_time;
pub mod encrypted_keys;
pub mod error;
pub mod hash;
pub mod media;
pub mod noise;
pub mod random;
pub mod ratchet;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// AES-256 key size
pub const AES_KEY_SIZE: usize = 32;

/// AES-GCM nonce size
pub const GCM_NONCE_SIZE: usize = 12;

/// AES-GCM tag size
pub const GCM_TAG_SIZE: usize = 16;

/// AES block size, also the CBC IV size
pub const AES_BLOCK_SIZE: usize = 16;

/// SHA-256 output size
pub const SHA256_OUTPUT_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// Directional keys produced by a completed handshake.
///
/// `send_key` encrypts frames this side writes, `recv_key` decrypts frames
/// the peer writes. Both sides derive the same pair with roles swapped.
#[derive(zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct TransportKeys {
    /// Key for sending data
    pub send_key: [u8; 32],
    /// Key for receiving data
    pub recv_key: [u8; 32],
    /// Final transcript hash, usable as a channel binding
    pub handshake_hash: [u8; 32],
}

impl TransportKeys {
    /// Build the two cipher states for this side of the connection.
    #[must_use]
    pub fn into_cipher_states(self) -> (aead::CipherState, aead::CipherState) {
        (
            aead::CipherState::new(aead::AeadKey::new(self.send_key)),
            aead::CipherState::new(aead::AeadKey::new(self.recv_key)),
        )
    }
}
