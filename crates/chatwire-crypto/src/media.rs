//! Media blob encryption.
//!
//! A random 32-byte media key is expanded with HKDF-SHA256 under a
//! per-type info string into:
//!
//! ```text
//! iv(16) || cipher_key(32) || mac_key(32) || ref_key(32)
//! ```
//!
//! The blob is AES-256-CBC encrypted, and the uploaded file is
//! `ciphertext || HMAC-SHA256(mac_key, iv || ciphertext)[..10]`. The MAC is
//! verified in constant time before any decryption is attempted.

use crate::constant_time::ct_eq;
use crate::hash;
use crate::{AES_BLOCK_SIZE, CryptoError, cbc, random};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the truncated media MAC appended to the ciphertext.
pub const MEDIA_MAC_SIZE: usize = 10;

/// Length of a media key.
pub const MEDIA_KEY_SIZE: usize = 32;

const EXPANDED_SIZE: usize = 112;

/// Kind of media; each kind has its own key-derivation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// Still images and stickers
    Image,
    /// Video and GIFs
    Video,
    /// Audio and voice notes
    Audio,
    /// Arbitrary documents
    Document,
}

impl MediaType {
    /// HKDF info string for this type.
    #[must_use]
    pub fn info(self) -> &'static [u8] {
        match self {
            Self::Image => b"WhatsApp Image Keys",
            Self::Video => b"WhatsApp Video Keys",
            Self::Audio => b"WhatsApp Audio Keys",
            Self::Document => b"WhatsApp Document Keys",
        }
    }
}

/// Subkeys expanded from one media key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MediaKeys {
    iv: [u8; AES_BLOCK_SIZE],
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
    ref_key: [u8; 32],
}

impl MediaKeys {
    /// Expand a media key for `media_type`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivationFailed`] if HKDF fails.
    pub fn expand(media_key: &[u8; MEDIA_KEY_SIZE], media_type: MediaType) -> Result<Self, CryptoError> {
        let mut okm = [0u8; EXPANDED_SIZE];
        hash::hkdf(b"", media_key, media_type.info(), &mut okm)?;

        let mut keys = Self {
            iv: [0u8; AES_BLOCK_SIZE],
            cipher_key: [0u8; 32],
            mac_key: [0u8; 32],
            ref_key: [0u8; 32],
        };
        keys.iv.copy_from_slice(&okm[..16]);
        keys.cipher_key.copy_from_slice(&okm[16..48]);
        keys.mac_key.copy_from_slice(&okm[48..80]);
        keys.ref_key.copy_from_slice(&okm[80..]);
        okm.zeroize();
        Ok(keys)
    }

    /// Key used to reference the upload on the server side.
    #[must_use]
    pub fn ref_key(&self) -> &[u8; 32] {
        &self.ref_key
    }

    fn mac(&self, ciphertext: &[u8]) -> [u8; MEDIA_MAC_SIZE] {
        let full = hash::hmac_sha256_concat(&self.mac_key, &[&self.iv, ciphertext]);
        let mut mac = [0u8; MEDIA_MAC_SIZE];
        mac.copy_from_slice(&full[..MEDIA_MAC_SIZE]);
        mac
    }
}

/// Result of encrypting a media blob.
pub struct EncryptedMedia {
    /// Random media key to share with the recipient
    pub media_key: [u8; MEDIA_KEY_SIZE],
    /// `ciphertext || mac`, the bytes to upload
    pub data: Vec<u8>,
    /// SHA-256 of the plaintext
    pub file_sha256: [u8; 32],
    /// SHA-256 of `data`
    pub file_enc_sha256: [u8; 32],
}

impl Drop for EncryptedMedia {
    fn drop(&mut self) {
        self.media_key.zeroize();
    }
}

/// Encrypt `plaintext` under a fresh random media key.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if no key can be generated.
pub fn encrypt_media(plaintext: &[u8], media_type: MediaType) -> Result<EncryptedMedia, CryptoError> {
    let media_key = random::random_32()?;
    encrypt_media_with_key(&media_key, plaintext, media_type)
}

/// Encrypt `plaintext` under a caller-supplied media key.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if expansion fails.
pub fn encrypt_media_with_key(
    media_key: &[u8; MEDIA_KEY_SIZE],
    plaintext: &[u8],
    media_type: MediaType,
) -> Result<EncryptedMedia, CryptoError> {
    let keys = MediaKeys::expand(media_key, media_type)?;
    let mut data = cbc::encrypt(&keys.cipher_key, &keys.iv, plaintext);
    let mac = keys.mac(&data);
    data.extend_from_slice(&mac);

    Ok(EncryptedMedia {
        media_key: *media_key,
        file_sha256: hash::sha256(plaintext),
        file_enc_sha256: hash::sha256(&data),
        data,
    })
}

/// Verify and decrypt an uploaded media blob.
///
/// # Errors
///
/// - [`CryptoError::InvalidMessage`] if the blob is too short
/// - [`CryptoError::MacMismatch`] if the MAC does not verify
/// - [`CryptoError::DecryptionFailed`] if the padding is invalid
pub fn decrypt_media(
    media_key: &[u8; MEDIA_KEY_SIZE],
    data: &[u8],
    media_type: MediaType,
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < AES_BLOCK_SIZE + MEDIA_MAC_SIZE {
        return Err(CryptoError::InvalidMessage(format!(
            "media blob too short: {} bytes",
            data.len()
        )));
    }
    let (ciphertext, mac) = data.split_at(data.len() - MEDIA_MAC_SIZE);

    let keys = MediaKeys::expand(media_key, media_type)?;
    if !ct_eq(&keys.mac(ciphertext), mac) {
        return Err(CryptoError::MacMismatch);
    }
    cbc::decrypt(&keys.cipher_key, &keys.iv, ciphertext)
}
