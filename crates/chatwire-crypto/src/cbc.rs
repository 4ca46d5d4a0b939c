//! AES-256-CBC with PKCS#7 padding.
//!
//! Unauthenticated on its own. Callers must MAC the IV and ciphertext and
//! verify that MAC before calling [`decrypt`]; see the ratchet and media
//! modules.

use crate::{AES_BLOCK_SIZE, AES_KEY_SIZE, CryptoError};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypt `plaintext` under `key` and `iv`.
#[must_use]
pub fn encrypt(key: &[u8; AES_KEY_SIZE], iv: &[u8; AES_BLOCK_SIZE], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt `ciphertext` under `key` and `iv`.
///
/// # Errors
///
/// Returns [`CryptoError::DecryptionFailed`] if the length is not a whole
/// number of blocks or the padding is invalid.
pub fn decrypt(
    key: &[u8; AES_KEY_SIZE],
    iv: &[u8; AES_BLOCK_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::DecryptionFailed);
    }
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbc_roundtrip_and_padding() {
        let key = [3u8; 32];
        let iv = [4u8; 16];

        for len in [0usize, 1, 15, 16, 17, 100] {
            let plaintext = vec![0x5Au8; len];
            let ciphertext = encrypt(&key, &iv, &plaintext);
            assert_eq!(ciphertext.len(), (len / 16 + 1) * 16);
            assert_eq!(decrypt(&key, &iv, &ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        assert!(decrypt(&[0u8; 32], &[0u8; 16], &[0u8; 17]).is_err());
        assert!(decrypt(&[0u8; 32], &[0u8; 16], &[]).is_err());
    }
}
