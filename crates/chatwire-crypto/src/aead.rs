//! AES-256-GCM AEAD encryption.
//!
//! Used for two things:
//! - the handshake cipher, keyed by `mix_key` and bound to the transcript
//!   hash through the associated data
//! - post-handshake transport frames, one [`CipherState`] per direction
//!
//! Nonces are never random: they are the Noise counter layout
//! `0u32 || counter u64 BE`, so a key must never be reused across
//! independent counters.

use crate::CryptoError;
use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, KeyInit, Payload},
};
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// AES-GCM nonce size (12 bytes / 96 bits).
pub const NONCE_SIZE: usize = 12;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce (12 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a slice.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; NONCE_SIZE] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Generate a random nonce.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a nonce from a counter value.
    ///
    /// Four zero bytes followed by the counter in big-endian.
    #[must_use]
    pub fn from_counter(counter: u64) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[4..].copy_from_slice(&counter.to_be_bytes());
        Self(bytes)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// AEAD encryption key (32 bytes).
///
/// Key is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with extreme care - this exposes the raw key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: self.0.len(),
        })
    }

    /// Encrypt plaintext with associated data.
    ///
    /// Returns ciphertext with appended authentication tag (`plaintext.len()` + 16 bytes).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher()?
            .encrypt(
                aes_gcm::Nonce::from_slice(&nonce.0),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext with associated data.
    ///
    /// Input must include the authentication tag at the end.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        ciphertext_and_tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_and_tag.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        self.cipher()?
            .decrypt(
                aes_gcm::Nonce::from_slice(&nonce.0),
                Payload {
                    msg: ciphertext_and_tag,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// One direction of an encrypted channel.
///
/// Holds a key and the implicit nonce counter. Each encrypt or decrypt
/// consumes one counter value; sender and receiver stay in lockstep because
/// the transport delivers frames in order.
#[derive(ZeroizeOnDrop)]
pub struct CipherState {
    key: AeadKey,
    #[zeroize(skip)]
    counter: u64,
    #[zeroize(skip)]
    max_counter: u64,
}

impl CipherState {
    /// Create a cipher state with the counter at zero.
    #[must_use]
    pub fn new(key: AeadKey) -> Self {
        Self {
            key,
            counter: 0,
            max_counter: u64::MAX,
        }
    }

    /// Lower the counter ceiling. Mostly useful for tests.
    #[must_use]
    pub fn with_max_counter(mut self, max_counter: u64) -> Self {
        self.max_counter = max_counter;
        self
    }

    /// Current nonce counter.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Encrypt with the next counter nonce.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::NonceOverflow` once the counter is exhausted.
    pub fn encrypt_with_ad(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce()?;
        self.key.encrypt(&nonce, plaintext, aad)
    }

    /// Decrypt with the next counter nonce.
    ///
    /// The counter only advances when authentication succeeds, so a forged
    /// frame does not desynchronize the channel.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure and
    /// `CryptoError::NonceOverflow` once the counter is exhausted.
    pub fn decrypt_with_ad(
        &mut self,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if self.counter >= self.max_counter {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = Nonce::from_counter(self.counter);
        let plaintext = self.key.decrypt(&nonce, ciphertext, aad)?;
        self.counter += 1;
        Ok(plaintext)
    }

    fn next_nonce(&mut self) -> Result<Nonce, CryptoError> {
        if self.counter >= self.max_counter {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = Nonce::from_counter(self.counter);
        self.counter += 1;
        Ok(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use proptest::prelude::*;

    #[test]
    fn test_aead_roundtrip() {
        let key = AeadKey::generate(&mut OsRng);
        let nonce = Nonce::generate(&mut OsRng);

        let ciphertext = key.encrypt(&nonce, b"hello", b"aad").unwrap();
        assert_eq!(ciphertext.len(), 5 + TAG_SIZE);

        let plaintext = key.decrypt(&nonce, &ciphertext, b"aad").unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_aead_wrong_aad_fails() {
        let key = AeadKey::generate(&mut OsRng);
        let nonce = Nonce::from_counter(0);

        let ciphertext = key.encrypt(&nonce, b"payload", b"transcript-a").unwrap();
        assert_eq!(
            key.decrypt(&nonce, &ciphertext, b"transcript-b"),
            Err(CryptoError::DecryptionFailed)
        );
    }

    proptest! {
        #[test]
        fn prop_aead_roundtrip_any_input(
            key in any::<[u8; 32]>(),
            counter in any::<u64>(),
            plaintext in prop::collection::vec(any::<u8>(), 0..1024),
            aad in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let key = AeadKey::new(key);
            let nonce = Nonce::from_counter(counter);
            let ciphertext = key.encrypt(&nonce, &plaintext, &aad).unwrap();
            prop_assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);
            prop_assert_eq!(key.decrypt(&nonce, &ciphertext, &aad).unwrap(), plaintext);
        }

        #[test]
        fn prop_aead_any_bit_flip_rejected(
            plaintext in prop::collection::vec(any::<u8>(), 0..256),
            flip in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let key = AeadKey::new([0x42; 32]);
            let nonce = Nonce::from_counter(7);
            let mut ciphertext = key.encrypt(&nonce, &plaintext, b"ad").unwrap();
            let i = flip.index(ciphertext.len());
            ciphertext[i] ^= 1 << bit;
            prop_assert_eq!(
                key.decrypt(&nonce, &ciphertext, b"ad"),
                Err(CryptoError::DecryptionFailed)
            );
        }

        #[test]
        fn prop_cipher_states_stay_in_step(
            key in any::<[u8; 32]>(),
            frames in prop::collection::vec(
                prop::collection::vec(any::<u8>(), 0..128),
                1..32,
            ),
        ) {
            let mut send = CipherState::new(AeadKey::new(key));
            let mut recv = CipherState::new(AeadKey::new(key));
            for frame in &frames {
                let sealed = send.encrypt_with_ad(&[], frame).unwrap();
                prop_assert_eq!(&recv.decrypt_with_ad(&[], &sealed).unwrap(), frame);
            }
            prop_assert_eq!(send.counter(), frames.len() as u64);
            prop_assert_eq!(recv.counter(), frames.len() as u64);
        }
    }

    #[test]
    fn test_aead_short_ciphertext_rejected() {
        let key = AeadKey::new([7u8; 32]);
        let nonce = Nonce::from_counter(0);
        assert!(key.decrypt(&nonce, &[0u8; 15], b"").is_err());
    }

    #[test]
    fn test_nonce_counter_layout() {
        let nonce = Nonce::from_counter(0x0102_0304_0506_0708);
        assert_eq!(
            nonce.as_bytes(),
            &[0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_key_from_slice_length() {
        assert!(AeadKey::from_slice(&[0u8; 31]).is_err());
        assert!(AeadKey::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_cipher_state_lockstep() {
        let key = [0x42u8; 32];
        let mut sender = CipherState::new(AeadKey::new(key));
        let mut receiver = CipherState::new(AeadKey::new(key));

        for i in 0..5u8 {
            let ct = sender.encrypt_with_ad(b"", &[i; 10]).unwrap();
            let pt = receiver.decrypt_with_ad(b"", &ct).unwrap();
            assert_eq!(pt, vec![i; 10]);
        }
        assert_eq!(sender.counter(), 5);
        assert_eq!(receiver.counter(), 5);
    }

    #[test]
    fn test_cipher_state_forgery_does_not_advance() {
        let key = [0x11u8; 32];
        let mut sender = CipherState::new(AeadKey::new(key));
        let mut receiver = CipherState::new(AeadKey::new(key));

        let mut ct = sender.encrypt_with_ad(b"", b"frame").unwrap();
        ct[0] ^= 0x01;
        assert!(receiver.decrypt_with_ad(b"", &ct).is_err());
        assert_eq!(receiver.counter(), 0);

        ct[0] ^= 0x01;
        assert_eq!(receiver.decrypt_with_ad(b"", &ct).unwrap(), b"frame");
    }

    #[test]
    fn test_cipher_state_overflow() {
        let mut state = CipherState::new(AeadKey::new([0u8; 32])).with_max_counter(2);
        state.encrypt_with_ad(b"", b"a").unwrap();
        state.encrypt_with_ad(b"", b"b").unwrap();
        assert_eq!(
            state.encrypt_with_ad(b"", b"c"),
            Err(CryptoError::NonceOverflow)
        );
    }
}
