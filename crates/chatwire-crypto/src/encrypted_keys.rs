//! # Passphrase-encrypted key files
//!
//! Wraps serialized key material (identity, prekeys) for storage at rest.
//!
//! - **Key Derivation:** Argon2id with configurable parameters
//! - **Encryption:** XChaCha20-Poly1305 AEAD
//! - **Memory Safety:** derived keys and decrypted contents are zeroized
//!
//! ## File Format
//!
//! ```text
//! +----------------+----------------+----------------+
//! | Version (1B)   | Argon2 (6B)    | Salt (32B)     |
//! +----------------+----------------+----------------+
//! | Nonce (24B)    | Ciphertext (N + 16B tag)        |
//! +----------------+---------------------------------+
//! ```

use argon2::{Algorithm, Argon2, Params, ParamsBuilder, Version};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;
use crate::random::fill_random;

/// Current format version.
const FORMAT_VERSION: u8 = 1;

const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
const PARAMS_SIZE: usize = 6;
const HEADER_SIZE: usize = 1 + PARAMS_SIZE + SALT_SIZE + NONCE_SIZE;

/// Argon2id cost parameters.
///
/// Defaults follow OWASP guidance: 64 MiB, 4 iterations, 4 lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEncryptionParams {
    /// Memory cost in KiB
    pub memory_cost_kib: u32,
    /// Number of iterations
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KeyEncryptionParams {
    fn default() -> Self {
        Self {
            memory_cost_kib: 65536,
            iterations: 4,
            parallelism: 4,
        }
    }
}

impl KeyEncryptionParams {
    /// Cheap parameters for tests. Not for production use.
    #[must_use]
    pub fn low_security() -> Self {
        Self {
            memory_cost_kib: 4096,
            iterations: 2,
            parallelism: 1,
        }
    }

    fn validate(&self) -> Result<(), CryptoError> {
        if self.memory_cost_kib < 8 {
            return Err(CryptoError::InvalidParameter(
                "memory_cost_kib must be at least 8 KiB".into(),
            ));
        }
        if self.memory_cost_kib >= 1 << 24 {
            return Err(CryptoError::InvalidParameter(
                "memory_cost_kib must fit in 24 bits".into(),
            ));
        }
        if self.iterations < 1 || self.iterations > u32::from(u16::MAX) {
            return Err(CryptoError::InvalidParameter(
                "iterations must be between 1 and 65535".into(),
            ));
        }
        if self.parallelism < 1 || self.parallelism > 255 {
            return Err(CryptoError::InvalidParameter(
                "parallelism must be between 1 and 255".into(),
            ));
        }
        Ok(())
    }

    fn argon2_params(&self) -> Result<Params, CryptoError> {
        self.validate()?;
        ParamsBuilder::new()
            .m_cost(self.memory_cost_kib)
            .t_cost(self.iterations)
            .p_cost(self.parallelism)
            .build()
            .map_err(|e| CryptoError::InvalidParameter(format!("Argon2 params: {e}")))
    }

    fn to_bytes(self) -> [u8; PARAMS_SIZE] {
        let mut bytes = [0u8; PARAMS_SIZE];
        bytes[0..3].copy_from_slice(&self.memory_cost_kib.to_le_bytes()[0..3]);
        bytes[3..5].copy_from_slice(&(self.iterations as u16).to_le_bytes());
        bytes[5] = self.parallelism as u8;
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            memory_cost_kib: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            iterations: u32::from(u16::from_le_bytes([bytes[3], bytes[4]])),
            parallelism: u32::from(bytes[5]),
        }
    }
}

/// Passphrase-encrypted blob with its KDF parameters.
#[derive(Clone)]
pub struct EncryptedKeyFile {
    params: KeyEncryptionParams,
    salt: [u8; SALT_SIZE],
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl EncryptedKeyFile {
    /// Encrypt `contents` under `passphrase`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are invalid, randomness is
    /// unavailable or encryption fails.
    pub fn encrypt(
        contents: &[u8],
        passphrase: &[u8],
        params: KeyEncryptionParams,
    ) -> Result<Self, CryptoError> {
        params.validate()?;

        let mut salt = [0u8; SALT_SIZE];
        fill_random(&mut salt)?;
        let mut nonce = [0u8; NONCE_SIZE];
        fill_random(&mut nonce)?;

        let derived_key = derive_key(passphrase, &salt, &params)?;
        let cipher = XChaCha20Poly1305::new_from_slice(derived_key.as_slice())
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), contents)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(Self {
            params,
            salt,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt with `passphrase`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] for a wrong passphrase or
    /// tampered file.
    pub fn decrypt(&self, passphrase: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let derived_key = derive_key(passphrase, &self.salt, &self.params)?;
        let cipher = XChaCha20Poly1305::new_from_slice(derived_key.as_slice())
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        cipher
            .decrypt(XNonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Serialize for storage.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&self.params.to_bytes());
        bytes.extend_from_slice(&self.salt);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parse the stored form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] when truncated and
    /// [`CryptoError::InvalidParameter`] for an unknown version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < HEADER_SIZE + TAG_SIZE {
            return Err(CryptoError::InvalidKeyMaterial);
        }
        if bytes[0] != FORMAT_VERSION {
            return Err(CryptoError::InvalidParameter(format!(
                "unsupported format version: {}",
                bytes[0]
            )));
        }

        let params = KeyEncryptionParams::from_bytes(&bytes[1..1 + PARAMS_SIZE]);
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[1 + PARAMS_SIZE..1 + PARAMS_SIZE + SALT_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[1 + PARAMS_SIZE + SALT_SIZE..HEADER_SIZE]);

        Ok(Self {
            params,
            salt,
            nonce,
            ciphertext: bytes[HEADER_SIZE..].to_vec(),
        })
    }

    /// Argon2 parameters this file was written with.
    #[must_use]
    pub fn params(&self) -> &KeyEncryptionParams {
        &self.params
    }
}

fn derive_key(
    passphrase: &[u8],
    salt: &[u8; SALT_SIZE],
    params: &KeyEncryptionParams,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.argon2_params()?);

    let mut derived_key = Zeroizing::new([0u8; 32]);
    if argon2
        .hash_password_into(passphrase, salt, derived_key.as_mut())
        .is_err()
    {
        derived_key.zeroize();
        return Err(CryptoError::KeyDerivationFailed);
    }
    Ok(derived_key)
}
