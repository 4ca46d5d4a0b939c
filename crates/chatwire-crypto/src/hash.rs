//! SHA-256 hashing, HMAC-SHA256 and HKDF-SHA256 (RFC 5869).
//!
//! HKDF is the shared derivation primitive: the handshake's `mix_key`,
//! ratchet message keys and media key expansion all go through it, each
//! with its own `info` string so the contexts never collide.

use crate::CryptoError;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// SHA-256 output (32 bytes).
pub type HashOutput = [u8; 32];

type HmacSha256 = Hmac<Sha256>;

/// Compute the SHA-256 hash of input data.
#[must_use]
pub fn sha256(data: &[u8]) -> HashOutput {
    Sha256::digest(data).into()
}

/// Compute SHA-256 over the concatenation of several parts.
#[must_use]
pub fn sha256_concat(parts: &[&[u8]]) -> HashOutput {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Compute HMAC-SHA256.
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> HashOutput {
    hmac_sha256_concat(key, &[data])
}

/// Compute HMAC-SHA256 over the concatenation of several parts.
#[must_use]
pub fn hmac_sha256_concat(key: &[u8], parts: &[&[u8]]) -> HashOutput {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC accepts keys of any length");
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// HKDF-Extract: derive a pseudorandom key from input key material.
///
/// An empty salt is treated as 32 zero bytes, per RFC 5869.
#[must_use]
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> HashOutput {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let (prk, _) = Hkdf::<Sha256>::extract(salt, ikm);
    prk.into()
}

/// HKDF-Expand: expand a pseudorandom key into `output.len()` bytes.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if more than 255 blocks
/// (8160 bytes) are requested.
pub fn hkdf_expand(prk: &HashOutput, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::from_prk(prk).map_err(|_| CryptoError::KeyDerivationFailed)?;
    hk.expand(info, output)
        .map_err(|_| CryptoError::KeyDerivationFailed)
}

/// Full HKDF: extract then expand.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if the output is too long.
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, output)
        .map_err(|_| CryptoError::KeyDerivationFailed)
}

/// HKDF into two 32-byte outputs, the shape Noise `mix_key` and `split` use.
///
/// # Errors
///
/// Never fails in practice; the signature mirrors [`hkdf`].
pub fn hkdf_pair(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<(HashOutput, HashOutput), CryptoError> {
    let mut okm = [0u8; 64];
    hkdf(salt, ikm, info, &mut okm)?;
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    zeroize::Zeroize::zeroize(&mut okm);
    Ok((first, second))
}
