//! Symmetric chain-key ratchet for per-message keys.
//!
//! Each direction has a chain key. For every message:
//!
//! ```text
//! seed         = HMAC-SHA256(chain_key, 0x01)
//! message keys = HKDF-SHA256(salt = 0^32, seed, "chatwire message keys")[0..80]
//!              = cipher_key(32) || mac_key(32) || iv(16)
//! next chain   = HMAC-SHA256(chain_key, 0x02)
//! ```
//!
//! The old chain key is dropped (and zeroized) as soon as its successor is
//! stored, so compromise of the current state does not expose earlier
//! message keys. Messages are AES-256-CBC encrypted and authenticated with
//! HMAC-SHA256 over `version || counter || iv || ciphertext`; the tag is
//! checked in constant time before anything is decrypted.

use std::collections::BTreeMap;

use crate::constant_time::ct_eq;
use crate::hash;
use crate::noise::Role;
use crate::{AES_BLOCK_SIZE, CryptoError, cbc};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Largest forward jump a single decrypt will derive through.
pub const MAX_SKIP: u32 = 2000;

/// Upper bound on cached keys for skipped counters.
pub const MAX_SKIPPED_KEYS: usize = 2000;

/// Ratchet message format version.
pub const RATCHET_VERSION: u8 = 1;

/// HMAC tag size on ratchet messages.
pub const MAC_SIZE: usize = 32;

const HEADER_SIZE: usize = 1 + 4;
const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;
const MESSAGE_KEYS_INFO: &[u8] = b"chatwire message keys";
const CHAIN_SPLIT_INFO: &[u8] = b"chatwire ratchet chains";

/// Chain key for symmetric ratcheting
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    key: [u8; 32],
    #[zeroize(skip)]
    index: u32,
}

impl ChainKey {
    /// Create a chain key at `index`.
    #[must_use]
    pub fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    /// Counter of the message this chain key produces keys for.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Derive the next chain key: `HMAC(chain_key, 0x02)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceOverflow`] when the counter is exhausted.
    pub fn successor(&self) -> Result<Self, CryptoError> {
        let index = self.index.checked_add(1).ok_or(CryptoError::NonceOverflow)?;
        Ok(Self {
            key: hash::hmac_sha256(&self.key, &[CHAIN_KEY_SEED]),
            index,
        })
    }

    #[cfg(test)]
    fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Keys for exactly one message.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
    iv: [u8; AES_BLOCK_SIZE],
    #[zeroize(skip)]
    counter: u32,
}

impl MessageKeys {
    /// Counter these keys belong to.
    #[must_use]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Derived IV.
    #[must_use]
    pub fn iv(&self) -> &[u8; AES_BLOCK_SIZE] {
        &self.iv
    }

    fn tag(&self, counter: u32, iv: &[u8], ciphertext: &[u8]) -> [u8; MAC_SIZE] {
        hash::hmac_sha256_concat(
            &self.mac_key,
            &[&[RATCHET_VERSION], &counter.to_be_bytes(), iv, ciphertext],
        )
    }

    fn open(&self, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let expected = self.tag(message.counter, &message.iv, &message.ciphertext);
        if !ct_eq(&expected, &message.tag) || !ct_eq(&self.iv, &message.iv) {
            return Err(CryptoError::MacMismatch);
        }
        cbc::decrypt(&self.cipher_key, &self.iv, &message.ciphertext)
    }
}

/// Derive the message keys for `chain_key`'s counter.
///
/// One-way: the chain key cannot be recovered from the result.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if HKDF fails.
pub fn derive_message_keys(chain_key: &ChainKey) -> Result<MessageKeys, CryptoError> {
    let mut seed = hash::hmac_sha256(&chain_key.key, &[MESSAGE_KEY_SEED]);
    let mut okm = [0u8; 80];
    let derived = hash::hkdf(&[0u8; 32], &seed, MESSAGE_KEYS_INFO, &mut okm);
    seed.zeroize();
    derived?;

    let mut keys = MessageKeys {
        cipher_key: [0u8; 32],
        mac_key: [0u8; 32],
        iv: [0u8; AES_BLOCK_SIZE],
        counter: chain_key.index,
    };
    keys.cipher_key.copy_from_slice(&okm[..32]);
    keys.mac_key.copy_from_slice(&okm[32..64]);
    keys.iv.copy_from_slice(&okm[64..]);
    okm.zeroize();
    Ok(keys)
}

/// An encrypted ratchet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Sending-chain counter
    pub counter: u32,
    /// CBC IV (derived, carried for verification)
    pub iv: [u8; AES_BLOCK_SIZE],
    /// AES-256-CBC ciphertext
    pub ciphertext: Vec<u8>,
    /// HMAC-SHA256 tag
    pub tag: [u8; MAC_SIZE],
}

impl RatchetMessage {
    /// Serialize: `version || counter BE || iv || ciphertext || tag`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HEADER_SIZE + AES_BLOCK_SIZE + self.ciphertext.len() + MAC_SIZE);
        out.push(RATCHET_VERSION);
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parse the serialized form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMessage`] on truncation, a partial
    /// cipher block or an unknown version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        const MIN_SIZE: usize = HEADER_SIZE + AES_BLOCK_SIZE + AES_BLOCK_SIZE + MAC_SIZE;
        if bytes.len() < MIN_SIZE {
            return Err(CryptoError::InvalidMessage(format!(
                "ratchet message too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != RATCHET_VERSION {
            return Err(CryptoError::InvalidMessage(format!(
                "unsupported ratchet version {}",
                bytes[0]
            )));
        }

        let counter = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let mut iv = [0u8; AES_BLOCK_SIZE];
        iv.copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + AES_BLOCK_SIZE]);

        let tag_start = bytes.len() - MAC_SIZE;
        let ciphertext = bytes[HEADER_SIZE + AES_BLOCK_SIZE..tag_start].to_vec();
        if ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::InvalidMessage(
                "ciphertext is not a whole number of blocks".into(),
            ));
        }
        let mut tag = [0u8; MAC_SIZE];
        tag.copy_from_slice(&bytes[tag_start..]);

        Ok(Self {
            counter,
            iv,
            ciphertext,
            tag,
        })
    }
}

/// Sending and receiving chains for one peer.
///
/// Not synchronized: one owner mutates it at a time.
pub struct RatchetSession {
    sending: ChainKey,
    receiving: ChainKey,
    skipped: BTreeMap<u32, MessageKeys>,
    max_skip: u32,
}

impl RatchetSession {
    /// Create from explicit chain keys, both at counter 0.
    #[must_use]
    pub fn new(sending_chain_key: [u8; 32], receiving_chain_key: [u8; 32]) -> Self {
        Self {
            sending: ChainKey::new(sending_chain_key, 0),
            receiving: ChainKey::new(receiving_chain_key, 0),
            skipped: BTreeMap::new(),
            max_skip: MAX_SKIP,
        }
    }

    /// Seed both chains from a shared secret.
    ///
    /// The initiator's sending chain is the responder's receiving chain.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivationFailed`] if HKDF fails.
    pub fn from_shared_secret(secret: &[u8; 32], role: Role) -> Result<Self, CryptoError> {
        let (first, second) = hash::hkdf_pair(b"", secret, CHAIN_SPLIT_INFO)?;
        Ok(match role {
            Role::Initiator => Self::new(first, second),
            Role::Responder => Self::new(second, first),
        })
    }

    /// Override the forward-skip bound.
    #[must_use]
    pub fn with_max_skip(mut self, max_skip: u32) -> Self {
        self.max_skip = max_skip;
        self
    }

    /// Counter the next outgoing message will carry.
    #[must_use]
    pub fn send_counter(&self) -> u32 {
        self.sending.index()
    }

    /// Next receiving counter expected in order.
    #[must_use]
    pub fn receive_counter(&self) -> u32 {
        self.receiving.index()
    }

    /// Number of cached keys for skipped counters.
    #[must_use]
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt and advance the sending chain.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceOverflow`] when the chain is exhausted.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let keys = derive_message_keys(&self.sending)?;
        let next = self.sending.successor()?;

        let ciphertext = cbc::encrypt(&keys.cipher_key, &keys.iv, plaintext);
        let tag = keys.tag(keys.counter, &keys.iv, &ciphertext);
        self.sending = next;

        Ok(RatchetMessage {
            counter: keys.counter,
            iv: keys.iv,
            ciphertext,
            tag,
        })
    }

    /// Verify and decrypt, deriving forward for counters ahead of the chain.
    ///
    /// State only changes when the message authenticates.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::MacMismatch`] if the tag does not verify
    /// - [`CryptoError::DuplicateMessage`] for a counter already consumed
    /// - [`CryptoError::TooManySkipped`] if the counter is beyond the skip bound
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let current = self.receiving.index();

        if message.counter < current {
            let keys = self
                .skipped
                .get(&message.counter)
                .ok_or(CryptoError::DuplicateMessage(message.counter))?;
            let plaintext = keys.open(message)?;
            self.skipped.remove(&message.counter);
            return Ok(plaintext);
        }

        if message.counter - current > self.max_skip {
            return Err(CryptoError::TooManySkipped {
                counter: message.counter,
                current,
            });
        }

        let mut chain = self.receiving.clone();
        let mut passed = Vec::new();
        while chain.index() < message.counter {
            passed.push(derive_message_keys(&chain)?);
            chain = chain.successor()?;
        }

        let plaintext = derive_message_keys(&chain)?.open(message)?;

        for keys in passed {
            self.skipped.insert(keys.counter, keys);
        }
        while self.skipped.len() > MAX_SKIPPED_KEYS {
            self.skipped.pop_first();
        }
        self.receiving = chain.successor()?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (RatchetSession, RatchetSession) {
        let secret = [0x42u8; 32];
        (
            RatchetSession::from_shared_secret(&secret, Role::Initiator).unwrap(),
            RatchetSession::from_shared_secret(&secret, Role::Responder).unwrap(),
        )
    }

    #[test]
    fn test_message_keys_differ_from_chain_keys() {
        let chain = ChainKey::new([0x42u8; 32], 0);
        let keys = derive_message_keys(&chain).unwrap();
        let next = chain.successor().unwrap();

        assert_ne!(&keys.cipher_key, chain.as_bytes());
        assert_ne!(&keys.mac_key, chain.as_bytes());
        assert_ne!(next.as_bytes(), chain.as_bytes());
        assert_ne!(&keys.cipher_key, next.as_bytes());

        let next_keys = derive_message_keys(&next).unwrap();
        assert_ne!(keys.cipher_key, next_keys.cipher_key);
        assert_ne!(keys.mac_key, next_keys.mac_key);
        assert_ne!(keys.iv, next_keys.iv);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_message_keys(&ChainKey::new([7u8; 32], 3)).unwrap();
        let b = derive_message_keys(&ChainKey::new([7u8; 32], 3)).unwrap();
        assert_eq!(a.cipher_key, b.cipher_key);
        assert_eq!(a.counter(), 3);
    }

    #[test]
    fn test_encrypt_advances_sending_chain() {
        let (mut alice, _) = session_pair();
        let before = alice.sending.clone();

        let m0 = alice.encrypt(b"first").unwrap();
        let m1 = alice.encrypt(b"second").unwrap();

        assert_eq!(m0.counter, 0);
        assert_eq!(m1.counter, 1);
        assert_eq!(alice.send_counter(), 2);
        assert_ne!(alice.sending.as_bytes(), before.as_bytes());
        assert_ne!(m0.iv, m1.iv);
    }

    #[test]
    fn test_in_order_roundtrip() {
        let (mut alice, mut bob) = session_pair();
        for i in 0..10u8 {
            let msg = alice.encrypt(&[i; 33]).unwrap();
            assert_eq!(bob.decrypt(&msg).unwrap(), vec![i; 33]);
        }
        assert_eq!(bob.receive_counter(), 10);
        assert_eq!(bob.skipped_len(), 0);

        let reply = bob.encrypt(b"reply").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"reply");
    }

    #[test]
    fn test_out_of_order_delivery() {
        let (mut alice, mut bob) = session_pair();
        let m0 = alice.encrypt(b"zero").unwrap();
        let m1 = alice.encrypt(b"one").unwrap();
        let m2 = alice.encrypt(b"two").unwrap();

        assert_eq!(bob.decrypt(&m2).unwrap(), b"two");
        assert_eq!(bob.skipped_len(), 2);
        assert_eq!(bob.decrypt(&m0).unwrap(), b"zero");
        assert_eq!(bob.decrypt(&m1).unwrap(), b"one");
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn test_duplicate_rejected() {
        let (mut alice, mut bob) = session_pair();
        let m0 = alice.encrypt(b"once").unwrap();
        bob.decrypt(&m0).unwrap();
        assert_eq!(bob.decrypt(&m0), Err(CryptoError::DuplicateMessage(0)));
    }

    #[test]
    fn test_skip_bound_enforced() {
        let (mut alice, bob) = session_pair();
        let mut bob = bob.with_max_skip(5);
        for _ in 0..6 {
            alice.encrypt(b"dropped").unwrap();
        }
        let far = alice.encrypt(b"far").unwrap();
        assert!(matches!(
            bob.decrypt(&far),
            Err(CryptoError::TooManySkipped { counter: 6, current: 0 })
        ));
        assert_eq!(bob.receive_counter(), 0);
    }

    #[test]
    fn test_every_bit_flip_detected() {
        let (mut alice, _) = session_pair();
        let message = alice.encrypt(b"integrity matters").unwrap();
        let wire = message.to_bytes();

        for byte in 0..wire.len() {
            for bit in 0..8 {
                let mut tampered = wire.clone();
                tampered[byte] ^= 1 << bit;

                let (_, mut bob) = session_pair();
                let result = RatchetMessage::from_bytes(&tampered).and_then(|m| bob.decrypt(&m));
                assert!(result.is_err(), "flip at byte {byte} bit {bit} accepted");
                if let Err(err) = result {
                    assert!(
                        matches!(
                            err,
                            CryptoError::MacMismatch
                                | CryptoError::InvalidMessage(_)
                                | CryptoError::TooManySkipped { .. }
                        ),
                        "unexpected error {err:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_failed_verification_leaves_state_intact() {
        let (mut alice, mut bob) = session_pair();
        let message = alice.encrypt(b"payload").unwrap();

        let mut forged = message.clone();
        forged.ciphertext[0] ^= 0x01;
        assert_eq!(bob.decrypt(&forged), Err(CryptoError::MacMismatch));
        assert_eq!(bob.receive_counter(), 0);

        assert_eq!(bob.decrypt(&message).unwrap(), b"payload");
    }

    #[test]
    fn test_wire_roundtrip_and_truncation() {
        let (mut alice, _) = session_pair();
        let message = alice.encrypt(b"wire").unwrap();
        let bytes = message.to_bytes();

        assert_eq!(RatchetMessage::from_bytes(&bytes).unwrap(), message);
        assert!(RatchetMessage::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(RatchetMessage::from_bytes(&bytes[..20]).is_err());
    }

    #[test]
    fn test_skipped_cache_bounded() {
        let (mut alice, mut bob) = session_pair();
        let mut held = Vec::new();
        for _ in 0..(MAX_SKIPPED_KEYS + 10) {
            held.push(alice.encrypt(b"x").unwrap());
        }
        // Two jumps, each within MAX_SKIP.
        bob.decrypt(&held[MAX_SKIPPED_KEYS / 2]).unwrap();
        bob.decrypt(held.last().unwrap()).unwrap();
        assert!(bob.skipped_len() <= MAX_SKIPPED_KEYS);
        // Oldest entries were evicted first.
        assert_eq!(bob.decrypt(&held[0]), Err(CryptoError::DuplicateMessage(0)));
    }
}
