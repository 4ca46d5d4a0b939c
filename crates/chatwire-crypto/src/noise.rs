//! `Noise_XX_25519_AESGCM_SHA256` handshake.
//!
//! Three messages, both sides authenticated by their static keys:
//!
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//!
//! The running transcript hash `h` is the associated data of every
//! handshake encryption, so any modification of an earlier message makes
//! every later decryption fail. Each DH result is folded into the chaining
//! key with `mix_key` (HKDF-SHA256), which also yields a fresh cipher key
//! and resets the nonce counter. [`HandshakeState::split`] consumes the
//! state and returns the two directional transport keys.

use crate::aead::{AeadKey, Nonce};
use crate::hash::{self, HashOutput};
use crate::x25519::{KeyPair, PublicKey};
use crate::{CryptoError, TransportKeys};
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Noise protocol name, hashed into the initial transcript.
pub const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_AESGCM_SHA256";

/// Size of an encrypted static key (32-byte key plus GCM tag).
pub const ENCRYPTED_STATIC_SIZE: usize = 32 + crate::GCM_TAG_SIZE;

/// Which side of the handshake this state drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the first message (the client).
    Initiator,
    /// Answers the first message (the server).
    Responder,
}

/// Progress through the three-message pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Message 1 not yet exchanged.
    Start,
    /// Message 1 exchanged, message 2 pending.
    AwaitingServerHello,
    /// Message 2 exchanged, message 3 pending.
    AwaitingClientFinish,
    /// All messages exchanged; only [`HandshakeState::split`] remains.
    Complete,
    /// A step failed; the state must be discarded.
    Failed,
}

/// Message 1: the initiator's ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Initiator ephemeral public key
    pub ephemeral: [u8; 32],
}

/// Message 2: responder ephemeral, encrypted responder static, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    /// Responder ephemeral public key
    pub ephemeral: [u8; 32],
    /// Responder static public key, encrypted
    pub static_ciphertext: Vec<u8>,
    /// Encrypted payload
    pub payload: Vec<u8>,
}

/// Message 3: encrypted initiator static and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFinish {
    /// Initiator static public key, encrypted
    pub static_ciphertext: Vec<u8>,
    /// Encrypted payload
    pub payload: Vec<u8>,
}

/// Transcript hash, chaining key and the current handshake cipher key.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SymmetricState {
    h: HashOutput,
    ck: HashOutput,
    #[zeroize(skip)]
    k: Option<AeadKey>,
    #[zeroize(skip)]
    n: u64,
}

impl SymmetricState {
    fn initialize(protocol_name: &[u8]) -> Self {
        let h = if protocol_name.len() <= 32 {
            let mut h = [0u8; 32];
            h[..protocol_name.len()].copy_from_slice(protocol_name);
            h
        } else {
            hash::sha256(protocol_name)
        };
        Self {
            h,
            ck: h,
            k: None,
            n: 0,
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        self.h = hash::sha256_concat(&[&self.h, data]);
    }

    fn mix_key(&mut self, input_key_material: &[u8]) -> Result<(), CryptoError> {
        let (ck, k) = hash::hkdf_pair(&self.ck, input_key_material, b"")?;
        self.ck = ck;
        self.k = Some(AeadKey::new(k));
        self.n = 0;
        Ok(())
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = match &self.k {
            Some(k) => {
                let ct = k.encrypt(&Nonce::from_counter(self.n), plaintext, &self.h)?;
                self.n += 1;
                ct
            }
            None => plaintext.to_vec(),
        };
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let plaintext = match &self.k {
            Some(k) => {
                let pt = k
                    .decrypt(&Nonce::from_counter(self.n), ciphertext, &self.h)
                    .map_err(|_| {
                        CryptoError::HandshakeFailed("handshake message failed authentication".into())
                    })?;
                self.n += 1;
                pt
            }
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    fn split(&self) -> Result<(HashOutput, HashOutput), CryptoError> {
        hash::hkdf_pair(&self.ck, b"", b"")
    }
}

/// In-progress handshake for one side.
pub struct HandshakeState {
    role: Role,
    phase: HandshakePhase,
    symmetric: SymmetricState,
    local_static: KeyPair,
    local_ephemeral: Option<KeyPair>,
    remote_static: Option<PublicKey>,
    remote_ephemeral: Option<PublicKey>,
    pinned_remote_static: Option<PublicKey>,
}

impl HandshakeState {
    /// Start a handshake as the initiator.
    #[must_use]
    pub fn new_initiator(local_static: KeyPair, prologue: &[u8]) -> Self {
        Self::new(Role::Initiator, local_static, prologue)
    }

    /// Start a handshake as the responder.
    #[must_use]
    pub fn new_responder(local_static: KeyPair, prologue: &[u8]) -> Self {
        Self::new(Role::Responder, local_static, prologue)
    }

    fn new(role: Role, local_static: KeyPair, prologue: &[u8]) -> Self {
        let mut symmetric = SymmetricState::initialize(PROTOCOL_NAME);
        symmetric.mix_hash(prologue);
        Self {
            role,
            phase: HandshakePhase::Start,
            symmetric,
            local_static,
            local_ephemeral: None,
            remote_static: None,
            remote_ephemeral: None,
            pinned_remote_static: None,
        }
    }

    /// Require the peer's static key to equal `expected`.
    #[must_use]
    pub fn with_pinned_remote_static(mut self, expected: PublicKey) -> Self {
        self.pinned_remote_static = Some(expected);
        self
    }

    /// Role of this side.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Peer static key, once it has been decrypted.
    #[must_use]
    pub fn remote_static(&self) -> Option<PublicKey> {
        self.remote_static
    }

    /// Current transcript hash.
    #[must_use]
    pub fn handshake_hash(&self) -> HashOutput {
        self.symmetric.h
    }

    // ───────────────────────────── initiator ─────────────────────────────

    /// Write message 1.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] when called out of order.
    pub fn write_client_hello<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ClientHello, CryptoError> {
        self.expect(Role::Initiator, HandshakePhase::Start)?;

        let ephemeral = KeyPair::generate(rng);
        let public = ephemeral.public().to_bytes();
        self.symmetric.mix_hash(&public);
        self.local_ephemeral = Some(ephemeral);
        self.guard(|s| s.symmetric.encrypt_and_hash(&[]).map(drop))?;

        self.phase = HandshakePhase::AwaitingServerHello;
        Ok(ClientHello { ephemeral: public })
    }

    /// Read message 2 and return its decrypted payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HandshakeFailed`] if any part fails
    /// authentication or the responder static key does not match a pinned
    /// key, and [`CryptoError::InvalidState`] when called out of order.
    pub fn read_server_hello(&mut self, message: &ServerHello) -> Result<Vec<u8>, CryptoError> {
        self.expect(Role::Initiator, HandshakePhase::AwaitingServerHello)?;

        let payload = self.guard(|s| {
            let re = PublicKey::from_bytes(message.ephemeral);
            s.symmetric.mix_hash(&message.ephemeral);
            s.remote_ephemeral = Some(re);

            let e = s.local_ephemeral.as_ref().ok_or(CryptoError::InvalidState)?;
            let ee = e.dh(&re).map_err(handshake_dh_failure)?;
            s.symmetric.mix_key(ee.as_bytes())?;

            let rs = s.read_remote_static(&message.static_ciphertext)?;

            let e = s.local_ephemeral.as_ref().ok_or(CryptoError::InvalidState)?;
            let es = e.dh(&rs).map_err(handshake_dh_failure)?;
            s.symmetric.mix_key(es.as_bytes())?;

            s.symmetric.decrypt_and_hash(&message.payload)
        })?;

        self.phase = HandshakePhase::AwaitingClientFinish;
        Ok(payload)
    }

    /// Write message 3 carrying `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] when called out of order.
    pub fn write_client_finish(&mut self, payload: &[u8]) -> Result<ClientFinish, CryptoError> {
        self.expect(Role::Initiator, HandshakePhase::AwaitingClientFinish)?;

        let message = self.guard(|s| {
            let static_public = s.local_static.public().to_bytes();
            let static_ciphertext = s.symmetric.encrypt_and_hash(&static_public)?;

            let re = s.remote_ephemeral.ok_or(CryptoError::InvalidState)?;
            let se = s.local_static.dh(&re).map_err(handshake_dh_failure)?;
            s.symmetric.mix_key(se.as_bytes())?;

            let payload = s.symmetric.encrypt_and_hash(payload)?;
            Ok(ClientFinish {
                static_ciphertext,
                payload,
            })
        })?;

        self.phase = HandshakePhase::Complete;
        Ok(message)
    }

    // ───────────────────────────── responder ─────────────────────────────

    /// Read message 1.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] when called out of order.
    pub fn read_client_hello(&mut self, message: &ClientHello) -> Result<(), CryptoError> {
        self.expect(Role::Responder, HandshakePhase::Start)?;

        self.remote_ephemeral = Some(PublicKey::from_bytes(message.ephemeral));
        self.symmetric.mix_hash(&message.ephemeral);
        self.guard(|s| s.symmetric.decrypt_and_hash(&[]).map(drop))?;

        self.phase = HandshakePhase::AwaitingServerHello;
        Ok(())
    }

    /// Write message 2 carrying `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] when called out of order and
    /// [`CryptoError::HandshakeFailed`] if the initiator ephemeral is a
    /// low-order point.
    pub fn write_server_hello<R: RngCore + CryptoRng>(
        &mut self,
        payload: &[u8],
        rng: &mut R,
    ) -> Result<ServerHello, CryptoError> {
        self.expect(Role::Responder, HandshakePhase::AwaitingServerHello)?;

        let message = self.guard(|s| {
            let ephemeral = KeyPair::generate(rng);
            let ephemeral_public = ephemeral.public().to_bytes();
            s.symmetric.mix_hash(&ephemeral_public);

            let re = s.remote_ephemeral.ok_or(CryptoError::InvalidState)?;
            let ee = ephemeral.dh(&re).map_err(handshake_dh_failure)?;
            s.symmetric.mix_key(ee.as_bytes())?;
            s.local_ephemeral = Some(ephemeral);

            let static_public = s.local_static.public().to_bytes();
            let static_ciphertext = s.symmetric.encrypt_and_hash(&static_public)?;

            let es = s.local_static.dh(&re).map_err(handshake_dh_failure)?;
            s.symmetric.mix_key(es.as_bytes())?;

            let payload = s.symmetric.encrypt_and_hash(payload)?;
            Ok(ServerHello {
                ephemeral: ephemeral_public,
                static_ciphertext,
                payload,
            })
        })?;

        self.phase = HandshakePhase::AwaitingClientFinish;
        Ok(message)
    }

    /// Read message 3 and return its decrypted payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HandshakeFailed`] on authentication failure
    /// and [`CryptoError::InvalidState`] when called out of order.
    pub fn read_client_finish(&mut self, message: &ClientFinish) -> Result<Vec<u8>, CryptoError> {
        self.expect(Role::Responder, HandshakePhase::AwaitingClientFinish)?;

        let payload = self.guard(|s| {
            let rs = s.read_remote_static(&message.static_ciphertext)?;

            let e = s.local_ephemeral.as_ref().ok_or(CryptoError::InvalidState)?;
            let se = e.dh(&rs).map_err(handshake_dh_failure)?;
            s.symmetric.mix_key(se.as_bytes())?;

            s.symmetric.decrypt_and_hash(&message.payload)
        })?;

        self.phase = HandshakePhase::Complete;
        Ok(payload)
    }

    // ─────────────────────────────── common ──────────────────────────────

    /// Finish the handshake and derive the directional transport keys.
    ///
    /// Consumes the state; the chaining key and ephemeral keys are zeroized
    /// when it drops.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] unless all three messages have
    /// been exchanged.
    pub fn split(self) -> Result<TransportKeys, CryptoError> {
        if self.phase != HandshakePhase::Complete {
            return Err(CryptoError::InvalidState);
        }
        let (initiator_to_responder, responder_to_initiator) = self.symmetric.split()?;
        let (send_key, recv_key) = match self.role {
            Role::Initiator => (initiator_to_responder, responder_to_initiator),
            Role::Responder => (responder_to_initiator, initiator_to_responder),
        };
        Ok(TransportKeys {
            send_key,
            recv_key,
            handshake_hash: self.symmetric.h,
        })
    }

    fn read_remote_static(&mut self, ciphertext: &[u8]) -> Result<PublicKey, CryptoError> {
        if ciphertext.len() != ENCRYPTED_STATIC_SIZE {
            return Err(CryptoError::HandshakeFailed(format!(
                "encrypted static key has {} bytes, expected {ENCRYPTED_STATIC_SIZE}",
                ciphertext.len()
            )));
        }
        let plaintext = self.symmetric.decrypt_and_hash(ciphertext)?;
        let rs = PublicKey::from_slice(&plaintext)
            .map_err(|_| CryptoError::HandshakeFailed("malformed static key".into()))?;

        if let Some(pinned) = &self.pinned_remote_static {
            if *pinned != rs {
                return Err(CryptoError::HandshakeFailed(
                    "remote static key does not match pinned key".into(),
                ));
            }
        }
        self.remote_static = Some(rs);
        Ok(rs)
    }

    fn expect(&self, role: Role, phase: HandshakePhase) -> Result<(), CryptoError> {
        if self.role != role || self.phase != phase {
            return Err(CryptoError::InvalidState);
        }
        Ok(())
    }

    /// Run a step; any error poisons the state.
    fn guard<T>(
        &mut self,
        step: impl FnOnce(&mut Self) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let result = step(self);
        if result.is_err() {
            self.phase = HandshakePhase::Failed;
        }
        result
    }
}

fn handshake_dh_failure(_: CryptoError) -> CryptoError {
    CryptoError::HandshakeFailed("peer sent a low-order public key".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    const PROLOGUE: &[u8] = b"chatwire-test";

    fn pair() -> (HandshakeState, HandshakeState, KeyPair, KeyPair) {
        let client_static = KeyPair::generate(&mut OsRng);
        let server_static = KeyPair::generate(&mut OsRng);
        (
            HandshakeState::new_initiator(client_static.clone(), PROLOGUE),
            HandshakeState::new_responder(server_static.clone(), PROLOGUE),
            client_static,
            server_static,
        )
    }

    #[test]
    fn test_full_handshake_derives_mirrored_keys() {
        let (mut client, mut server, client_static, server_static) = pair();

        let hello = client.write_client_hello(&mut OsRng).unwrap();
        server.read_client_hello(&hello).unwrap();

        let server_hello = server.write_server_hello(b"server cert", &mut OsRng).unwrap();
        let payload = client.read_server_hello(&server_hello).unwrap();
        assert_eq!(payload, b"server cert");
        assert_eq!(client.remote_static(), Some(*server_static.public()));

        let finish = client.write_client_finish(b"client payload").unwrap();
        let payload = server.read_client_finish(&finish).unwrap();
        assert_eq!(payload, b"client payload");
        assert_eq!(server.remote_static(), Some(*client_static.public()));

        assert_eq!(client.handshake_hash(), server.handshake_hash());

        let client_keys = client.split().unwrap();
        let server_keys = server.split().unwrap();
        assert_eq!(client_keys.send_key, server_keys.recv_key);
        assert_eq!(client_keys.recv_key, server_keys.send_key);
        assert_ne!(client_keys.send_key, client_keys.recv_key);
    }

    #[test]
    fn test_static_key_is_not_sent_in_clear() {
        let (mut client, mut server, _, server_static) = pair();
        let hello = client.write_client_hello(&mut OsRng).unwrap();
        server.read_client_hello(&hello).unwrap();
        let server_hello = server.write_server_hello(b"", &mut OsRng).unwrap();

        assert_eq!(server_hello.static_ciphertext.len(), ENCRYPTED_STATIC_SIZE);
        assert_ne!(
            &server_hello.static_ciphertext[..32],
            server_static.public().as_bytes()
        );
    }

    #[test]
    fn test_tampered_server_hello_fails() {
        let (mut client, mut server, _, _) = pair();
        let hello = client.write_client_hello(&mut OsRng).unwrap();
        server.read_client_hello(&hello).unwrap();
        let mut server_hello = server.write_server_hello(b"payload", &mut OsRng).unwrap();
        server_hello.payload[0] ^= 0x01;

        let err = client.read_server_hello(&server_hello).unwrap_err();
        assert!(matches!(err, CryptoError::HandshakeFailed(_)));
        assert_eq!(client.phase(), HandshakePhase::Failed);
        assert_eq!(
            client.write_client_finish(b"").unwrap_err(),
            CryptoError::InvalidState
        );
    }

    #[test]
    fn test_tampered_client_finish_fails() {
        let (mut client, mut server, _, _) = pair();
        let hello = client.write_client_hello(&mut OsRng).unwrap();
        server.read_client_hello(&hello).unwrap();
        let server_hello = server.write_server_hello(b"", &mut OsRng).unwrap();
        client.read_server_hello(&server_hello).unwrap();

        let mut finish = client.write_client_finish(b"login").unwrap();
        finish.static_ciphertext[5] ^= 0x80;
        assert!(matches!(
            server.read_client_finish(&finish),
            Err(CryptoError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_prologue_mismatch_fails() {
        let mut client = HandshakeState::new_initiator(KeyPair::generate(&mut OsRng), b"a");
        let mut server = HandshakeState::new_responder(KeyPair::generate(&mut OsRng), b"b");

        let hello = client.write_client_hello(&mut OsRng).unwrap();
        server.read_client_hello(&hello).unwrap();
        let server_hello = server.write_server_hello(b"", &mut OsRng).unwrap();
        assert!(client.read_server_hello(&server_hello).is_err());
    }

    #[test]
    fn test_pinned_server_key_mismatch() {
        let (_, mut server, client_static, _) = pair();
        let wrong = KeyPair::generate(&mut OsRng);
        let mut client = HandshakeState::new_initiator(client_static, PROLOGUE)
            .with_pinned_remote_static(*wrong.public());

        let hello = client.write_client_hello(&mut OsRng).unwrap();
        server.read_client_hello(&hello).unwrap();
        let server_hello = server.write_server_hello(b"", &mut OsRng).unwrap();

        let err = client.read_server_hello(&server_hello).unwrap_err();
        assert!(matches!(err, CryptoError::HandshakeFailed(msg) if msg.contains("pinned")));
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let (mut client, mut server, _, _) = pair();
        assert_eq!(
            client.write_client_finish(b"").unwrap_err(),
            CryptoError::InvalidState
        );
        assert_eq!(
            server.write_server_hello(b"", &mut OsRng).unwrap_err(),
            CryptoError::InvalidState
        );
        let hello = client.write_client_hello(&mut OsRng).unwrap();
        assert!(client.read_client_hello(&hello).is_err());
    }

    #[test]
    fn test_split_before_complete_rejected() {
        let (mut client, _, _, _) = pair();
        client.write_client_hello(&mut OsRng).unwrap();
        assert!(matches!(client.split(), Err(CryptoError::InvalidState)));
    }

    #[test]
    fn test_low_order_ephemeral_rejected() {
        let (_, mut server, _, _) = pair();
        server
            .read_client_hello(&ClientHello {
                ephemeral: [0u8; 32],
            })
            .unwrap();
        assert!(matches!(
            server.write_server_hello(b"", &mut OsRng),
            Err(CryptoError::HandshakeFailed(_))
        ));
    }
}
