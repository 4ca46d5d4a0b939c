//! Fuzz target for ratchet message parsing and decryption
//!
//! Parsing arbitrary bytes never panics, and a forged message never
//! decrypts or disturbs the receiving chain.

#![no_main]

use arbitrary::Arbitrary;
use chatwire_crypto::noise::Role;
use chatwire_crypto::ratchet::{RatchetMessage, RatchetSession};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct RatchetInput {
    secret: [u8; 32],
    forged: Vec<u8>,
    plaintext: Vec<u8>,
}

fuzz_target!(|input: RatchetInput| {
    let Ok(mut alice) = RatchetSession::from_shared_secret(&input.secret, Role::Initiator) else {
        return;
    };
    let Ok(mut bob) = RatchetSession::from_shared_secret(&input.secret, Role::Responder) else {
        return;
    };

    if let Ok(forged) = RatchetMessage::from_bytes(&input.forged) {
        assert!(bob.decrypt(&forged).is_err());
    }

    let message = alice.encrypt(&input.plaintext).expect("encrypt");
    let opened = bob.decrypt(&message).expect("genuine message decrypts");
    assert_eq!(opened, input.plaintext);
});
