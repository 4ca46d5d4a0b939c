//! Noise XX handshake over a frame transport.
//!
//! The three handshake messages travel as unencrypted `handshake` nodes:
//!
//! ```text
//! -> <handshake><e/></handshake>                      e
//! <- <handshake><e/><s/><payload/></handshake>        e, ee, s, es
//! -> <handshake><s/><payload/></handshake>            s, se
//! ```
//!
//! After the third message both sides switch to the transport
//! [`CipherState`]s returned in [`HandshakeOutcome`].

use super::error::{ClientError, Result};
use crate::binary::{Node, decode, encode};
use crate::error::CodecResult;
use chatwire_crypto::aead::CipherState;
use chatwire_crypto::noise::{ClientFinish, ClientHello, HandshakeState, ServerHello};
use chatwire_crypto::x25519::{KeyPair, PublicKey};
use chatwire_transport::Transport;
use rand_core::OsRng;

const HANDSHAKE: &str = "handshake";

/// Keys and peer details from a completed handshake.
pub struct HandshakeOutcome {
    /// Encrypts frames this side sends
    pub send: CipherState,
    /// Decrypts frames the peer sends
    pub recv: CipherState,
    /// Peer's static public key
    pub remote_static: PublicKey,
    /// Transcript hash
    pub handshake_hash: [u8; 32],
    /// Payload the peer carried in its handshake message
    pub peer_payload: Vec<u8>,
}

impl std::fmt::Debug for HandshakeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeOutcome")
            .field("remote_static", &self.remote_static)
            .field("handshake_hash", &hex::encode(self.handshake_hash))
            .field("peer_payload", &crate::logging::RedactedBytes(&self.peer_payload))
            .finish_non_exhaustive()
    }
}

// ───────────────────────────── node mapping ─────────────────────────────

fn bytes_child(tag: &str, bytes: &[u8]) -> CodecResult<Node> {
    Ok(Node::new(tag)?.with_bytes(bytes.to_vec()))
}

fn child_bytes<'a>(node: &'a Node, tag: &'static str) -> Result<&'a [u8]> {
    node.child(tag)
        .and_then(Node::payload)
        .ok_or(ClientError::handshake("handshake message is missing a field"))
}

fn child_key(node: &Node, tag: &'static str) -> Result<[u8; 32]> {
    child_bytes(node, tag)?
        .try_into()
        .map_err(|_| ClientError::handshake("handshake key has the wrong length"))
}

fn expect_handshake(node: &Node) -> Result<()> {
    if node.tag() == HANDSHAKE {
        Ok(())
    } else {
        Err(ClientError::handshake("expected a handshake node"))
    }
}

/// Node for message 1.
///
/// # Errors
///
/// Only fails if node construction fails.
pub fn client_hello_node(message: &ClientHello) -> CodecResult<Node> {
    Ok(Node::new(HANDSHAKE)?.with_children(vec![bytes_child("e", &message.ephemeral)?]))
}

/// Parse message 1.
///
/// # Errors
///
/// Returns [`ClientError::Handshake`] if the node is not a client hello.
pub fn parse_client_hello(node: &Node) -> Result<ClientHello> {
    expect_handshake(node)?;
    if node.child("s").is_some() {
        return Err(ClientError::handshake("unexpected static key in client hello"));
    }
    Ok(ClientHello {
        ephemeral: child_key(node, "e")?,
    })
}

/// Node for message 2.
///
/// # Errors
///
/// Only fails if node construction fails.
pub fn server_hello_node(message: &ServerHello) -> CodecResult<Node> {
    Ok(Node::new(HANDSHAKE)?.with_children(vec![
        bytes_child("e", &message.ephemeral)?,
        bytes_child("s", &message.static_ciphertext)?,
        bytes_child("payload", &message.payload)?,
    ]))
}

/// Parse message 2.
///
/// # Errors
///
/// Returns [`ClientError::Handshake`] if the node is not a server hello.
pub fn parse_server_hello(node: &Node) -> Result<ServerHello> {
    expect_handshake(node)?;
    Ok(ServerHello {
        ephemeral: child_key(node, "e")?,
        static_ciphertext: child_bytes(node, "s")?.to_vec(),
        payload: child_bytes(node, "payload")?.to_vec(),
    })
}

/// Node for message 3.
///
/// # Errors
///
/// Only fails if node construction fails.
pub fn client_finish_node(message: &ClientFinish) -> CodecResult<Node> {
    Ok(Node::new(HANDSHAKE)?.with_children(vec![
        bytes_child("s", &message.static_ciphertext)?,
        bytes_child("payload", &message.payload)?,
    ]))
}

/// Parse message 3.
///
/// # Errors
///
/// Returns [`ClientError::Handshake`] if the node is not a client finish.
pub fn parse_client_finish(node: &Node) -> Result<ClientFinish> {
    expect_handshake(node)?;
    if node.child("e").is_some() {
        return Err(ClientError::handshake("unexpected ephemeral in client finish"));
    }
    Ok(ClientFinish {
        static_ciphertext: child_bytes(node, "s")?.to_vec(),
        payload: child_bytes(node, "payload")?.to_vec(),
    })
}

// ───────────────────────────── drivers ─────────────────────────────

async fn send_node(transport: &dyn Transport, node: &Node) -> Result<()> {
    let frame = encode(node)?;
    transport.send(&frame).await?;
    Ok(())
}

async fn recv_node(transport: &dyn Transport) -> Result<Node> {
    let frame = transport.recv().await?;
    decode(&frame).map_err(|e| {
        tracing::debug!("Undecodable handshake frame: {}", e);
        ClientError::handshake("undecodable handshake frame")
    })
}

fn finish(state: HandshakeState, peer_payload: Vec<u8>) -> Result<HandshakeOutcome> {
    let remote_static = state
        .remote_static()
        .ok_or(ClientError::handshake("peer static key missing"))?;
    let keys = state.split()?;
    let handshake_hash = keys.handshake_hash;
    let (send, recv) = keys.into_cipher_states();
    Ok(HandshakeOutcome {
        send,
        recv,
        remote_static,
        handshake_hash,
        peer_payload,
    })
}

/// Run the initiator side and return the transport ciphers.
///
/// `payload` travels encrypted in message 3. When `pinned` is set the
/// server's static key must equal it.
///
/// # Errors
///
/// Returns [`ClientError::Handshake`] on any authentication failure, a
/// malformed server message or a pinned-key mismatch, and
/// [`ClientError::Transport`] if the transport fails.
pub async fn perform_handshake(
    transport: &dyn Transport,
    local_static: KeyPair,
    prologue: &[u8],
    pinned: Option<PublicKey>,
    payload: &[u8],
) -> Result<HandshakeOutcome> {
    let mut state = HandshakeState::new_initiator(local_static, prologue);
    if let Some(expected) = pinned {
        state = state.with_pinned_remote_static(expected);
    }

    let hello = state.write_client_hello(&mut OsRng)?;
    send_node(transport, &client_hello_node(&hello)?).await?;
    tracing::debug!("Sent client hello");

    let reply = recv_node(transport).await?;
    let server_hello = parse_server_hello(&reply)?;
    let server_payload = state.read_server_hello(&server_hello)?;

    let finish_msg = state.write_client_finish(payload)?;
    send_node(transport, &client_finish_node(&finish_msg)?).await?;

    let outcome = finish(state, server_payload)?;
    tracing::debug!(
        server = %hex::encode(outcome.remote_static.as_bytes()),
        "Handshake complete"
    );
    Ok(outcome)
}

/// Run the responder side. Used by local servers and tests.
///
/// # Errors
///
/// Same as [`perform_handshake`].
pub async fn accept_handshake(
    transport: &dyn Transport,
    local_static: KeyPair,
    prologue: &[u8],
    payload: &[u8],
) -> Result<HandshakeOutcome> {
    let mut state = HandshakeState::new_responder(local_static, prologue);

    let hello = parse_client_hello(&recv_node(transport).await?)?;
    state.read_client_hello(&hello)?;

    let server_hello = state.write_server_hello(payload, &mut OsRng)?;
    send_node(transport, &server_hello_node(&server_hello)?).await?;

    let finish_msg = parse_client_finish(&recv_node(transport).await?)?;
    let client_payload = state.read_client_finish(&finish_msg)?;

    finish(state, client_payload)
}
