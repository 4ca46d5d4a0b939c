//! Scripted in-memory server
//!
//! Plays the server side of the handshake and auth exchange over a
//! [`MemoryConnector`], so tests can drive the real `ConnectionManager`
//! without sockets.
//!
//! # Example
//!
//! ```no_run
//! use chatwire_integration_tests::fixtures::{MockServer, build_client, test_config};
//! use chatwire_transport::MemoryConnector;
//!
//! # async fn example() {
//! let (connector, listener) = MemoryConnector::new();
//! let mut server = MockServer::new(listener);
//! let dir = tempfile::tempdir().unwrap();
//! let (client, _events) = build_client(test_config(), &connector, dir.path());
//!
//! let task = tokio::spawn(async move {
//!     let mut conn = server.accept().await;
//!     conn.complete_registration(None).await;
//!     conn
//! });
//! client.connect().await.unwrap();
//! # }
//! ```

use chatwire_core::client::config::DEFAULT_PROLOGUE;
use chatwire_core::client::handshake::accept_handshake;
use chatwire_core::client::{ClientConfig, ClientError, ClientEvent, ConnectionManager};
use chatwire_core::client::{KeyStore, SessionStore};
use chatwire_core::{Node, decode, encode};
use chatwire_crypto::aead::CipherState;
use chatwire_crypto::signatures::{Signature, VerifyingKey};
use chatwire_crypto::x25519::{KeyPair, PublicKey};
use chatwire_transport::{MemoryConnector, MemoryListener, MemoryTransport, Transport};
use rand_core::OsRng;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Account id the mock assigns on registration
pub const WID: &str = "15551234567@s.whatsapp.net";

/// Server token issued on registration
pub const SERVER_TOKEN: &str = "server-token-1";

/// Client token issued on registration
pub const CLIENT_TOKEN: &str = "client-token-1";

/// Session file key used by [`build_client`]
const SESSION_KEY: [u8; 32] = [0x5A; 32];

/// Accepts client connections and completes the handshake.
pub struct MockServer {
    listener: MemoryListener,
    keys: KeyPair,
}

impl MockServer {
    /// Server with a fresh static key.
    pub fn new(listener: MemoryListener) -> Self {
        Self {
            listener,
            keys: KeyPair::generate(&mut OsRng),
        }
    }

    /// Static public key, for pinning.
    pub fn public_key(&self) -> PublicKey {
        *self.keys.public()
    }

    /// Accept the next connection and run the responder handshake.
    pub async fn try_accept(&mut self) -> Result<ServerConn, ClientError> {
        let (endpoint, transport) = self
            .listener
            .accept()
            .await
            .ok_or(ClientError::transport("listener closed"))?;
        let outcome =
            accept_handshake(transport.as_ref(), self.keys.clone(), DEFAULT_PROLOGUE, b"").await?;

        Ok(ServerConn {
            endpoint,
            client_static: outcome.remote_static,
            transport,
            send: outcome.send,
            recv: outcome.recv,
        })
    }

    /// [`try_accept`](Self::try_accept), panicking on failure.
    pub async fn accept(&mut self) -> ServerConn {
        self.try_accept().await.expect("handshake with client")
    }
}

/// One accepted, handshaken connection.
pub struct ServerConn {
    /// Endpoint the client dialled
    pub endpoint: String,
    /// Client static key from the handshake
    pub client_static: PublicKey,
    transport: Arc<MemoryTransport>,
    send: CipherState,
    recv: CipherState,
}

impl ServerConn {
    /// Encrypt and send one node.
    pub async fn send(&mut self, node: &Node) {
        let frame = self
            .send
            .encrypt_with_ad(&[], &encode(node).unwrap())
            .unwrap();
        self.transport.send(&frame).await.unwrap();
    }

    /// Send bytes as-is, bypassing encryption.
    pub async fn send_raw(&self, frame: &[u8]) {
        self.transport.send(frame).await.unwrap();
    }

    /// Next node, pings included. `None` once the client closes.
    pub async fn recv_any(&mut self) -> Option<Node> {
        let frame = self.transport.recv().await.ok()?;
        let plaintext = self.recv.decrypt_with_ad(&[], &frame).unwrap();
        Some(decode(&plaintext).unwrap())
    }

    /// Next node that is not a client ping; pings are answered.
    pub async fn recv(&mut self) -> Option<Node> {
        loop {
            let node = self.recv_any().await?;
            if is_ping(&node) {
                let pong = Node::new("iq")
                    .unwrap()
                    .with_attr("id", node.attr("id").unwrap_or_default())
                    .with_attr("type", "result");
                self.send(&pong).await;
                continue;
            }
            return Some(node);
        }
    }

    /// Next non-ping node, asserting its tag.
    pub async fn expect(&mut self, tag: &str) -> Node {
        let node = self.recv().await.expect("client closed the connection");
        assert_eq!(node.tag(), tag, "unexpected node {node}");
        node
    }

    /// Read a `register`, check its signed prekey, optionally send a
    /// `pair-ref`, then accept. Returns the register node.
    pub async fn complete_registration(&mut self, pair_ref: Option<&str>) -> Node {
        let register = self.expect("register").await;
        verify_registration(&register);

        if let Some(pair_ref) = pair_ref {
            self.send(&Node::new("pair-ref").unwrap().with_attr("ref", pair_ref))
                .await;
        }
        self.send(
            &Node::new("success")
                .unwrap()
                .with_attr("server_token", SERVER_TOKEN)
                .with_attr("client_token", CLIENT_TOKEN)
                .with_attr("wid", WID),
        )
        .await;
        register
    }

    /// Read a `login` and accept it. Returns the login node.
    pub async fn accept_login(&mut self) -> Node {
        let login = self.expect("login").await;
        self.send(&Node::new("success").unwrap().with_attr("wid", WID))
            .await;
        login
    }

    /// Reply `failure` to whatever auth request arrives next.
    pub async fn reject(&mut self, expected: &str, reason: &str) -> Node {
        let request = self.expect(expected).await;
        self.send(&Node::new("failure").unwrap().with_attr("reason", reason))
            .await;
        request
    }

    /// Close the server end.
    pub async fn close(&self) {
        let _ = self.transport.close().await;
    }

    /// Whether either side has closed.
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}

fn is_ping(node: &Node) -> bool {
    node.tag() == "iq" && node.attr("type") == Some("get") && node.child("ping").is_some()
}

/// Check the signed prekey in a `register` against its `signer` key.
pub fn verify_registration(register: &Node) {
    let signer: [u8; 32] = register
        .child("signer")
        .and_then(Node::payload)
        .expect("signer")
        .try_into()
        .expect("signer length");
    let skey = register.child("skey").expect("skey");
    let value = skey.child("value").and_then(Node::payload).expect("value");
    let signature = skey
        .child("signature")
        .and_then(Node::payload)
        .expect("signature");

    let signer = VerifyingKey::from_bytes(&signer).expect("valid signer key");
    signer
        .verify(value, &Signature::from_slice(signature).expect("signature length"))
        .expect("signed prekey verifies");
}

/// Client configuration pointing at two in-memory endpoints.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.connection.endpoints = vec!["ws://primary.test".into(), "ws://backup.test".into()];
    config
}

/// Client over `connector`, persisting its session in `dir`.
///
/// Keys are kept in memory; a client built over the same `dir` later
/// restores them from the stored session.
pub fn build_client(
    config: ClientConfig,
    connector: &MemoryConnector,
    dir: &Path,
) -> (ConnectionManager, mpsc::UnboundedReceiver<ClientEvent>) {
    let sessions = SessionStore::with_key(dir.join("session.bin"), SESSION_KEY);
    ConnectionManager::with_stores(
        config,
        Arc::new(connector.clone()),
        KeyStore::in_memory(),
        sessions,
    )
    .expect("valid client configuration")
}

/// Wait for the first event matching `predicate`, discarding the rest.
pub async fn next_event(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    predicate: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
