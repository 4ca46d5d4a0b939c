//! Connection manager - drives one transport through its lifetime
//!
//! `connect()` dials the configured endpoints in rotation, runs the Noise
//! handshake, then logs in with a stored session or registers afresh. Once
//! connected a reader task decrypts inbound frames, answers pings and sends
//! its own heartbeat. When the link drops a supervisor task schedules
//! reconnects with exponential backoff until the attempt budget runs out.
//!
//! Frame flow after the handshake:
//!
//! ```text
//!  OutboundQueue ──► ClientSink ──► encode ──► CipherState(send) ──► Transport
//!  Transport ──► CipherState(recv) ──► decode ──► dispatch ──► ClientEvent
//! ```

use super::backoff::Backoff;
use super::config::{ClientConfig, ConfigError};
use super::error::{ClientError, Result};
use super::events::{ClientEvent, PairingPayload};
use super::handshake::{HandshakeOutcome, perform_handshake};
use super::keystore::KeyStore;
use super::queue::{ActionSink, OutboundAction, OutboundQueue, QueueError};
use super::session_store::{SessionRecord, SessionStore};
use super::unix_now;
use crate::binary::{Node, decode, encode};
use crate::session::{ConnectionState, StateMachine};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chatwire_crypto::aead::CipherState;
use chatwire_crypto::noise::Role;
use chatwire_crypto::ratchet::{RatchetMessage, RatchetSession};
use chatwire_crypto::x25519::{KeyPair, PublicKey};
use chatwire_transport::{Connector, Transport};
use dashmap::DashMap;
use rand_core::{OsRng, RngCore};
use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

/// One-time prekeys generated before a fresh registration when none remain.
const PREKEY_BATCH: u32 = 16;

/// Ping namespace.
const PING_XMLNS: &str = "w:p";

/// The live, authenticated transport.
struct Link {
    transport: Arc<dyn Transport>,
    send: CipherState,
    generation: u64,
}

/// Reported by a reader task when its link ends.
struct LinkLost {
    generation: u64,
    reason: String,
}

/// Shared client state
pub(crate) struct ClientInner {
    config: ClientConfig,
    prologue: Vec<u8>,
    pinned: Option<PublicKey>,
    connector: Arc<dyn Connector>,
    state: StateMachine,
    events: mpsc::UnboundedSender<ClientEvent>,
    keys: Mutex<KeyStore>,
    sessions: SessionStore,
    record: Mutex<Option<SessionRecord>>,
    /// Serializes encryption and writes on the current link
    link: tokio::sync::Mutex<Option<Link>>,
    /// Held for the whole of a connection attempt
    dialing: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    endpoint_index: AtomicUsize,
    backoff: Mutex<Backoff>,
    ratchets: DashMap<String, RatchetSession>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    lost_tx: mpsc::UnboundedSender<LinkLost>,
}

/// Long-lived chat client connection.
///
/// Cloning yields another handle to the same connection. Call
/// [`destroy`](Self::destroy) to stop its background tasks.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ClientInner>,
    queue: Arc<OutboundQueue>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl ConnectionManager {
    /// Open the key and session stores named by `config` and build a client.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] if the configuration does not
    /// validate, or an I/O error if a store cannot be opened.
    pub fn open(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        config.validate().map_err(config_error)?;
        let keys = KeyStore::open(
            &config.storage.key_dir,
            config.storage.key_passphrase.as_deref(),
        )?;
        let sessions = SessionStore::open(&config.storage)?;
        Self::with_stores(config, connector, keys, sessions)
    }

    /// Build a client over explicit stores.
    ///
    /// A stored session is loaded immediately; if the key store is empty the
    /// keys exported into that session are imported.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] if the configuration does not
    /// validate.
    pub fn with_stores(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        mut keys: KeyStore,
        sessions: SessionStore,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        config.validate().map_err(config_error)?;
        let prologue = config.connection.prologue_bytes().map_err(config_error)?;
        let pinned = config
            .connection
            .server_static_key_bytes()
            .map_err(config_error)?
            .map(PublicKey::from_bytes);

        let record = sessions.load();
        if let Some(record) = &record {
            if keys.identity().is_none() {
                if let Err(e) = keys.import_all(&record.key_export) {
                    tracing::warn!("Could not restore keys from stored session: {}", e);
                }
            }
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let state = StateMachine::new();
        let _ = events.send(ClientEvent::StateChanged(state.state()));

        let inner = Arc::new(ClientInner {
            backoff: Mutex::new(Backoff::new(&config.reconnect)),
            prologue,
            pinned,
            connector,
            state,
            events,
            keys: Mutex::new(keys),
            sessions,
            record: Mutex::new(record),
            link: tokio::sync::Mutex::new(None),
            dialing: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            endpoint_index: AtomicUsize::new(0),
            ratchets: DashMap::new(),
            next_id: AtomicU64::new(1),
            shutdown,
            lost_tx,
            config,
        });

        let sink: Arc<dyn ActionSink> = Arc::new(ClientSink(Arc::downgrade(&inner)));
        let queue = Arc::new(OutboundQueue::start(&inner.config.queue, sink));
        tokio::spawn(supervise(Arc::downgrade(&inner), lost_rx));

        Ok((Self { inner, queue }, events_rx))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════

impl ConnectionManager {
    /// Connect, handshake and authenticate.
    ///
    /// Tries the current endpoint first and then each other endpoint once.
    /// Returns whether a stored session was resumed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AllEndpointsFailed`] when no endpoint accepts,
    /// [`ClientError::Handshake`] when the handshake or a fresh registration
    /// fails, and [`ClientError::InvalidState`] if already connected. The
    /// client is left `Disconnected` on failure; no reconnect is scheduled.
    pub async fn connect(&self) -> Result<bool> {
        self.inner.ensure_alive()?;
        self.inner.establish().await
    }

    /// Queue a node for paced delivery and wait until it is written.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Destroyed`] if the client is destroyed first,
    /// or the error that prevented the write.
    pub async fn send_node(&self, node: Node) -> Result<()> {
        self.inner.ensure_alive()?;
        self.queue
            .submit(OutboundAction::Node(node))
            .await
            .map_err(queue_error)
    }

    /// Ratchet-encrypt `plaintext` for `jid` and queue it. Returns the
    /// message id.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoSession`] without an installed ratchet for
    /// `jid`, otherwise as [`send_node`](Self::send_node).
    pub async fn send_message(&self, jid: &str, plaintext: &[u8]) -> Result<String> {
        self.inner.ensure_alive()?;
        let payload = {
            let mut session = self
                .inner
                .ratchets
                .get_mut(jid)
                .ok_or_else(|| ClientError::NoSession(jid.to_string()))?;
            session.encrypt(plaintext)?.to_bytes()
        };
        let id = message_id();
        self.queue
            .submit(OutboundAction::Message {
                to: jid.to_string(),
                id: id.clone(),
                payload,
            })
            .await
            .map_err(queue_error)?;
        Ok(id)
    }

    /// Use `session` for messages to and from `jid`, replacing any previous one.
    pub fn install_ratchet(&self, jid: impl Into<String>, session: RatchetSession) {
        let jid = jid.into();
        tracing::debug!(jid = %jid, "Ratchet session installed");
        self.inner.ratchets.insert(jid, session);
    }

    /// Whether a ratchet is installed for `jid`.
    #[must_use]
    pub fn has_ratchet(&self, jid: &str) -> bool {
        self.inner.ratchets.contains_key(jid)
    }

    /// Tell the server to end the session, forget it locally and destroy the
    /// client.
    ///
    /// # Errors
    ///
    /// Returns an error only if the session file cannot be removed.
    pub async fn logout(&self) -> Result<()> {
        if self.inner.state.state() == ConnectionState::Connected {
            let client_id = lock(&self.inner.record)
                .as_ref()
                .map(|r| r.client_id.clone());
            let mut node = Node::new("logout")?;
            if let Some(client_id) = client_id {
                node.set_attr("client_id", client_id);
            }
            if let Err(e) = self.inner.send_node(&node).await {
                tracing::warn!("Logout notice not delivered: {}", e);
            }
        }

        let cleared = self.inner.forget_session();
        self.inner.emit(ClientEvent::LoggedOut);
        self.destroy().await;
        tracing::info!("Logged out");
        cleared
    }

    /// Stop everything: cancel timers and any connect in progress, close the
    /// transport, reject queued items and enter `Destroyed`. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        if self.inner.state.destroy() {
            self.inner
                .emit(ClientEvent::StateChanged(ConnectionState::Destroyed));
        }

        let link = self.inner.link.lock().await.take();
        if let Some(link) = link {
            if let Err(e) = link.transport.close().await {
                tracing::debug!("Error closing transport: {}", e);
            }
        }

        self.queue.shutdown().await;
        tracing::info!("Client destroyed");
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Current session record, if paired.
    #[must_use]
    pub fn session(&self) -> Option<SessionRecord> {
        lock(&self.inner.record).clone()
    }

    /// Identity public key, once generated.
    #[must_use]
    pub fn identity_public(&self) -> Option<PublicKey> {
        lock(&self.inner.keys).identity_public()
    }

    /// Items waiting in the outbound queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Connection establishment
// ═══════════════════════════════════════════════════════════════════════════

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        // The application may have dropped its receiver
        let _ = self.events.send(event);
    }

    fn set_state(&self, to: ConnectionState) -> Result<()> {
        self.state.transition_to(to)?;
        self.emit(ClientEvent::StateChanged(to));
        Ok(())
    }

    fn ensure_alive(&self) -> Result<()> {
        if *self.shutdown.borrow() || self.state.state().is_terminal() {
            Err(ClientError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Run `fut` unless the client is destroyed first.
    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            () = stopped(&mut shutdown) => Err(ClientError::Destroyed),
            result = fut => result,
        }
    }

    fn iq_id(&self) -> String {
        format!("ping.{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// One full connection attempt. Leaves the state `Disconnected` on failure.
    async fn establish(self: &Arc<Self>) -> Result<bool> {
        let _dialing = self.dialing.lock().await;
        self.ensure_alive()?;
        self.set_state(ConnectionState::Connecting)?;

        match self.guarded(self.open_link()).await {
            Ok(resumed) => Ok(resumed),
            Err(e) => {
                if !self.state.state().is_terminal() {
                    let _ = self.set_state(ConnectionState::Disconnected);
                }
                tracing::warn!("Connection attempt failed: {}", e);
                Err(e)
            }
        }
    }

    async fn open_link(self: &Arc<Self>) -> Result<bool> {
        let transport = self.dial().await?;
        match self.secure(&transport).await {
            Ok(resumed) => Ok(resumed),
            Err(e) => {
                let _ = transport.close().await;
                Err(e)
            }
        }
    }

    /// Try each endpoint once, starting with the last one that worked.
    async fn dial(&self) -> Result<Arc<dyn Transport>> {
        let endpoints = &self.config.connection.endpoints;
        let timeout = self.config.connection.connect_timeout();
        let start = self.endpoint_index.load(Ordering::Acquire);

        for offset in 0..endpoints.len() {
            let index = (start + offset) % endpoints.len();
            let endpoint = &endpoints[index];
            tracing::debug!(endpoint = %endpoint, "Dialing");

            match tokio::time::timeout(timeout, self.connector.connect(endpoint)).await {
                Ok(Ok(transport)) => {
                    self.endpoint_index.store(index, Ordering::Release);
                    tracing::info!(endpoint = %endpoint, "Transport connected");
                    return Ok(transport);
                }
                Ok(Err(e)) => tracing::warn!(endpoint = %endpoint, "Connect failed: {}", e),
                Err(_) => tracing::warn!(endpoint = %endpoint, "Connect timed out"),
            }
        }
        Err(ClientError::AllEndpointsFailed(endpoints.len()))
    }

    /// Handshake, authenticate and install the link.
    async fn secure(self: &Arc<Self>, transport: &Arc<dyn Transport>) -> Result<bool> {
        self.set_state(ConnectionState::Handshaking)?;
        let local = self.identity_key_pair()?;
        let hello = encode(&Node::new("client")?.with_attr("v", env!("CARGO_PKG_VERSION")))?;

        let HandshakeOutcome {
            mut send,
            mut recv,
            remote_static,
            ..
        } = tokio::time::timeout(
            self.config.connection.connect_timeout(),
            perform_handshake(transport.as_ref(), local, &self.prologue, self.pinned, &hello),
        )
        .await
        .map_err(|_| ClientError::timeout("handshake"))??;

        self.set_state(ConnectionState::Authenticating)?;
        let resumed = self
            .authenticate(transport.as_ref(), &mut send, &mut recv, remote_static)
            .await?;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut link = self.link.lock().await;
            if *self.shutdown.borrow() {
                return Err(ClientError::Destroyed);
            }
            *link = Some(Link {
                transport: Arc::clone(transport),
                send,
                generation,
            });
        }

        self.set_state(ConnectionState::Connected)?;
        lock(&self.backoff).reset();
        self.emit(ClientEvent::Connected { resumed });
        tracing::info!(resumed, generation, "Connected");

        tokio::spawn(read_loop(
            Arc::clone(self),
            Arc::clone(transport),
            recv,
            generation,
        ));
        Ok(resumed)
    }

    fn identity_key_pair(&self) -> Result<KeyPair> {
        let mut keys = lock(&self.keys);
        if let Some(identity) = keys.identity() {
            return Ok(identity.key_pair().clone());
        }
        tracing::info!("Generating identity key");
        Ok(keys.generate_identity()?.key_pair().clone())
    }

    /// The record a login may present. A record that aged out while the
    /// client was running is forgotten here.
    fn resumable_record(&self) -> Option<SessionRecord> {
        let record = lock(&self.record).clone()?;
        if !self.sessions.is_current(&record) {
            tracing::info!(
                client_id = %record.client_id,
                last_updated = record.last_updated,
                "Session expired, registering again"
            );
            if let Err(e) = self.forget_session() {
                tracing::warn!("Could not clear expired session: {}", e);
            }
            return None;
        }
        Some(record).filter(SessionRecord::is_resumable)
    }

    fn forget_session(&self) -> Result<()> {
        lock(&self.record).take();
        self.sessions.clear()
    }

    fn store_session(&self, record: SessionRecord) {
        if let Err(e) = self.sessions.save(&record) {
            tracing::warn!("Could not persist session: {}", e);
        }
        *lock(&self.record) = Some(record);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Authentication
// ═══════════════════════════════════════════════════════════════════════════

async fn send_sealed(transport: &dyn Transport, send: &mut CipherState, node: &Node) -> Result<()> {
    let frame = send.encrypt_with_ad(&[], &encode(node)?)?;
    transport.send(&frame).await?;
    Ok(())
}

async fn recv_sealed(
    transport: &dyn Transport,
    recv: &mut CipherState,
    wait: Option<Duration>,
) -> Result<Node> {
    let frame = match wait {
        Some(wait) => tokio::time::timeout(wait, transport.recv())
            .await
            .map_err(|_| ClientError::timeout("auth reply"))??,
        None => transport.recv().await?,
    };
    let plaintext = recv.decrypt_with_ad(&[], &frame)?;
    Ok(decode(&plaintext)?)
}

impl ClientInner {
    /// Log in with the stored session, or register. Returns whether the
    /// session was resumed.
    async fn authenticate(
        &self,
        transport: &dyn Transport,
        send: &mut CipherState,
        recv: &mut CipherState,
        remote_static: PublicKey,
    ) -> Result<bool> {
        let stored = self.resumable_record();

        if let Some(record) = stored {
            let mut login = Node::new("login")?.with_attr("client_id", record.client_id.as_str());
            if let (Some(server), Some(client)) = (&record.server_token, &record.client_token) {
                login.set_attr("server_token", server.as_str());
                login.set_attr("client_token", client.as_str());
            }
            send_sealed(transport, send, &login).await?;

            match recv_sealed(transport, recv, Some(self.config.connection.auth_timeout())).await {
                Ok(reply) if reply.tag() == "success" => {
                    self.finish_resume(record, &reply, remote_static);
                    return Ok(true);
                }
                Ok(reply) => tracing::warn!(
                    tag = reply.tag(),
                    reason = reply.attr("reason").unwrap_or("unspecified"),
                    "Session resume rejected, registering again"
                ),
                Err(e @ (ClientError::Transport(_) | ClientError::Timeout(_))) => return Err(e),
                Err(e) => tracing::warn!("Malformed resume reply, registering again: {}", e),
            }
            if let Err(e) = self.forget_session() {
                tracing::warn!("Could not clear stale session: {}", e);
            }
        }

        self.register(transport, send, recv, remote_static).await?;
        Ok(false)
    }

    fn finish_resume(&self, mut record: SessionRecord, reply: &Node, remote_static: PublicKey) {
        if let Some(token) = reply.attr("server_token") {
            record.server_token = Some(token.to_string());
        }
        if let Some(token) = reply.attr("client_token") {
            record.client_token = Some(token.to_string());
        }
        if let Some(wid) = reply.attr("wid") {
            record.wid = Some(wid.to_string());
        }
        record.remote_identity = Some(remote_static.to_bytes());
        record.touch();
        tracing::info!(client_id = %record.client_id, "Session resumed");
        self.store_session(record);
    }

    fn register_node(&self, client_id: &str) -> Result<Node> {
        let mut keys = lock(&self.keys);
        if keys.identity().is_none() {
            keys.generate_identity()?;
        }
        if keys.signed_prekey().is_none() {
            keys.generate_signed_prekey()?;
        }
        if keys.prekey_count() == 0 {
            keys.generate_prekeys(PREKEY_BATCH)?;
        }

        let identity = keys
            .identity()
            .ok_or(ClientError::invalid_state("no identity key"))?;
        let signed = keys
            .signed_prekey()
            .ok_or(ClientError::invalid_state("no signed prekey"))?;

        let prekeys = keys
            .prekeys()
            .map(|prekey| -> Result<Node> {
                Ok(Node::new("key")?
                    .with_attr("id", prekey.id().to_string())
                    .with_bytes(prekey.public().to_bytes().to_vec()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Node::new("register")?
            .with_attr("client_id", client_id)
            .with_children(vec![
                Node::new("identity")?.with_bytes(identity.public().to_bytes().to_vec()),
                Node::new("skey")?
                    .with_attr("id", signed.id().to_string())
                    .with_children(vec![
                        Node::new("value")?.with_bytes(signed.public().to_bytes().to_vec()),
                        Node::new("signature")?.with_bytes(signed.signature().as_bytes().to_vec()),
                    ]),
                Node::new("signer")?.with_bytes(identity.verifying_key()?.to_bytes().to_vec()),
                Node::new("prekeys")?.with_children(prekeys),
            ]))
    }

    async fn register(
        &self,
        transport: &dyn Transport,
        send: &mut CipherState,
        recv: &mut CipherState,
        remote_static: PublicKey,
    ) -> Result<()> {
        let mut raw = [0u8; 16];
        OsRng.fill_bytes(&mut raw);
        let client_id = B64.encode(raw);

        let request = self.register_node(&client_id)?;
        send_sealed(transport, send, &request).await?;
        tracing::info!("Registration sent");

        // Once a pairing ref is out the user may take a while to scan it
        let mut wait = Some(self.config.connection.auth_timeout());
        loop {
            let reply = recv_sealed(transport, recv, wait).await?;
            match reply.tag() {
                "pair-ref" => {
                    let server_ref = reply
                        .attr("ref")
                        .ok_or(ClientError::protocol("pair-ref without ref"))?;
                    let public_key = lock(&self.keys)
                        .identity_public()
                        .ok_or(ClientError::invalid_state("no identity key"))?
                        .to_bytes();
                    self.emit(ClientEvent::PairingRequired(PairingPayload {
                        public_key,
                        server_ref: server_ref.to_string(),
                        client_id: client_id.clone(),
                        timestamp: unix_now(),
                    }));
                    wait = None;
                }
                "success" => {
                    let key_export = lock(&self.keys).export_all()?;
                    let mut record = SessionRecord::new(client_id, key_export);
                    record.server_token = reply.attr("server_token").map(str::to_string);
                    record.client_token = reply.attr("client_token").map(str::to_string);
                    record.wid = reply.attr("wid").map(str::to_string);
                    record.remote_identity = Some(remote_static.to_bytes());

                    let wid = record.wid.clone();
                    tracing::info!(wid = ?wid, "Registration complete");
                    self.store_session(record);
                    self.emit(ClientEvent::Paired { wid });
                    return Ok(());
                }
                "failure" => {
                    let reason = reply.attr("reason").unwrap_or("unspecified");
                    return Err(ClientError::Handshake(Cow::Owned(format!(
                        "registration rejected: {reason}"
                    ))));
                }
                other => {
                    tracing::warn!(tag = other, "Unexpected registration reply");
                    return Err(ClientError::handshake("unexpected registration reply"));
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Connected operation
// ═══════════════════════════════════════════════════════════════════════════

impl ClientInner {
    /// Encrypt and write one node on the current link.
    async fn send_node(&self, node: &Node) -> Result<()> {
        let frame = encode(node)?;
        let mut guard = self.link.lock().await;
        let link = guard
            .as_mut()
            .ok_or(ClientError::transport("not connected"))?;
        let sealed = link.send.encrypt_with_ad(&[], &frame)?;
        link.transport.send(&sealed).await?;
        tracing::debug!(tag = node.tag(), bytes = sealed.len(), "Sent frame");
        Ok(())
    }

    async fn send_ping(&self) -> Result<String> {
        let id = self.iq_id();
        let ping = Node::new("iq")?
            .with_attr("id", id.as_str())
            .with_attr("type", "get")
            .with_attr("xmlns", PING_XMLNS)
            .with_children(vec![Node::new("ping")?]);
        self.send_node(&ping).await?;
        Ok(id)
    }

    /// Decrypt and decode one frame; failures are reported and dropped.
    fn open_frame(&self, recv: &mut CipherState, frame: &[u8]) -> Option<Node> {
        let reason = match recv.decrypt_with_ad(&[], frame) {
            Ok(plaintext) => match decode(&plaintext) {
                Ok(node) => {
                    tracing::debug!(tag = node.tag(), bytes = frame.len(), "Received frame");
                    return Some(node);
                }
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };
        tracing::warn!("Dropping inbound frame: {}", reason);
        self.emit(ClientEvent::FrameRejected { reason });
        None
    }

    async fn dispatch(&self, node: Node, outstanding: &mut Option<(String, Instant)>) {
        let kind = node.attr("type");

        if node.tag() == "iq" && kind == Some("result") {
            let pong = matches!(
                (outstanding.as_ref(), node.attr("id")),
                (Some((expected, _)), Some(id)) if expected == id
            );
            if pong {
                tracing::trace!("Pong received");
                *outstanding = None;
                return;
            }
        }

        if node.tag() == "iq" && kind == Some("get") && node.child("ping").is_some() {
            if let Err(e) = self.answer_ping(&node).await {
                tracing::warn!("Could not answer ping: {}", e);
            }
            return;
        }

        if node.tag() == "message" && node.child("enc").is_some() {
            let event = self.open_message(node);
            self.emit(event);
            return;
        }

        if node.tag() == "notification" && kind == Some("prekey") {
            match self.consume_prekey(&node) {
                Ok(event) => self.emit(event),
                Err(e) => {
                    tracing::warn!("Could not start session from prekey: {}", e);
                    self.emit(ClientEvent::FrameRejected {
                        reason: e.to_string(),
                    });
                }
            }
            return;
        }

        self.emit(ClientEvent::from_node(node));
    }

    async fn answer_ping(&self, ping: &Node) -> Result<()> {
        let mut reply = Node::new("iq")?.with_attr("type", "result");
        if let Some(id) = ping.attr("id") {
            reply.set_attr("id", id);
        }
        self.send_node(&reply).await
    }

    /// `<notification type="prekey" from=jid><prekey id=n>base key</prekey>`:
    /// the peer used prekey `n`. The prekey is removed and a responder
    /// ratchet is seeded from it.
    fn consume_prekey(&self, node: &Node) -> Result<ClientEvent> {
        let jid = node
            .attr("from")
            .ok_or(ClientError::protocol("prekey notification without from"))?
            .to_string();
        let used = node
            .child("prekey")
            .ok_or(ClientError::protocol("prekey notification without prekey"))?;
        let prekey_id: u32 = used
            .attr("id")
            .and_then(|id| id.parse().ok())
            .ok_or(ClientError::protocol("prekey id missing or malformed"))?;
        let base_key = PublicKey::from_slice(
            used.payload()
                .ok_or(ClientError::protocol("prekey notification without base key"))?,
        )?;

        let (prekey, export) = {
            let mut keys = lock(&self.keys);
            let prekey = keys
                .remove_prekey(prekey_id)?
                .ok_or(ClientError::protocol("unknown or already used prekey"))?;
            (prekey, keys.export_all()?)
        };
        let secret = prekey.key_pair().dh(&base_key)?;
        let session = RatchetSession::from_shared_secret(secret.as_bytes(), Role::Responder)?;

        // Keep the persisted export in step so a restart cannot revive the key
        let record = lock(&self.record).clone();
        if let Some(mut record) = record {
            record.key_export = export;
            record.touch();
            self.store_session(record);
        }

        tracing::info!(jid = %jid, prekey_id, "Prekey consumed, ratchet installed");
        self.ratchets.insert(jid.clone(), session);
        Ok(ClientEvent::SessionStarted { jid, prekey_id })
    }

    /// Decrypt `message/enc` with the sender's ratchet.
    fn open_message(&self, node: Node) -> ClientEvent {
        let Some(from) = node.attr("from").map(str::to_string) else {
            return ClientEvent::Message(node);
        };
        let Some(mut session) = self.ratchets.get_mut(&from) else {
            return ClientEvent::Message(node);
        };

        let opened = node
            .child("enc")
            .and_then(Node::payload)
            .ok_or_else(|| chatwire_crypto::CryptoError::InvalidMessage("empty enc".into()))
            .and_then(RatchetMessage::from_bytes)
            .and_then(|message| session.decrypt(&message));

        match opened {
            Ok(plaintext) => ClientEvent::DecryptedMessage {
                from,
                id: node.attr("id").map(str::to_string),
                plaintext,
            },
            Err(e) => {
                tracing::warn!(from = %from, "Could not decrypt message: {}", e);
                ClientEvent::FrameRejected {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Read frames and keep the link alive until it fails or the client stops.
async fn read_loop(
    inner: Arc<ClientInner>,
    transport: Arc<dyn Transport>,
    mut recv: CipherState,
    generation: u64,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let interval = inner.config.connection.heartbeat_interval();
    let pong_timeout = inner.config.connection.pong_timeout();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut outstanding: Option<(String, Instant)> = None;

    let reason = loop {
        let deadline = outstanding.as_ref().map(|(_, deadline)| *deadline);
        tokio::select! {
            biased;
            () = stopped(&mut shutdown) => return,
            frame = transport.recv() => match frame {
                Ok(frame) => {
                    if let Some(node) = inner.open_frame(&mut recv, &frame) {
                        inner.dispatch(node, &mut outstanding).await;
                    }
                }
                Err(e) => break format!("transport closed: {e}"),
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                break "pong timeout".to_string();
            }
            _ = heartbeat.tick() => {
                if outstanding.is_none() {
                    match inner.send_ping().await {
                        Ok(id) => outstanding = Some((id, Instant::now() + pong_timeout)),
                        Err(e) => break format!("ping failed: {e}"),
                    }
                }
            }
        }
    };

    if let Err(e) = transport.close().await {
        tracing::debug!("Error closing transport: {}", e);
    }
    let _ = inner.lost_tx.send(LinkLost { generation, reason });
}

// ═══════════════════════════════════════════════════════════════════════════
// Reconnection
// ═══════════════════════════════════════════════════════════════════════════

/// Turns lost links into reconnect attempts. Exits once the client is gone.
async fn supervise(inner: Weak<ClientInner>, mut lost: mpsc::UnboundedReceiver<LinkLost>) {
    while let Some(event) = lost.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.handle_lost(event).await {
            inner.reconnect().await;
        }
    }
}

impl ClientInner {
    /// Tear down the link a reader reported. Returns whether to reconnect.
    async fn handle_lost(&self, event: LinkLost) -> bool {
        let link = {
            let mut guard = self.link.lock().await;
            if guard.as_ref().map(|l| l.generation) != Some(event.generation) {
                return false;
            }
            guard.take()
        };
        if let Some(link) = link {
            let _ = link.transport.close().await;
        }
        if self.set_state(ConnectionState::Disconnected).is_err() {
            return false;
        }

        tracing::warn!(reason = %event.reason, "Disconnected");
        self.emit(ClientEvent::Disconnected {
            reason: event.reason,
        });
        true
    }

    async fn reconnect(self: &Arc<Self>) {
        loop {
            let (delay, attempt) = {
                let mut backoff = lock(&self.backoff);
                (backoff.next_delay(), backoff.attempts())
            };
            let Some(delay) = delay else {
                tracing::error!(attempts = attempt, "Reconnect attempts exhausted");
                self.emit(ClientEvent::Terminal { attempts: attempt });
                return;
            };

            if self.set_state(ConnectionState::Reconnecting).is_err() {
                return;
            }
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            self.emit(ClientEvent::Reconnecting { attempt, delay });

            let slept = self
                .guarded(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await;
            if slept.is_err() {
                return;
            }

            match self.establish().await {
                Ok(_) => return,
                Err(e) if e.is_permanent() => {
                    tracing::debug!("Reconnect stopped: {}", e);
                    return;
                }
                Err(_) => {}
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Queue sink
// ═══════════════════════════════════════════════════════════════════════════

/// Writes dequeued actions once the client is connected.
struct ClientSink(Weak<ClientInner>);

#[async_trait]
impl ActionSink for ClientSink {
    async fn execute(&self, action: OutboundAction) -> Result<()> {
        let inner = self.0.upgrade().ok_or(ClientError::Destroyed)?;
        let mut state = inner.state.subscribe();
        let reached = *state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Destroyed))
            .await
            .map_err(|_| ClientError::Destroyed)?;
        if reached == ConnectionState::Destroyed {
            return Err(ClientError::Destroyed);
        }
        inner.send_node(&action.into_node()?).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

fn message_id() -> String {
    let mut raw = [0u8; 8];
    OsRng.fill_bytes(&mut raw);
    hex::encode_upper(raw)
}

/// Resolves once the client is destroyed. The watch guard is dropped
/// before this returns.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn config_error(err: ConfigError) -> ClientError {
    ClientError::InvalidConfig(Cow::Owned(err.to_string()))
}

fn queue_error(err: QueueError) -> ClientError {
    match err {
        QueueError::Destroyed => ClientError::Destroyed,
        QueueError::Action(e) => e,
    }
}
