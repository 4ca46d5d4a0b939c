//! End-to-end tests of the session client against the scripted server.
//!
//! Every test drives a real `ConnectionManager` over in-memory transports:
//! handshake, registration and resume, heartbeat, reconnection, paced
//! sending and ratchet-encrypted messages.

use chatwire_core::client::{ClientError, ClientEvent, ConnectionManager};
use chatwire_core::{ConnectionState, Node};
use chatwire_crypto::noise::Role;
use chatwire_crypto::ratchet::{RatchetMessage, RatchetSession};
use chatwire_integration_tests::fixtures::{
    CLIENT_TOKEN, MockServer, SERVER_TOKEN, ServerConn, WID, build_client, next_event,
    test_config,
};
use chatwire_transport::MemoryConnector;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

const PEER: &str = "15557654321@s.whatsapp.net";

/// Register a fresh client and hand back both ends.
async fn registered_client(
    connector: &MemoryConnector,
    server: MockServer,
    dir: &TempDir,
    config: chatwire_core::ClientConfig,
) -> (
    ConnectionManager,
    UnboundedReceiver<ClientEvent>,
    MockServer,
    ServerConn,
) {
    let (client, events) = build_client(config, connector, dir.path());
    let server_task = tokio::spawn(async move {
        let mut server = server;
        let mut conn = server.accept().await;
        conn.complete_registration(None).await;
        (server, conn)
    });

    let resumed = client.connect().await.expect("registration succeeds");
    assert!(!resumed);
    let (server, conn) = server_task.await.unwrap();
    (client, events, server, conn)
}

// ============================================================================
// Registration and resume
// ============================================================================

#[tokio::test]
async fn test_fresh_registration_pairs_and_persists() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events) = build_client(test_config(), &connector, dir.path());

    let server_task = tokio::spawn(async move {
        let mut server = MockServer::new(listener);
        let mut conn = server.accept().await;
        let register = conn.complete_registration(Some("2@pairing-ref")).await;
        (conn, register)
    });

    assert!(!client.connect().await.unwrap());
    let (conn, register) = server_task.await.unwrap();
    assert_eq!(conn.endpoint, "ws://primary.test");
    assert_eq!(client.state(), ConnectionState::Connected);

    let pairing = next_event(&mut events, |e| matches!(e, ClientEvent::PairingRequired(_))).await;
    let ClientEvent::PairingRequired(payload) = pairing else {
        unreachable!()
    };
    assert_eq!(payload.server_ref, "2@pairing-ref");
    assert_eq!(
        payload.public_key,
        client.identity_public().unwrap().to_bytes()
    );
    assert_eq!(Some(payload.client_id.as_str()), register.attr("client_id"));
    assert!(payload.qr_data().starts_with("2@pairing-ref,"));

    // The handshake static key is the identity key
    assert_eq!(conn.client_static, client.identity_public().unwrap());

    let paired = next_event(&mut events, |e| matches!(e, ClientEvent::Paired { .. })).await;
    assert!(matches!(paired, ClientEvent::Paired { wid: Some(w) } if w == WID));
    let connected = next_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert!(matches!(connected, ClientEvent::Connected { resumed: false }));

    let record = client.session().unwrap();
    assert_eq!(record.server_token.as_deref(), Some(SERVER_TOKEN));
    assert_eq!(record.client_token.as_deref(), Some(CLIENT_TOKEN));
    assert_eq!(record.wid.as_deref(), Some(WID));
    assert!(dir.path().join("session.bin").exists());

    client.destroy().await;
}

#[tokio::test]
async fn test_resume_with_stored_session() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (first, _events, server, _conn) =
        registered_client(&connector, MockServer::new(listener), &dir, test_config()).await;
    let identity = first.identity_public().unwrap();
    let client_id = first.session().unwrap().client_id;
    first.destroy().await;

    let (second, mut events) = build_client(test_config(), &connector, dir.path());
    assert_eq!(second.identity_public(), Some(identity));

    let server_task = tokio::spawn(async move {
        let mut server = server;
        let mut conn = server.accept().await;
        let login = conn.accept_login().await;
        (conn, login)
    });

    assert!(second.connect().await.unwrap());
    let (conn, login) = server_task.await.unwrap();
    assert_eq!(login.attr("client_id"), Some(client_id.as_str()));
    assert_eq!(login.attr("server_token"), Some(SERVER_TOKEN));
    assert_eq!(login.attr("client_token"), Some(CLIENT_TOKEN));
    assert_eq!(conn.client_static, identity);

    let connected = next_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert!(matches!(connected, ClientEvent::Connected { resumed: true }));
    second.destroy().await;
}

#[tokio::test]
async fn test_rejected_resume_falls_back_to_registration() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (first, _events, server, _conn) =
        registered_client(&connector, MockServer::new(listener), &dir, test_config()).await;
    let old_client_id = first.session().unwrap().client_id;
    first.destroy().await;

    let (second, mut events) = build_client(test_config(), &connector, dir.path());
    let server_task = tokio::spawn(async move {
        let mut server = server;
        let mut conn = server.accept().await;
        conn.reject("login", "401").await;
        // Same channel, no reconnect
        let register = conn.complete_registration(None).await;
        (conn, register)
    });

    assert!(!second.connect().await.unwrap());
    let (_conn, register) = server_task.await.unwrap();

    let new_client_id = second.session().unwrap().client_id;
    assert_ne!(new_client_id, old_client_id);
    assert_eq!(register.attr("client_id"), Some(new_client_id.as_str()));
    assert_eq!(connector.attempts(), 2);

    next_event(&mut events, |e| matches!(e, ClientEvent::Paired { .. })).await;
    second.destroy().await;
}

#[tokio::test]
async fn test_malformed_resume_reply_falls_back() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (first, _events, server, _conn) =
        registered_client(&connector, MockServer::new(listener), &dir, test_config()).await;
    first.destroy().await;

    let (second, _events) = build_client(test_config(), &connector, dir.path());
    let server_task = tokio::spawn(async move {
        let mut server = server;
        let mut conn = server.accept().await;
        conn.expect("login").await;
        conn.send(&Node::new("receipt").unwrap()).await;
        conn.complete_registration(None).await;
        conn
    });

    assert!(!second.connect().await.unwrap());
    server_task.await.unwrap();
    assert_eq!(second.state(), ConnectionState::Connected);
    second.destroy().await;
}

#[tokio::test]
async fn test_registration_rejected() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (client, _events) = build_client(test_config(), &connector, dir.path());

    let server_task = tokio::spawn(async move {
        let mut server = MockServer::new(listener);
        let mut conn = server.accept().await;
        conn.reject("register", "banned").await;
    });

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::Handshake(_)));
    assert!(err.to_string().contains("banned"));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.session().is_none());
    assert!(!dir.path().join("session.bin").exists());

    server_task.await.unwrap();
    client.destroy().await;
}

#[tokio::test]
async fn test_pinned_server_key_mismatch() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.connection.server_static_key = Some(hex::encode([0x11u8; 32]));
    let (client, _events) = build_client(config, &connector, dir.path());

    let server_task = tokio::spawn(async move {
        let mut server = MockServer::new(listener);
        server.try_accept().await.is_err()
    });

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::Handshake(_)));
    assert!(server_task.await.unwrap());
    client.destroy().await;
}

#[tokio::test]
async fn test_pinned_server_key_match() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::new(listener);
    let mut config = test_config();
    config.connection.server_static_key = Some(hex::encode(server.public_key().to_bytes()));

    let (client, _events, server, _conn) =
        registered_client(&connector, server, &dir, config).await;
    assert_eq!(
        client.session().unwrap().remote_identity,
        Some(server.public_key().to_bytes())
    );
    client.destroy().await;
}

// ============================================================================
// Connected operation
// ============================================================================

#[tokio::test]
async fn test_inbound_nodes_become_typed_events() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events, _server, mut conn) =
        registered_client(&connector, MockServer::new(listener), &dir, test_config()).await;

    conn.send(&Node::new("receipt").unwrap().with_attr("id", "r1"))
        .await;
    conn.send(&Node::new("presence").unwrap().with_attr("from", PEER))
        .await;

    let receipt = next_event(&mut events, |e| matches!(e, ClientEvent::Receipt(_))).await;
    assert!(matches!(receipt, ClientEvent::Receipt(n) if n.attr("id") == Some("r1")));
    next_event(&mut events, |e| matches!(e, ClientEvent::Presence(_))).await;
    client.destroy().await;
}

#[tokio::test]
async fn test_bad_frame_is_rejected_and_connection_continues() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events, _server, mut conn) =
        registered_client(&connector, MockServer::new(listener), &dir, test_config()).await;

    conn.send_raw(&[0xDE, 0xAD, 0xBE, 0xEF]).await;
    next_event(&mut events, |e| matches!(e, ClientEvent::FrameRejected { .. })).await;

    conn.send(&Node::new("notification").unwrap()).await;
    next_event(&mut events, |e| matches!(e, ClientEvent::Notification(_))).await;
    assert_eq!(client.state(), ConnectionState::Connected);
    client.destroy().await;
}

#[tokio::test]
async fn test_server_ping_is_answered() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (client, _events, _server, mut conn) =
        registered_client(&connector, MockServer::new(listener), &dir, test_config()).await;

    let ping = Node::new("iq")
        .unwrap()
        .with_attr("id", "srv-1")
        .with_attr("type", "get")
        .with_attr("xmlns", "w:p")
        .with_children(vec![Node::new("ping").unwrap()]);
    conn.send(&ping).await;

    let reply = conn.recv_any().await.unwrap();
    assert_eq!(reply.tag(), "iq");
    assert_eq!(reply.attr("id"), Some("srv-1"));
    assert_eq!(reply.attr("type"), Some("result"));
    client.destroy().await;
}

#[tokio::test]
async fn test_ratchet_messages_both_directions() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events, _server, mut conn) =
        registered_client(&connector, MockServer::new(listener), &dir, test_config()).await;

    let secret = [0x24u8; 32];
    client.install_ratchet(
        PEER,
        RatchetSession::from_shared_secret(&secret, Role::Initiator).unwrap(),
    );
    let mut peer = RatchetSession::from_shared_secret(&secret, Role::Responder).unwrap();

    let id = client.send_message(PEER, b"hello there").await.unwrap();
    let message = conn.expect("message").await;
    assert_eq!(message.attr("to"), Some(PEER));
    assert_eq!(message.attr("id"), Some(id.as_str()));
    let enc = message.child("enc").and_then(Node::payload).unwrap();
    let plaintext = peer.decrypt(&RatchetMessage::from_bytes(enc).unwrap()).unwrap();
    assert_eq!(plaintext, b"hello there");

    let reply = peer.encrypt(b"hi back").unwrap();
    conn.send(
        &Node::new("message")
            .unwrap()
            .with_attr("from", PEER)
            .with_attr("id", "m2")
            .with_children(vec![Node::new("enc").unwrap().with_bytes(reply.to_bytes())]),
    )
    .await;

    let event = next_event(&mut events, |e| {
        matches!(e, ClientEvent::DecryptedMessage { .. })
    })
    .await;
    let ClientEvent::DecryptedMessage { from, id, plaintext } = event else {
        unreachable!()
    };
    assert_eq!(from, PEER);
    assert_eq!(id.as_deref(), Some("m2"));
    assert_eq!(plaintext, b"hi back");

    // Replaying the same ciphertext is rejected, not delivered twice
    conn.send(
        &Node::new("message")
            .unwrap()
            .with_attr("from", PEER)
            .with_children(vec![Node::new("enc").unwrap().with_bytes(reply.to_bytes())]),
    )
    .await;
    next_event(&mut events, |e| matches!(e, ClientEvent::FrameRejected { .. })).await;
    client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_outbound_queue_paces_writes() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (client, _events, _server, mut conn) =
        registered_client(&connector, MockServer::new(listener), &dir, test_config()).await;

    let reader = tokio::spawn(async move {
        let mut arrivals = Vec::new();
        for _ in 0..3 {
            let node = conn.expect("presence").await;
            arrivals.push((Instant::now(), node.attr("id").unwrap().to_string()));
        }
        arrivals
    });

    for id in ["p1", "p2", "p3"] {
        client
            .send_node(Node::new("presence").unwrap().with_attr("id", id))
            .await
            .unwrap();
    }

    let arrivals = reader.await.unwrap();
    let ids: Vec<&str> = arrivals.iter().map(|(_, id)| id.as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2", "p3"]);
    for pair in arrivals.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(1_000));
    }
    client.destroy().await;
}

// ============================================================================
// Heartbeat and reconnection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_heartbeat_ping_and_pong_timeout() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.connection.heartbeat_interval_ms = 1_000;
    config.connection.pong_timeout_ms = 500;
    let (client, mut events, _server, mut conn) =
        registered_client(&connector, MockServer::new(listener), &dir, config).await;

    let ping = conn.recv_any().await.unwrap();
    assert_eq!(ping.tag(), "iq");
    assert_eq!(ping.attr("type"), Some("get"));
    assert_eq!(ping.attr("xmlns"), Some("w:p"));
    assert!(ping.child("ping").is_some());
    conn.send(
        &Node::new("iq")
            .unwrap()
            .with_attr("id", ping.attr("id").unwrap())
            .with_attr("type", "result"),
    )
    .await;

    // Second ping goes unanswered
    let second = conn.recv_any().await.unwrap();
    assert_ne!(second.attr("id"), ping.attr("id"));

    let event = next_event(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    assert!(matches!(event, ClientEvent::Disconnected { reason } if reason.contains("pong timeout")));
    assert!(conn.recv_any().await.is_none());
    client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_session() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events, server, conn) =
        registered_client(&connector, MockServer::new(listener), &dir, test_config()).await;

    let server_task = tokio::spawn(async move {
        let mut server = server;
        let mut conn = server.accept().await;
        conn.accept_login().await;
        conn
    });
    conn.close().await;

    next_event(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    let reconnecting =
        next_event(&mut events, |e| matches!(e, ClientEvent::Reconnecting { .. })).await;
    assert!(matches!(
        reconnecting,
        ClientEvent::Reconnecting { attempt: 1, delay } if delay == Duration::from_millis(1_000)
    ));
    let connected = next_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert!(matches!(connected, ClientEvent::Connected { resumed: true }));
    assert_eq!(client.state(), ConnectionState::Connected);

    server_task.await.unwrap();
    client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_then_terminal() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.reconnect.base_delay_ms = 100;
    config.reconnect.max_delay_ms = 300;
    config.reconnect.max_attempts = 4;
    let (client, mut events, _server, conn) =
        registered_client(&connector, MockServer::new(listener), &dir, config).await;

    connector.refuse("ws://primary.test");
    connector.refuse("ws://backup.test");
    let attempts_before = connector.attempts();
    conn.close().await;

    let mut delays = Vec::new();
    let terminal = loop {
        let event = next_event(&mut events, |e| {
            matches!(
                e,
                ClientEvent::Reconnecting { .. } | ClientEvent::Terminal { .. }
            )
        })
        .await;
        match event {
            ClientEvent::Reconnecting { attempt, delay } => delays.push((attempt, delay)),
            other => break other,
        }
    };

    assert_eq!(
        delays,
        vec![
            (1, Duration::from_millis(100)),
            (2, Duration::from_millis(200)),
            (3, Duration::from_millis(300)),
            (4, Duration::from_millis(300)),
        ]
    );
    assert!(matches!(terminal, ClientEvent::Terminal { attempts: 4 }));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    // Each attempt tries both endpoints once
    assert_eq!(connector.attempts() - attempts_before, 8);

    // No second Terminal
    tokio::time::sleep(Duration::from_secs(60)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ClientEvent::Terminal { .. }));
    }
    client.destroy().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_destroy_closes_transport_and_rejects_queue() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events, _server, mut conn) =
        registered_client(&connector, MockServer::new(listener), &dir, test_config()).await;

    client.destroy().await;
    assert_eq!(client.state(), ConnectionState::Destroyed);
    assert!(conn.recv_any().await.is_none());

    let err = client
        .send_node(Node::new("presence").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Destroyed));

    // Destroy never triggers a reconnect
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ClientEvent::Reconnecting { .. }));
    }
}

#[tokio::test]
async fn test_logout_clears_session() {
    let (connector, listener) = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events, _server, mut conn) =
        registered_client(&connector, MockServer::new(listener), &dir, test_config()).await;
    let client_id = client.session().unwrap().client_id;

    client.logout().await.unwrap();

    let logout = conn.expect("logout").await;
    assert_eq!(logout.attr("client_id"), Some(client_id.as_str()));
    assert!(client.session().is_none());
    assert!(!dir.path().join("session.bin").exists());
    assert_eq!(client.state(), ConnectionState::Destroyed);
    next_event(&mut events, |e| matches!(e, ClientEvent::LoggedOut)).await;
}
