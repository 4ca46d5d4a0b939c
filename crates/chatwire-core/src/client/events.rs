//! Typed events delivered to the application.

use crate::binary::Node;
use crate::session::ConnectionState;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use std::time::Duration;

/// Everything the client reports to the application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection state changed
    StateChanged(ConnectionState),
    /// Authenticated; `resumed` tells whether a stored session was reused
    Connected {
        /// Login used a stored session
        resumed: bool,
    },
    /// Transport closed
    Disconnected {
        /// Why the connection ended
        reason: String,
    },
    /// Reconnect scheduled
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Wait before the attempt
        delay: Duration,
    },
    /// Reconnect budget exhausted; the client stays disconnected
    Terminal {
        /// Attempts made
        attempts: u32,
    },
    /// Fresh registration needs the user to scan or enter a pairing code
    PairingRequired(PairingPayload),
    /// Registration completed
    Paired {
        /// Account id assigned by the server
        wid: Option<String>,
    },
    /// Session was logged out and cleared
    LoggedOut,
    /// An inbound frame failed to decrypt or decode and was dropped
    FrameRejected {
        /// What went wrong
        reason: String,
    },
    /// A peer started a session against one of our prekeys; a ratchet for
    /// `jid` is now installed
    SessionStarted {
        /// Peer jid
        jid: String,
        /// The consumed prekey
        prekey_id: u32,
    },
    /// Incoming `message` node
    Message(Node),
    /// Decrypted payload of an incoming `message`
    DecryptedMessage {
        /// Sender jid
        from: String,
        /// Message id
        id: Option<String>,
        /// Plaintext
        plaintext: Vec<u8>,
    },
    /// Incoming `receipt` node
    Receipt(Node),
    /// Incoming `presence` node
    Presence(Node),
    /// Incoming `iq` node not consumed by the client itself
    Iq(Node),
    /// Incoming `notification` node
    Notification(Node),
    /// Any other incoming node
    Other(Node),
}

impl ClientEvent {
    /// Classify an inbound node by tag.
    #[must_use]
    pub fn from_node(node: Node) -> Self {
        match node.tag() {
            "message" => Self::Message(node),
            "receipt" => Self::Receipt(node),
            "presence" => Self::Presence(node),
            "iq" => Self::Iq(node),
            "notification" => Self::Notification(node),
            _ => Self::Other(node),
        }
    }
}

/// What the user needs to pair this client.
#[derive(Clone, PartialEq, Eq)]
pub struct PairingPayload {
    /// Identity public key
    pub public_key: [u8; 32],
    /// Pairing reference issued by the server
    pub server_ref: String,
    /// Client id
    pub client_id: String,
    /// Issue time (unix seconds)
    pub timestamp: u64,
}

impl PairingPayload {
    /// String to render as a QR code: `ref,base64(public_key),client_id`.
    #[must_use]
    pub fn qr_data(&self) -> String {
        format!(
            "{},{},{}",
            self.server_ref,
            B64.encode(self.public_key),
            self.client_id
        )
    }
}

impl std::fmt::Debug for PairingPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingPayload")
            .field("public_key", &hex::encode(self.public_key))
            .field("server_ref", &crate::logging::RedactedHex(&self.server_ref))
            .field("client_id", &self.client_id)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_node() {
        let event = ClientEvent::from_node(Node::new("receipt").unwrap());
        assert!(matches!(event, ClientEvent::Receipt(_)));

        let event = ClientEvent::from_node(Node::new("message").unwrap());
        assert!(matches!(event, ClientEvent::Message(_)));

        let event = ClientEvent::from_node(Node::new("call").unwrap());
        assert!(matches!(event, ClientEvent::Other(n) if n.tag() == "call"));
    }

    #[test]
    fn test_qr_data() {
        let payload = PairingPayload {
            public_key: [0u8; 32],
            server_ref: "2@abc".into(),
            client_id: "cid".into(),
            timestamp: 1,
        };
        assert_eq!(
            payload.qr_data(),
            "2@abc,AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=,cid"
        );
    }
}
