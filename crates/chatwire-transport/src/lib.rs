//! # chatwire Transport
//!
//! Frame transports for the chatwire client.
//!
//! This crate provides:
//! - The [`Transport`](transport::Transport) and
//!   [`Connector`](transport::Connector) traits the connection manager is
//!   written against
//! - A WebSocket client transport over `tokio-tungstenite` (binary frames only)
//! - In-memory transport pairs for tests and local tooling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod transport;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryListener, MemoryTransport};
pub use transport::{Connector, Transport, TransportError, TransportResult, TransportStats};
pub use websocket::{WebSocketConnector, WebSocketTransport};
