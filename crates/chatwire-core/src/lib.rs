//! # chatwire Core
//!
//! Core protocol implementation for the chatwire messaging client.
//!
//! This crate provides:
//! - The compact binary node codec and its token dictionary
//! - The connection state machine
//! - A session client: Noise handshake, login/registration, heartbeat,
//!   reconnection, encrypted key and session persistence, paced sending
//! - Logging setup with redaction helpers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ConnectionManager                         │
//! │      (handshake, auth, heartbeat, reconnect, typed events)       │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                      Transport CipherState                       │
//! │           (AES-256-GCM per frame, keys from Noise XX)            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                           Binary Nodes                           │
//! │        (tag, attributes, content; dictionary-compressed)         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use chatwire_core::{Node, decode, encode};
//!
//! let node = Node::new("message")
//!     .unwrap()
//!     .with_attr("to", "15551234567@s.whatsapp.net")
//!     .with_text("hello");
//! let bytes = encode(&node).unwrap();
//! assert_eq!(decode(&bytes).unwrap().attr("to"), node.attr("to"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binary;
pub mod client;
pub mod error;
pub mod logging;
pub mod session;
pub mod token;

pub use binary::{Content, Node, decode, encode};
pub use client::{ClientConfig, ClientError, ClientEvent, ConnectionManager};
pub use error::{CodecError, CodecResult, Error, StateError};
pub use session::{ConnectionState, StateMachine};
pub use token::{TokenCode, TokenDictionary};

/// Maximum nesting depth accepted by the decoder
pub const MAX_NODE_DEPTH: usize = binary::MAX_DEPTH;
