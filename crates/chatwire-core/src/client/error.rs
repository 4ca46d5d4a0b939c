//! Error types for the client layer
//!
//! Errors are categorized to support retry logic: transient failures feed the
//! reconnect policy, permanent ones are surfaced to the caller unchanged.
//!
//! # Example
//!
//! ```no_run
//! use chatwire_core::client::ClientError;
//!
//! fn handle_error(err: ClientError) {
//!     if err.is_transient() {
//!         println!("Transient error, reconnect will retry: {}", err);
//!     } else {
//!         println!("Permanent error: {}", err);
//!     }
//! }
//! ```

use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in client operations
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    // ============ Transport Errors ============
    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Every configured endpoint refused the connection
    #[error("All {0} endpoints failed")]
    AllEndpointsFailed(usize),

    // ============ Cryptographic Errors ============
    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Handshake failed or the server rejected registration
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// No ratchet session installed for a recipient
    #[error("No ratchet session for {0}")]
    NoSession(String),

    // ============ Protocol Errors ============
    /// Malformed frame from the server
    #[error("Protocol error: {0}")]
    Protocol(Cow<'static, str>),

    // ============ Storage Errors ============
    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not permitted in the current connection state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Client has been destroyed
    #[error("Client destroyed")]
    Destroyed,

    // ============ Operational Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Channel send/receive error
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),
}

impl ClientError {
    /// Returns true if this error is transient and may succeed on reconnect
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout(_)
                | ClientError::Transport(_)
                | ClientError::AllEndpointsFailed(_)
                | ClientError::Channel(_)
                | ClientError::Protocol(_)
        )
    }

    /// Returns true if this error will not succeed without intervention
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidConfig(_)
                | ClientError::Destroyed
                | ClientError::NoSession(_)
                | ClientError::InvalidState(_)
        )
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        ClientError::Transport(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        ClientError::Timeout(Cow::Borrowed(context))
    }

    /// Create a handshake error with static context (zero allocation)
    #[must_use]
    pub const fn handshake(context: &'static str) -> Self {
        ClientError::Handshake(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        ClientError::Protocol(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        ClientError::InvalidState(Cow::Borrowed(context))
    }
}

impl From<chatwire_crypto::CryptoError> for ClientError {
    fn from(err: chatwire_crypto::CryptoError) -> Self {
        match err {
            chatwire_crypto::CryptoError::HandshakeFailed(reason) => {
                ClientError::Handshake(Cow::Owned(reason))
            }
            other => ClientError::Crypto(other.to_string()),
        }
    }
}

impl From<chatwire_transport::TransportError> for ClientError {
    fn from(err: chatwire_transport::TransportError) -> Self {
        ClientError::Transport(Cow::Owned(err.to_string()))
    }
}

impl From<crate::CodecError> for ClientError {
    fn from(err: crate::CodecError) -> Self {
        ClientError::Protocol(Cow::Owned(err.to_string()))
    }
}

impl From<crate::StateError> for ClientError {
    fn from(err: crate::StateError) -> Self {
        ClientError::InvalidState(Cow::Owned(err.to_string()))
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(Cow::Owned(err.to_string()))
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
