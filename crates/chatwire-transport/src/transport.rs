//! Transport trait abstraction for frame-oriented backends.
//!
//! This module defines the core `Transport` trait that abstracts over the
//! connections chatwire can run on (WebSocket, in-memory pairs). A transport
//! moves whole binary frames; framing, encryption and encoding are layered
//! above it, so the connection manager never changes when the backend does.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection attempt did not complete in time
    #[error("Connection timed out after {0} ms")]
    Timeout(u64),

    /// Invalid endpoint or configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async transport trait for frame-oriented communication.
///
/// Every call to [`send`](Transport::send) delivers exactly one frame to the
/// peer, and every call to [`recv`](Transport::recv) yields exactly one.
/// Implementations serialize concurrent writers internally.
///
/// # Examples
///
/// ```no_run
/// use chatwire_transport::transport::Transport;
/// use chatwire_transport::memory::MemoryTransport;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (client, server) = MemoryTransport::pair();
///
/// client.send(b"hello").await?;
/// let frame = server.recv().await?;
/// assert_eq!(frame, b"hello");
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one binary frame.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] once the transport is closed, or a
    /// backend error if the write fails.
    async fn send(&self, frame: &[u8]) -> TransportResult<()>;

    /// Receive the next binary frame.
    ///
    /// Resolves with [`TransportError::Closed`] when either side closes.
    ///
    /// # Errors
    /// Returns `TransportError` if the receive operation fails
    async fn recv(&self) -> TransportResult<Vec<u8>>;

    /// Close the transport and release resources.
    ///
    /// After calling this method, all subsequent operations return
    /// `TransportError::Closed`, and a pending `recv` is woken. Closing
    /// twice is not an error.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Opens transports to named endpoints.
///
/// The connection manager holds one connector and asks it for a fresh
/// transport on every (re)connect, rotating through its endpoint list.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `endpoint`.
    ///
    /// # Errors
    /// Returns `TransportError` if the endpoint cannot be reached
    async fn connect(&self, endpoint: &str) -> TransportResult<Arc<dyn Transport>>;
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total frames sent
    pub frames_sent: u64,
    /// Total frames received
    pub frames_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.frames_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.frames_received += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}
