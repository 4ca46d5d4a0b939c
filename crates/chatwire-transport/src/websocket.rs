//! WebSocket client transport.
//!
//! Wraps a `tokio-tungstenite` stream split into sink and stream halves,
//! each behind its own lock, so one task can block in `recv` while others
//! write. Only binary messages carry frames; text messages are dropped and
//! control frames are handled by tungstenite.

use crate::transport::{Connector, Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default time allowed for TCP, TLS and the WebSocket upgrade.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Client-side WebSocket transport.
pub struct WebSocketTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl WebSocketTransport {
    /// Connect to a `ws://` or `wss://` URL.
    ///
    /// # Errors
    /// - [`TransportError::InvalidConfig`] for a non-WebSocket URL
    /// - [`TransportError::Timeout`] if the upgrade does not finish in time
    /// - [`TransportError::ConnectionFailed`] for any other failure
    pub async fn connect(url: &str, timeout: Duration) -> TransportResult<Self> {
        if !(url.starts_with("wss://") || url.starts_with("ws://")) {
            return Err(TransportError::InvalidConfig(format!(
                "not a WebSocket URL: {url}"
            )));
        }

        let (stream, response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{url}: {e}")))?;

        debug!(endpoint = %url, status = %response.status(), "WebSocket connected");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-upgraded stream.
    #[must_use]
    pub fn from_stream(stream: WsStream) -> Self {
        let (sink, stream) = stream.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            recv_errors: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: &[u8]) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut sink = self.sink.lock().await;
        match sink.send(Message::Binary(frame.to_vec())).await {
            Ok(()) => {
                self.bytes_sent
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::WebSocket(e.to_string()))
            }
        }
    }

    async fn recv(&self) -> TransportResult<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }

            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.bytes_received
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    self.frames_received.fetch_add(1, Ordering::Relaxed);
                    return Ok(data);
                }
                Some(Ok(Message::Text(text))) => {
                    warn!(len = text.len(), "Dropping text WebSocket message");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by peer");
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Closed);
                }
                // Ping/pong replies are queued by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.recv_errors.fetch_add(1, Ordering::Relaxed);
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::WebSocket(e.to_string()));
                }
                None => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Closed);
                }
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        // The peer may already be gone; closing locally is all that matters.
        if let Err(e) = sink.close().await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

/// Connector that opens [`WebSocketTransport`]s.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector with the given upgrade timeout.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> TransportResult<Arc<dyn Transport>> {
        let transport = WebSocketTransport::connect(endpoint, self.connect_timeout).await?;
        Ok(Arc::new(transport))
    }
}
