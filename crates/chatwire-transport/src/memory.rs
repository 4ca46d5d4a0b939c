//! In-memory transport pairs.
//!
//! [`MemoryTransport::pair`] returns two connected ends backed by unbounded
//! channels. [`MemoryConnector`] hands out the client end of a new pair on
//! each `connect` and delivers the server end through a [`MemoryListener`],
//! which lets tests script a server without opening sockets.

use crate::transport::{Connector, Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify, mpsc};

/// One end of an in-memory frame pipe.
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: AtomicBool,
    close_notify: Notify,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
}

impl MemoryTransport {
    /// Create two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: &[u8]) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::Closed);
        };
        if tx.send(frame.to_vec()).is_err() {
            self.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::Closed);
        }

        self.bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Vec<u8>> {
        // Registered before the flag check so a concurrent close cannot be missed.
        let closed = self.close_notify.notified();
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    self.bytes_received
                        .fetch_add(frame.len() as u64, Ordering::Relaxed);
                    self.frames_received.fetch_add(1, Ordering::Relaxed);
                    Ok(frame)
                }
                None => {
                    self.closed.store(true, Ordering::Release);
                    Err(TransportError::Closed)
                }
            },
            () = closed => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
        // Dropping the sender ends the peer's stream.
        self.tx.lock().await.take();
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
            recv_errors: 0,
        }
    }
}

/// Server side of a [`MemoryConnector`].
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<(String, Arc<MemoryTransport>)>,
}

impl MemoryListener {
    /// Wait for the next connection, returning the endpoint the client
    /// dialled and the server end of the pair.
    ///
    /// Returns `None` once every connector clone has been dropped.
    pub async fn accept(&mut self) -> Option<(String, Arc<MemoryTransport>)> {
        self.incoming.recv().await
    }
}

/// Connector producing in-memory pairs.
///
/// Endpoints can be marked as refusing connections to exercise endpoint
/// rotation and reconnect logic.
#[derive(Clone)]
pub struct MemoryConnector {
    incoming: mpsc::UnboundedSender<(String, Arc<MemoryTransport>)>,
    refused: Arc<DashSet<String>>,
    attempts: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Create a connector and its listener.
    #[must_use]
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                incoming: tx,
                refused: Arc::new(DashSet::new()),
                attempts: Arc::new(AtomicU64::new(0)),
            },
            MemoryListener { incoming: rx },
        )
    }

    /// Make `connect` fail for `endpoint` until [`accept`](Self::accept) is called.
    pub fn refuse(&self, endpoint: &str) {
        self.refused.insert(endpoint.to_string());
    }

    /// Let `endpoint` accept connections again.
    pub fn accept(&self, endpoint: &str) {
        self.refused.remove(endpoint);
    }

    /// Number of `connect` calls so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> TransportResult<Arc<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if self.refused.contains(endpoint) {
            return Err(TransportError::ConnectionFailed(format!(
                "{endpoint}: connection refused"
            )));
        }

        let (client, server) = MemoryTransport::pair();
        self.incoming
            .send((endpoint.to_string(), Arc::new(server)))
            .map_err(|_| TransportError::ConnectionFailed("listener dropped".into()))?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pair_send_recv() {
        let (a, b) = MemoryTransport::pair();

        a.send(b"ping").await.unwrap();
        b.send(b"pong").await.unwrap();

        assert_eq!(b.recv().await.unwrap(), b"ping");
        assert_eq!(a.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (a, b) = MemoryTransport::pair();
        a.send(b"last").await.unwrap();
        a.close().await.unwrap();

        assert!(a.is_closed());
        assert!(matches!(a.send(b"x").await, Err(TransportError::Closed)));

        // Frames already in flight are still delivered.
        assert_eq!(b.recv().await.unwrap(), b"last");
        assert!(matches!(b.recv().await, Err(TransportError::Closed)));
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let (a, _b) = MemoryTransport::pair();
        let a = Arc::new(a);

        let reader = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("recv should wake on close")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_double_close_is_ok() {
        let (a, _b) = MemoryTransport::pair();
        a.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stats() {
        let (a, b) = MemoryTransport::pair();
        a.send(&[0u8; 10]).await.unwrap();
        a.send(&[0u8; 5]).await.unwrap();
        b.recv().await.unwrap();

        let sent = a.stats();
        assert_eq!(sent.frames_sent, 2);
        assert_eq!(sent.bytes_sent, 15);

        let received = b.stats();
        assert_eq!(received.frames_received, 1);
        assert_eq!(received.bytes_received, 10);
    }

    #[tokio::test]
    async fn test_connector_delivers_server_end() {
        let (connector, mut listener) = MemoryConnector::new();

        let client = connector.connect("wss://a.example/ws").await.unwrap();
        let (endpoint, server) = listener.accept().await.unwrap();
        assert_eq!(endpoint, "wss://a.example/ws");

        client.send(b"hi").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_connector_refuse_and_accept() {
        let (connector, _listener) = MemoryConnector::new();
        connector.refuse("wss://down.example/ws");

        let err = connector.connect("wss://down.example/ws").await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));

        connector.accept("wss://down.example/ws");
        assert!(connector.connect("wss://down.example/ws").await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }

    proptest! {
        #[test]
        fn prop_frames_arrive_in_order(frames in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64), 0..32)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            runtime.block_on(async {
                let (a, b) = MemoryTransport::pair();
                for frame in &frames {
                    a.send(frame).await.unwrap();
                }
                for frame in &frames {
                    assert_eq!(&b.recv().await.unwrap(), frame);
                }
            });
        }
    }
}
