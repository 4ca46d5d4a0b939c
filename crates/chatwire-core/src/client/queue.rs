//! Paced outbound queue.
//!
//! One drain task takes items in submission order and hands each to an
//! [`ActionSink`]. Consecutive executions are at least `min_spacing` apart.
//! With a capacity configured, [`OutboundQueue::enqueue`] waits for room
//! instead of failing.

use super::config::QueueConfig;
use super::error::ClientError;
use crate::binary::Node;
use crate::error::CodecResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Queue errors
#[derive(Debug, Error, Clone)]
pub enum QueueError {
    /// The queue was shut down before the item ran
    #[error("queue destroyed")]
    Destroyed,

    /// The sink failed to execute the item
    #[error("action failed: {0}")]
    Action(ClientError),
}

/// Something the client should send.
#[derive(Debug, Clone)]
pub enum OutboundAction {
    /// A fully built node
    Node(Node),
    /// Ratchet ciphertext for `to`
    Message {
        /// Recipient jid
        to: String,
        /// Message id
        id: String,
        /// Serialized ratchet message
        payload: Vec<u8>,
    },
}

impl OutboundAction {
    /// Node to put on the wire.
    ///
    /// # Errors
    ///
    /// Returns a codec error if a node tag would be empty.
    pub fn into_node(self) -> CodecResult<Node> {
        match self {
            Self::Node(node) => Ok(node),
            Self::Message { to, id, payload } => Ok(Node::new("message")?
                .with_attr("to", to)
                .with_attr("id", id)
                .with_attr("type", "text")
                .with_children(vec![
                    Node::new("enc")?
                        .with_attr("v", "1")
                        .with_attr("type", "msg")
                        .with_bytes(payload),
                ])),
        }
    }
}

/// Executes dequeued actions.
#[async_trait]
pub trait ActionSink: Send + Sync {
    /// Execute one action.
    async fn execute(&self, action: OutboundAction) -> Result<(), ClientError>;
}

struct QueueItem {
    action: OutboundAction,
    completion: oneshot::Sender<Result<(), QueueError>>,
}

enum QueueSender {
    Bounded(mpsc::Sender<QueueItem>),
    Unbounded(mpsc::UnboundedSender<QueueItem>),
}

enum QueueReceiver {
    Bounded(mpsc::Receiver<QueueItem>),
    Unbounded(mpsc::UnboundedReceiver<QueueItem>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<QueueItem> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }

    fn close(&mut self) {
        match self {
            Self::Bounded(rx) => rx.close(),
            Self::Unbounded(rx) => rx.close(),
        }
    }

    fn try_recv(&mut self) -> Option<QueueItem> {
        match self {
            Self::Bounded(rx) => rx.try_recv().ok(),
            Self::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Handle to a queued item.
#[must_use = "a pending item reports its outcome only when awaited"]
pub struct Pending {
    rx: oneshot::Receiver<Result<(), QueueError>>,
}

impl Pending {
    /// Wait for the item to run.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Destroyed`] if the queue shut down first, or
    /// [`QueueError::Action`] if the sink failed.
    pub async fn wait(self) -> Result<(), QueueError> {
        self.rx.await.unwrap_or(Err(QueueError::Destroyed))
    }
}

/// FIFO of outbound actions drained at a minimum spacing.
pub struct OutboundQueue {
    tx: QueueSender,
    pending: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OutboundQueue {
    /// Spawn the drain task. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn start(config: &QueueConfig, sink: Arc<dyn ActionSink>) -> Self {
        let (tx, rx) = match config.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
            }
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = tokio::spawn(drain(
            rx,
            sink,
            config.min_spacing(),
            shutdown_rx,
            Arc::clone(&pending),
        ));

        Self {
            tx,
            pending,
            shutdown,
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    /// Append an item, waiting for room when the queue is bounded and full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Destroyed`] after shutdown.
    pub async fn enqueue(&self, action: OutboundAction) -> Result<Pending, QueueError> {
        if *self.shutdown.borrow() {
            return Err(QueueError::Destroyed);
        }
        let (completion, rx) = oneshot::channel();
        let item = QueueItem { action, completion };

        self.pending.fetch_add(1, Ordering::AcqRel);
        let sent = match &self.tx {
            QueueSender::Bounded(tx) => tx.send(item).await.is_ok(),
            QueueSender::Unbounded(tx) => tx.send(item).is_ok(),
        };
        if !sent {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(QueueError::Destroyed);
        }
        Ok(Pending { rx })
    }

    /// Append an item and wait for it to run.
    ///
    /// # Errors
    ///
    /// See [`enqueue`](Self::enqueue) and [`Pending::wait`].
    pub async fn submit(&self, action: OutboundAction) -> Result<(), QueueError> {
        self.enqueue(action).await?.wait().await
    }

    /// Items queued or executing.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether nothing is queued or executing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop draining and reject every pending item with
    /// [`QueueError::Destroyed`]. Returns once all of them are resolved.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!("Queue drain task failed: {}", e);
            }
        }
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn drain(
    mut rx: QueueReceiver,
    sink: Arc<dyn ActionSink>,
    spacing: Duration,
    mut shutdown: watch::Receiver<bool>,
    pending: Arc<AtomicUsize>,
) {
    let mut next_slot = Instant::now();

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let QueueItem { action, completion } = item;

        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                let _ = completion.send(Err(QueueError::Destroyed));
                pending.fetch_sub(1, Ordering::AcqRel);
                break;
            }
            result = async {
                tokio::time::sleep_until(next_slot).await;
                let result = sink.execute(action).await;
                // The sink may hold an item until the link is up; spacing
                // counts from when the write finished.
                next_slot = Instant::now() + spacing;
                result
            } => result,
        };

        pending.fetch_sub(1, Ordering::AcqRel);
        if let Err(e) = &result {
            tracing::warn!("Outbound action failed: {}", e);
        }
        let _ = completion.send(result.map_err(QueueError::Action));
    }

    rx.close();
    let mut rejected = 0usize;
    while let Some(item) = rx.try_recv() {
        let _ = item.completion.send(Err(QueueError::Destroyed));
        pending.fetch_sub(1, Ordering::AcqRel);
        rejected += 1;
    }
    tracing::debug!(rejected, "Outbound queue stopped");
}
