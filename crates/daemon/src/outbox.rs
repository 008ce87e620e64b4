//! Per-connection outbound message queue.
//!
//! Every connection gets a bounded queue of [`ServerMessage`]s that its
//! transport drains. Senders never wait: when a client falls behind and the
//! queue fills up, messages for it are dropped and the connection is flagged
//! as backpressured instead of stalling session output for everyone else.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tether_protocol::ServerMessage;
use tokio::sync::mpsc;

/// Unique identifier for a connection.
pub type ConnectionId = String;

/// Default queue capacity per connection.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// Statistics about a connection's outbound traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    /// Total messages queued successfully.
    pub messages_sent: u64,
    /// Messages dropped because the queue was full.
    pub messages_dropped: u64,
    /// Whether the connection is currently experiencing backpressure.
    pub is_backpressured: bool,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    backpressured: AtomicBool,
}

/// Sending half of a connection's queue.
///
/// Cheap to clone; clones share the queue and its statistics.
#[derive(Debug, Clone)]
pub struct Outbox {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
    counters: Arc<Counters>,
}

impl Outbox {
    /// Creates an outbox with the default capacity.
    ///
    /// Returns the outbox and the receiver the transport drains.
    pub fn new(id: ConnectionId) -> (Self, mpsc::Receiver<ServerMessage>) {
        Self::with_capacity(id, DEFAULT_OUTBOX_CAPACITY)
    }

    /// Creates an outbox with a specific capacity (at least 1).
    pub fn with_capacity(
        id: ConnectionId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbox = Outbox {
            id,
            tx,
            counters: Arc::new(Counters::default()),
        };
        (outbox, rx)
    }

    /// Returns the connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queues a message without waiting.
    ///
    /// Returns true if the message was queued, false if it was dropped
    /// because the queue is full or the connection has gone away.
    pub fn send(&self, message: ServerMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                if self.counters.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(
                        connection_id = %self.id,
                        "Connection recovered from backpressure"
                    );
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if !self.counters.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        connection_id = %self.id,
                        event = message.event_name(),
                        dropped,
                        "Connection is backpressured, dropping messages"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!(connection_id = %self.id, "Connection queue closed");
                false
            }
        }
    }

    /// Whether the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether the connection is currently backpressured.
    pub fn is_backpressured(&self) -> bool {
        self.counters.backpressured.load(Ordering::Relaxed)
    }

    /// Snapshot of the current statistics.
    pub fn stats(&self) -> OutboxStats {
        OutboxStats {
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
            is_backpressured: self.is_backpressured(),
        }
    }
}
