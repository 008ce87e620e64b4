//! Session broker.
//!
//! The [`Broker`] ties connections to the shared [`SessionTable`]. It hands out
//! a [`ConnectionHandler`] per connection, keeps a registry of every
//! connection's outbox so membership changes can be broadcast, and watches
//! the table for sessions whose process exited on its own.

mod handler;

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tether_protocol::ServerMessage;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::outbox::{ConnectionId, Outbox};
use crate::session::{NativePtySpawner, PtySpawner, SessionTable, TableEvent};

pub use handler::{ConnectionHandler, HandlerError};

struct BrokerInner {
    table: SessionTable,
    connections: DashMap<ConnectionId, Outbox>,
    /// Serializes broadcasts so the last one sent carries the latest list.
    broadcast_lock: Mutex<()>,
    outbox_capacity: usize,
}

/// Shared broker handle. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Creates a broker over a fresh session table.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &Config, spawner: Arc<dyn PtySpawner>) -> Self {
        let (table, table_events) = SessionTable::new(config.session.clone(), spawner);
        let inner = Arc::new(BrokerInner {
            table,
            connections: DashMap::new(),
            broadcast_lock: Mutex::new(()),
            outbox_capacity: config.server.outbox_capacity,
        });

        tokio::spawn(watch_table(Arc::downgrade(&inner), table_events));

        Broker { inner }
    }

    /// Creates a broker that spawns real shells.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config, Arc::new(NativePtySpawner))
    }

    /// The session table this broker serves.
    pub fn table(&self) -> &SessionTable {
        &self.inner.table
    }

    /// Registers a new connection.
    ///
    /// Returns its handler and the receiver the transport drains.
    pub fn connect(&self) -> (ConnectionHandler, mpsc::Receiver<ServerMessage>) {
        let id: ConnectionId = Uuid::new_v4().to_string();
        let (outbox, rx) = Outbox::with_capacity(id.clone(), self.inner.outbox_capacity);
        self.inner.connections.insert(id.clone(), outbox.clone());

        debug!(connection_id = %id, "Connection registered");
        (ConnectionHandler::new(id, outbox, self.clone()), rx)
    }

    /// Unregisters a connection and drops its attachment, if any.
    ///
    /// Returns the session the connection was attached to.
    pub(crate) async fn disconnect(&self, id: &str) -> Option<String> {
        self.inner.connections.remove(id);
        self.inner.table.release(id).await
    }

    /// Sends the current session list to every connection.
    ///
    /// Connections whose queue has closed are pruned.
    pub async fn broadcast_sessions(&self) {
        let _guard = self.inner.broadcast_lock.lock().await;
        let message = ServerMessage::Sessions(self.inner.table.list().await);

        let mut closed = Vec::new();
        for entry in self.inner.connections.iter() {
            let outbox = entry.value();
            if !outbox.send(message.clone()) && outbox.is_closed() {
                closed.push(entry.key().clone());
            }
        }

        for id in closed {
            debug!(connection_id = %id, "Pruning closed connection");
            self.inner.connections.remove(&id);
            self.inner.table.release(&id).await;
        }
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Kills every session. Returns how many were running.
    pub async fn shutdown(&self) -> usize {
        let killed = self.inner.table.shutdown().await;
        info!(sessions = killed, "Broker shut down");
        killed
    }
}

/// Rebroadcasts the session list whenever a process exits on its own.
async fn watch_table(broker: Weak<BrokerInner>, mut events: mpsc::UnboundedReceiver<TableEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = broker.upgrade() else {
            break;
        };
        match event {
            TableEvent::SessionExited { id, .. } => {
                debug!(session_id = %id, "Broadcasting after session exit");
                Broker { inner }.broadcast_sessions().await;
            }
        }
    }
}
