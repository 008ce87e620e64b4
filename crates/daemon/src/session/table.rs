//! The session table.
//!
//! [`SessionTable`] is the single authority over live sessions: it enforces
//! the session limit, owns every shell process and scrollback buffer, and
//! tracks which connection (if any) is attached to which session.
//!
//! All state lives behind one async mutex. Client requests and process events
//! both go through it, so membership, buffers and attachments never change
//! under a concurrent reader. Process events are fed in by one pump task per
//! session, which keeps each session's output in production order.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tether_protocol::{ServerMessage, SessionExited, SessionLabel, SessionRef, SessionSummary};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::pty::{ExitStatus, PtyEvent, PtyProcess, PtySpawner, SpawnRequest};
use super::ring_buffer::RingBuffer;
use super::{SessionError, SessionId};
use crate::config::SessionConfig;
use crate::outbox::{ConnectionId, Outbox};

/// Notifications the table raises for its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEvent {
    /// A session's process ended on its own and the session was removed.
    SessionExited {
        /// Removed session.
        id: SessionId,
        /// How the process ended.
        status: ExitStatus,
    },
}

/// One managed shell process.
struct Session {
    name: String,
    /// Creation ordinal, used for list ordering.
    seq: u64,
    created_at: u64,
    buffer: RingBuffer,
    process: Box<dyn PtyProcess>,
}

/// Connection to session relation, stored once and queried both ways.
#[derive(Default)]
struct Attachments {
    by_session: HashMap<SessionId, Outbox>,
    by_connection: HashMap<ConnectionId, SessionId>,
}

impl Attachments {
    /// Makes `outbox` the holder of `session`.
    ///
    /// Releases whatever the connection held before, and returns the previous
    /// holder of `session` if that was a different connection.
    fn bind(&mut self, session: &SessionId, outbox: &Outbox) -> Option<Outbox> {
        self.release_connection(outbox.id());

        let displaced = self.by_session.insert(session.clone(), outbox.clone());
        self.by_connection
            .insert(outbox.id().clone(), session.clone());

        let displaced = displaced.filter(|previous| previous.id() != outbox.id())?;
        self.by_connection.remove(displaced.id());
        Some(displaced)
    }

    fn holder(&self, session: &str) -> Option<&Outbox> {
        self.by_session.get(session)
    }

    fn session_of(&self, connection: &str) -> Option<&SessionId> {
        self.by_connection.get(connection)
    }

    fn release_connection(&mut self, connection: &str) -> Option<SessionId> {
        let session = self.by_connection.remove(connection)?;
        self.by_session.remove(&session);
        Some(session)
    }

    fn release_session(&mut self, session: &str) -> Option<Outbox> {
        let holder = self.by_session.remove(session)?;
        self.by_connection.remove(holder.id());
        Some(holder)
    }

    fn clear(&mut self) {
        self.by_session.clear();
        self.by_connection.clear();
    }
}

struct TableState {
    sessions: HashMap<SessionId, Session>,
    attachments: Attachments,
    next_seq: u64,
}

impl TableState {
    fn summary(&self, id: &SessionId, session: &Session) -> SessionSummary {
        SessionSummary {
            id: id.clone(),
            name: session.name.clone(),
            connected: self
                .attachments
                .holder(id)
                .is_some_and(|holder| !holder.is_closed()),
            created_at: session.created_at,
        }
    }

    /// Attach sequence: displace, acknowledge, replay.
    fn attach(&mut self, id: &str, outbox: &Outbox) -> Result<(), SessionError> {
        let (id, session) = self
            .sessions
            .get_key_value(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let id = id.clone();
        let label = SessionLabel {
            id: id.clone(),
            name: session.name.clone(),
        };
        let replay = (!session.buffer.is_empty()).then(|| session.buffer.contents().to_string());

        if let Some(displaced) = self.attachments.bind(&id, outbox) {
            debug!(
                session_id = %id,
                connection_id = %displaced.id(),
                "Connection displaced by a newer attach"
            );
            displaced.send(ServerMessage::Detached(SessionRef { id: id.clone() }));
        }

        outbox.send(ServerMessage::Attached(label));
        if let Some(replay) = replay {
            outbox.send(ServerMessage::Output(replay));
        }

        info!(session_id = %id, connection_id = %outbox.id(), "Attached");
        Ok(())
    }

    fn record_output(&mut self, id: &str, text: String) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.buffer.append(&text);
        if let Some(holder) = self.attachments.holder(id) {
            holder.send(ServerMessage::Output(text));
        }
    }

    /// Removes a session whose process ended.
    ///
    /// Returns how much output the session produced, or `None` if it was
    /// already gone.
    fn remove_exited(&mut self, id: &str, status: &ExitStatus) -> Option<u64> {
        let session = self.sessions.remove(id)?;
        if let Some(holder) = self.attachments.release_session(id) {
            holder.send(ServerMessage::SessionExited(SessionExited {
                id: id.to_string(),
                exit_code: status.code,
                signal: status.signal.clone(),
            }));
        }
        Some(session.buffer.total_written())
    }
}

/// The authoritative collection of live sessions.
pub struct SessionTable {
    state: Arc<Mutex<TableState>>,
    spawner: Arc<dyn PtySpawner>,
    config: SessionConfig,
    events_tx: mpsc::UnboundedSender<TableEvent>,
}

impl SessionTable {
    /// Creates an empty table.
    ///
    /// Returns the table and the receiver for its [`TableEvent`]s.
    pub fn new(
        config: SessionConfig,
        spawner: Arc<dyn PtySpawner>,
    ) -> (Self, mpsc::UnboundedReceiver<TableEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let table = SessionTable {
            state: Arc::new(Mutex::new(TableState {
                sessions: HashMap::new(),
                attachments: Attachments::default(),
                next_seq: 0,
            })),
            spawner,
            config,
            events_tx,
        };
        (table, events_rx)
    }

    /// Maximum number of concurrently alive sessions.
    pub fn max_sessions(&self) -> usize {
        self.config.max_sessions
    }

    /// Creates a session without attaching anyone to it.
    pub async fn create(&self, name: Option<String>) -> Result<SessionSummary, SessionError> {
        let mut state = self.state.lock().await;
        self.create_locked(&mut state, name)
    }

    /// Creates a session and attaches `outbox` to it in one step.
    ///
    /// The connection receives `session-created`, then `attached`.
    pub async fn create_attached(
        &self,
        name: Option<String>,
        outbox: &Outbox,
    ) -> Result<SessionSummary, SessionError> {
        let mut state = self.state.lock().await;
        let summary = self.create_locked(&mut state, name)?;

        outbox.send(ServerMessage::SessionCreated(SessionLabel {
            id: summary.id.clone(),
            name: summary.name.clone(),
        }));
        state.attach(&summary.id, outbox)?;

        Ok(state
            .sessions
            .get(&summary.id)
            .map(|session| state.summary(&summary.id, session))
            .unwrap_or(summary))
    }

    fn create_locked(
        &self,
        state: &mut TableState,
        name: Option<String>,
    ) -> Result<SessionSummary, SessionError> {
        let max = self.config.max_sessions;
        if state.sessions.len() >= max {
            return Err(SessionError::CapacityExceeded { max });
        }

        let id: SessionId = Uuid::new_v4().to_string();
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Shell {}", state.sessions.len() + 1));

        let request = SpawnRequest {
            session_id: id.clone(),
            shell: self.config.shell.clone(),
            args: self.config.args.clone(),
            cwd: self.config.cwd.clone(),
            env: self
                .config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cols: self.config.cols,
            rows: self.config.rows,
        };

        let (pty_tx, pty_rx) = mpsc::unbounded_channel();
        let process = self.spawner.spawn(&request, pty_tx)?;
        let pid = process.pid();

        let seq = state.next_seq;
        state.next_seq += 1;

        let session = Session {
            name,
            seq,
            created_at: now_millis(),
            buffer: RingBuffer::new(self.config.scrollback_buffer_size),
            process,
        };
        let summary = state.summary(&id, &session);
        state.sessions.insert(id.clone(), session);

        tokio::spawn(pump_events(
            id.clone(),
            pty_rx,
            Arc::downgrade(&self.state),
            self.events_tx.clone(),
        ));

        info!(session_id = %id, name = %summary.name, pid = ?pid, "Session created");
        Ok(summary)
    }

    /// Attaches `outbox` to session `id`.
    ///
    /// A connection previously attached to the session is sent `detached`
    /// first. On `NotFound` the connection's own attachment is unchanged.
    pub async fn attach(&self, id: &str, outbox: &Outbox) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        state.attach(id, outbox)
    }

    /// Drops whatever attachment `connection` holds. Returns the session it left.
    pub async fn release(&self, connection: &str) -> Option<SessionId> {
        let mut state = self.state.lock().await;
        let released = state.attachments.release_connection(connection);
        if let Some(ref id) = released {
            info!(session_id = %id, connection_id = %connection, "Detached");
        }
        released
    }

    /// Session `connection` is attached to, if any.
    pub async fn current_session(&self, connection: &str) -> Option<SessionId> {
        let state = self.state.lock().await;
        state.attachments.session_of(connection).cloned()
    }

    /// Forwards input to the session `connection` is attached to.
    ///
    /// Input from an unattached connection is dropped.
    pub async fn write_input(&self, connection: &str, data: &str) {
        let mut state = self.state.lock().await;
        let Some(id) = state.attachments.session_of(connection).cloned() else {
            trace!(connection_id = %connection, "Dropping input from unattached connection");
            return;
        };
        if let Some(session) = state.sessions.get_mut(&id) {
            session.process.write(data.as_bytes());
        }
    }

    /// Resizes the session `connection` is attached to. Dropped when unattached.
    pub async fn resize(&self, connection: &str, cols: u16, rows: u16) {
        let mut state = self.state.lock().await;
        let Some(id) = state.attachments.session_of(connection).cloned() else {
            trace!(connection_id = %connection, "Dropping resize from unattached connection");
            return;
        };
        if let Some(session) = state.sessions.get_mut(&id) {
            session.process.resize(cols, rows);
        }
    }

    /// Terminates and removes a session.
    ///
    /// The attached connection, if any, is sent `session-killed`. Unknown ids
    /// are a no-op. Returns whether a session was removed.
    pub async fn kill(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(mut session) = state.sessions.remove(id) else {
            debug!(session_id = %id, "Kill for unknown session ignored");
            return false;
        };

        if let Some(holder) = state.attachments.release_session(id) {
            holder.send(ServerMessage::SessionKilled(SessionRef { id: id.to_string() }));
        }
        session.process.kill();

        info!(
            session_id = %id,
            output_chars = session.buffer.total_written(),
            "Session killed"
        );
        true
    }

    /// Relabels a session.
    ///
    /// The name is trimmed like at creation. Unknown ids and blank names are a
    /// no-op. Returns whether the session was renamed.
    pub async fn rename(&self, id: &str, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            debug!(session_id = %id, "Ignoring blank rename");
            return false;
        }
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(id) {
            Some(session) => {
                session.name = name.to_string();
                debug!(session_id = %id, name = %name, "Session renamed");
                true
            }
            None => false,
        }
    }

    /// Snapshot of all live sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let state = self.state.lock().await;
        let mut sessions: Vec<(u64, SessionSummary)> = state
            .sessions
            .iter()
            .map(|(id, session)| (session.seq, state.summary(id, session)))
            .collect();
        sessions.sort_by_key(|(seq, _)| *seq);
        sessions.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Looks up one live session.
    pub async fn get(&self, id: &str) -> Result<SessionSummary, SessionError> {
        let state = self.state.lock().await;
        state
            .sessions
            .get_key_value(id)
            .map(|(id, session)| state.summary(id, session))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Kills every session. Returns how many were running.
    pub async fn shutdown(&self) -> usize {
        let mut state = self.state.lock().await;
        let count = state.sessions.len();
        state.attachments.clear();
        for (id, mut session) in state.sessions.drain() {
            session.process.kill();
            debug!(session_id = %id, "Session killed on shutdown");
        }
        count
    }
}

/// Feeds one session's process events into the table, in order.
async fn pump_events(
    id: SessionId,
    mut events: mpsc::UnboundedReceiver<PtyEvent>,
    state: Weak<Mutex<TableState>>,
    table_events: mpsc::UnboundedSender<TableEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        let mut state = state.lock().await;

        match event {
            PtyEvent::Data(text) => state.record_output(&id, text),
            PtyEvent::Exit(status) => {
                let removed = state.remove_exited(&id, &status);
                drop(state);
                if let Some(output_chars) = removed {
                    info!(
                        session_id = %id,
                        exit_code = ?status.code,
                        signal = ?status.signal,
                        output_chars,
                        "Session exited"
                    );
                    let _ = table_events.send(TableEvent::SessionExited {
                        id: id.clone(),
                        status,
                    });
                }
                break;
            }
        }
    }
    trace!(session_id = %id, "Session event pump finished");
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
