//! Per-connection protocol handling.

use tether_protocol::{ClientMessage, ProtocolError, ServerMessage};
use tracing::{debug, warn};

use super::Broker;
use crate::outbox::{ConnectionId, Outbox, OutboxStats};
use crate::session::SessionError;

/// Errors that can occur while handling a client request.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Session-related error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The client sent something that is not a valid request.
    #[error("invalid message: {0}")]
    Protocol(#[from] ProtocolError),
}

impl HandlerError {
    /// Convert the error to the `error` message sent back to the client.
    pub fn to_error_message(&self) -> ServerMessage {
        ServerMessage::Error(self.to_string())
    }
}

/// Protocol state machine for one connection.
///
/// The connection's attachment lives in the session table; the handler only
/// carries its identity and outbox.
pub struct ConnectionHandler {
    id: ConnectionId,
    outbox: Outbox,
    broker: Broker,
}

impl ConnectionHandler {
    pub(super) fn new(id: ConnectionId, outbox: Outbox, broker: Broker) -> Self {
        Self { id, outbox, broker }
    }

    /// Returns the connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Outbound traffic counters for this connection.
    pub fn stats(&self) -> OutboxStats {
        self.outbox.stats()
    }

    /// Queues an `error` message for this connection.
    pub fn send_error(&self, message: impl Into<String>) {
        self.outbox.send(ServerMessage::Error(message.into()));
    }

    /// Decodes and handles one JSON text frame.
    pub async fn handle_text(&self, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Rejecting client message");
                self.outbox
                    .send(HandlerError::from(e).to_error_message());
            }
        }
    }

    /// Handles one request. Failures are reported to the client as `error`.
    pub async fn handle(&self, message: ClientMessage) {
        let event = message.event_name();
        if let Err(e) = self.dispatch(message).await {
            debug!(connection_id = %self.id, event, error = %e, "Request failed");
            self.outbox.send(e.to_error_message());
        }
    }

    async fn dispatch(&self, message: ClientMessage) -> Result<(), HandlerError> {
        let table = self.broker.table();

        match message {
            ClientMessage::ListSessions => {
                self.outbox.send(ServerMessage::Sessions(table.list().await));
            }
            ClientMessage::CreateSession(request) => {
                table.create_attached(request.name, &self.outbox).await?;
                self.broker.broadcast_sessions().await;
            }
            ClientMessage::Attach(id) => {
                table.attach(&id, &self.outbox).await?;
                self.broker.broadcast_sessions().await;
            }
            ClientMessage::Detach => {
                if table.release(&self.id).await.is_some() {
                    self.broker.broadcast_sessions().await;
                }
            }
            ClientMessage::Input(data) => {
                table.write_input(&self.id, &data).await;
            }
            ClientMessage::Resize(size) => {
                table.resize(&self.id, size.cols, size.rows).await;
            }
            ClientMessage::KillSession(id) => {
                table.kill(&id).await;
                self.broker.broadcast_sessions().await;
            }
            ClientMessage::RenameSession(request) => {
                if table.rename(&request.id, &request.name).await {
                    self.broker.broadcast_sessions().await;
                }
            }
        }

        Ok(())
    }

    /// Tears down the connection. The session it was attached to keeps running.
    pub async fn disconnect(self) {
        if let Some(session_id) = self.broker.disconnect(&self.id).await {
            debug!(
                connection_id = %self.id,
                session_id = %session_id,
                "Disconnected while attached"
            );
            self.broker.broadcast_sessions().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tether_protocol::{
        CreateSession, RenameSession, Resize, SessionLabel, SessionRef, SessionSummary,
    };
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::Config;
    use crate::session::fake::FakeSpawner;

    fn broker_with(max_sessions: usize, scrollback: usize) -> (Broker, FakeSpawner) {
        let mut config = Config::default();
        config.session.shell = "/bin/sh".to_string();
        config.session.max_sessions = max_sessions;
        config.session.scrollback_buffer_size = scrollback;
        let spawner = FakeSpawner::new();
        (Broker::new(&config, Arc::new(spawner.clone())), spawner)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn sessions_of(messages: &[ServerMessage]) -> Vec<SessionSummary> {
        messages
            .iter()
            .rev()
            .find_map(|m| match m {
                ServerMessage::Sessions(list) => Some(list.clone()),
                _ => None,
            })
            .expect("no sessions message")
    }

    async fn create(handler: &ConnectionHandler, rx: &mut mpsc::Receiver<ServerMessage>) -> String {
        handler
            .handle(ClientMessage::CreateSession(CreateSession::default()))
            .await;
        match drain(rx).first() {
            Some(ServerMessage::SessionCreated(label)) => label.id.clone(),
            other => panic!("expected session-created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_acks_attaches_and_broadcasts() {
        let (broker, _spawner) = broker_with(5, 100);
        let (creator, mut creator_rx) = broker.connect();
        let (observer, mut observer_rx) = broker.connect();

        creator
            .handle_text(r#"{"event":"create-session","data":{"name":"work"}}"#)
            .await;

        let messages = drain(&mut creator_rx);
        let id = match &messages[0] {
            ServerMessage::SessionCreated(label) => label.id.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(
            messages[1],
            ServerMessage::Attached(SessionLabel {
                id: id.clone(),
                name: "work".to_string()
            })
        );
        let listed = sessions_of(&messages);
        assert_eq!(listed.len(), 1);
        assert!(listed[0].connected);

        assert_eq!(sessions_of(&drain(&mut observer_rx))[0].id, id);
        drop(observer);
    }

    #[tokio::test]
    async fn test_list_sessions_reply() {
        let (broker, _spawner) = broker_with(5, 100);
        let (handler, mut rx) = broker.connect();

        handler.handle_text(r#"{"event":"list-sessions"}"#).await;
        assert_eq!(drain(&mut rx), vec![ServerMessage::Sessions(vec![])]);
    }

    #[tokio::test]
    async fn test_capacity_error_names_limit() {
        let (broker, _spawner) = broker_with(1, 100);
        let (handler, mut rx) = broker.connect();

        let s1 = create(&handler, &mut rx).await;
        handler
            .handle(ClientMessage::CreateSession(CreateSession::default()))
            .await;
        match drain(&mut rx).as_slice() {
            [ServerMessage::Error(message)] => assert!(message.contains("at most 1")),
            other => panic!("expected capacity error, got {other:?}"),
        }

        handler.handle(ClientMessage::KillSession(s1)).await;
        drain(&mut rx);
        create(&handler, &mut rx).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_reported() {
        let (broker, spawner) = broker_with(5, 100);
        let (handler, mut rx) = broker.connect();

        spawner.fail_next();
        handler
            .handle(ClientMessage::CreateSession(CreateSession::default()))
            .await;
        match drain(&mut rx).as_slice() {
            [ServerMessage::Error(message)] => assert!(message.contains("failed to spawn")),
            other => panic!("expected spawn error, got {other:?}"),
        }
        assert_eq!(broker.table().count().await, 0);
    }

    #[tokio::test]
    async fn test_attach_unknown_session() {
        let (broker, _spawner) = broker_with(5, 100);
        let (handler, mut rx) = broker.connect();

        handler.handle(ClientMessage::Attach("nope".to_string())).await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error("session not found: nope".to_string())]
        );
    }

    #[tokio::test]
    async fn test_takeover_order_and_stale_input() {
        let (broker, spawner) = broker_with(5, 100);
        let (x, mut x_rx) = broker.connect();
        let (y, mut y_rx) = broker.connect();

        let id = create(&x, &mut x_rx).await;
        drain(&mut y_rx);

        y.handle(ClientMessage::Attach(id.clone())).await;

        let x_messages = drain(&mut x_rx);
        assert_eq!(
            x_messages[0],
            ServerMessage::Detached(SessionRef { id: id.clone() })
        );
        let y_messages = drain(&mut y_rx);
        assert_eq!(
            y_messages[0],
            ServerMessage::Attached(SessionLabel {
                id: id.clone(),
                name: "Shell 1".to_string()
            })
        );

        x.handle(ClientMessage::Input("from x\r".to_string())).await;
        x.handle(ClientMessage::Resize(Resize { cols: 10, rows: 5 }))
            .await;
        y.handle(ClientMessage::Input("from y\r".to_string())).await;

        assert_eq!(spawner.last().written(), "from y\r");
        assert_eq!(spawner.last().size(), (80, 24));
        assert!(drain(&mut x_rx).iter().all(|m| !matches!(m, ServerMessage::Error(_))));
    }

    #[tokio::test]
    async fn test_reattach_replays_buffer_before_live_output() {
        let (broker, spawner) = broker_with(5, 100);
        let (first, mut first_rx) = broker.connect();

        let id = create(&first, &mut first_rx).await;
        spawner.last().emit("A");
        spawner.last().emit("B");
        settle().await;

        first.disconnect().await;

        let (second, mut second_rx) = broker.connect();
        second.handle(ClientMessage::Attach(id.clone())).await;
        spawner.last().emit("C");
        settle().await;

        let outputs: Vec<_> = drain(&mut second_rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::Attached(_) | ServerMessage::Output(_)))
            .collect();
        assert_eq!(
            outputs,
            vec![
                ServerMessage::Attached(SessionLabel {
                    id,
                    name: "Shell 1".to_string()
                }),
                ServerMessage::Output("AB".to_string()),
                ServerMessage::Output("C".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_detach_keeps_session_running() {
        let (broker, spawner) = broker_with(5, 100);
        let (handler, mut rx) = broker.connect();

        let id = create(&handler, &mut rx).await;
        handler.handle_text(r#"{"event":"detach"}"#).await;
        let listed = sessions_of(&drain(&mut rx));
        assert_eq!(listed[0].id, id);
        assert!(!listed[0].connected);

        spawner.last().emit("while away");
        settle().await;
        assert!(drain(&mut rx)
            .iter()
            .all(|m| !matches!(m, ServerMessage::Output(_))));

        handler.handle(ClientMessage::Input("ignored".to_string())).await;
        assert_eq!(spawner.last().written(), "");
        assert_eq!(broker.table().count().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_session_running() {
        let (broker, spawner) = broker_with(5, 100);
        let (handler, mut rx) = broker.connect();
        let (observer, mut observer_rx) = broker.connect();

        create(&handler, &mut rx).await;
        drain(&mut observer_rx);

        handler.disconnect().await;

        assert!(!spawner.last().exited());
        let listed = sessions_of(&drain(&mut observer_rx));
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].connected);
        drop(observer);
    }

    #[tokio::test]
    async fn test_kill_notifies_holder_and_broadcasts() {
        let (broker, _spawner) = broker_with(5, 100);
        let (holder, mut holder_rx) = broker.connect();
        let (killer, mut killer_rx) = broker.connect();

        let id = create(&holder, &mut holder_rx).await;
        killer.handle(ClientMessage::KillSession(id.clone())).await;

        let holder_messages = drain(&mut holder_rx);
        assert_eq!(
            holder_messages[0],
            ServerMessage::SessionKilled(SessionRef { id })
        );
        assert!(sessions_of(&holder_messages).is_empty());
        assert!(sessions_of(&drain(&mut killer_rx)).is_empty());
    }

    #[tokio::test]
    async fn test_kill_unknown_is_not_an_error() {
        let (broker, _spawner) = broker_with(5, 100);
        let (handler, mut rx) = broker.connect();

        handler
            .handle(ClientMessage::KillSession("ghost".to_string()))
            .await;
        assert_eq!(drain(&mut rx), vec![ServerMessage::Sessions(vec![])]);
    }

    #[tokio::test]
    async fn test_rename_broadcasts() {
        let (broker, _spawner) = broker_with(5, 100);
        let (handler, mut rx) = broker.connect();

        let id = create(&handler, &mut rx).await;
        handler
            .handle(ClientMessage::RenameSession(RenameSession {
                id,
                name: "logs".to_string(),
            }))
            .await;

        assert_eq!(sessions_of(&drain(&mut rx))[0].name, "logs");
    }

    #[tokio::test]
    async fn test_blank_rename_is_ignored() {
        let (broker, _spawner) = broker_with(5, 100);
        let (handler, mut rx) = broker.connect();

        let id = create(&handler, &mut rx).await;
        handler
            .handle(ClientMessage::RenameSession(RenameSession {
                id: id.clone(),
                name: "   ".to_string(),
            }))
            .await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(broker.table().get(&id).await.unwrap().name, "Shell 1");
    }

    #[tokio::test]
    async fn test_stats_count_queued_replies() {
        let (broker, _spawner) = broker_with(5, 100);
        let (handler, mut rx) = broker.connect();

        handler.handle_text(r#"{"event":"list-sessions"}"#).await;
        handler.handle_text("{not json").await;

        let stats = handler.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 0);
        assert!(!stats.is_backpressured);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_bad_messages_get_error_reply() {
        let (broker, _spawner) = broker_with(5, 100);
        let (handler, mut rx) = broker.connect();

        handler.handle_text("{not json").await;
        handler.handle_text(r#"{"event":"teleport"}"#).await;
        handler
            .handle_text(r#"{"event":"resize","data":{"cols":"wide"}}"#)
            .await;

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 3);
        for message in &messages {
            match message {
                ServerMessage::Error(text) => assert!(text.starts_with("invalid message")),
                other => panic!("expected error, got {other:?}"),
            }
        }
        assert!(matches!(&messages[1], ServerMessage::Error(t) if t.contains("teleport")));
    }

    #[tokio::test]
    async fn test_exit_reports_code_to_holder() {
        let (broker, spawner) = broker_with(5, 100);
        let (handler, mut rx) = broker.connect();

        let id = create(&handler, &mut rx).await;
        spawner.last().exit(3);
        settle().await;

        let messages = drain(&mut rx);
        assert_eq!(
            messages[0],
            ServerMessage::SessionExited(tether_protocol::SessionExited {
                id,
                exit_code: Some(3),
                signal: None,
            })
        );
        assert!(sessions_of(&messages).is_empty());
    }
}
