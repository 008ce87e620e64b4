//! Protocol message definitions for Tether.
//!
//! Every message on the wire is a single JSON object carrying an event name
//! and an optional payload:
//!
//! ```json
//! {"event": "attach", "data": "5f0c…"}
//! {"event": "sessions", "data": [{"id": "5f0c…", "name": "Shell 1", "connected": true, "createdAt": 1700000000000}]}
//! ```
//!
//! [`ClientMessage`] covers requests flowing from a client to the broker,
//! [`ServerMessage`] covers everything the broker sends back.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Opaque session identifier handed out by the broker.
pub type SessionId = String;

/// Requests sent from a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Ask for the current session list.
    ListSessions,
    /// Create a session and attach to it.
    CreateSession(CreateSession),
    /// Attach to an existing session.
    Attach(SessionId),
    /// Stop receiving output from the current session without disconnecting.
    Detach,
    /// Keystrokes for the attached session.
    Input(String),
    /// Terminal size change for the attached session.
    Resize(Resize),
    /// Terminate a session.
    KillSession(SessionId),
    /// Relabel a session.
    RenameSession(RenameSession),
}

/// Messages sent from the broker to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Current session list (reply to `list-sessions` and membership broadcasts).
    Sessions(Vec<SessionSummary>),
    /// Acknowledges a `create-session` request.
    SessionCreated(SessionLabel),
    /// Acknowledges an attach; output for this session follows.
    Attached(SessionLabel),
    /// Process output or scrollback replay for the attached session.
    Output(String),
    /// The process inside a session ended.
    SessionExited(SessionExited),
    /// Another connection took over the session this connection was attached to.
    Detached(SessionRef),
    /// The session this connection was attached to was explicitly killed.
    SessionKilled(SessionRef),
    /// A request failed.
    Error(String),
}

// ============================================================================
// Payloads
// ============================================================================

/// Payload of `create-session`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSession {
    /// Display label; the broker picks `Shell N` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Payload of `resize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    /// Terminal columns.
    pub cols: u16,
    /// Terminal rows.
    pub rows: u16,
}

/// Payload of `rename-session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameSession {
    /// Session to relabel.
    pub id: SessionId,
    /// New display label.
    pub name: String,
}

/// Identity and label of a session, sent with `session-created` and `attached`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLabel {
    /// Session identifier.
    pub id: SessionId,
    /// Display label.
    pub name: String,
}

/// Bare session reference, sent with `detached` and `session-killed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    /// Session identifier.
    pub id: SessionId,
}

/// Payload of `session-exited`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExited {
    /// Session whose process ended.
    pub id: SessionId,
    /// Exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// Signal description, when the process was terminated by a signal.
    pub signal: Option<String>,
}

/// One entry of the `sessions` list. Never carries buffer content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session identifier.
    pub id: SessionId,
    /// Display label.
    pub name: String,
    /// Whether some connection is currently attached.
    pub connected: bool,
    /// Creation time, Unix epoch milliseconds.
    pub created_at: u64,
}

// ============================================================================
// Encoding
// ============================================================================

/// Envelope shape used while decoding client messages.
#[derive(Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    data: Value,
}

impl ClientMessage {
    /// Decode a client message from a JSON text frame.
    ///
    /// `list-sessions`, `detach` and `create-session` may omit `data`.
    pub fn from_json(text: &str) -> Result<Self> {
        let RawEvent { event, data } = serde_json::from_str(text)?;

        let message = match event.as_str() {
            "list-sessions" => ClientMessage::ListSessions,
            "create-session" => ClientMessage::CreateSession(optional_payload(&event, data)?),
            "attach" => ClientMessage::Attach(payload(&event, data)?),
            "detach" => ClientMessage::Detach,
            "input" => ClientMessage::Input(payload(&event, data)?),
            "resize" => ClientMessage::Resize(payload(&event, data)?),
            "kill-session" => ClientMessage::KillSession(payload(&event, data)?),
            "rename-session" => ClientMessage::RenameSession(payload(&event, data)?),
            _ => return Err(ProtocolError::UnknownEvent(event)),
        };

        Ok(message)
    }

    /// Encode this message as a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of this message's event.
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::ListSessions => "list-sessions",
            ClientMessage::CreateSession(_) => "create-session",
            ClientMessage::Attach(_) => "attach",
            ClientMessage::Detach => "detach",
            ClientMessage::Input(_) => "input",
            ClientMessage::Resize(_) => "resize",
            ClientMessage::KillSession(_) => "kill-session",
            ClientMessage::RenameSession(_) => "rename-session",
        }
    }
}

impl ServerMessage {
    /// Encode this message as a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a server message from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of this message's event.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Sessions(_) => "sessions",
            ServerMessage::SessionCreated(_) => "session-created",
            ServerMessage::Attached(_) => "attached",
            ServerMessage::Output(_) => "output",
            ServerMessage::SessionExited(_) => "session-exited",
            ServerMessage::Detached(_) => "detached",
            ServerMessage::SessionKilled(_) => "session-killed",
            ServerMessage::Error(_) => "error",
        }
    }
}

fn payload<T: DeserializeOwned>(event: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

fn optional_payload<T: DeserializeOwned + Default>(event: &str, data: Value) -> Result<T> {
    if data.is_null() {
        Ok(T::default())
    } else {
        payload(event, data)
    }
}
