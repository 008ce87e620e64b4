//! # Tether Protocol Library
//!
//! Message definitions shared by the Tether broker and its clients.
//!
//! ## Overview
//!
//! Tether keeps interactive shells alive on a host while clients come and go.
//! Clients talk to the broker over an ordered, bidirectional channel (a
//! WebSocket in the reference daemon) using named events:
//!
//! ```text
//! client                                   broker
//!   │ ── create-session {name?} ─────────────▶ │
//!   │ ◀──────────── session-created {id,name} ─│
//!   │ ◀─────────────────── attached {id,name} ─│
//!   │ ◀───────────────────── sessions [...] ───│  (broadcast)
//!   │ ── input "ls\r" ───────────────────────▶ │
//!   │ ◀──────────────────────── output "..." ──│
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use tether_protocol::{ClientMessage, ServerMessage};
//!
//! let request = ClientMessage::from_json(r#"{"event":"attach","data":"abc"}"#).unwrap();
//! assert_eq!(request, ClientMessage::Attach("abc".to_string()));
//!
//! let reply = ServerMessage::Error("session not found: abc".to_string());
//! assert_eq!(
//!     reply.to_json().unwrap(),
//!     r#"{"event":"error","data":"session not found: abc"}"#
//! );
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Client and server message definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    ClientMessage, CreateSession, RenameSession, Resize, ServerMessage, SessionExited, SessionId,
    SessionLabel, SessionRef, SessionSummary,
};
