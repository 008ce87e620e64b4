//! # Tether Daemon Library
//!
//! This crate provides the session broker behind Tether: long-lived shell
//! processes that outlive the connections driving them.
//!
//! ## Overview
//!
//! The daemon owns every shell process independently of any network
//! connection. A client can create a session, detach (or simply drop off the
//! network), and later reattach to find the shell exactly where it left it,
//! with recent output replayed from a scrollback buffer.
//!
//! - **Session Table**: Spawns shells on PTYs, enforces the session limit,
//!   buffers output, and tracks which connection is attached where
//! - **Broker**: Hands out per-connection protocol handlers and broadcasts
//!   session list changes
//! - **Transport**: WebSocket listener carrying the JSON protocol
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    WebSocket Transport                        │
//! │      (one reader loop + one writer task per connection)       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ConnectionHandler  ──▶  Broker  ──▶  broadcast `sessions`    │
//! │         │                                                     │
//! │         ▼                                                     │
//! │  ┌────────────────────────────────────────────────────────┐   │
//! │  │                    Session Table                       │   │
//! │  │  sessions · ring buffers · connection ↔ session links  │   │
//! │  └────────────────────────────────────────────────────────┘   │
//! │         │  ▲                                                  │
//! │         ▼  │ PtyEvent::{Data, Exit}                           │
//! │  ┌────────────────────────────────────────────────────────┐   │
//! │  │                PTY adapter (portable-pty)              │   │
//! │  └────────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether_daemon::{transport, Broker, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let broker = Broker::from_config(&config);
//!     let listener = transport::bind(config.bind_addr()?).await?;
//!
//!     let shutdown = CancellationToken::new();
//!     transport::serve(listener, broker.clone(), shutdown).await;
//!
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY adapter, ring buffer and session table
//! - [`outbox`]: Per-connection outbound queues
//! - [`broker`]: Broker and connection handler
//! - [`transport`]: WebSocket listener

pub mod broker;
pub mod config;
pub mod outbox;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use tether_protocol as protocol;

pub use broker::{Broker, ConnectionHandler, HandlerError};
pub use config::{Config, ConfigError, EnvOverride};
pub use outbox::{ConnectionId, Outbox, OutboxStats};
pub use session::{
    ExitStatus, NativePtySpawner, PtyEvent, PtyProcess, PtySpawner, RingBuffer, SessionError,
    SessionId, SessionTable, SpawnRequest, TableEvent,
};
pub use transport::TransportError;
