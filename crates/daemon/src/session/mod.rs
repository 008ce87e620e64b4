//! Session management module.
//!
//! This module owns the long-lived shell processes: spawning them on a PTY,
//! buffering their output for replay, and tracking which connection is
//! attached to which session.

mod error;
#[cfg(test)]
pub(crate) mod fake;
pub mod pty;
pub mod ring_buffer;
pub mod table;

pub use error::SessionError;
pub use pty::{ExitStatus, NativePtySpawner, PtyEvent, PtyProcess, PtySpawner, SpawnRequest};
pub use ring_buffer::RingBuffer;
pub use table::{SessionTable, TableEvent};
pub use tether_protocol::SessionId;
