//! Session error types.

use thiserror::Error;

use super::SessionId;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No alive session has this id.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Creating another session would exceed the configured maximum.
    #[error("session limit reached: at most {max} sessions may run at once")]
    CapacityExceeded {
        /// Configured maximum number of concurrent sessions.
        max: usize,
    },

    /// The PTY or the shell process could not be started.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),
}
