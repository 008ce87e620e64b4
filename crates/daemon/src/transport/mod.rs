//! Network transports that carry the client protocol.

pub mod websocket;

pub use websocket::{bind, serve, TransportError, MAX_FRAME_SIZE};
