//! WebSocket listener using tokio-tungstenite.
//!
//! Each accepted socket becomes one broker connection. A writer task drains
//! the connection's outbox into JSON text frames while the read loop feeds
//! incoming text frames to the connection handler. Closing the socket, a read
//! error, or listener shutdown all end in the disconnect transition.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::broker::Broker;

/// Maximum accepted size of an incoming text frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// How long a closing connection may take to flush its queued messages.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listen socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Binds the WebSocket listen socket.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::Bind { addr, source })
}

/// Accepts connections until `shutdown` is cancelled.
///
/// Open connections are closed once `shutdown` fires.
pub async fn serve(listener: TcpListener, broker: Broker, shutdown: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!(addr = %addr, "WebSocket listener started"),
        Err(_) => info!("WebSocket listener started"),
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("WebSocket listener stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(handle_socket(
                        stream,
                        remote,
                        broker.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    }
}

async fn handle_socket(
    stream: TcpStream,
    remote: SocketAddr,
    broker: Broker,
    shutdown: CancellationToken,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!(remote = %remote, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws_stream.split();

    let (handler, mut outbound) = broker.connect();
    let connection_id = handler.id().clone();
    info!(
        connection_id = %connection_id,
        remote = %remote,
        connections = broker.connection_count(),
        "Client connected"
    );

    let writer_id = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(connection_id = %writer_id, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(connection_id = %writer_id, error = %e, "WebSocket send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = source.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_FRAME_SIZE {
                    warn!(
                        connection_id = %connection_id,
                        size = text.len(),
                        "Rejecting oversized frame"
                    );
                    handler.send_error(format!(
                        "message too large: {} bytes (max {})",
                        text.len(),
                        MAX_FRAME_SIZE
                    ));
                    continue;
                }
                handler.handle_text(text.as_str()).await;
            }
            Some(Ok(Message::Binary(_))) => {
                trace!(connection_id = %connection_id, "Ignoring binary frame");
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    let stats = handler.stats();
    handler.disconnect().await;

    // The outbox closes once the broker lets go of it; give queued messages a
    // moment to flush before dropping the socket.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    info!(
        connection_id = %connection_id,
        messages_sent = stats.messages_sent,
        messages_dropped = stats.messages_dropped,
        "Client disconnected"
    );
}
