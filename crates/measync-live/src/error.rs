//! Live channel errors.

use std::time::Duration;

use measync_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the live and control channels.
#[derive(Debug, Error)]
pub enum LiveError {
    /// Every port tried while binding was already taken.
    #[error("No free port for {endpoint} after {attempts} attempts")]
    AddrInUse { endpoint: String, attempts: u32 },

    /// Binding failed for a reason other than the port being taken.
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer closed the connection or the reader task ended.
    #[error("Disconnected from {0}")]
    Disconnected(String),

    /// A control request got no reply within its bound.
    #[error("No reply within {0:?}")]
    Timeout(Duration),
}

impl LiveError {
    /// Whether reconnecting on a later attempt may succeed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LiveError::Io(_) | LiveError::WebSocket(_) | LiveError::Disconnected(_) | LiveError::Timeout(_)
        )
    }
}
