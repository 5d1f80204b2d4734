use std::time::Duration;

use thiserror::Error;

use crate::events::NotificationError;

/// Errors returned by ComfyUI operations.
#[derive(Error, Debug)]
pub enum ComfyError {
    /// ComfyUI returned a non-success HTTP status.
    #[error("ComfyUI returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    /// The response from ComfyUI was well-formed but missing expected fields.
    #[error("{0}")]
    Protocol(String),

    /// The WebSocket handshake to ComfyUI failed.
    #[error("WebSocket connection to {url} failed: {source}")]
    Connection {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// `connect` was called on a stream client that is already running.
    #[error("WebSocket client is already running")]
    AlreadyRunning,

    /// A streaming operation was requested on a client built without streaming.
    #[error("WebSocket streaming is disabled for this client; enable it with `with_streaming(true)`")]
    StreamingDisabled,

    /// No completion signal arrived within the wait deadline.
    #[error("Timed out after {0:?} waiting for completion")]
    Timeout(Duration),

    /// The caller's cancellation token fired.
    #[error("Operation was cancelled")]
    Cancelled,

    /// ComfyUI reported a failure for the awaited prompt over the WebSocket.
    #[error("Prompt {prompt_id} failed: {source}")]
    Remote {
        prompt_id: String,
        source: NotificationError,
    },

    /// The shared WebSocket went away while a wait was registered on it.
    #[error("WebSocket stream closed before completion was signalled")]
    StreamClosed,

    /// The client was configured with values that cannot be used.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ComfyError {
    /// True for failures of the request/response transport (network or non-2xx).
    pub fn is_transport(&self) -> bool {
        matches!(self, ComfyError::Http { .. } | ComfyError::Network { .. })
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ComfyError>;
