//! Upstream client error types.

use thiserror::Error;

/// Errors that can occur while talking to an upstream MCP server.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The child process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The `initialize` handshake or initial `tools/list` failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O failure).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The peer returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not complete before its deadline.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The client was closed while the request was in flight, or a request
    /// was attempted after close.
    #[error("server '{server}' connection closed")]
    Closed { server: String },
}

impl UpstreamError {
    /// Whether this error indicates the connection itself is unusable, as
    /// opposed to a single request failing.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::TransportError { .. } | Self::Closed { .. } | Self::Timeout { .. } => true,
            Self::SpawnFailed { .. } | Self::InitFailed { .. } => true,
            Self::ServerError { message, .. } => {
                let lower = message.to_lowercase();
                ["connection", "broken pipe", "eof", "closed", "timeout"]
                    .iter()
                    .any(|needle| lower.contains(needle))
            }
        }
    }
}
