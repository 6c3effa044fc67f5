//! Inference error types.
//!
//! Structured logging is the caller's responsibility; these types carry the
//! context needed to build meaningful log entries.

use thiserror::Error;

/// Errors that can occur during an LLM call.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body could not be interpreted.
    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    /// Client construction or configuration error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// A scripted client ran out of replies.
    #[error("scripted client exhausted after {calls} calls")]
    ScriptExhausted { calls: usize },
}

impl InferenceError {
    /// Whether retrying the same request might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::ConnectionFailed { .. } | InferenceError::Timeout { .. } => true,
            InferenceError::HttpError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
