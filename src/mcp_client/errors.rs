//! Tool-server error types.

use thiserror::Error;

/// Coarse classification of an [`McpError`].
///
/// Callers use this to decide whether a failure is local to one tool call,
/// one server, or a configuration problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The server failed to spawn, handshake, or report tools.
    Startup,
    /// The addressed server is not in the live set.
    ServerUnavailable,
    /// The server is live but does not expose the requested tool.
    UnknownTool,
    /// The server accepted the call but failed it, or the call timed out.
    ToolExecution,
    /// Restart attempts are exhausted; the server stays down.
    PermanentFailure,
    /// Static configuration is invalid.
    Config,
}

/// Errors that can occur while supervising tool servers.
#[derive(Debug, Error)]
pub enum McpError {
    /// The descriptor's enable predicate rejected startup.
    #[error("server '{name}' is disabled: {reason}")]
    Disabled { name: String, reason: String },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake or tool discovery failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error, closed pipe).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The owning server is live but does not expose this tool.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// The owning server is not currently live.
    #[error("server '{name}' is unavailable")]
    ServerUnavailable { name: String },

    /// The tool call failed on the server side or timed out.
    #[error("tool '{tool}' failed: {reason}")]
    ToolExecutionFailed { tool: String, reason: String },

    /// A request did not complete within its deadline.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Configuration error (duplicate names, bad separator, missing descriptor).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted { name: String, attempts: u32 },
}

impl McpError {
    /// Classify this error into the supervisor's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::Disabled { .. }
            | McpError::SpawnFailed { .. }
            | McpError::InitFailed { .. } => ErrorKind::Startup,
            McpError::ServerUnavailable { .. } => ErrorKind::ServerUnavailable,
            McpError::UnknownTool { .. } => ErrorKind::UnknownTool,
            McpError::ToolExecutionFailed { .. }
            | McpError::TransportError { .. }
            | McpError::ServerError { .. }
            | McpError::Timeout { .. } => ErrorKind::ToolExecution,
            McpError::RestartExhausted { .. } => ErrorKind::PermanentFailure,
            McpError::ConfigError { .. } => ErrorKind::Config,
        }
    }

    /// Name of the server this error is about, when known.
    pub fn server_name(&self) -> Option<&str> {
        match self {
            McpError::Disabled { name, .. }
            | McpError::SpawnFailed { name, .. }
            | McpError::InitFailed { name, .. }
            | McpError::ServerUnavailable { name }
            | McpError::RestartExhausted { name, .. } => Some(name),
            McpError::TransportError { server, .. } | McpError::Timeout { server, .. } => {
                Some(server)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let startup = McpError::InitFailed {
            name: "db".into(),
            reason: "bad handshake".into(),
        };
        assert_eq!(startup.kind(), ErrorKind::Startup);

        let timeout = McpError::Timeout {
            server: "db".into(),
            method: "tools/call".into(),
            timeout_ms: 10,
        };
        assert_eq!(timeout.kind(), ErrorKind::ToolExecution);

        let gone = McpError::ServerUnavailable { name: "ghost".into() };
        assert_eq!(gone.kind(), ErrorKind::ServerUnavailable);
        assert_eq!(gone.server_name(), Some("ghost"));
    }

    #[test]
    fn test_display_is_human_readable() {
        let err = McpError::RestartExhausted {
            name: "supabase".into(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "server 'supabase' failed after 3 restart attempts"
        );
    }
}
