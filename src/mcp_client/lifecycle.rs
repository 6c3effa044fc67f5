//! Server process lifecycle management.
//!
//! Handles spawning, handshaking, probing, and shutting down tool-server
//! child processes. Each server runs as a separate OS process communicating
//! via JSON-RPC over stdio.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    CallToolResult, InitializeResult, ListToolsResult, ServerDescriptor, ToolDescriptor,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version announced in the `initialize` handshake.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Number of trailing stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long to let the stderr drain catch up after a failed handshake.
const STDERR_SETTLE: Duration = Duration::from_millis(100);

// ─── Timeouts ────────────────────────────────────────────────────────────────

/// Deadlines applied to one server's lifecycle operations.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimeouts {
    /// Covers spawn → `initialize` → `tools/list`.
    pub init: Duration,
    /// Grace period between closing stdin and force-killing.
    pub shutdown: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(30),
            shutdown: Duration::from_secs(5),
        }
    }
}

// ─── ManagedServer ───────────────────────────────────────────────────────────

/// A running tool-server process with its transport and discovered tools.
///
/// The tool list is fixed for the lifetime of the instance; a restart
/// produces a new `ManagedServer`.
pub struct ManagedServer {
    descriptor: ServerDescriptor,
    process: Mutex<Child>,
    pid: Option<u32>,
    transport: StdioTransport,
    tools: Vec<ToolDescriptor>,
    started_at: DateTime<Utc>,
}

impl ManagedServer {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Namespaced tools in the order the server reported them.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn has_tool(&self, original_name: &str) -> bool {
        self.tools.iter().any(|t| t.original_name == original_name)
    }

    /// When the handshake for this instance completed.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the server's stdout has closed.
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Check if the server process is still running and its stdout open.
    pub async fn is_alive(&self) -> bool {
        if self.transport.is_closed() {
            return false;
        }
        let mut process = self.process.lock().await;
        matches!(process.try_wait(), Ok(None))
    }

    /// Cheap liveness probe: the process is running and answers `tools/list`.
    pub async fn probe(&self, timeout: Duration) -> Result<(), McpError> {
        if !self.is_alive().await {
            return Err(McpError::TransportError {
                server: self.name().to_string(),
                reason: "process is not running".into(),
            });
        }
        let response = self.transport.request("tools/list", None, timeout).await?;
        extract_result(response).map(|_| ())
    }

    /// Forward a `tools/call` request for a tool this server reported.
    ///
    /// A JSON-RPC error or an `isError` result becomes
    /// [`McpError::ToolExecutionFailed`]; transport errors and timeouts are
    /// returned unchanged.
    pub async fn call_tool(
        &self,
        original_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({
            "name": original_name,
            "arguments": arguments,
        });

        let response = self
            .transport
            .request("tools/call", Some(params), timeout)
            .await?;

        let result = match extract_result(response) {
            Ok(result) => result,
            Err(McpError::ServerError { code, message, .. }) => {
                return Err(McpError::ToolExecutionFailed {
                    tool: original_name.to_string(),
                    reason: format!("[{code}] {message}"),
                });
            }
            Err(e) => return Err(e),
        };

        let parsed: CallToolResult =
            serde_json::from_value(result).map_err(|e| McpError::ToolExecutionFailed {
                tool: original_name.to_string(),
                reason: format!("malformed tools/call result: {e}"),
            })?;

        if parsed.is_error {
            let reason = parsed
                .error
                .unwrap_or_else(|| content_text(&parsed.content));
            return Err(McpError::ToolExecutionFailed {
                tool: original_name.to_string(),
                reason,
            });
        }

        Ok(parsed.content)
    }

    /// Close the transport and make sure the process is gone.
    ///
    /// Closing stdin asks the server to exit; if it has not exited within
    /// the grace period it is killed.
    pub async fn shutdown(&self, grace: Duration) {
        self.transport.close().await;

        let mut process = self.process.lock().await;
        match tokio::time::timeout(grace, process.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name(), %status, "server exited");
            }
            _ => {
                tracing::warn!(
                    server = %self.name(),
                    grace_ms = grace.as_millis() as u64,
                    "server did not exit in time, killing"
                );
                if let Err(e) = process.kill().await {
                    tracing::warn!(server = %self.name(), error = %e, "kill failed");
                }
            }
        }
    }
}

/// Flatten MCP-style `[{type:"text", text}]` content into a single string.
///
/// Anything else is rendered as compact JSON.
pub fn content_text(content: &serde_json::Value) -> String {
    if let Some(items) = content.as_array() {
        let texts: Vec<&str> = items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect();
        if !texts.is_empty() && texts.len() == items.len() {
            return texts.join("\n");
        }
    }
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ─── Stderr capture ──────────────────────────────────────────────────────────

/// Ring buffer of the last stderr lines, filled by a background drain task.
#[derive(Clone, Default)]
struct StderrTail {
    lines: Arc<std::sync::Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn spawn_drain(&self, server: String, stderr: ChildStderr) {
        let lines = Arc::clone(&self.lines);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!(server = %server, stderr = %line, "server stderr");
                let mut buf = lines.lock().unwrap_or_else(|p| p.into_inner());
                if buf.len() == STDERR_TAIL_LINES {
                    buf.pop_front();
                }
                buf.push_back(line);
            }
        });
    }

    fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Format a suffix for error messages (empty string if no stderr).
    fn suffix(&self) -> String {
        let lines = self.lines();
        if lines.is_empty() {
            String::new()
        } else {
            format!(" | stderr: {}", lines.join(" / "))
        }
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a tool server, perform the handshake, and discover its tools.
///
/// On any failure after the process started, the process is killed before
/// the error is returned.
pub async fn spawn_server(
    descriptor: &ServerDescriptor,
    timeouts: &LifecycleTimeouts,
    restart_count: u32,
) -> Result<ManagedServer, McpError> {
    descriptor.validate()?;
    descriptor
        .check_enabled()
        .map_err(|reason| McpError::Disabled {
            name: descriptor.name.clone(),
            reason,
        })?;

    let name = descriptor.name.as_str();

    let mut cmd = Command::new(&descriptor.command);
    cmd.args(&descriptor.args);
    // The child inherits our environment; overrides win.
    cmd.envs(&descriptor.env);
    if let Some(dir) = &descriptor.cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{}: {e}", descriptor.command),
    })?;

    let pid = child.id();

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr_tail = StderrTail::default();
    if let Some(stderr) = child.stderr.take() {
        stderr_tail.spawn_drain(name.to_string(), stderr);
    }

    let transport = StdioTransport::new(name, stdin, stdout);

    tracing::debug!(server = name, pid = ?pid, "server process spawned");

    let handshake = tokio::time::timeout(timeouts.init, handshake(&transport, name, timeouts.init));
    let tools = match handshake.await {
        Ok(Ok(tools)) => tools,
        Ok(Err(e)) => {
            let _ = child.kill().await;
            tokio::time::sleep(STDERR_SETTLE).await;
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("{e}{}", stderr_tail.suffix()),
            });
        }
        Err(_) => {
            let _ = child.kill().await;
            tokio::time::sleep(STDERR_SETTLE).await;
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!(
                    "initialization timed out after {}ms{}",
                    timeouts.init.as_millis(),
                    stderr_tail.suffix()
                ),
            });
        }
    };

    tracing::info!(
        server = name,
        pid = ?pid,
        tool_count = tools.len(),
        restart_count,
        "server started"
    );

    Ok(ManagedServer {
        descriptor: descriptor.clone(),
        process: Mutex::new(child),
        pid,
        transport,
        tools,
        started_at: Utc::now(),
    })
}

/// `initialize` → `notifications/initialized` → `tools/list`.
async fn handshake(
    transport: &StdioTransport,
    server_name: &str,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let response = transport.request("initialize", Some(params), timeout).await?;
    let init: InitializeResult =
        serde_json::from_value(extract_result(response)?).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(info) = &init.server_info {
        tracing::debug!(
            server = server_name,
            reported_name = ?info.name,
            version = ?info.version,
            protocol = ?init.protocol_version,
            "handshake accepted"
        );
    }

    transport.notify("notifications/initialized", None).await?;

    let response = transport.request("tools/list", None, timeout).await?;
    let listed: ListToolsResult =
        serde_json::from_value(extract_result(response)?).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse tools/list response: {e}"),
        })?;

    Ok(listed
        .tools
        .into_iter()
        .map(|def| ToolDescriptor::qualify(server_name, def))
        .collect())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
