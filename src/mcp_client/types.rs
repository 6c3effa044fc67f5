//! Shared types for the tool-server supervisor.
//!
//! JSON-RPC 2.0 envelopes, the child protocol payloads, and the static and
//! discovered descriptors that the supervisor works with.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::McpError;

/// Separator between the server name and the tool name in a qualified name.
///
/// Server names never contain it; tool names may.
pub const TOOL_NAME_SEPARATOR: char = '_';

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a success response.
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn failure(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── Child protocol payloads ─────────────────────────────────────────────────

/// Tool definition as reported by a server in `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

/// `tools/call` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, rename = "isError", alias = "is_error")]
    pub is_error: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Server info returned in the `initialize` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Server descriptors ──────────────────────────────────────────────────────

fn default_enabled() -> bool {
    true
}

/// Static declaration of one tool-server child process.
///
/// Loaded once from configuration and never mutated; restarts replay it
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique server name; also the namespace prefix for its tools.
    pub name: String,
    /// Executable to spawn.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides merged over the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Variables that must be non-empty (in the overrides or the inherited
    /// environment) for the server to start, e.g. credentials.
    #[serde(default)]
    pub required_env: Vec<String>,
}

impl ServerDescriptor {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            enabled: true,
            required_env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_required_env(mut self, key: impl Into<String>) -> Self {
        self.required_env.push(key.into());
        self
    }

    /// Evaluate the enable predicate.
    ///
    /// Returns the reason the server must not start, if any.
    pub fn check_enabled(&self) -> Result<(), String> {
        if !self.enabled {
            return Err("disabled in configuration".to_string());
        }
        let missing: Vec<&str> = self
            .required_env
            .iter()
            .filter(|key| {
                let overridden = self.env.get(*key).is_some_and(|v| !v.is_empty());
                let inherited = std::env::var(key).is_ok_and(|v| !v.is_empty());
                !overridden && !inherited
            })
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required environment: {}", missing.join(", ")))
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.check_enabled().is_ok()
    }

    /// Reject names that would make qualified tool names ambiguous.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.name.is_empty() {
            return Err(McpError::ConfigError {
                reason: "server name must not be empty".into(),
            });
        }
        if self.name.contains(TOOL_NAME_SEPARATOR) {
            return Err(McpError::ConfigError {
                reason: format!(
                    "server name '{}' must not contain '{TOOL_NAME_SEPARATOR}'",
                    self.name
                ),
            });
        }
        if self.command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("server '{}' has an empty command", self.name),
            });
        }
        Ok(())
    }
}

// ─── Qualified names ─────────────────────────────────────────────────────────

/// A tool name namespaced by its owning server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedToolName {
    pub server: String,
    pub tool: String,
}

impl QualifiedToolName {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
        }
    }

    /// Split on the first separator, reading left to right.
    ///
    /// `"db_query_table"` → server `db`, tool `query_table`.
    pub fn parse(qualified: &str) -> Option<Self> {
        let (server, tool) = qualified.split_once(TOOL_NAME_SEPARATOR)?;
        if server.is_empty() || tool.is_empty() {
            return None;
        }
        Some(Self::new(server, tool))
    }
}

impl fmt::Display for QualifiedToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TOOL_NAME_SEPARATOR}{}", self.server, self.tool)
    }
}

/// A discovered tool, namespaced by its owning server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub qualified_name: String,
    pub original_name: String,
    /// Name of the owning server (non-owning back-reference).
    pub server: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl ToolDescriptor {
    /// Namespace a server-reported tool definition.
    pub fn qualify(server: &str, def: McpToolDefinition) -> Self {
        let name = QualifiedToolName::new(server, def.name.as_str());
        Self {
            qualified_name: name.to_string(),
            original_name: def.name,
            server: server.to_string(),
            description: def.description,
            input_schema: def.input_schema,
        }
    }

    pub fn name(&self) -> QualifiedToolName {
        QualifiedToolName::new(self.server.as_str(), self.original_name.as_str())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
        assert!(resp.result.is_none());
    }

    #[test]
    fn test_failure_response_serializes_code() {
        let resp = JsonRpcResponse::failure(7, error_codes::INVALID_PARAMS, "unknown tool: nope");
        let json: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["error"]["code"], -32602);
        assert_eq!(json["error"]["message"], "unknown tool: nope");
        assert!(json.get("result").map_or(true, |r| r.is_null()));
    }

    #[test]
    fn test_tool_definition_accepts_camel_case_schema() {
        let json = r#"{"name":"ping","inputSchema":{"type":"object"}}"#;
        let def: McpToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.input_schema["type"], "object");
        assert!(def.description.is_empty());
    }

    #[test]
    fn test_call_tool_result_error_flag() {
        let json = r#"{"content":[{"type":"text","text":"boom"}],"isError":true}"#;
        let res: CallToolResult = serde_json::from_str(json).unwrap();
        assert!(res.is_error);
    }

    #[test]
    fn test_qualified_name_splits_on_first_separator() {
        let name = QualifiedToolName::parse("supabase_query_table").unwrap();
        assert_eq!(name.server, "supabase");
        assert_eq!(name.tool, "query_table");
        assert_eq!(name.to_string(), "supabase_query_table");
    }

    #[test]
    fn test_qualified_name_rejects_unqualified() {
        assert!(QualifiedToolName::parse("ping").is_none());
        assert!(QualifiedToolName::parse("_ping").is_none());
        assert!(QualifiedToolName::parse("echo_").is_none());
    }

    #[test]
    fn test_qualify_tool_definition() {
        let def = McpToolDefinition {
            name: "list_dir".into(),
            description: "List a directory".into(),
            input_schema: serde_json::json!({"type": "object"}),
        };
        let tool = ToolDescriptor::qualify("fs", def);
        assert_eq!(tool.qualified_name, "fs_list_dir");
        assert_eq!(tool.original_name, "list_dir");
        assert_eq!(tool.name(), QualifiedToolName::new("fs", "list_dir"));
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(ServerDescriptor::new("echo", "echo-server").validate().is_ok());
        assert!(ServerDescriptor::new("cutter_coder", "x").validate().is_err());
        assert!(ServerDescriptor::new("", "x").validate().is_err());
        assert!(ServerDescriptor::new("echo", "  ").validate().is_err());
    }

    #[test]
    fn test_descriptor_enable_predicate() {
        let disabled = ServerDescriptor {
            enabled: false,
            ..ServerDescriptor::new("echo", "x")
        };
        assert!(!disabled.is_enabled());

        let missing = ServerDescriptor::new("db", "x")
            .with_required_env("__TOOLBRAIN_TEST_MISSING_TOKEN__");
        let reason = missing.check_enabled().unwrap_err();
        assert!(reason.contains("__TOOLBRAIN_TEST_MISSING_TOKEN__"));

        let overridden = missing.with_env("__TOOLBRAIN_TEST_MISSING_TOKEN__", "secret");
        assert!(overridden.is_enabled());
    }
}
