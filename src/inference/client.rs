//! LLM client seam and an OpenAI-compatible HTTP implementation.
//!
//! The orchestrator only sees [`LlmClient`]. [`OpenAiCompatClient`]
//! translates the block-based conversation into the Chat Completions wire
//! format: tool uses become `tool_calls`, tool results become `tool` role
//! messages.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::{ChatMessage, CompletionRequest, ContentBlock, LlmReply, MessageContent, Role};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout. Tool-heavy contexts can take a while to process.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ─── Trait ───────────────────────────────────────────────────────────────────

/// An LLM that can take part in a tool-use conversation.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send the conversation and tool catalog, return the model's reply.
    async fn complete(&self, request: CompletionRequest) -> Result<LlmReply, InferenceError>;

    /// Short label for logs.
    fn name(&self) -> &str {
        "llm"
    }
}

// ─── OpenAiCompatClient ──────────────────────────────────────────────────────

/// Client for any endpoint speaking the OpenAI Chat Completions API.
pub struct OpenAiCompatClient {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatClient {
    /// Create a client for `base_url` (e.g. `http://localhost:11434/v1`).
    ///
    /// Does not check connectivity; that happens on the first request.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<LlmReply, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = to_wire_request(&request);

        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map_or(0, |t| t.len()),
            max_tokens = body.max_tokens,
            "sending completion request"
        );

        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: REQUEST_TIMEOUT.as_secs(),
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::InvalidResponse {
                reason: format!("failed to read response body: {e}"),
            })?;

        parse_response(&body_text)
    }

    fn name(&self) -> &str {
        "openai-compat"
    }
}

// ─── Wire format ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

/// Chat Completions message.
///
/// `content` is `""` rather than `null` on assistant tool-call turns; several
/// local runtimes reject `null` there.
#[derive(Debug, Clone, Serialize, PartialEq)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

impl WireMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default = "function_type")]
    r#type: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_wire_request(request: &CompletionRequest) -> WireRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        messages.push(WireMessage::new("system", system.as_str()));
    }
    for message in &request.messages {
        messages.extend(to_wire_messages(message));
    }

    let tools: Vec<WireTool> = request
        .tools
        .iter()
        .map(|t| WireTool {
            r#type: "function",
            function: WireFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect();
    let has_tools = !tools.is_empty();

    WireRequest {
        model: request.model.clone(),
        messages,
        tools: has_tools.then_some(tools),
        tool_choice: has_tools.then_some("auto"),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        stream: false,
    }
}

/// One conversation message may expand to several wire messages: each tool
/// result is its own `tool` role message.
fn to_wire_messages(message: &ChatMessage) -> Vec<WireMessage> {
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            return vec![WireMessage::new(role, text.as_str())];
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    match message.role {
        Role::Assistant => {
            let mut text = Vec::new();
            let mut calls = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => text.push(t.as_str()),
                    ContentBlock::ToolUse { id, name, input } => calls.push(WireToolCall {
                        id: Some(id.clone()),
                        r#type: function_type(),
                        function: WireFunctionCall {
                            name: name.clone(),
                            arguments: input.to_string(),
                        },
                    }),
                    ContentBlock::ToolResult { .. } => {}
                }
            }
            let mut msg = WireMessage::new("assistant", text.join("\n"));
            if !calls.is_empty() {
                msg.tool_calls = Some(calls);
            }
            vec![msg]
        }
        Role::User => {
            let mut out = Vec::new();
            let mut text = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => text.push(t.as_str()),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let content = if *is_error {
                            format!("Error: {content}")
                        } else {
                            content.clone()
                        };
                        let mut msg = WireMessage::new("tool", content);
                        msg.tool_call_id = Some(tool_use_id.clone());
                        out.push(msg);
                    }
                    ContentBlock::ToolUse { .. } => {}
                }
            }
            if !text.is_empty() {
                out.push(WireMessage::new("user", text.join("\n")));
            }
            out
        }
    }
}

fn parse_response(body: &str) -> Result<LlmReply, InferenceError> {
    #[derive(Deserialize)]
    struct Response {
        choices: Vec<Choice>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: ResponseMessage,
    }

    #[derive(Deserialize)]
    struct ResponseMessage {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        tool_calls: Option<Vec<WireToolCall>>,
    }

    let resp: Response = serde_json::from_str(body).map_err(|e| InferenceError::InvalidResponse {
        reason: format!("failed to parse completion response: {e}"),
    })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::InvalidResponse {
            reason: "empty choices array".into(),
        })?;

    let mut blocks = Vec::new();
    if let Some(text) = choice.message.content.filter(|c| !c.trim().is_empty()) {
        blocks.push(ContentBlock::Text { text });
    }

    for call in choice.message.tool_calls.unwrap_or_default() {
        let id = call
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
        let raw = call.function.arguments.trim();
        let input = if raw.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(raw).map_err(|e| InferenceError::InvalidResponse {
                reason: format!(
                    "tool call '{}' has invalid JSON arguments: {e}",
                    call.function.name
                ),
            })?
        };
        blocks.push(ContentBlock::ToolUse {
            id,
            name: call.function.name,
            input,
        });
    }

    Ok(LlmReply::new(blocks))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
