//! Tool-use conversation orchestrator.
//!
//! Drives one bounded conversation between the LLM and the tool catalog:
//!
//! 1. Resolve the catalog (filtered by the caller's allow-list). An empty
//!    catalog fails the run before the LLM is called.
//! 2. Call the LLM with the full history and the catalog.
//! 3. No tool use in the reply: the concatenated text is the answer.
//! 4. Otherwise run every requested tool, in request order, and append all
//!    results as one user turn. Failed calls go back to the model as
//!    error-flagged results so it can correct itself. A tool outside the
//!    run's catalog is refused the same way and never dispatched.
//! 5. Repeat until the iteration cap, then fail with a budget error.
//!
//! Progress is reported through a callback after every record. The
//! orchestrator knows nothing about run ids or storage.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;

use crate::inference::{ChatMessage, CompletionRequest, ContentBlock, LlmClient, ToolSpec, ToolUse};
use crate::mcp_client::lifecycle::content_text;
use crate::mcp_client::registry::filter_tools;
use crate::mcp_client::{McpError, Supervisor, ToolDescriptor};

use super::errors::AgentError;
use super::types::{IterationKind, IterationRecord, RunOptions, ToolCallRecord};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Tool output fed back to the model is capped at this many characters.
const MAX_TOOL_RESULT_CHARS: usize = 6_000;

/// System prompt used when the run does not supply one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an assistant that completes tasks by calling \
the tools you are given. Work step by step: when a later step needs data from an earlier tool \
result, call the tools one after another and pass the values you received into the next call. \
If a tool reports an error, read the message and retry with corrected arguments or choose a \
different tool. When no further tool calls are needed, reply with the final answer as plain \
text.";

// ─── Tool Executor ──────────────────────────────────────────────────────────

/// The orchestrator's view of the tool side: a catalog and a way to call it.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn list_tools(&self) -> Vec<ToolDescriptor>;

    async fn invoke(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError>;
}

#[async_trait]
impl ToolExecutor for Supervisor {
    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        Supervisor::list_tools(self).await
    }

    async fn invoke(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        Supervisor::invoke(self, qualified_name, arguments).await
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// A finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Concatenated text of the final reply.
    pub answer: String,
    /// LLM calls made.
    pub iterations: u32,
    /// Full conversation, user prompt first.
    pub messages: Vec<ChatMessage>,
}

#[derive(Clone)]
pub struct ConversationOrchestrator {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolExecutor>,
}

impl ConversationOrchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self { llm, tools }
    }

    /// Run the tool-use loop to completion.
    ///
    /// `on_event` receives every [`IterationRecord`] as it is produced.
    /// Iterations of one run are strictly sequential: all tool results of a
    /// round are in the history before the next LLM call.
    pub async fn run<F>(&self, options: &RunOptions, on_event: F) -> Result<RunOutcome, AgentError>
    where
        F: FnMut(IterationRecord) + Send,
    {
        options.validate()?;

        let catalog = filter_tools(&self.tools.list_tools().await, &options.tool_filter);
        if catalog.is_empty() {
            tracing::warn!(
                filter = ?options.tool_filter,
                "orchestrator: no tools available, not calling the model"
            );
            return Err(AgentError::NoToolsAvailable);
        }
        let offered: HashSet<&str> = catalog.iter().map(|t| t.qualified_name.as_str()).collect();
        let tool_specs: Vec<ToolSpec> = catalog.iter().map(ToolSpec::from).collect();
        let system = options
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        tracing::info!(
            model = %options.model,
            llm = %self.llm.name(),
            tool_count = tool_specs.len(),
            max_iterations = options.max_iterations,
            "orchestrator: run started"
        );

        let mut messages = vec![ChatMessage::user(options.prompt.clone())];
        let mut sink = EventSink::new(on_event);

        for iteration in 1..=options.max_iterations {
            let request = CompletionRequest {
                model: options.model.clone(),
                system: Some(system.clone()),
                messages: messages.clone(),
                tools: tool_specs.clone(),
                temperature: options.temperature,
                max_tokens: options.max_tokens,
            };

            tracing::debug!(iteration, message_count = messages.len(), "orchestrator: llm call");
            let reply = self.llm.complete(request).await.map_err(|e| {
                tracing::warn!(iteration, error = %e, "orchestrator: llm call failed");
                AgentError::from(e)
            })?;

            let text = reply.text_content();
            let uses = reply.tool_uses();
            messages.push(ChatMessage::assistant(reply.blocks));

            if uses.is_empty() {
                tracing::info!(iteration, "orchestrator: final answer");
                sink.emit(iteration, IterationKind::Complete, Some(text.clone()), Vec::new());
                return Ok(RunOutcome {
                    answer: text,
                    iterations: iteration,
                    messages,
                });
            }

            if !text.trim().is_empty() {
                sink.emit(iteration, IterationKind::Thinking, Some(text), Vec::new());
            }

            tracing::info!(
                iteration,
                tools = ?uses.iter().map(|u| u.name.as_str()).collect::<Vec<_>>(),
                "orchestrator: dispatching tool calls"
            );

            let executed =
                join_all(uses.iter().map(|tool_use| self.execute(tool_use, &offered))).await;
            let (records, results): (Vec<_>, Vec<_>) = executed.into_iter().unzip();
            messages.push(ChatMessage::tool_results(results));
            sink.emit(iteration, IterationKind::ToolUse, None, records);
        }

        tracing::warn!(
            max_iterations = options.max_iterations,
            "orchestrator: iteration budget exhausted"
        );
        Err(AgentError::IterationBudgetExhausted {
            max_iterations: options.max_iterations,
        })
    }

    /// Run one tool call. Failures become error-flagged results.
    async fn execute(
        &self,
        tool_use: &ToolUse,
        offered: &HashSet<&str>,
    ) -> (ToolCallRecord, ContentBlock) {
        if !offered.contains(tool_use.name.as_str()) {
            let err = McpError::UnknownTool {
                name: tool_use.name.clone(),
            };
            tracing::warn!(tool = %tool_use.name, "orchestrator: tool not in run catalog, refused");
            return failed_call(tool_use, format!("{err}: not in this run's tool catalog"));
        }

        match self.tools.invoke(&tool_use.name, tool_use.input.clone()).await {
            Ok(value) => {
                let content = truncate_tool_result(content_text(&value));
                let record = ToolCallRecord {
                    id: tool_use.id.clone(),
                    name: tool_use.name.clone(),
                    arguments: tool_use.input.clone(),
                    result: Some(value),
                    error: None,
                };
                let block = ContentBlock::ToolResult {
                    tool_use_id: tool_use.id.clone(),
                    content,
                    is_error: false,
                };
                (record, block)
            }
            Err(e) => {
                tracing::warn!(
                    tool = %tool_use.name,
                    kind = ?e.kind(),
                    error = %e,
                    "orchestrator: tool call failed"
                );
                failed_call(tool_use, e.to_string())
            }
        }
    }
}

fn failed_call(tool_use: &ToolUse, message: String) -> (ToolCallRecord, ContentBlock) {
    let record = ToolCallRecord {
        id: tool_use.id.clone(),
        name: tool_use.name.clone(),
        arguments: tool_use.input.clone(),
        result: None,
        error: Some(message.clone()),
    };
    let block = ContentBlock::ToolResult {
        tool_use_id: tool_use.id.clone(),
        content: message,
        is_error: true,
    };
    (record, block)
}

/// Numbers records and forwards them to the caller's callback.
struct EventSink<F> {
    next_index: u32,
    on_event: F,
}

impl<F: FnMut(IterationRecord)> EventSink<F> {
    fn new(on_event: F) -> Self {
        Self {
            next_index: 1,
            on_event,
        }
    }

    fn emit(
        &mut self,
        iteration: u32,
        kind: IterationKind,
        content: Option<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) {
        let record = IterationRecord {
            index: self.next_index,
            iteration,
            kind,
            content,
            tool_calls,
            timestamp: Utc::now(),
        };
        self.next_index += 1;
        (self.on_event)(record);
    }
}

/// Cap tool output on a char boundary.
fn truncate_tool_result(result: String) -> String {
    let total = result.chars().count();
    if total <= MAX_TOOL_RESULT_CHARS {
        return result;
    }
    tracing::warn!(
        original_chars = total,
        truncated_to = MAX_TOOL_RESULT_CHARS,
        "tool result truncated"
    );
    let kept: String = result.chars().take(MAX_TOOL_RESULT_CHARS).collect();
    format!("{kept}\n\n[... truncated: showing first {MAX_TOOL_RESULT_CHARS} of {total} chars]")
}

// ─── Tests ──────────────────────────────────────────────────────────────────
