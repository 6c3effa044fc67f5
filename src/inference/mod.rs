//! Inference: the LLM side of the tool-use conversation.
//!
//! This module handles:
//! - The block-based conversation model (text, tool use, tool result)
//! - The `LlmClient` seam the orchestrator talks to
//! - An OpenAI-compatible HTTP client
//! - A scripted client for tests and dry runs
//!
//! Switching models is a config change, not a code change.

pub mod client;
pub mod errors;
pub mod mock;
pub mod types;

// Re-exports for convenience
pub use client::{LlmClient, OpenAiCompatClient};
pub use errors::InferenceError;
pub use mock::ScriptedLlm;
pub use types::{ChatMessage, CompletionRequest, ContentBlock, LlmReply, Role, ToolSpec, ToolUse};
