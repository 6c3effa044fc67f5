//! Scripted LLM client for tests and dry runs.
//!
//! Produces deterministic replies without network access and records every
//! request it receives, so tests can assert on what the orchestrator sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::client::LlmClient;
use super::errors::InferenceError;
use super::types::{CompletionRequest, LlmReply};

/// Reply mode.
#[derive(Debug, Clone)]
pub enum ScriptMode {
    /// Pop replies in order; fail once the queue is empty.
    Queue(VecDeque<LlmReply>),
    /// Request the same tool on every call.
    AlwaysTool {
        name: String,
        input: serde_json::Value,
    },
    /// Fail every call.
    Error(String),
}

/// Deterministic [`LlmClient`].
pub struct ScriptedLlm {
    mode: Mutex<ScriptMode>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn with_mode(mode: ScriptMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replay `replies` in order.
    pub fn new(replies: Vec<LlmReply>) -> Self {
        Self::with_mode(ScriptMode::Queue(replies.into()))
    }

    /// Answer immediately with `text` and no tool use.
    pub fn final_answer(text: impl Into<String>) -> Self {
        Self::new(vec![LlmReply::text(text)])
    }

    /// Request `name` with `input` on every call, never finishing.
    pub fn always_tool(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::with_mode(ScriptMode::AlwaysTool {
            name: name.into(),
            input,
        })
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_mode(ScriptMode::Error(message.into()))
    }

    /// Number of `complete` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<LlmReply, InferenceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request);

        let mut mode = self.mode.lock().unwrap_or_else(|p| p.into_inner());
        match &mut *mode {
            ScriptMode::Queue(replies) => replies
                .pop_front()
                .ok_or(InferenceError::ScriptExhausted { calls: call - 1 }),
            ScriptMode::AlwaysTool { name, input } => {
                Ok(LlmReply::tool_use(format!("call_{call}"), name.clone(), input.clone()))
            }
            ScriptMode::Error(message) => Err(InferenceError::HttpError {
                status: 500,
                body: message.clone(),
            }),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
