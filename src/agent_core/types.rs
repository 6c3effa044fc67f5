//! Shared types for the agent core.
//!
//! Run options, the iteration records a run produces, and the tracked
//! workflow run that owns them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::AgentError;

// ─── Defaults ───────────────────────────────────────────────────────────────

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

// ─── Run Options ────────────────────────────────────────────────────────────

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub prompt: String,
    /// Model id passed through to the LLM client.
    pub model: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Substring allow-list over qualified tool names. Empty keeps all.
    #[serde(default)]
    pub tool_filter: Vec<String>,
    /// Replaces the default system prompt when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

impl RunOptions {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            tool_filter: Vec::new(),
            system_prompt: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tool_filter<I, S>(mut self, filter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_filter = filter.into_iter().map(Into::into).collect();
        self
    }

    /// Reject options that could never produce a run.
    pub fn validate(&self) -> Result<(), AgentError> {
        let reason = if self.prompt.trim().is_empty() {
            Some("prompt must not be empty".to_string())
        } else if self.model.trim().is_empty() {
            Some("model must not be empty".to_string())
        } else if self.max_iterations == 0 {
            Some("max_iterations must be at least 1".to_string())
        } else if self.max_tokens == 0 {
            Some("max_tokens must be at least 1".to_string())
        } else if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            Some(format!("temperature {} outside 0.0..=2.0", self.temperature))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(AgentError::InvalidOptions { reason }),
            None => Ok(()),
        }
    }
}

// ─── Iteration Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationKind {
    /// Model text that accompanied a tool request.
    Thinking,
    /// One round of tool calls.
    ToolUse,
    /// The final answer.
    Complete,
}

/// One tool call made during a round, with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Correlation id chosen by the model.
    pub id: String,
    /// Qualified tool name.
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallRecord {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A progress event of a run. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based position within the run.
    pub index: u32,
    /// LLM call that produced this record (1-based).
    pub iteration: u32,
    pub kind: IterationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    pub timestamp: DateTime<Utc>,
}

// ─── Workflow Runs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }

    /// Status only moves forward: queued → running → completed | error.
    /// A queued run may fail before it starts.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Queued, RunStatus::Running)
                | (RunStatus::Queued, RunStatus::Error)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Error)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    IterationBudgetExhausted,
    NoToolsAvailable,
    Llm,
    InvalidOptions,
    Internal,
}

/// Terminal error of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    /// Human-readable cause.
    pub message: String,
}

/// One tracked execution of the tool-use loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub status: RunStatus,
    pub options: RunOptions,
    pub iterations: Vec<IterationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(id: impl Into<String>, options: RunOptions) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: RunStatus::Queued,
            options,
            iterations: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next` if that is a forward transition. Returns whether the
    /// status changed.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    /// Append a record unless the run has already finished.
    pub fn push_iteration(&mut self, record: IterationRecord) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.iterations.push(record);
        self.updated_at = Utc::now();
        true
    }

    /// Set the terminal outcome. Only the first call has any effect.
    pub fn finish(&mut self, outcome: Result<String, RunFailure>) -> bool {
        let next = match outcome {
            Ok(_) => RunStatus::Completed,
            Err(_) => RunStatus::Error,
        };
        if !self.transition(next) {
            return false;
        }
        match outcome {
            Ok(answer) => self.result = Some(answer),
            Err(failure) => self.error = Some(failure),
        }
        true
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            status: self.status,
            prompt: self.options.prompt.clone(),
            iteration_count: self.iterations.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// List view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub status: RunStatus,
    pub prompt: String,
    pub iteration_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u32) -> IterationRecord {
        IterationRecord {
            index,
            iteration: index,
            kind: IterationKind::ToolUse,
            content: None,
            tool_calls: vec![],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(RunOptions::new("list parts", "local").validate().is_ok());
        assert!(RunOptions::new("  ", "local").validate().is_err());
        assert!(RunOptions::new("list parts", "").validate().is_err());
        assert!(RunOptions::new("list parts", "local")
            .with_max_iterations(0)
            .validate()
            .is_err());

        let mut hot = RunOptions::new("list parts", "local");
        hot.temperature = 3.5;
        assert!(matches!(
            hot.validate(),
            Err(AgentError::InvalidOptions { .. })
        ));
    }

    #[test]
    fn test_options_defaults_from_json() {
        let opts: RunOptions =
            serde_json::from_str(r#"{"prompt": "hi", "model": "m"}"#).unwrap();
        assert_eq!(opts.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(opts.max_tokens, DEFAULT_MAX_TOKENS);
        assert!(opts.tool_filter.is_empty());
    }

    #[test]
    fn test_status_moves_forward_only() {
        let mut run = WorkflowRun::new("r1", RunOptions::new("p", "m"));
        assert!(run.transition(RunStatus::Running));
        assert!(!run.transition(RunStatus::Queued));
        assert!(run.finish(Ok("done".into())));
        assert_eq!(run.status, RunStatus::Completed);

        assert!(!run.transition(RunStatus::Running));
        assert!(!run.finish(Err(RunFailure {
            kind: FailureKind::Internal,
            message: "late".into(),
        })));
        assert_eq!(run.result.as_deref(), Some("done"));
        assert!(run.error.is_none());
    }

    #[test]
    fn test_no_records_after_terminal() {
        let mut run = WorkflowRun::new("r1", RunOptions::new("p", "m"));
        run.transition(RunStatus::Running);
        assert!(run.push_iteration(record(1)));
        run.finish(Ok("ok".into()));
        assert!(!run.push_iteration(record(2)));
        assert_eq!(run.iterations.len(), 1);
        assert_eq!(run.summary().iteration_count, 1);
    }

    #[test]
    fn test_record_serialization_omits_empty_calls() {
        let json = serde_json::to_value(record(1)).unwrap();
        assert_eq!(json["kind"], "tool_use");
        assert!(json.get("tool_calls").is_none());
    }
}
