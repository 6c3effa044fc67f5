//! Agent Core: the tool-use loop and the runs built on it.
//!
//! Submodules:
//! - `orchestrator`: bounded LLM ↔ tool conversation, reports progress via callback
//! - `workflow`: tracker that owns runs, plus the streaming entry point
//! - `types`: run options, iteration records, workflow runs
//! - `errors`: agent-level error types

pub mod errors;
pub mod orchestrator;
pub mod types;
pub mod workflow;

// Re-exports for convenience
pub use errors::AgentError;
pub use orchestrator::{ConversationOrchestrator, RunOutcome, ToolExecutor, DEFAULT_SYSTEM_PROMPT};
pub use types::{
    FailureKind, IterationKind, IterationRecord, RunFailure, RunOptions, RunStatus, RunSummary,
    ToolCallRecord, WorkflowRun,
};
pub use workflow::{TrackerSettings, WorkflowTracker, DEFAULT_MAX_WORKFLOWS};
