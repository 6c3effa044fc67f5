//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;

use super::types::{FailureKind, RunFailure};

/// Errors that end a tool-use run or reject it at the call site.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Run options failed validation. Rejected before anything starts.
    #[error("invalid run options: {reason}")]
    InvalidOptions { reason: String },

    /// The tool catalog was empty after filtering.
    #[error("no tools available")]
    NoToolsAvailable,

    /// The model was still requesting tools when the iteration cap was hit.
    #[error("max iterations reached ({max_iterations}) without a final answer")]
    IterationBudgetExhausted { max_iterations: u32 },

    /// The LLM call itself failed.
    #[error("llm call failed: {0}")]
    Llm(#[from] InferenceError),

    /// The run tracker task is gone.
    #[error("workflow tracker is not running")]
    TrackerClosed,
}

impl AgentError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AgentError::InvalidOptions { .. } => FailureKind::InvalidOptions,
            AgentError::NoToolsAvailable => FailureKind::NoToolsAvailable,
            AgentError::IterationBudgetExhausted { .. } => FailureKind::IterationBudgetExhausted,
            AgentError::Llm(_) => FailureKind::Llm,
            AgentError::TrackerClosed => FailureKind::Internal,
        }
    }
}

impl From<&AgentError> for RunFailure {
    fn from(e: &AgentError) -> Self {
        RunFailure {
            kind: e.failure_kind(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhaustion_is_distinguishable() {
        let exhausted = AgentError::IterationBudgetExhausted { max_iterations: 3 };
        let failure = RunFailure::from(&exhausted);
        assert_eq!(failure.kind, FailureKind::IterationBudgetExhausted);
        assert!(failure.message.contains("max iterations"));

        let llm = AgentError::from(InferenceError::Timeout { duration_secs: 5 });
        assert_eq!(RunFailure::from(&llm).kind, FailureKind::Llm);
    }
}
