//! Workflow run tracker.
//!
//! Every run is owned by one background task. [`WorkflowTracker`] is a
//! cheap handle that sends it commands: runs in flight report their
//! iteration records and terminal status as messages, never by touching the
//! stored run directly.
//!
//! Retention is bounded. When an insert pushes the store over
//! `max_workflows`, the oldest run (by creation time) is evicted.

use std::collections::HashMap;

use futures::stream::{self, Stream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::errors::AgentError;
use super::orchestrator::ConversationOrchestrator;
use super::types::{IterationRecord, RunFailure, RunOptions, RunStatus, RunSummary, WorkflowRun};

/// Default number of runs kept in memory.
pub const DEFAULT_MAX_WORKFLOWS: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    pub max_workflows: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_workflows: DEFAULT_MAX_WORKFLOWS,
        }
    }
}

/// Commands processed by the tracker task, in the order they were sent.
#[derive(Debug)]
enum TrackerCommand {
    Insert(Box<WorkflowRun>),
    MarkRunning {
        id: String,
    },
    Append {
        id: String,
        record: IterationRecord,
    },
    Finish {
        id: String,
        outcome: Result<String, RunFailure>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<WorkflowRun>>,
    },
    List {
        reply: oneshot::Sender<Vec<WorkflowRun>>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<bool>,
    },
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Creates, queries and streams tool-use runs.
#[derive(Clone)]
pub struct WorkflowTracker {
    tx: mpsc::UnboundedSender<TrackerCommand>,
    orchestrator: ConversationOrchestrator,
}

impl WorkflowTracker {
    /// Spawn the tracker task. Must be called inside a tokio runtime.
    pub fn new(orchestrator: ConversationOrchestrator, settings: TrackerSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(tracker_task(rx, settings.max_workflows.max(1)));
        tracing::debug!(max_workflows = settings.max_workflows, "workflow tracker started");
        Self { tx, orchestrator }
    }

    /// Register a run and start it in the background.
    ///
    /// Returns the run id as soon as the run is queued. Invalid options are
    /// rejected here and nothing is stored.
    pub fn create(&self, options: RunOptions) -> Result<String, AgentError> {
        options.validate()?;

        let id = uuid::Uuid::new_v4().to_string();
        let run = WorkflowRun::new(id.clone(), options.clone());
        self.send(TrackerCommand::Insert(Box::new(run)))?;

        tracing::info!(run_id = %id, model = %options.model, "workflow run queued");

        let tx = self.tx.clone();
        let orchestrator = self.orchestrator.clone();
        let run_id = id.clone();
        tokio::spawn(async move {
            let _ = tx.send(TrackerCommand::MarkRunning { id: run_id.clone() });

            let record_tx = tx.clone();
            let record_id = run_id.clone();
            let result = orchestrator
                .run(&options, move |record| {
                    let _ = record_tx.send(TrackerCommand::Append {
                        id: record_id.clone(),
                        record,
                    });
                })
                .await;

            let outcome = match result {
                Ok(outcome) => {
                    tracing::info!(run_id = %run_id, iterations = outcome.iterations, "workflow run completed");
                    Ok(outcome.answer)
                }
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "workflow run failed");
                    Err(RunFailure::from(&e))
                }
            };
            let _ = tx.send(TrackerCommand::Finish {
                id: run_id,
                outcome,
            });
        });

        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkflowRun>, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::Get {
            id: id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| AgentError::TrackerClosed)
    }

    /// All stored runs, newest first.
    pub async fn list(&self) -> Result<Vec<WorkflowRun>, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::List { reply })?;
        rx.await.map_err(|_| AgentError::TrackerClosed)
    }

    pub async fn summaries(&self) -> Result<Vec<RunSummary>, AgentError> {
        Ok(self.list().await?.iter().map(WorkflowRun::summary).collect())
    }

    /// Remove a run. Returns `false` if it was not stored.
    ///
    /// A run that is still executing keeps going; its later records are
    /// dropped.
    pub async fn delete(&self, id: &str) -> Result<bool, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::Delete {
            id: id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| AgentError::TrackerClosed)
    }

    /// Run the tool-use loop without storing it, yielding records as they
    /// are produced.
    ///
    /// Nothing starts until the stream is first polled. A failed run ends
    /// with one `Err` item. Dropping the stream aborts the run.
    pub fn stream(
        &self,
        options: RunOptions,
    ) -> impl Stream<Item = Result<IterationRecord, AgentError>> + Send + 'static {
        let initial = StreamState::Idle {
            orchestrator: self.orchestrator.clone(),
            options,
        };

        stream::unfold(initial, |state| async move {
            let (mut rx, task) = match state {
                StreamState::Idle {
                    orchestrator,
                    options,
                } => spawn_streamed_run(orchestrator, options),
                StreamState::Running { rx, task } => (rx, task),
            };
            let item = rx.recv().await?;
            Some((item, StreamState::Running { rx, task }))
        })
    }

    fn send(&self, command: TrackerCommand) -> Result<(), AgentError> {
        self.tx.send(command).map_err(|_| AgentError::TrackerClosed)
    }
}

// ─── Streaming ──────────────────────────────────────────────────────────────

type StreamItem = Result<IterationRecord, AgentError>;

enum StreamState {
    Idle {
        orchestrator: ConversationOrchestrator,
        options: RunOptions,
    },
    Running {
        rx: mpsc::UnboundedReceiver<StreamItem>,
        task: AbortOnDrop,
    },
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn spawn_streamed_run(
    orchestrator: ConversationOrchestrator,
    options: RunOptions,
) -> (mpsc::UnboundedReceiver<StreamItem>, AbortOnDrop) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let record_tx = tx.clone();
        let result = orchestrator
            .run(&options, move |record| {
                let _ = record_tx.send(Ok(record));
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "streamed run failed");
            let _ = tx.send(Err(e));
        }
    });
    (rx, AbortOnDrop(handle))
}

// ─── Tracker Task ───────────────────────────────────────────────────────────

struct StoredRun {
    /// Insertion order; breaks ties between equal creation times.
    seq: u64,
    run: WorkflowRun,
}

struct RunStore {
    runs: HashMap<String, StoredRun>,
    next_seq: u64,
    max_workflows: usize,
}

impl RunStore {
    fn new(max_workflows: usize) -> Self {
        Self {
            runs: HashMap::new(),
            next_seq: 0,
            max_workflows,
        }
    }

    fn insert(&mut self, run: WorkflowRun) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.runs.insert(run.id.clone(), StoredRun { seq, run });

        while self.runs.len() > self.max_workflows {
            let oldest = self
                .runs
                .iter()
                .min_by_key(|(_, stored)| (stored.run.created_at, stored.seq))
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.runs.remove(&id);
                    tracing::info!(run_id = %id, "evicted oldest workflow run");
                }
                None => break,
            }
        }
    }

    fn apply(&mut self, command: TrackerCommand) {
        match command {
            TrackerCommand::Insert(run) => self.insert(*run),
            TrackerCommand::MarkRunning { id } => {
                if let Some(stored) = self.runs.get_mut(&id) {
                    stored.run.transition(RunStatus::Running);
                }
            }
            TrackerCommand::Append { id, record } => {
                if let Some(stored) = self.runs.get_mut(&id) {
                    stored.run.push_iteration(record);
                }
            }
            TrackerCommand::Finish { id, outcome } => {
                if let Some(stored) = self.runs.get_mut(&id) {
                    stored.run.finish(outcome);
                }
            }
            TrackerCommand::Get { id, reply } => {
                let _ = reply.send(self.runs.get(&id).map(|s| s.run.clone()));
            }
            TrackerCommand::List { reply } => {
                let mut stored: Vec<&StoredRun> = self.runs.values().collect();
                stored.sort_by(|a, b| (b.run.created_at, b.seq).cmp(&(a.run.created_at, a.seq)));
                let _ = reply.send(stored.into_iter().map(|s| s.run.clone()).collect());
            }
            TrackerCommand::Delete { id, reply } => {
                let removed = self.runs.remove(&id).is_some();
                if removed {
                    tracing::debug!(run_id = %id, "workflow run deleted");
                }
                let _ = reply.send(removed);
            }
        }
    }
}

/// Owns every stored run. Exits once all handles and in-flight runs are gone.
async fn tracker_task(mut rx: mpsc::UnboundedReceiver<TrackerCommand>, max_workflows: usize) {
    let mut store = RunStore::new(max_workflows);
    while let Some(command) = rx.recv().await {
        store.apply(command);
    }
    tracing::debug!("workflow tracker stopped");
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::orchestrator::ToolExecutor;
    use crate::agent_core::types::{FailureKind, IterationKind};
    use crate::inference::{LlmClient, LlmReply, ScriptedLlm};
    use crate::mcp_client::types::McpToolDefinition;
    use crate::mcp_client::{McpError, ToolDescriptor};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct PingTools;

    #[async_trait]
    impl ToolExecutor for PingTools {
        async fn list_tools(&self) -> Vec<ToolDescriptor> {
            vec![ToolDescriptor::qualify(
                "echo",
                McpToolDefinition {
                    name: "ping".into(),
                    description: "Ping".into(),
                    input_schema: json!({"type": "object"}),
                },
            )]
        }

        async fn invoke(
            &self,
            _qualified_name: &str,
            _arguments: serde_json::Value,
        ) -> Result<serde_json::Value, McpError> {
            Ok(json!("pong"))
        }
    }

    fn tracker_with(llm: impl LlmClient + 'static, max_workflows: usize) -> WorkflowTracker {
        let orchestrator = ConversationOrchestrator::new(Arc::new(llm), Arc::new(PingTools));
        WorkflowTracker::new(orchestrator, TrackerSettings { max_workflows })
    }

    async fn wait_terminal(tracker: &WorkflowTracker, id: &str) -> WorkflowRun {
        for _ in 0..200 {
            if let Some(run) = tracker.get(id).await.unwrap() {
                if run.status.is_terminal() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {id} did not finish");
    }

    #[tokio::test]
    async fn test_create_runs_to_completion() {
        let tracker = tracker_with(
            ScriptedLlm::new(vec![
                LlmReply::tool_use("c1", "echo_ping", json!({})),
                LlmReply::text("all done"),
            ]),
            10,
        );

        let id = tracker.create(RunOptions::new("ping it", "mock")).unwrap();
        let run = wait_terminal(&tracker, &id).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result.as_deref(), Some("all done"));
        assert!(run.error.is_none());
        let kinds: Vec<IterationKind> = run.iterations.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![IterationKind::ToolUse, IterationKind::Complete]);
        assert!(run.updated_at >= run.created_at);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_options() {
        let tracker = tracker_with(ScriptedLlm::final_answer("x"), 10);
        let err = tracker.create(RunOptions::new("", "mock")).unwrap_err();
        assert!(matches!(err, AgentError::InvalidOptions { .. }));
        assert!(tracker.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_run_keeps_history() {
        let tracker = tracker_with(ScriptedLlm::always_tool("echo_ping", json!({})), 10);
        let id = tracker
            .create(RunOptions::new("loop", "mock").with_max_iterations(3))
            .unwrap();
        let run = wait_terminal(&tracker, &id).await;

        assert_eq!(run.status, RunStatus::Error);
        let failure = run.error.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::IterationBudgetExhausted);
        assert!(failure.message.contains("max iterations"));
        assert_eq!(run.iterations.len(), 3);
    }

    #[tokio::test]
    async fn test_get_is_read_only_after_terminal() {
        let tracker = tracker_with(ScriptedLlm::final_answer("done"), 10);
        let id = tracker.create(RunOptions::new("hi", "mock")).unwrap();
        let first = wait_terminal(&tracker, &id).await;
        let second = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_eviction_drops_oldest() {
        let tracker = tracker_with(ScriptedLlm::always_tool("echo_ping", json!({})), 2);
        let opts = || RunOptions::new("p", "mock").with_max_iterations(1);

        let first = tracker.create(opts()).unwrap();
        let second = tracker.create(opts()).unwrap();
        let third = tracker.create(opts()).unwrap();

        assert!(tracker.get(&first).await.unwrap().is_none());
        assert!(tracker.get(&second).await.unwrap().is_some());
        assert!(tracker.get(&third).await.unwrap().is_some());

        let listed: Vec<String> = tracker
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(listed, vec![third, second]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tracker = tracker_with(ScriptedLlm::final_answer("done"), 10);
        let id = tracker.create(RunOptions::new("hi", "mock")).unwrap();
        assert!(tracker.delete(&id).await.unwrap());
        assert!(!tracker.delete(&id).await.unwrap());
        assert!(tracker.get(&id).await.unwrap().is_none());
        assert!(!tracker.delete("no-such-run").await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_yields_records_in_order() {
        let tracker = tracker_with(
            ScriptedLlm::new(vec![
                LlmReply::tool_use("c1", "echo_ping", json!({})),
                LlmReply::text("finished"),
            ]),
            10,
        );

        let records: Vec<IterationRecord> = tracker
            .stream(RunOptions::new("ping", "mock"))
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].index, 1);
        assert_eq!(records[1].kind, IterationKind::Complete);
        assert_eq!(records[1].content.as_deref(), Some("finished"));
        assert!(tracker.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_ends_with_error_on_failure() {
        let tracker = tracker_with(ScriptedLlm::always_tool("echo_ping", json!({})), 10);
        let items: Vec<_> = tracker
            .stream(RunOptions::new("loop", "mock").with_max_iterations(2))
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert!(items[..2].iter().all(|i| i.is_ok()));
        assert!(matches!(
            items[2],
            Err(AgentError::IterationBudgetExhausted { max_iterations: 2 })
        ));
    }

    #[test]
    fn test_store_ignores_updates_for_unknown_runs() {
        let mut store = RunStore::new(5);
        store.apply(TrackerCommand::MarkRunning { id: "ghost".into() });
        store.apply(TrackerCommand::Finish {
            id: "ghost".into(),
            outcome: Ok("x".into()),
        });
        assert!(store.runs.is_empty());
    }
}
