//! Tool-server supervision: JSON-RPC over stdio to child processes.
//!
//! This module handles:
//! - Spawning tool-server child processes and performing the handshake
//! - JSON-RPC 2.0 communication over process stdio, correlated by id
//! - Tool discovery, namespacing, and aggregation across all servers
//! - Tool call routing by qualified name
//! - Health probing with bounded, backed-off restarts
//!
//! The supervisor is the tool backend for the conversation orchestrator in
//! `agent_core`.

pub mod errors;
pub mod health;
pub mod lifecycle;
pub mod registry;
pub mod supervisor;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use errors::{ErrorKind, McpError};
pub use health::{HealthSettings, ServerState};
pub use lifecycle::LifecycleTimeouts;
pub use registry::ToolRegistry;
pub use supervisor::{ServerStatus, Supervisor, SupervisorSettings};
pub use types::{QualifiedToolName, ServerDescriptor, ToolDescriptor, TOOL_NAME_SEPARATOR};
