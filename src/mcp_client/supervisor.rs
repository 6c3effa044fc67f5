//! Tool-server supervisor: high-level interface for tool discovery and
//! execution across a fixed set of configured servers.
//!
//! The live set only contains servers whose handshake and discovery
//! succeeded. All changes to it (start, stop, restart, cleanup) are
//! serialized by one lifecycle lock. A server is removed from the live set
//! before it is shut down and re-added only after a fresh handshake, so an
//! invocation during a restart fails with `ServerUnavailable` rather than
//! reaching a closed channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::health::{
    self, CheckClaim, HealthAction, HealthSettings, RestartPolicy, ServerHealth, ServerState,
};
use super::lifecycle::{self, LifecycleTimeouts, ManagedServer};
use super::registry::ToolRegistry;
use super::types::{QualifiedToolName, ServerDescriptor, ToolDescriptor};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Timeouts and health policy for a [`Supervisor`].
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Deadline for one `tools/call` round-trip.
    pub call_timeout: Duration,
    pub lifecycle: LifecycleTimeouts,
    pub health: HealthSettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            lifecycle: LifecycleTimeouts::default(),
            health: HealthSettings::default(),
        }
    }
}

/// Status of one configured server, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    pub restart_count: u32,
    pub tool_count: usize,
    pub pid: Option<u32>,
    /// Start time of the live instance; `None` when not running.
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Owns the tool-server processes and routes tool calls to them.
pub struct Supervisor {
    /// Configured servers, in start order.
    descriptors: Vec<ServerDescriptor>,
    settings: SupervisorSettings,
    /// Live servers, kept in descriptor order.
    live: RwLock<Vec<Arc<ManagedServer>>>,
    health: std::sync::Mutex<HashMap<String, ServerHealth>>,
    lifecycle_lock: Mutex<()>,
    initialized: AtomicBool,
    health_rounds: AtomicU64,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Create a supervisor for `descriptors`.
    ///
    /// Rejects duplicate names and names that would make qualified tool
    /// names ambiguous. Nothing is spawned until [`Supervisor::initialize`]
    /// or [`Supervisor::start_all`].
    pub fn new(
        descriptors: Vec<ServerDescriptor>,
        settings: SupervisorSettings,
    ) -> Result<Self, McpError> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            descriptor.validate()?;
            if !seen.insert(descriptor.name.as_str()) {
                return Err(McpError::ConfigError {
                    reason: format!("duplicate server name '{}'", descriptor.name),
                });
            }
        }

        let health = descriptors
            .iter()
            .map(|d| (d.name.clone(), ServerHealth::default()))
            .collect();

        Ok(Self {
            descriptors,
            settings,
            live: RwLock::new(Vec::new()),
            health: std::sync::Mutex::new(health),
            lifecycle_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            health_rounds: AtomicU64::new(0),
            monitor: std::sync::Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn descriptors(&self) -> &[ServerDescriptor] {
        &self.descriptors
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start every configured server and launch the health monitor.
    ///
    /// Only the first call does anything; later calls return an empty list.
    pub async fn initialize(self: &Arc<Self>) -> Vec<Result<String, McpError>> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            tracing::debug!("supervisor already initialized");
            return Vec::new();
        }

        let results = self.start_all().await;

        let handle = health::spawn_monitor(Arc::downgrade(self), self.settings.health);
        if let Some(old) = lock_std(&self.monitor).replace(handle) {
            old.abort();
        }

        results
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Start all configured servers, one at a time.
    ///
    /// A failure on one server is logged and recorded; the remaining
    /// servers are still attempted. Returns one result per descriptor.
    pub async fn start_all(&self) -> Vec<Result<String, McpError>> {
        let mut results = Vec::with_capacity(self.descriptors.len());

        for descriptor in &self.descriptors {
            let result = self.start(&descriptor.name).await;
            match &result {
                Ok(_) => {}
                Err(e @ McpError::Disabled { .. }) => {
                    tracing::info!(server = %descriptor.name, reason = %e, "skipping server");
                }
                Err(e) => {
                    tracing::warn!(server = %descriptor.name, error = %e, "server failed to start");
                }
            }
            results.push(result.map(|_| descriptor.name.clone()));
        }

        let live = self.live.read().await.len();
        tracing::info!(
            configured = self.descriptors.len(),
            live,
            "tool servers started"
        );

        results
    }

    /// Start one configured server. Returns its tool count.
    ///
    /// Starting a server that is already live is a no-op.
    pub async fn start(&self, name: &str) -> Result<usize, McpError> {
        let _guard = self.lifecycle_lock.lock().await;
        self.start_locked(name).await
    }

    async fn start_locked(&self, name: &str) -> Result<usize, McpError> {
        let descriptor = self.descriptor(name)?;

        if let Some(server) = self.live_server(name).await {
            return Ok(server.tools().len());
        }

        if let Err(reason) = descriptor.check_enabled() {
            self.update_health(name, |h| {
                h.state = ServerState::Disabled;
                h.monitored = false;
                h.last_error = Some(reason.clone());
            });
            return Err(McpError::Disabled {
                name: name.to_string(),
                reason,
            });
        }

        let restart_count = self.health_of(name).restart_count;

        match lifecycle::spawn_server(descriptor, &self.settings.lifecycle, restart_count).await {
            Ok(server) => {
                let tool_count = server.tools().len();
                self.insert_live(Arc::new(server)).await;
                self.update_health(name, |h| {
                    h.state = ServerState::Running;
                    h.monitored = true;
                    h.last_error = None;
                });
                Ok(tool_count)
            }
            Err(e) => {
                self.update_health(name, |h| {
                    if h.state != ServerState::Failed {
                        h.state = ServerState::Stopped;
                    }
                    h.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    /// Stop a server and drop it from the live set.
    ///
    /// Stopping a server that is not live is a no-op.
    pub async fn stop(&self, name: &str) {
        let _guard = self.lifecycle_lock.lock().await;
        self.retire(name).await;
        self.update_health(name, |h| {
            if h.state == ServerState::Running {
                h.state = ServerState::Stopped;
            }
            h.monitored = false;
        });
    }

    /// Stop and start a server from its original descriptor.
    ///
    /// Clears a permanent failure: the server gets a fresh restart budget.
    pub async fn restart(&self, name: &str) -> Result<usize, McpError> {
        let _guard = self.lifecycle_lock.lock().await;
        self.descriptor(name)?;
        self.retire(name).await;
        self.update_health(name, |h| {
            if h.state == ServerState::Failed {
                h.state = ServerState::Stopped;
                h.restart_count = 0;
            }
        });
        tracing::info!(server = name, "restarting server on request");
        self.start_locked(name).await
    }

    /// Health-monitor restart: stop now, start again after `delay`.
    ///
    /// Skipped if the server was explicitly stopped during the delay.
    pub(crate) async fn restart_after_failure(
        &self,
        name: &str,
        delay: Duration,
    ) -> Result<usize, McpError> {
        {
            let _guard = self.lifecycle_lock.lock().await;
            self.retire(name).await;
        }

        tokio::time::sleep(delay).await;

        let _guard = self.lifecycle_lock.lock().await;
        if !self.health_of(name).monitored {
            return Err(McpError::ServerUnavailable {
                name: name.to_string(),
            });
        }
        self.start_locked(name).await
    }

    /// Shut down a server that exhausted its restart budget.
    pub(crate) async fn retire_failed(&self, name: &str) {
        let _guard = self.lifecycle_lock.lock().await;
        self.retire(name).await;
    }

    /// Stop every live server and the health monitor. Always completes.
    pub async fn cleanup(&self) {
        if let Some(handle) = lock_std(&self.monitor).take() {
            handle.abort();
        }

        let _guard = self.lifecycle_lock.lock().await;
        let servers: Vec<Arc<ManagedServer>> = std::mem::take(&mut *self.live.write().await);
        let grace = self.settings.lifecycle.shutdown;

        join_all(servers.iter().map(|server| server.shutdown(grace))).await;

        {
            let mut health = lock_std(&self.health);
            for h in health.values_mut() {
                if h.state == ServerState::Running {
                    h.state = ServerState::Stopped;
                }
                h.monitored = false;
            }
        }

        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!(stopped = servers.len(), "supervisor cleaned up");
    }

    /// Remove a server from the live set, then shut it down.
    async fn retire(&self, name: &str) -> bool {
        let removed = {
            let mut live = self.live.write().await;
            live.iter()
                .position(|s| s.name() == name)
                .map(|i| live.remove(i))
        };

        match removed {
            Some(server) => {
                server.shutdown(self.settings.lifecycle.shutdown).await;
                tracing::info!(server = name, "server stopped");
                true
            }
            None => false,
        }
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// Aggregated catalog of all live servers, in start order.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.registry().await.into_tools()
    }

    /// Snapshot of the live catalog as a registry.
    pub async fn registry(&self) -> ToolRegistry {
        let live = self.live.read().await;
        let mut registry = ToolRegistry::new();
        for server in live.iter() {
            registry.register_server_tools(server.name(), server.tools());
        }
        registry
    }

    /// Route a tool call to the server that owns it.
    ///
    /// Fails with `UnknownTool` when the name is not qualified or the live
    /// server does not expose the tool, `ServerUnavailable` when the owning
    /// server is not live, and `ToolExecutionFailed` for anything that goes
    /// wrong on the call itself, including timeouts.
    pub async fn invoke(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let name = QualifiedToolName::parse(qualified_name).ok_or_else(|| McpError::UnknownTool {
            name: qualified_name.to_string(),
        })?;

        let server = match self.live_server(&name.server).await {
            Some(server) if !server.is_closed() => server,
            _ => {
                return Err(McpError::ServerUnavailable {
                    name: name.server,
                })
            }
        };

        if !server.has_tool(&name.tool) {
            return Err(McpError::UnknownTool {
                name: qualified_name.to_string(),
            });
        }

        tracing::debug!(tool = %qualified_name, server = %name.server, "dispatching tool call");

        server
            .call_tool(&name.tool, arguments, self.settings.call_timeout)
            .await
            .map_err(|e| match e {
                McpError::ToolExecutionFailed { reason, .. } => McpError::ToolExecutionFailed {
                    tool: qualified_name.to_string(),
                    reason,
                },
                other => McpError::ToolExecutionFailed {
                    tool: qualified_name.to_string(),
                    reason: other.to_string(),
                },
            })
    }

    // ─── Health ──────────────────────────────────────────────────────────

    /// Servers the health monitor should probe.
    pub fn monitored_servers(&self) -> Vec<String> {
        let health = lock_std(&self.health);
        self.descriptors
            .iter()
            .filter(|d| health.get(&d.name).is_some_and(|h| h.monitored))
            .map(|d| d.name.clone())
            .collect()
    }

    /// Health-check rounds run so far.
    pub fn health_rounds(&self) -> u64 {
        self.health_rounds.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_health_round(&self) -> u64 {
        self.health_rounds.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Claim every monitored server that no other round is checking.
    pub(crate) fn claim_for_check(&self) -> Vec<CheckClaim<'_>> {
        let names: Vec<String> = {
            let mut health = lock_std(&self.health);
            self.descriptors
                .iter()
                .filter_map(|d| {
                    let h = health.get_mut(&d.name)?;
                    if !h.monitored || h.checking {
                        return None;
                    }
                    h.checking = true;
                    Some(d.name.clone())
                })
                .collect()
        };
        names
            .into_iter()
            .map(|name| CheckClaim::new(self, name))
            .collect()
    }

    pub(crate) fn release_check(&self, name: &str) {
        self.update_health(name, |h| h.checking = false);
    }

    /// One bounded liveness probe. A server that is not live fails the probe.
    pub async fn probe(&self, name: &str, timeout: Duration) -> Result<(), McpError> {
        let server = self
            .live_server(name)
            .await
            .ok_or_else(|| McpError::ServerUnavailable {
                name: name.to_string(),
            })?;

        match tokio::time::timeout(timeout, server.probe(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: name.to_string(),
                method: "tools/list".into(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn record_probe_success(&self, name: &str) {
        let policy = RestartPolicy::from_settings(&self.settings.health);
        self.update_health(name, |h| {
            if h.restart_count > 0 {
                tracing::info!(server = name, "server healthy again");
            }
            policy.on_success(h);
        });
    }

    pub fn record_probe_failure(&self, name: &str, reason: String) -> HealthAction {
        let policy = RestartPolicy::from_settings(&self.settings.health);
        let mut health = lock_std(&self.health);
        let entry = health.entry(name.to_string()).or_default();
        policy.on_failure(entry, reason)
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// One entry per configured server, in configuration order.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let live = self.live.read().await;
        let health = lock_std(&self.health);

        self.descriptors
            .iter()
            .map(|d| {
                let h = health.get(&d.name).cloned().unwrap_or_default();
                let server = live.iter().find(|s| s.name() == d.name);
                ServerStatus {
                    name: d.name.clone(),
                    state: h.state,
                    restart_count: h.restart_count,
                    tool_count: server.map_or(0, |s| s.tools().len()),
                    pid: server.and_then(|s| s.pid()),
                    started_at: server.map(|s| s.started_at()),
                    last_error: h.last_error,
                }
            })
            .collect()
    }

    /// Names of live servers, in start order.
    pub async fn running_servers(&self) -> Vec<String> {
        self.live
            .read()
            .await
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub async fn is_server_running(&self, name: &str) -> bool {
        self.live_server(name).await.is_some()
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn descriptor(&self, name: &str) -> Result<&ServerDescriptor, McpError> {
        self.descriptors
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| McpError::ConfigError {
                reason: format!("no configuration for server '{name}'"),
            })
    }

    fn descriptor_index(&self, name: &str) -> usize {
        self.descriptors
            .iter()
            .position(|d| d.name == name)
            .unwrap_or(usize::MAX)
    }

    async fn live_server(&self, name: &str) -> Option<Arc<ManagedServer>> {
        self.live
            .read()
            .await
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    async fn insert_live(&self, server: Arc<ManagedServer>) {
        let mut live = self.live.write().await;
        let at = self.descriptor_index(server.name());
        let pos = live
            .iter()
            .position(|s| self.descriptor_index(s.name()) > at)
            .unwrap_or(live.len());
        live.insert(pos, server);
    }

    fn health_of(&self, name: &str) -> ServerHealth {
        lock_std(&self.health).get(name).cloned().unwrap_or_default()
    }

    fn update_health(&self, name: &str, f: impl FnOnce(&mut ServerHealth)) {
        let mut health = lock_std(&self.health);
        f(health.entry(name.to_string()).or_default());
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(handle) = lock_std(&self.monitor).take() {
            handle.abort();
        }
    }
}

fn lock_std<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
