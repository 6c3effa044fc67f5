//! Health monitoring for live tool servers.
//!
//! A background task probes every monitored server on a fixed interval.
//! Probes run concurrently and each is bounded by a timeout, so a hung
//! server never delays the others. Each round runs as its own task: a
//! restart in progress does not push back the next tick, and a server that
//! is still being checked is skipped by later rounds. Failures feed a
//! bounded restart policy: restart with backoff until the attempt budget is
//! spent, then give up and leave the server in the `failed` state.

use std::sync::Weak;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use super::supervisor::Supervisor;

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    /// Time between probe rounds.
    pub interval: Duration,
    /// Delay before the first probe round after initialization.
    pub initial_delay: Duration,
    /// Upper bound for one probe.
    pub probe_timeout: Duration,
    /// Restarts allowed before a server is marked permanently failed.
    pub max_restart_attempts: u32,
    /// Pause between stopping a failed server and starting it again.
    pub restart_backoff: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(10),
            max_restart_attempts: 3,
            restart_backoff: Duration::from_secs(2),
        }
    }
}

// ─── Restart policy ──────────────────────────────────────────────────────────

/// Observable state of one configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Running,
    Stopped,
    Disabled,
    Failed,
}

/// Per-server health bookkeeping, owned by the supervisor.
#[derive(Debug, Clone)]
pub struct ServerHealth {
    pub state: ServerState,
    /// Consecutive restarts since the last successful probe.
    pub restart_count: u32,
    pub last_error: Option<String>,
    /// Whether the health monitor should probe this server.
    pub monitored: bool,
    /// A health-check round currently owns this server.
    pub checking: bool,
}

impl Default for ServerHealth {
    fn default() -> Self {
        Self {
            state: ServerState::Stopped,
            restart_count: 0,
            last_error: None,
            monitored: false,
            checking: false,
        }
    }
}

/// What the monitor should do after a failed probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    Restart { attempt: u32, delay: Duration },
    /// Attempts exhausted; the server is now permanently failed.
    GiveUp { attempts: u32 },
    /// The server had already been given up on.
    AlreadyFailed,
}

/// Bounded restart policy.
///
/// `restart_count` never exceeds `max_attempts`; the failure after the last
/// allowed restart gives up instead of restarting again.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RestartPolicy {
    pub fn from_settings(settings: &HealthSettings) -> Self {
        Self {
            max_attempts: settings.max_restart_attempts,
            backoff: settings.restart_backoff,
        }
    }

    pub fn on_failure(&self, health: &mut ServerHealth, reason: String) -> HealthAction {
        if health.state == ServerState::Failed {
            return HealthAction::AlreadyFailed;
        }
        health.last_error = Some(reason);

        if health.restart_count >= self.max_attempts {
            health.state = ServerState::Failed;
            health.monitored = false;
            return HealthAction::GiveUp {
                attempts: health.restart_count,
            };
        }

        health.restart_count += 1;
        HealthAction::Restart {
            attempt: health.restart_count,
            delay: self.backoff,
        }
    }

    /// A healthy probe clears the consecutive-restart counter.
    pub fn on_success(&self, health: &mut ServerHealth) {
        health.restart_count = 0;
    }
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

/// Result of probing one server in a health-check round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Restarted { attempt: u32 },
    RestartFailed { attempt: u32, reason: String },
    GaveUp { attempts: u32 },
    Skipped,
}

/// Spawn the periodic health-check loop for `supervisor`.
///
/// The first round runs after `initial_delay`, then one per `interval`.
/// The loop ends on its own once the supervisor is dropped.
pub fn spawn_monitor(supervisor: Weak<Supervisor>, settings: HealthSettings) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(settings.initial_delay).await;

        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Dropped with the monitor, which aborts any round still running.
        let mut rounds = JoinSet::new();

        tracing::info!(
            interval_secs = settings.interval.as_secs(),
            max_restart_attempts = settings.max_restart_attempts,
            "health monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(supervisor) = supervisor.upgrade() else {
                        tracing::debug!("supervisor dropped, health monitor exiting");
                        break;
                    };
                    rounds.spawn(async move {
                        run_health_check(&supervisor, &settings).await;
                    });
                }
                Some(_) = rounds.join_next() => {}
            }
        }
    })
}

/// Probe every monitored server once, concurrently.
///
/// Servers still owned by an earlier round are left out.
pub async fn run_health_check(
    supervisor: &Supervisor,
    settings: &HealthSettings,
) -> Vec<(String, ProbeOutcome)> {
    let round = supervisor.begin_health_round();
    let claims = supervisor.claim_for_check();
    let checks = claims.into_iter().map(|claim| async move {
        let outcome = check_server(supervisor, &claim.name, settings).await;
        (claim.name.clone(), outcome)
    });
    let outcomes = join_all(checks).await;
    tracing::debug!(round, checked = outcomes.len(), "health check round finished");
    outcomes
}

/// Exclusive claim on one server for the duration of a check.
///
/// Released on drop, including when the round is aborted.
pub(crate) struct CheckClaim<'a> {
    supervisor: &'a Supervisor,
    pub(crate) name: String,
}

impl<'a> CheckClaim<'a> {
    pub(crate) fn new(supervisor: &'a Supervisor, name: String) -> Self {
        Self { supervisor, name }
    }
}

impl Drop for CheckClaim<'_> {
    fn drop(&mut self) {
        self.supervisor.release_check(&self.name);
    }
}

async fn check_server(supervisor: &Supervisor, name: &str, settings: &HealthSettings) -> ProbeOutcome {
    let reason = match supervisor.probe(name, settings.probe_timeout).await {
        Ok(()) => {
            supervisor.record_probe_success(name);
            return ProbeOutcome::Healthy;
        }
        Err(e) => e.to_string(),
    };

    tracing::warn!(server = name, error = %reason, "health probe failed");

    match supervisor.record_probe_failure(name, reason) {
        HealthAction::Restart { attempt, delay } => {
            tracing::info!(
                server = name,
                attempt,
                max = settings.max_restart_attempts,
                delay_ms = delay.as_millis() as u64,
                "restarting server"
            );
            match supervisor.restart_after_failure(name, delay).await {
                Ok(_) => ProbeOutcome::Restarted { attempt },
                Err(e) => {
                    tracing::warn!(server = name, attempt, error = %e, "restart failed");
                    ProbeOutcome::RestartFailed {
                        attempt,
                        reason: e.to_string(),
                    }
                }
            }
        }
        HealthAction::GiveUp { attempts } => {
            tracing::error!(
                server = name,
                attempts,
                "server failed permanently, no further restarts"
            );
            supervisor.retire_failed(name).await;
            ProbeOutcome::GaveUp { attempts }
        }
        HealthAction::AlreadyFailed => ProbeOutcome::Skipped,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
