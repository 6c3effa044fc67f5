//! Toolbrain configuration.
//!
//! Loaded from a YAML file (default `toolbrain.yaml`). String values may
//! reference the environment as `${VAR}` or `${VAR:-default}`; a leading
//! `~` in a default is expanded to the home directory.
//!
//! ```yaml
//! servers:
//!   - name: database
//!     command: db-tool-server
//!     args: ["--read-only"]
//!     env: { DB_TOOLS_HOME: "${DB_TOOLS_HOME:-~/.toolbrain/db}" }
//!     required_env: [DATABASE_URL]
//! health:
//!   interval_secs: 30
//! llm:
//!   base_url: http://localhost:11434/v1
//!   model: qwen2.5
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::types::{DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use crate::agent_core::{RunOptions, TrackerSettings, DEFAULT_MAX_WORKFLOWS};
use crate::mcp_client::{HealthSettings, LifecycleTimeouts, ServerDescriptor, SupervisorSettings};

/// Environment variable that overrides `enabled_servers` (comma-separated).
pub const ENABLED_SERVERS_ENV: &str = "MCP_ENABLED_SERVERS";

/// Environment variable pointing at the config file.
pub const CONFIG_PATH_ENV: &str = "TOOLBRAIN_CONFIG";

const CONFIG_FILE_NAME: &str = "toolbrain.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },

    #[error("could not find toolbrain.yaml")]
    NotFound,
}

// ─── Sections ────────────────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrainConfig {
    /// Tool servers, in start order.
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    /// When set, only these servers may start.
    #[serde(default)]
    pub enabled_servers: Option<Vec<String>>,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub workflows: WorkflowSection,
    #[serde(default)]
    pub llm: LlmSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub call_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            init_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub interval_secs: u64,
    pub initial_delay_ms: u64,
    pub probe_timeout_ms: u64,
    pub max_restart_attempts: u32,
    pub restart_backoff_ms: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            initial_delay_ms: 2_000,
            probe_timeout_ms: 10_000,
            max_restart_attempts: 3,
            restart_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub max_workflows: usize,
    pub default_max_iterations: u32,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_workflows: DEFAULT_MAX_WORKFLOWS,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// OpenAI-compatible endpoint used for runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    /// Name of the variable holding the API key. The key itself is never
    /// stored in the file.
    pub api_key_env: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            api_key_env: None,
            model: "qwen2.5".into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: None,
        }
    }
}

impl LlmSection {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `TOOLBRAIN_CONFIG`, then `toolbrain.yaml` in `start` and its
/// parents, then the platform config directory.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("toolbrain").join("config.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(ConfigError::NotFound)
}

impl BrainConfig {
    /// Read, interpolate, parse and validate a config file.
    ///
    /// `MCP_ENABLED_SERVERS` takes precedence over `enabled_servers`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut config = Self::from_yaml_str(&raw)?;
        if let Ok(value) = std::env::var(ENABLED_SERVERS_ENV) {
            config.override_enabled_servers(&value);
        }
        config.validate()?;

        tracing::info!(
            path = %path.display(),
            servers = config.servers.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse YAML after environment interpolation. Does not validate.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Replace the allow-list with a comma-separated value. Blank input
    /// leaves the current list alone.
    pub fn override_enabled_servers(&mut self, value: &str) {
        let names: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect();
        if !names.is_empty() {
            self.enabled_servers = Some(names);
        }
    }

    /// Reject misconfiguration that would otherwise surface at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            server.validate().map_err(|e| ConfigError::Invalid {
                reason: e.to_string(),
            })?;
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate server name '{}'", server.name),
                });
            }
        }

        if let Some(enabled) = &self.enabled_servers {
            for name in enabled.iter().filter(|n| !seen.contains(n.as_str())) {
                tracing::warn!(server = %name, "enabled_servers names an unknown server");
            }
        }

        if self.workflows.max_workflows == 0 {
            return Err(ConfigError::Invalid {
                reason: "workflows.max_workflows must be at least 1".into(),
            });
        }
        if self.workflows.default_max_iterations == 0 {
            return Err(ConfigError::Invalid {
                reason: "workflows.default_max_iterations must be at least 1".into(),
            });
        }
        if self.health.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                reason: "health.interval_secs must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Server descriptors with the allow-list applied: servers not on it
    /// are disabled rather than dropped, so they still show up in status.
    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.servers
            .iter()
            .cloned()
            .map(|mut server| {
                if let Some(enabled) = &self.enabled_servers {
                    if !enabled.iter().any(|n| n == &server.name) {
                        server.enabled = false;
                    }
                }
                server
            })
            .collect()
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let s = &self.supervisor;
        let h = &self.health;
        SupervisorSettings {
            call_timeout: Duration::from_millis(s.call_timeout_ms),
            lifecycle: LifecycleTimeouts {
                init: Duration::from_millis(s.init_timeout_ms),
                shutdown: Duration::from_millis(s.shutdown_timeout_ms),
            },
            health: HealthSettings {
                interval: Duration::from_secs(h.interval_secs),
                initial_delay: Duration::from_millis(h.initial_delay_ms),
                probe_timeout: Duration::from_millis(h.probe_timeout_ms),
                max_restart_attempts: h.max_restart_attempts,
                restart_backoff: Duration::from_millis(h.restart_backoff_ms),
            },
        }
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            max_workflows: self.workflows.max_workflows,
        }
    }

    /// Run options for `prompt` using the configured model defaults.
    pub fn run_options(&self, prompt: impl Into<String>) -> RunOptions {
        let mut options = RunOptions::new(prompt, self.llm.model.clone())
            .with_max_iterations(self.workflows.default_max_iterations);
        options.temperature = self.llm.temperature;
        options.max_tokens = self.llm.max_tokens;
        options.system_prompt = self.llm.system_prompt.clone();
        options
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next();
        let expr: String = chars.by_ref().take_while(|c| *c != '}').collect();
        result.push_str(&resolve_var_expr(&expr));
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config = BrainConfig::from_yaml_str(
            r#"
servers:
  - name: echo
    command: toolbrain-echo-server
"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.servers.len(), 1);
        assert!(config.servers[0].enabled);
        let settings = config.supervisor_settings();
        assert_eq!(settings.call_timeout, Duration::from_secs(30));
        assert_eq!(settings.health.max_restart_attempts, 3);
        assert_eq!(config.tracker_settings().max_workflows, 100);
        assert_eq!(config.run_options("hi").max_iterations, 10);
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLBRAIN_TEST_UNSET__");
        let result = interpolate_env_vars("${__TOOLBRAIN_TEST_UNSET__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLBRAIN_TEST_SET__", "/custom/path");
        let result = interpolate_env_vars("dir: ${__TOOLBRAIN_TEST_SET__:-/fallback}");
        assert_eq!(result, "dir: /custom/path");
        std::env::remove_var("__TOOLBRAIN_TEST_SET__");
    }

    #[test]
    fn test_interpolate_leaves_plain_dollars() {
        let input = "price: $5 and ${";
        assert_eq!(interpolate_env_vars("price: $5"), "price: $5");
        assert_eq!(interpolate_env_vars(input), "price: $5 and ");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/tools");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/tools"));
    }

    #[test]
    fn test_validation_rejects_bad_servers() {
        let dup = BrainConfig::from_yaml_str(
            r#"
servers:
  - { name: db, command: a }
  - { name: db, command: b }
"#,
        )
        .unwrap();
        assert!(matches!(dup.validate(), Err(ConfigError::Invalid { .. })));

        let sep = BrainConfig::from_yaml_str("servers: [{ name: my_db, command: a }]").unwrap();
        assert!(sep.validate().unwrap_err().to_string().contains("my_db"));

        let empty = BrainConfig::from_yaml_str("servers: [{ name: db, command: '' }]").unwrap();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_enabled_servers_disables_the_rest() {
        let mut config = BrainConfig::from_yaml_str(
            r#"
servers:
  - { name: db, command: a }
  - { name: web, command: b }
enabled_servers: [db]
"#,
        )
        .unwrap();

        let enabled: Vec<bool> = config.descriptors().iter().map(|d| d.enabled).collect();
        assert_eq!(enabled, vec![true, false]);

        config.override_enabled_servers(" web , ");
        let enabled: Vec<bool> = config.descriptors().iter().map(|d| d.enabled).collect();
        assert_eq!(enabled, vec![false, true]);

        config.override_enabled_servers("  ");
        assert_eq!(config.enabled_servers, Some(vec!["web".to_string()]));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
servers:
  - name: echo
    command: toolbrain-echo-server
    args: ["--tools", "ping"]
    env:
      GREETING: "${{__TOOLBRAIN_TEST_NEVER_SET__:-hello}}"
health:
  interval_secs: 5
  max_restart_attempts: 1
llm:
  model: local-model
  temperature: 0.5
"#
        )
        .unwrap();

        let config = BrainConfig::load(file.path()).unwrap();
        assert_eq!(config.servers[0].env["GREETING"], "hello");
        assert_eq!(config.servers[0].args, vec!["--tools", "ping"]);
        assert_eq!(config.supervisor_settings().health.interval, Duration::from_secs(5));
        let options = config.run_options("go");
        assert_eq!(options.model, "local-model");
        assert!((options.temperature - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_load_missing_file() {
        let err = BrainConfig::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
