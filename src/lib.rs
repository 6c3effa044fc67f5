//! Toolbrain: supervises tool-server child processes and runs bounded
//! tool-use conversations against an LLM.
//!
//! - `mcp_client`: tool-server supervisor, transport, discovery and health
//! - `inference`: conversation model and LLM clients
//! - `agent_core`: tool-use loop and workflow run tracking
//! - `config`: YAML configuration

pub mod agent_core;
pub mod config;
pub mod inference;
pub mod mcp_client;

use std::path::{Path, PathBuf};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Log files kept besides the current one.
const LOG_ROTATIONS: u32 = 3;

/// Return the platform-standard data directory for Toolbrain.
///
/// Falls back to `~/.toolbrain/` if the platform directory cannot be
/// resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolbrain");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolbrain")
}

/// Where and how to write logs.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Emit one JSON object per line.
    pub json: bool,
    /// Write to `<dir>/toolbrain.log` instead of stderr.
    pub log_dir: Option<PathBuf>,
}

/// Initialize the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, defaulting to `toolbrain=info,warn`.
/// With a log dir, existing logs are rotated (toolbrain.log → .1 → .2 → .3)
/// and a fresh file is opened with a line-flushing writer.
pub fn init_tracing(options: &LogOptions) -> std::io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolbrain=info,warn"));

    let (writer, log_path) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let log_path = dir.join("toolbrain.log");
            rotate_log_file(&log_path, LOG_ROTATIONS);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            (BoxMakeWriter::new(FlushingWriter::new(file)), Some(log_path))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    let installed = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| std::io::Error::other(e.to_string()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "toolbrain starting"
    );
    Ok(())
}

/// Rotate log files: `toolbrain.log` → `.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Gaps in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let _ = std::fs::remove_file(format!("{}.{keep}", base_path.display()));

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let _ = std::fs::rename(base_path, format!("{}.1", base_path.display()));
    }
}

/// File writer that flushes after every write so log lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_chain() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("toolbrain.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("toolbrain.log.1"), "older").unwrap();
        std::fs::write(dir.path().join("toolbrain.log.3"), "oldest").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |suffix: &str| {
            std::fs::read_to_string(dir.path().join(format!("toolbrain.log.{suffix}"))).ok()
        };
        assert_eq!(read("1").as_deref(), Some("current"));
        assert_eq!(read("2").as_deref(), Some("older"));
        assert_eq!(read("3"), None);
    }

    #[test]
    fn test_data_dir_is_namespaced() {
        assert!(data_dir().ends_with("toolbrain") || data_dir().ends_with(".toolbrain"));
    }
}
