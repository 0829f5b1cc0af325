//! Ally core — agent runtime for tool-using language-model assistants.
//!
//! Modules:
//! - `agent_core`: conversation engine, permission arbiter, tool invoker,
//!   checkpointing and the multi-stage pipeline orchestrator
//! - `inference`: provider registry, plugin discovery and model handles
//! - `config`: `ally.yaml` loading with env interpolation
//! - `runtime`: process-wide wiring of the above

pub mod agent_core;
pub mod config;
pub mod inference;
pub mod runtime;

#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};

pub use agent_core::{
    AgentConfig, AgentError, ApprovalChannel, ApprovalRequest, ApprovalResponse, Capability,
    CapabilityDescriptor, CapabilitySet, ChannelApproval, CheckpointStore, CompletionPredicate,
    ConversationEngine, MemoryCheckpointStore, PermissionArbiter, PipelineContext,
    PipelineOrchestrator, PipelineStatus, Retriever, Session, SqliteCheckpointStore, ToolError,
};
pub use config::{find_config_path, load_runtime_config, RuntimeConfig};
pub use inference::{InferenceError, ModelHandle, ProviderDescriptor, ProviderRegistry};
pub use runtime::{ActiveSession, Runtime};

/// Return the platform-standard data directory for Ally.
///
/// - macOS: `~/Library/Application Support/ally/`
/// - Windows: `{FOLDERID_RoamingAppData}\ally\`
/// - Linux: `$XDG_DATA_HOME/ally/` (fallback `~/.local/share/ally/`)
///
/// Falls back to `~/.ally/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("ally");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ally")
}

/// Initialize the tracing subscriber, writing structured logs to `log_dir`.
///
/// 1. Rotates existing logs (agent.log → agent.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh agent.log with a line-flushing writer.
/// 3. Logs a startup banner with the log path.
///
/// Returns the log file path. A subscriber installed earlier is left alone.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("agent.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ally_core=info,warn"));

    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_dir = %log_dir.display(),
            log_file = %log_path.display(),
            pid = std::process::id(),
            "=== Ally starting ==="
        );
    }
    Ok(log_path)
}

/// Rotate log files: `agent.log` → `agent.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// log lines survive a crash.
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

// ─── Tests ───────────────────────────────────────────────────────────────────
