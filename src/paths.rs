//! Persistent state layout.
//!
//! All on-disk state lives under one data root: the session database, the
//! worker registry, per-session sidecars, and per-session logs. Centralizing
//! the layout here keeps the Supervisor, Reconciler, Log Tailer, and Worker
//! Bootstrap from disagreeing about where something lives.

use std::path::{Path, PathBuf};

use crate::session::SessionId;

/// Resolve the default data root: `$AFK_HOME` if set, else `~/.afk`.
pub fn default_data_root() -> anyhow::Result<PathBuf> {
    if let Ok(home) = std::env::var("AFK_HOME") {
        return Ok(PathBuf::from(home));
    }
    let base = dirs_home()?;
    Ok(base.join(".afk"))
}

fn dirs_home() -> anyhow::Result<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))
}

/// Path to the SQLite database file.
pub fn database_path(data_root: &Path) -> PathBuf {
    data_root.join("sessions.db")
}

/// Directory holding per-session sidecars and logs.
pub fn sessions_dir(data_root: &Path) -> PathBuf {
    data_root.join("sessions")
}

/// Directory for a single session's sidecars and log file.
pub fn session_dir(data_root: &Path, id: &SessionId) -> PathBuf {
    sessions_dir(data_root).join(id.as_str())
}

/// Path to the session's main log file.
pub fn log_path(data_root: &Path, id: &SessionId) -> PathBuf {
    session_dir(data_root, id).join("session.log")
}

/// Path to the session's progress sidecar.
pub fn progress_path(data_root: &Path, id: &SessionId) -> PathBuf {
    session_dir(data_root, id).join("progress.json")
}

/// Path to the session's context report sidecar.
pub fn context_report_path(data_root: &Path, id: &SessionId) -> PathBuf {
    session_dir(data_root, id).join("context-report.json")
}

/// Path to the session's raw context event log (JSON-lines).
pub fn context_events_path(data_root: &Path, id: &SessionId) -> PathBuf {
    session_dir(data_root, id).join("context-events.jsonl")
}

/// Directory the Worker Bootstrap treats as its process registry.
pub fn registry_dir(data_root: &Path) -> PathBuf {
    data_root.join("registry")
}

/// Path to a worker's stdio-redirect log, keyed by session id.
pub fn worker_log_path(data_root: &Path, id: &SessionId) -> PathBuf {
    registry_dir(data_root).join(format!("{}.worker.log", id))
}
