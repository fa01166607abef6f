//! Session creation and startup options, and the config handed from the
//! parent process to the detached Worker Bootstrap.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::SessionId;

/// Options accepted by `Supervisor::start_foreground` / `start_background`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOptions {
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    pub model: Option<String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub background: bool,
    #[serde(default = "default_prevent_sleep")]
    pub prevent_sleep: bool,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

fn default_iterations() -> u32 {
    10
}

fn default_prevent_sleep() -> bool {
    true
}

fn default_checkpoint_interval() -> u64 {
    1800
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            model: None,
            working_dir: None,
            background: false,
            prevent_sleep: default_prevent_sleep(),
            checkpoint_interval: default_checkpoint_interval(),
            allowed_tools: Vec::new(),
        }
    }
}

/// The single opaque argument handed from the parent process to the
/// detached Worker Bootstrap. Unknown fields are ignored on decode, so an
/// older worker binary can still start a session encoded by a newer CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub task: String,
    pub options: StartOptions,
    pub session_id: SessionId,
    pub working_directory: PathBuf,
}

impl WorkerConfig {
    /// Encode as the single command-line argument passed to `afk-worker`.
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the worker's single argument. Unknown JSON fields are ignored
    /// by `serde_json`'s default behavior.
    pub fn decode(arg: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(arg)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_options_have_sane_defaults() {
        let opts = StartOptions::default();
        assert_eq!(opts.iterations, 10);
        assert!(opts.prevent_sleep);
        assert_eq!(opts.checkpoint_interval, 1800);
        assert!(!opts.background);
    }

    #[test]
    fn worker_config_round_trips() {
        let cfg = WorkerConfig {
            task: "refactor the parser".to_string(),
            options: StartOptions::default(),
            session_id: SessionId::from_string("afk-123456-deadbeef".to_string()),
            working_directory: PathBuf::from("/tmp/project"),
        };
        let encoded = cfg.encode().unwrap();
        let decoded = WorkerConfig::decode(&encoded).unwrap();
        assert_eq!(decoded.task, cfg.task);
        assert_eq!(decoded.session_id, cfg.session_id);
    }

    #[test]
    fn worker_config_ignores_unknown_fields() {
        let json = r#"{"task":"t","options":{},"session_id":"afk-1-2","working_directory":"/tmp","extra":"ignored"}"#;
        let decoded = WorkerConfig::decode(json).unwrap();
        assert_eq!(decoded.task, "t");
    }
}
