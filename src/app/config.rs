//! Application configuration
//!
//! This module handles application-wide configuration settings.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration structure
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Verbosity level for logging
    pub verbose: u8,
    /// Directory the process was invoked from
    pub working_dir: PathBuf,
    /// Root of the persistent state tree (sessions, registry, logs)
    pub data_root: PathBuf,
    /// How often the Progress Tracker checkpoints mid-iteration state
    pub checkpoint_interval: Duration,
    /// Disable the sleep-inhibitor helper even when available
    pub no_sleep_inhibitor: bool,
    /// The assistant CLI binary the Iteration Runner spawns once per
    /// iteration; overridable via `AFK_ASSISTANT_PROGRAM` for testing.
    pub assistant_program: String,
}

impl AppConfig {
    /// Create a new application configuration
    pub fn new(verbose: u8) -> Result<Self> {
        let working_dir = std::env::current_dir()
            .map_err(|e| anyhow::anyhow!("Failed to get current directory: {}", e))?;
        let data_root = crate::paths::default_data_root()?;

        Ok(Self {
            verbose,
            working_dir,
            data_root,
            checkpoint_interval: Duration::from_secs(30),
            no_sleep_inhibitor: false,
            assistant_program: std::env::var("AFK_ASSISTANT_PROGRAM")
                .unwrap_or_else(|_| "claude".to_string()),
        })
    }

    /// Override the data root (primarily for tests)
    pub fn with_data_root(mut self, root: PathBuf) -> Self {
        self.data_root = root;
        self
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    /// Get the log level string based on verbosity
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            2 => "trace",
            _ => "trace",
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            verbose: 0,
            working_dir: PathBuf::from("."),
            data_root: PathBuf::from(".afk"),
            checkpoint_interval: Duration::from_secs(30),
            no_sleep_inhibitor: false,
            assistant_program: "claude".to_string(),
        }
    }
}
