//! CLI argument structures.
//!
//! Defines the `afk` command surface: start a new AFk session, inspect or
//! stop running ones, tail their logs, and perform maintenance.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "afk")]
#[command(about = "Supervise long-running AI assistant sessions", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new AFk session against the given task
    Start {
        /// What to ask the assistant to work on
        task: String,

        /// Number of iterations to run
        #[arg(short = 'n', long, default_value = "10")]
        iterations: u32,

        /// Assistant model override
        #[arg(long)]
        model: Option<String>,

        /// Working directory the assistant runs in (defaults to current directory)
        #[arg(short = 'p', long)]
        path: Option<PathBuf>,

        /// Detach into a background worker process immediately
        #[arg(long)]
        background: bool,

        /// Do not hold a sleep inhibitor for the session's lifetime
        #[arg(long)]
        no_sleep_inhibitor: bool,

        /// Seconds between progress checkpoints
        #[arg(long, default_value = "1800")]
        checkpoint_interval: u64,

        /// Restrict the assistant to this comma-separated tool allowlist
        #[arg(long, value_delimiter = ',')]
        allowed_tools: Option<Vec<String>>,
    },

    /// Stop a running session
    Stop {
        /// Full or unambiguous partial session id
        session_id: String,
    },

    /// Show session status, optionally filtered
    Status {
        /// Only show sessions in this status (created, starting, running, completed, error, stopped, failed)
        #[arg(long)]
        status: Option<String>,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show aggregate statistics across all sessions
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Tail a session's log file
    Tail {
        /// Full or unambiguous partial session id
        session_id: String,

        /// Poll interval in seconds (clamped to a minimum of 1)
        #[arg(long, default_value = "1")]
        interval_secs: u64,

        /// Stop after the session reaches a terminal state instead of following forever
        #[arg(long)]
        follow_until_done: bool,
    },

    /// Remove terminated sessions and their sidecars older than the given age
    Cleanup {
        /// Only remove sessions whose terminal state is older than this many days
        #[arg(long, default_value = "7")]
        days: i64,
    },

    /// Reconcile persisted session state against live processes
    Validate {
        /// Report only, without correcting discrepancies
        #[arg(long)]
        dry_run: bool,
    },
}
