//! # afk
//!
//! Supervises long-running AI-assistant iteration jobs: spawns the
//! assistant CLI repeatedly, classifies its output for usage-limit and
//! context-limit signals, applies retry/backoff, persists session state
//! durably, reconciles sessions against crashed processes on restart, and
//! tails logs for a running session.
//!
//! ## Modules
//!
//! - `app` - application configuration, logging, runtime bootstrap, fatal-error handling
//! - `cli` - argument parsing and command dispatch
//! - `session` - the durable `Session` row, its sidecars, and the Session Store
//! - `classifier` - output classification (usage limit, context limit, compaction signals)
//! - `retry` - exponential backoff policy
//! - `context_monitor` - per-iteration context event log and report sidecar
//! - `progress` - iteration progress sidecar
//! - `runner` - the per-iteration assistant invocation and outcome handling
//! - `supervisor` - per-session lifecycle: creation, sleep inhibitor, iteration loop, stop
//! - `reconciler` - startup/on-demand drift repair between persisted state and live processes
//! - `tailer` - log resolution and incremental follow
//! - `subprocess` - process spawn/kill abstraction used by the runner and supervisor
//! - `paths` - data-root layout helpers
//! - `error` - the crate-wide error type

pub mod app;
pub mod classifier;
pub mod cli;
pub mod context_monitor;
pub mod error;
pub mod paths;
pub mod progress;
pub mod reconciler;
pub mod retry;
pub mod runner;
pub mod session;
pub mod subprocess;
pub mod supervisor;
pub mod tailer;

pub use error::{Error, Result};
