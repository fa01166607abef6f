//! Core session data model: `SessionId`, `Session`, `SessionStatus`, and the
//! iteration/context sidecar record types.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session, format `afk-<timestamp-suffix>-<random>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new, randomly-generated session id.
    pub fn new() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let suffix = &ts.to_string()[ts.to_string().len().saturating_sub(6)..];
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("afk-{}-{}", suffix, &random[..8]))
    }

    /// Wrap an existing string as a session id (used when decoding from storage).
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reserved for future job types; today only `Afk` exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Afk,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Afk => write!(f, "afk"),
        }
    }
}

/// The session's lifecycle status. Terminal statuses are absorbing: once a
/// session reaches one of `Completed`, `Error`, `Stopped`, or `Failed`, no
/// later write may move it back to a non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Starting,
    Running,
    Completed,
    Error,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Error
                | SessionStatus::Stopped
                | SessionStatus::Failed
        )
    }

    /// Statuses the Session Store's `active()` query considers "in flight".
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionStatus::Running | SessionStatus::Starting | SessionStatus::Created
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => SessionStatus::Created,
            "starting" => SessionStatus::Starting,
            "running" => SessionStatus::Running,
            "completed" => SessionStatus::Completed,
            "error" => SessionStatus::Error,
            "stopped" => SessionStatus::Stopped,
            "failed" => SessionStatus::Failed,
            other => {
                return Err(crate::Error::Validation(format!(
                    "unknown session status {other:?}"
                )))
            }
        })
    }
}

/// Metadata bag for the handful of session-level extras that don't belong
/// on the core `Session` row, given a typed home instead of a stringly-typed map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub caffeinate_pid: Option<u32>,
    #[serde(default)]
    pub background: bool,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
}

fn default_checkpoint_interval() -> u64 {
    1800
}

/// A durable session row, owned exclusively by the Session Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(rename = "type")]
    pub kind: SessionType,
    pub task: String,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub iterations_planned: u32,
    pub iterations_completed: u32,
    pub current_iteration: u32,
    pub started_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub working_directory: String,
    pub model: Option<String>,
    pub metadata: SessionMetadata,
}

impl Session {
    /// Build a fresh, not-yet-persisted session row from a task and its
    /// start options. `created()` stamps `started_at`/`updated_at` on insert.
    pub fn from_start(task: String, options: &super::StartOptions, working_directory: String) -> Self {
        Self {
            id: SessionId::new(),
            kind: SessionType::Afk,
            task,
            status: SessionStatus::Created,
            pid: None,
            iterations_planned: options.iterations,
            iterations_completed: 0,
            current_iteration: 0,
            started_at: 0,
            updated_at: 0,
            completed_at: None,
            ended_at: None,
            exit_code: None,
            error: None,
            working_directory,
            model: options.model.clone(),
            metadata: SessionMetadata {
                caffeinate_pid: None,
                background: options.background,
                checkpoint_interval: options.checkpoint_interval,
            },
        }
    }

    /// Checksum used by `allWithChecksum`: cheap enough to compute on every
    /// poll, sensitive to any row changing.
    pub fn checksum_of(sessions: &[Session]) -> String {
        let count = sessions.len();
        let max_updated = sessions.iter().map(|s| s.updated_at).max().unwrap_or(0);
        format!("{count},{max_updated}")
    }
}

/// Per-session sticky flags threaded explicitly through the Iteration
/// Runner rather than mutated on a shared reference (REDESIGN FLAG: ad-hoc
/// booleans become a value type returned to the caller).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetState {
    pub needs_context_reset: bool,
    pub context_reset_attempted: bool,
    pub failed_after_reset: bool,
}

/// Status of a single iteration within the progress sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Running,
    Completed,
    Failed,
    Stopped,
    Error,
}

/// One entry in the progress sidecar's ordered iteration sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub number: u32,
    pub goal: String,
    pub start: i64,
    pub end: Option<i64>,
    pub status: IterationStatus,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub achievements: Vec<String>,
    #[serde(default)]
    pub challenges: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    pub duration_sec: Option<f64>,
}

/// The context-event kinds recorded by the Context Monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextEventKind {
    IterationStart,
    IterationEnd,
    ContextLimit,
    CompactSuggestion,
    CompactAttempt,
    CompactFailure,
}

/// One entry in a session's append-only context event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEvent {
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: ContextEventKind,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_absorbing_by_flag() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Created.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            SessionStatus::Created,
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Error,
            SessionStatus::Stopped,
            SessionStatus::Failed,
        ] {
            let parsed: SessionStatus = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn session_id_has_afk_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("afk-"));
    }

    #[test]
    fn checksum_reflects_count_and_max_updated_at() {
        let mk = |updated: i64| Session {
            id: SessionId::new(),
            kind: SessionType::Afk,
            task: "t".into(),
            status: SessionStatus::Running,
            pid: None,
            iterations_planned: 1,
            iterations_completed: 0,
            current_iteration: 0,
            started_at: 0,
            updated_at: updated,
            completed_at: None,
            ended_at: None,
            exit_code: None,
            error: None,
            working_directory: ".".into(),
            model: None,
            metadata: SessionMetadata::default(),
        };
        let sessions = vec![mk(10), mk(30), mk(20)];
        assert_eq!(Session::checksum_of(&sessions), "3,30");
        assert_eq!(Session::checksum_of(&[]), "0,0");
    }
}
