//! Reconciler: on startup and on demand, cross-check persisted `running`
//! sessions against observable OS state and repair drift. The only
//! component besides the Supervisor itself permitted to write a session's
//! status.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::paths;
use crate::session::{Session, SessionId, SessionPatch, SessionStatus, SessionStore};
use crate::Result;

/// Session is treated as alive if its Context Monitor log has been touched
/// within this window.
const HEARTBEAT_ALIVE_WINDOW: Duration = Duration::from_secs(15 * 60);
/// Beyond this much time since `updated_at`, a pid-less session is marked
/// `error` outright.
const STALE_ERROR_WINDOW_MS: i64 = 30 * 60 * 1000;

/// A process found on the OS that looks like an AFk worker or assistant
/// invocation, keyed by the session id embedded in its command line.
#[derive(Debug, Clone)]
pub struct OrphanProcess {
    pub pid: u32,
    pub session_id: Option<SessionId>,
    pub command: String,
}

/// What one `reconcile()` pass did.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub checked: Vec<SessionId>,
    pub marked_error: Vec<SessionId>,
    pub restored: Vec<SessionId>,
    pub adopted_pids: Vec<(SessionId, u32)>,
    pub orphans: Vec<OrphanProcess>,
}

impl ReconcileReport {
    pub fn total_checked(&self) -> usize {
        self.checked.len()
    }
}

pub struct Reconciler<'a> {
    store: &'a dyn SessionStore,
    data_root: PathBuf,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn SessionStore, data_root: &Path) -> Self {
        Self {
            store,
            data_root: data_root.to_path_buf(),
        }
    }

    /// Run one full reconcile pass: the per-session running check, the
    /// symmetric error→running restoration, and the independent orphan hunt.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        for session in self.store.by_status(SessionStatus::Running).await? {
            report.checked.push(session.id.clone());
            self.reconcile_running_session(&session, &system, &mut report).await?;
        }

        for session in self.store.by_status(SessionStatus::Error).await? {
            self.restore_if_alive(&session, &system, &mut report).await?;
        }

        report.orphans = self.orphan_hunt(&system).await?;
        Ok(report)
    }

    async fn reconcile_running_session(
        &self,
        session: &Session,
        system: &System,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        // Step 1: a live, stored pid is healthy on its own.
        if let Some(pid) = session.pid {
            if pid_is_alive(system, pid) {
                return Ok(());
            }
        }

        // Step 2: fall back to the Context Monitor heartbeat.
        let events_path = paths::context_events_path(&self.data_root, &session.id);
        if let Some(age) = heartbeat_age(&events_path).await {
            if age <= HEARTBEAT_ALIVE_WINDOW {
                return Ok(());
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        if now - session.updated_at > STALE_ERROR_WINDOW_MS {
            // Step 3: last resort, scan for a matching live process before
            // giving up on this session.
            if let Some(found) = find_matching_process(system, &session.id) {
                self.store
                    .update(
                        &session.id,
                        SessionPatch {
                            pid: Some(Some(found)),
                            ..Default::default()
                        },
                    )
                    .await?;
                report.adopted_pids.push((session.id.clone(), found));
                return Ok(());
            }

            self.mark_terminated_unexpectedly(session, report).await?;
            return Ok(());
        }

        // Step 3 (not yet past the stale window, but still no pid/heartbeat):
        // one more scan in case the process table simply never got updated.
        if let Some(found) = find_matching_process(system, &session.id) {
            self.store
                .update(
                    &session.id,
                    SessionPatch {
                        pid: Some(Some(found)),
                        ..Default::default()
                    },
                )
                .await?;
            report.adopted_pids.push((session.id.clone(), found));
        }

        Ok(())
    }

    async fn mark_terminated_unexpectedly(
        &self,
        session: &Session,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.store
            .update(
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Error),
                    pid: Some(None),
                    completed_at: Some(Some(now)),
                    ended_at: Some(Some(now)),
                    error: Some(Some("terminated unexpectedly".to_string())),
                    ..Default::default()
                },
            )
            .await?;
        report.marked_error.push(session.id.clone());
        tracing::warn!("reconciler marked session {} as error: terminated unexpectedly", session.id);
        Ok(())
    }

    /// Symmetric pass: an `error` session with a live matching process is
    /// restored to `running`.
    async fn restore_if_alive(
        &self,
        session: &Session,
        system: &System,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        if let Some(pid) = find_matching_process(system, &session.id) {
            self.store
                .update(
                    &session.id,
                    SessionPatch {
                        status: Some(SessionStatus::Running),
                        pid: Some(Some(pid)),
                        completed_at: Some(None),
                        ended_at: Some(None),
                        error: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
            report.restored.push(session.id.clone());
        }
        Ok(())
    }

    /// Independent orphan hunt: worker/assistant processes whose session is
    /// not `running`. Reported, not acted upon — the caller decides whether
    /// to signal them.
    async fn orphan_hunt(&self, system: &System) -> Result<Vec<OrphanProcess>> {
        let running: std::collections::HashSet<SessionId> = self
            .store
            .by_status(SessionStatus::Running)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();

        let mut orphans = Vec::new();
        for (pid, process) in system.processes() {
            let cmd = command_line(process);
            if !looks_like_worker_or_assistant(&cmd) {
                continue;
            }
            let session_id = extract_session_id(&cmd);
            let is_orphan = match &session_id {
                Some(id) => !running.contains(id),
                None => true,
            };
            if is_orphan {
                orphans.push(OrphanProcess {
                    pid: pid.as_u32(),
                    session_id,
                    command: cmd,
                });
            }
        }
        Ok(orphans)
    }
}

pub(crate) fn pid_is_alive(system: &System, pid: u32) -> bool {
    system.process(Pid::from_u32(pid)).is_some()
}

async fn heartbeat_age(events_path: &Path) -> Option<Duration> {
    let meta = tokio::fs::metadata(events_path).await.ok()?;
    let modified = meta.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn command_line(process: &sysinfo::Process) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(name) = process.exe() {
        parts.push(name.to_string_lossy().to_string());
    }
    for arg in process.cmd() {
        parts.push(arg.to_string_lossy().to_string());
    }
    parts.join(" ")
}

pub(crate) fn looks_like_worker_or_assistant(cmd: &str) -> bool {
    cmd.contains("afk-worker") || cmd.contains("--afk-session")
}

/// Pull a session id back out of a worker/assistant command line that
/// embeds it, e.g. `afk-worker '{"session_id":"afk-123-abc",...}'` or
/// `claude ... --afk-session afk-123-abc`.
fn extract_session_id(cmd: &str) -> Option<SessionId> {
    if let Some(idx) = cmd.find("--afk-session") {
        let rest = cmd[idx + "--afk-session".len()..].trim_start();
        let token = rest.split_whitespace().next()?;
        return Some(SessionId::from_string(token.to_string()));
    }
    if let Some(idx) = cmd.find("\"session_id\":\"") {
        let rest = &cmd[idx + "\"session_id\":\"".len()..];
        let end = rest.find('"')?;
        return Some(SessionId::from_string(rest[..end].to_string()));
    }
    None
}

pub(crate) fn find_matching_process(system: &System, session_id: &SessionId) -> Option<u32> {
    system.processes().iter().find_map(|(pid, process)| {
        let cmd = command_line(process);
        if looks_like_worker_or_assistant(&cmd) && cmd.contains(session_id.as_str()) {
            Some(pid.as_u32())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InMemorySessionStore, SessionMetadata, SessionType};
    use tempfile::TempDir;

    fn make_running(id: &str, updated_at: i64, pid: Option<u32>) -> Session {
        Session {
            id: SessionId::from_string(id.to_string()),
            kind: SessionType::Afk,
            task: "t".to_string(),
            status: SessionStatus::Running,
            pid,
            iterations_planned: 3,
            iterations_completed: 0,
            current_iteration: 1,
            started_at: updated_at,
            updated_at,
            completed_at: None,
            ended_at: None,
            exit_code: None,
            error: None,
            working_directory: "/tmp".to_string(),
            model: None,
            metadata: SessionMetadata::default(),
        }
    }

    #[tokio::test]
    async fn stale_session_with_no_pid_and_no_heartbeat_is_marked_error() {
        let dir = TempDir::new().unwrap();
        let store = InMemorySessionStore::new();
        let now = chrono::Utc::now().timestamp_millis();
        let session = make_running("afk-stale-1", now - 45 * 60 * 1000, Some(999_999_999));
        store.create(session.clone()).await.unwrap();

        let reconciler = Reconciler::new(&store, dir.path());
        let report = reconciler.reconcile().await.unwrap();

        assert_eq!(report.marked_error, vec![session.id.clone()]);
        let fetched = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Error);
        assert!(fetched.pid.is_none());
        assert!(fetched.completed_at.is_some());
        assert_eq!(fetched.error.as_deref(), Some("terminated unexpectedly"));
    }

    #[tokio::test]
    async fn recent_heartbeat_keeps_session_running() {
        let dir = TempDir::new().unwrap();
        let store = InMemorySessionStore::new();
        let now = chrono::Utc::now().timestamp_millis();
        let session = make_running("afk-fresh-1", now - 45 * 60 * 1000, Some(999_999_999));
        store.create(session.clone()).await.unwrap();

        let events_path = paths::context_events_path(dir.path(), &session.id);
        tokio::fs::create_dir_all(events_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&events_path, "{}\n").await.unwrap();

        let reconciler = Reconciler::new(&store, dir.path());
        let report = reconciler.reconcile().await.unwrap();

        assert!(report.marked_error.is_empty());
        let fetched = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Running);
    }
}
