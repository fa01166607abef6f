//! Session Supervisor: per-session creation, sleep-inhibitor lifecycle,
//! iteration sequencing, backoff on failure, status transitions, and
//! cancellation.
//!
//! The lifecycle follows a create -> iterate -> finalize main loop, and
//! `stop()` follows a two-stage process-group termination: signal the
//! whole process group, and tolerate "already exited" as success.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};

use crate::context_monitor::ContextMonitor;
use crate::paths;
use crate::progress::ProgressTracker;
use crate::reconciler::find_matching_process;
use crate::retry::RetryPolicy;
use crate::runner::{self, IterationContext, ProcessTable};
use crate::session::{
    ResetState, Session, SessionId, SessionPatch, SessionStatus, SessionStore, StartOptions,
    WorkerConfig,
};
use crate::{Error, Result};

/// A session with more than this many planned iterations gets a sleep
/// inhibitor by default.
const SLEEP_INHIBITOR_ITERATION_THRESHOLD: u32 = 5;
/// Sleeps longer than this are segmented so stop requests are observed
/// promptly.
const SLEEP_SEGMENT: Duration = Duration::from_secs(5);
/// Floor for the inter-iteration gap after a successful iteration.
const MIN_INTER_ITERATION_GAP: Duration = Duration::from_secs(5);

/// Owns everything a running session needs that must never be persisted:
/// the process table, the assistant program and tool allowlist, and the
/// data root used to lay out sidecars.
pub struct Supervisor {
    store: Arc<dyn SessionStore>,
    data_root: PathBuf,
    assistant_program: String,
    allowed_tools: Arc<Vec<String>>,
    process_table: ProcessTable,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        data_root: PathBuf,
        assistant_program: String,
        allowed_tools: Vec<String>,
    ) -> Self {
        Self {
            store,
            data_root,
            assistant_program,
            allowed_tools: Arc::new(allowed_tools),
            process_table: ProcessTable::new(),
        }
    }

    fn layout(&self, id: &SessionId) -> SessionLayout {
        SessionLayout {
            log: paths::log_path(&self.data_root, id),
            events: paths::context_events_path(&self.data_root, id),
            report: paths::context_report_path(&self.data_root, id),
            progress: paths::progress_path(&self.data_root, id),
        }
    }

    /// Create a session and run its foreground loop to completion in the
    /// current process, returning the final session row.
    pub async fn start_foreground(&self, task: String, options: StartOptions) -> Result<Session> {
        let working_directory = resolve_working_dir(&options);
        let prevent_sleep = options.prevent_sleep;
        let mut session = Session::from_start(task, &options, working_directory);
        session.status = SessionStatus::Starting;
        let created = self.store.create(session).await?;
        self.spawn_inhibitor_if_warranted(&created, prevent_sleep).await?;
        self.store
            .update(
                &created.id,
                SessionPatch {
                    status: Some(SessionStatus::Running),
                    ..Default::default()
                },
            )
            .await?;

        self.run_foreground_loop(&created.id).await?;

        self.store
            .get(&created.id)
            .await?
            .ok_or_else(|| Error::NotFound(created.id.to_string()))
    }

    /// Create a session row, then detach a Worker Bootstrap process that
    /// runs the same loop. Returns immediately with the just-created row.
    pub async fn start_background(&self, task: String, options: StartOptions) -> Result<Session> {
        let working_directory = resolve_working_dir(&options);
        let prevent_sleep = options.prevent_sleep;
        let mut session = Session::from_start(task.clone(), &options, working_directory.clone());
        session.status = SessionStatus::Starting;
        session.metadata.background = true;
        let created = self.store.create(session).await?;
        self.spawn_inhibitor_if_warranted(&created, prevent_sleep).await?;

        let layout = self.layout(&created.id);
        if let Some(parent) = layout.log.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let preamble = format!(
            "[afk] session {} starting in background: {}\n",
            created.id, task
        );
        tokio::fs::write(&layout.log, preamble).await?;

        let worker_config = WorkerConfig {
            task,
            options,
            session_id: created.id.clone(),
            working_directory: PathBuf::from(&working_directory),
        };
        let encoded = worker_config.encode()?;

        let worker_bin = self.worker_binary_path()?;
        let mut command = tokio::process::Command::new(&worker_bin);
        command
            .arg(&encoded)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid().map_err(std::io::Error::from)?;
                    Ok(())
                });
            }
        }

        let mut child = command.spawn().map_err(|e| {
            Error::ProcessSpawn(format!("{}: {e}", worker_bin.display()))
        })?;
        // Reap the detached worker in the background so it never zombies;
        // we never wait on its exit code, we only keep dropping it clean.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        self.store
            .get(&created.id)
            .await?
            .ok_or_else(|| Error::NotFound(created.id.to_string()))
    }

    fn worker_binary_path(&self) -> Result<PathBuf> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| Error::Resource("cannot determine executable directory".to_string()))?;
        let name = if cfg!(windows) { "afk-worker.exe" } else { "afk-worker" };
        Ok(dir.join(name))
    }

    /// The per-session loop itself, shared by `start_foreground` and the
    /// `afk-worker` bootstrap, which resumes an already-created session by id.
    pub async fn run_foreground_loop(&self, id: &SessionId) -> Result<()> {
        let mut session = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let inhibitor_pid = session.metadata.caffeinate_pid;

        let layout = self.layout(id);
        let mut monitor = ContextMonitor::new(layout.events.clone(), layout.report.clone());
        let mut tracker = ProgressTracker::load(layout.progress.clone()).await?;
        let mut retry = RetryPolicy::default();
        let mut reset_state = ResetState::default();

        let planned = session.iterations_planned;
        let mut i: u32 = 1;

        while i <= planned {
            session = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            if session.status.is_terminal() {
                break;
            }

            self.store
                .update(
                    id,
                    SessionPatch {
                        status: Some(SessionStatus::Running),
                        iterations_completed: Some(i.saturating_sub(1)),
                        ..Default::default()
                    },
                )
                .await?;

            let advanced = runner::run_single_iteration(
                IterationContext {
                    session: &session,
                    number: i,
                    assistant_program: &self.assistant_program,
                    allowed_tools: &self.allowed_tools,
                    log_path: &layout.log,
                    store: self.store.as_ref(),
                    process_table: &self.process_table,
                    monitor: &mut monitor,
                    tracker: &mut tracker,
                    retry: &mut retry,
                },
                &mut reset_state,
            )
            .await?;

            if !advanced {
                self.interruptible_sleep(retry.next_delay(), id).await;
                if self.is_stopped(id).await? {
                    break;
                }
                continue;
            }

            self.store
                .update(
                    id,
                    SessionPatch {
                        iterations_completed: Some(i),
                        ..Default::default()
                    },
                )
                .await?;

            if i < planned {
                let gap = std::cmp::max(MIN_INTER_ITERATION_GAP, retry.next_delay() / 6);
                self.interruptible_sleep(gap, id).await;
                if self.is_stopped(id).await? {
                    break;
                }
            }
            i += 1;
        }

        self.finalize(id).await?;
        if let Some(pid) = inhibitor_pid {
            kill_pid_best_effort(pid);
        }
        Ok(())
    }

    async fn finalize(&self, id: &SessionId) -> Result<()> {
        let Some(session) = self.store.get(id).await? else {
            return Ok(());
        };
        if session.status == SessionStatus::Running {
            let now = chrono::Utc::now().timestamp_millis();
            self.store
                .update(
                    id,
                    SessionPatch {
                        status: Some(SessionStatus::Completed),
                        completed_at: Some(Some(now)),
                        ended_at: Some(Some(now)),
                        pid: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Spawn and persist a sleep inhibitor pid at session-creation time, if
    /// the session is long enough to warrant one and the caller didn't opt
    /// out.
    async fn spawn_inhibitor_if_warranted(&self, session: &Session, prevent_sleep: bool) -> Result<()> {
        if !prevent_sleep || session.iterations_planned <= SLEEP_INHIBITOR_ITERATION_THRESHOLD {
            return Ok(());
        }
        let Some(pid) = spawn_sleep_inhibitor().await else {
            return Ok(());
        };
        let mut metadata = session.metadata.clone();
        metadata.caffeinate_pid = Some(pid);
        self.store
            .update(
                &session.id,
                SessionPatch {
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn is_stopped(&self, id: &SessionId) -> Result<bool> {
        Ok(self
            .store
            .get(id)
            .await?
            .map(|s| s.status.is_terminal())
            .unwrap_or(true))
    }

    /// Sleep `total`, but in ≤5s segments, re-checking for a user-initiated
    /// stop between each segment. Shared by the backoff delay and the
    /// inter-iteration gap.
    async fn interruptible_sleep(&self, total: Duration, id: &SessionId) {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            let step = remaining.min(SLEEP_SEGMENT);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
            if self.is_stopped(id).await.unwrap_or(true) {
                return;
            }
        }
    }

    /// Stop a running session: locate its live process via the in-memory
    /// table, then the stored pid, then a last-resort OS process scan;
    /// terminate it and the sleep inhibitor; transition to `stopped`.
    /// Idempotent — calling `stop` on an already-terminal session is a
    /// no-op success, not an error.
    pub async fn stop(&self, id_or_prefix: &str) -> Result<Session> {
        let session = self
            .store
            .find_by_partial_id(id_or_prefix)
            .await?
            .ok_or_else(|| Error::NotFound(id_or_prefix.to_string()))?;

        if session.status.is_terminal() {
            return Ok(session);
        }

        if let Some((pid, _n)) = self.process_table.get(&session.id).await {
            kill_process_group_best_effort(pid);
        } else if let Some(pid) = session.pid {
            kill_process_group_best_effort(pid);
        } else {
            let mut system = System::new();
            system.refresh_processes(ProcessesToUpdate::All, true);
            if let Some(pid) = find_matching_process(&system, &session.id) {
                kill_process_group_best_effort(pid);
            }
        }

        if let Some(inhibitor_pid) = session.metadata.caffeinate_pid {
            kill_pid_best_effort(inhibitor_pid);
        }

        let now = chrono::Utc::now().timestamp_millis();
        self.store
            .update(
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Stopped),
                    pid: Some(None),
                    completed_at: Some(Some(now)),
                    ended_at: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await?;

        self.store
            .get(&session.id)
            .await?
            .ok_or_else(|| Error::NotFound(session.id.to_string()))
    }
}

struct SessionLayout {
    log: PathBuf,
    events: PathBuf,
    report: PathBuf,
    progress: PathBuf,
}

fn resolve_working_dir(options: &StartOptions) -> String {
    options
        .working_dir
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
        .to_string_lossy()
        .to_string()
}

/// Start the platform sleep-inhibitor utility. Non-fatal if unavailable —
/// only macOS ships `caffeinate`; elsewhere this logs and returns `None`.
async fn spawn_sleep_inhibitor() -> Option<u32> {
    #[cfg(target_os = "macos")]
    {
        match tokio::process::Command::new("caffeinate")
            .arg("-dim")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(mut child) => {
                let pid = child.id();
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                pid
            }
            Err(e) => {
                tracing::warn!("could not start sleep inhibitor: {e}");
                None
            }
        }
    }
    #[cfg(not(target_os = "macos"))]
    {
        tracing::debug!("no sleep inhibitor available on this platform");
        None
    }
}

/// Signal a process's whole process group with SIGTERM only; the caller
/// does not escalate to SIGKILL. "Already exited" is treated as success
/// rather than an error.
#[cfg(unix)]
fn kill_process_group_best_effort(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(-(pid as i32));
    match signal::kill(pgid, Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!("failed to signal process group for pid {pid}: {e}"),
    }
}

#[cfg(not(unix))]
fn kill_process_group_best_effort(pid: u32) {
    tracing::warn!("process-group termination not implemented for this platform (pid {pid})");
}

#[cfg(unix)]
fn kill_pid_best_effort(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!("failed to signal pid {pid}: {e}"),
    }
}

#[cfg(not(unix))]
fn kill_pid_best_effort(pid: u32) {
    tracing::warn!("pid termination not implemented for this platform (pid {pid})");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;
    use tempfile::TempDir;

    fn supervisor(store: Arc<dyn SessionStore>, dir: &TempDir, script: &std::path::Path) -> Supervisor {
        Supervisor::new(store, dir.path().to_path_buf(), script.to_string_lossy().to_string(), vec![])
    }

    async fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join(name);
        tokio::fs::write(&path, format!("#!/bin/sh\n{body}\n")).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    #[tokio::test]
    async fn foreground_session_with_all_successful_iterations_completes() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "assistant", "cat >/dev/null\necho ok\nexit 0").await;
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let sup = supervisor(store.clone(), &dir, &script);

        let options = StartOptions {
            iterations: 3,
            working_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let session = sup.start_foreground("do the thing".to_string(), options).await.unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.iterations_completed, 3);
        assert!(session.completed_at.is_some());
    }

    #[tokio::test]
    async fn stop_on_terminal_session_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "assistant", "cat >/dev/null\nexit 0").await;
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let sup = supervisor(store.clone(), &dir, &script);

        let options = StartOptions {
            iterations: 1,
            working_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let session = sup.start_foreground("t".to_string(), options).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);

        let stopped_once = sup.stop(session.id.as_str()).await.unwrap();
        assert_eq!(stopped_once.status, SessionStatus::Completed);
        let stopped_twice = sup.stop(session.id.as_str()).await.unwrap();
        assert_eq!(stopped_twice.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn stop_on_unknown_session_surfaces_not_found() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "assistant", "exit 0").await;
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let sup = supervisor(store, &dir, &script);

        let err = sup.stop("afk-does-not-exist").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
