//! Iteration Runner — the hard core: spawn the assistant for a single
//! iteration, pipe it a prompt, consume its output concurrently, apply the
//! `/compact` recovery path, and resolve success/failure.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::classifier;
use crate::context_monitor::ContextMonitor;
use crate::progress::{IterationOutcome, ProgressTracker};
use crate::retry::RetryPolicy;
use crate::session::{ContextEventKind, ResetState, Session, SessionId, SessionPatch, SessionStore};
use crate::subprocess::{AssistantInvocation, AssistantProcess, ExitStatus, StreamSource};

/// Hard timeout for a single iteration.
const ITERATION_TIMEOUT: Duration = Duration::from_secs(300);
const KILL_GRACE_BEFORE_SECOND_COMPACT_WRITE: Duration = Duration::from_millis(100);
/// `summary` passed to the Progress Tracker is the tail of stdout.
const SUMMARY_TAIL_CHARS: usize = 500;
/// Trailing window of accumulated stdout rescanned on each chunk, wide
/// enough to span a pattern split across a chunk boundary.
const CONTEXT_SCAN_WINDOW_CHARS: usize = 1024;

/// Process-local table of live iteration child pids, keyed by session id.
/// Never persisted.
#[derive(Clone, Default)]
pub struct ProcessTable {
    inner: Arc<Mutex<HashMap<SessionId, (u32, u32)>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: SessionId, pid: u32, iteration: u32) {
        self.inner.lock().await.insert(id, (pid, iteration));
    }

    pub async fn remove(&self, id: &SessionId) {
        self.inner.lock().await.remove(id);
    }

    pub async fn get(&self, id: &SessionId) -> Option<(u32, u32)> {
        self.inner.lock().await.get(id).copied()
    }
}

/// Append-only sink for the per-session combined stdout/stderr log.
pub struct LogSink {
    file: tokio::fs::File,
}

impl LogSink {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self { file })
    }

    pub async fn write_line(&mut self, source: StreamSource, line: &str) -> std::io::Result<()> {
        let prefix = match source {
            StreamSource::Stdout => "",
            StreamSource::Stderr => "[stderr] ",
        };
        self.file.write_all(prefix.as_bytes()).await?;
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        Ok(())
    }
}

/// Build the assistant's argv for iteration `n`. `needs_context_reset`
/// suppresses the continuation flag so the assistant starts a fresh
/// conversation.
pub fn build_assistant_args(n: u32, needs_context_reset: bool, allowed_tools: &[String]) -> Vec<String> {
    let mut args = vec!["-p".to_string()];
    if n > 1 && !needs_context_reset {
        args.push("-c".to_string());
    }
    if !allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(allowed_tools.join(","));
    }
    args
}

fn build_prompt(session: &Session, n: u32) -> String {
    if n == 1 {
        format!(
            "Task: {}\nIteration {} of {} for session {}.\nIf your context window is exhausted, prefer running /compact over stopping.\n",
            session.task, n, session.iterations_planned, session.id
        )
    } else {
        format!("Continue with iteration {n} of {} for session {}.\n", session.iterations_planned, session.id)
    }
}

/// The five `/compact` recovery variants, attempted in order until one
/// write succeeds. The last variant is two writes separated by a short delay.
/// Returns `true` if some variant's stdin write succeeded, `false` if all
/// five raised and the caller must set `needsContextReset`.
async fn attempt_compact_recovery(
    process: &mut AssistantProcess,
    monitor: &mut ContextMonitor,
) -> crate::Result<bool> {
    let variants: [&str; 5] = ["/compact\n", "\n/compact\n", "/compact\r\n", "\ncompact\n", "\n"];
    let mut last_err: Option<String> = None;

    for (idx, variant) in variants.iter().enumerate() {
        let result = if idx == variants.len() - 1 {
            let first = process.write_stdin(variant).await;
            if first.is_ok() {
                tokio::time::sleep(KILL_GRACE_BEFORE_SECOND_COMPACT_WRITE).await;
                process.write_stdin("/compact\n").await
            } else {
                first
            }
        } else {
            process.write_stdin(variant).await
        };

        match result {
            Ok(()) => {
                monitor
                    .log_compact_attempt(variant.escape_default().to_string().as_str(), true, None)
                    .await?;
                return Ok(true);
            }
            Err(e) => last_err = Some(e.to_string()),
        }
    }

    monitor
        .log_compact_attempt("all variants", false, last_err.as_deref())
        .await?;
    Ok(false)
}

fn effective_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

struct DrainedOutput {
    status: ExitStatus,
    stdout_buf: String,
    stderr_buf: String,
    needs_context_reset: bool,
}

async fn drive_iteration(
    process: &mut AssistantProcess,
    log_sink: &mut LogSink,
    monitor: &mut ContextMonitor,
    tracker: &mut ProgressTracker,
    retry: &mut RetryPolicy,
) -> crate::Result<DrainedOutput> {
    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();
    let mut compact_attempted = false;
    let mut needs_context_reset = false;
    let mut usage_limit_recorded = false;

    while let Some(chunk) = process.next_chunk().await {
        let _ = log_sink.write_line(chunk.source, &chunk.line).await;

        match chunk.source {
            StreamSource::Stdout => {
                stdout_buf.push_str(&chunk.line);
                stdout_buf.push('\n');
                tracker.observe_chunk(&chunk.line);
                let window_start = stdout_buf
                    .char_indices()
                    .rev()
                    .nth(CONTEXT_SCAN_WINDOW_CHARS)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let saw_context_limit = monitor.monitor_output(&stdout_buf[window_start..]).await?;
                if saw_context_limit && !compact_attempted {
                    compact_attempted = true;
                    if !attempt_compact_recovery(process, monitor).await? {
                        needs_context_reset = true;
                    }
                }
            }
            StreamSource::Stderr => {
                stderr_buf.push_str(&chunk.line);
                stderr_buf.push('\n');
                if !usage_limit_recorded && classifier::has_usage_limit(&chunk.line) {
                    usage_limit_recorded = true;
                    retry.record_failure();
                }
            }
        }
    }

    let status = process.wait().await.map_err(crate::Error::from)?;
    Ok(DrainedOutput {
        status,
        stdout_buf,
        stderr_buf,
        needs_context_reset,
    })
}

/// Everything the runner needs to execute one iteration.
pub struct IterationContext<'a> {
    pub session: &'a Session,
    pub number: u32,
    pub assistant_program: &'a str,
    pub allowed_tools: &'a [String],
    pub log_path: &'a Path,
    pub store: &'a dyn SessionStore,
    pub process_table: &'a ProcessTable,
    pub monitor: &'a mut ContextMonitor,
    pub tracker: &'a mut ProgressTracker,
    pub retry: &'a mut RetryPolicy,
}

/// Runs iteration `number` to completion (or timeout) and returns `true` iff
/// the supervisor should advance, `false` iff it should retry after backoff.
pub async fn run_single_iteration(
    ctx: IterationContext<'_>,
    reset_state: &mut ResetState,
) -> crate::Result<bool> {
    let IterationContext {
        session,
        number: n,
        assistant_program,
        allowed_tools,
        log_path,
        store,
        process_table,
        monitor,
        tracker,
        retry,
    } = ctx;

    // Step 1: build invocation, consuming `needsContextReset` immediately.
    let needs_reset_for_this_call = reset_state.needs_context_reset;
    let args = build_assistant_args(n, needs_reset_for_this_call, allowed_tools);
    reset_state.needs_context_reset = false;

    let invocation = AssistantInvocation {
        program: assistant_program.to_string(),
        args,
        working_dir: std::path::PathBuf::from(&session.working_directory),
        env: HashMap::new(),
    };

    let mut process = match AssistantProcess::spawn(invocation).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("failed to spawn assistant for session {}: {e}", session.id);
            return Ok(false);
        }
    };

    // Step 2: register process, persist live pid.
    let pid = process.pid();
    process_table.insert(session.id.clone(), pid, n).await;
    store
        .update(
            &session.id,
            SessionPatch {
                pid: Some(Some(pid)),
                current_iteration: Some(n),
                ..Default::default()
            },
        )
        .await?;

    tracker.start_iteration(n, &session.task).await?;
    monitor
        .log_event(ContextEventKind::IterationStart, serde_json::json!({ "n": n }))
        .await?;

    // Step 3: write the prompt, close stdin.
    let prompt = build_prompt(session, n);
    let mut log_sink = LogSink::open(log_path).await.map_err(crate::Error::Io)?;
    process.write_stdin(&prompt).await?;
    process.close_stdin().await?;

    // Steps 4-6, bounded by the iteration timeout (step 8).
    let drained = tokio::time::timeout(
        ITERATION_TIMEOUT,
        drive_iteration(&mut process, &mut log_sink, monitor, tracker, retry),
    )
    .await;

    let outcome = match drained {
        Ok(inner) => inner?,
        Err(_) => {
            tracing::warn!("iteration {n} for session {} timed out, killing", session.id);
            let _ = process.kill().await;
            process_table.remove(&session.id).await;
            retry.record_failure();
            monitor
                .log_event(ContextEventKind::IterationEnd, serde_json::json!({ "n": n, "timeout": true }))
                .await?;
            tracker
                .complete_iteration(IterationOutcome {
                    success: false,
                    exit_code: None,
                    summary: "iteration timed out".to_string(),
                })
                .await?;
            return Ok(false);
        }
    };

    process_table.remove(&session.id).await;

    let code = effective_code(&outcome.status);
    monitor
        .log_event(ContextEventKind::IterationEnd, serde_json::json!({ "n": n, "code": code }))
        .await?;

    let tail: String = outcome
        .stdout_buf
        .chars()
        .rev()
        .take(SUMMARY_TAIL_CHARS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    tracker
        .complete_iteration(IterationOutcome {
            success: outcome.status.success(),
            exit_code: outcome.status.code(),
            summary: tail,
        })
        .await?;

    if outcome.needs_context_reset {
        reset_state.needs_context_reset = true;
    }

    // Step 7: classify outcome in strict priority order.
    let has_usage_limit =
        classifier::has_usage_limit(&outcome.stdout_buf) || classifier::has_usage_limit(&outcome.stderr_buf);

    if has_usage_limit && !outcome.status.success() {
        retry.record_failure();
        return Ok(false);
    }

    if code == 1 && n > 1 && !reset_state.context_reset_attempted {
        reset_state.needs_context_reset = true;
        reset_state.context_reset_attempted = true;
        return Ok(true);
    }

    if outcome.status.success() {
        retry.record_success();
        reset_state.context_reset_attempted = false;
        return Ok(true);
    }

    retry.record_failure();
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InMemorySessionStore, StartOptions};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    async fn write_script(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, format!("#!/bin/sh\n{body}\n")).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    fn test_session(id: &str, iterations_planned: u32, working_dir: &Path) -> Session {
        let options = StartOptions {
            iterations: iterations_planned,
            ..Default::default()
        };
        let mut session = Session::from_start(
            "do the thing".to_string(),
            &options,
            working_dir.to_string_lossy().to_string(),
        );
        session.id = SessionId::from_string(id.to_string());
        session
    }

    async fn harness(dir: &TempDir) -> (InMemorySessionStore, ProcessTable, ContextMonitor, ProgressTracker, RetryPolicy) {
        let store = InMemorySessionStore::new();
        let table = ProcessTable::new();
        let monitor = ContextMonitor::new(dir.path().join("events.jsonl"), dir.path().join("report.json"));
        let tracker = ProgressTracker::load(dir.path().join("progress.json")).await.unwrap();
        let retry = RetryPolicy::default();
        (store, table, monitor, tracker, retry)
    }

    #[test]
    fn build_assistant_args_first_iteration_has_no_continue_flag() {
        let args = build_assistant_args(1, false, &[]);
        assert_eq!(args, vec!["-p"]);
    }

    #[test]
    fn build_assistant_args_later_iteration_adds_continue_flag() {
        let args = build_assistant_args(2, false, &[]);
        assert_eq!(args, vec!["-p", "-c"]);
    }

    #[test]
    fn build_assistant_args_suppresses_continue_flag_on_reset() {
        let args = build_assistant_args(2, true, &[]);
        assert_eq!(args, vec!["-p"]);
    }

    #[test]
    fn build_assistant_args_appends_allowed_tools() {
        let args = build_assistant_args(1, false, &["Read".to_string(), "Write".to_string()]);
        assert_eq!(args, vec!["-p", "--allowedTools", "Read,Write"]);
    }

    #[tokio::test]
    async fn successful_iteration_advances_and_records_success() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "assistant", "cat >/dev/null\necho all good\nexit 0").await;
        let session = test_session("afk-test-1", 1, dir.path());
        let (store, table, mut monitor, mut tracker, mut retry) = harness(&dir).await;
        store.create(session.clone()).await.unwrap();
        let mut reset_state = ResetState::default();

        let ok = run_single_iteration(
            IterationContext {
                session: &session,
                number: 1,
                assistant_program: script.to_str().unwrap(),
                allowed_tools: &[],
                log_path: &dir.path().join("session.log"),
                store: &store,
                process_table: &table,
                monitor: &mut monitor,
                tracker: &mut tracker,
                retry: &mut retry,
            },
            &mut reset_state,
        )
        .await
        .unwrap();

        assert!(ok);
        assert_eq!(retry.consecutive_failures(), 0);
        assert_eq!(tracker.document().iterations.len(), 1);
        assert!(table.get(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn usage_limit_failure_is_recorded_and_iteration_retries() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            &dir,
            "assistant",
            "cat >/dev/null\necho 'Claude Max usage limit reached'\nexit 1",
        )
        .await;
        let session = test_session("afk-test-2", 3, dir.path());
        let (store, table, mut monitor, mut tracker, mut retry) = harness(&dir).await;
        store.create(session.clone()).await.unwrap();
        let mut reset_state = ResetState::default();

        let ok = run_single_iteration(
            IterationContext {
                session: &session,
                number: 1,
                assistant_program: script.to_str().unwrap(),
                allowed_tools: &[],
                log_path: &dir.path().join("session.log"),
                store: &store,
                process_table: &table,
                monitor: &mut monitor,
                tracker: &mut tracker,
                retry: &mut retry,
            },
            &mut reset_state,
        )
        .await
        .unwrap();

        assert!(!ok);
        assert_eq!(retry.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn suspected_context_fault_on_later_iteration_advances_with_reset_flag() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "assistant", "cat >/dev/null\nexit 1").await;
        let session = test_session("afk-test-3", 3, dir.path());
        let (store, table, mut monitor, mut tracker, mut retry) = harness(&dir).await;
        store.create(session.clone()).await.unwrap();
        let mut reset_state = ResetState::default();

        let ok = run_single_iteration(
            IterationContext {
                session: &session,
                number: 2,
                assistant_program: script.to_str().unwrap(),
                allowed_tools: &[],
                log_path: &dir.path().join("session.log"),
                store: &store,
                process_table: &table,
                monitor: &mut monitor,
                tracker: &mut tracker,
                retry: &mut retry,
            },
            &mut reset_state,
        )
        .await
        .unwrap();

        assert!(ok);
        assert!(reset_state.needs_context_reset);
        assert!(reset_state.context_reset_attempted);
    }

    #[tokio::test]
    async fn spawn_failure_returns_false_without_erroring() {
        let dir = TempDir::new().unwrap();
        let session = test_session("afk-test-4", 1, dir.path());
        let (store, table, mut monitor, mut tracker, mut retry) = harness(&dir).await;
        store.create(session.clone()).await.unwrap();
        let mut reset_state = ResetState::default();

        let ok = run_single_iteration(
            IterationContext {
                session: &session,
                number: 1,
                assistant_program: "definitely-not-a-real-binary",
                allowed_tools: &[],
                log_path: &dir.path().join("session.log"),
                store: &store,
                process_table: &table,
                monitor: &mut monitor,
                tracker: &mut tracker,
                retry: &mut retry,
            },
            &mut reset_state,
        )
        .await
        .unwrap();

        assert!(!ok);
    }
}
