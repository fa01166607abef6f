//! Interactive assistant process handle.
//!
//! The Iteration Runner needs a still-running child whose stdout/stderr can
//! be consumed concurrently while additional input (the `/compact` recovery
//! variants) is written to its stdin mid-run, and that can be hard-killed on
//! a per-iteration timeout. A single handle built for that one purpose, with
//! its own stream-processor channel pattern.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::ProcessError;
use super::runner::ExitStatus;

const KILL_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub source: StreamSource,
    pub line: String,
}

/// Parameters for launching the assistant CLI for one iteration.
pub struct AssistantInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
}

/// A live, interactive child process plus the plumbing to read its output
/// line-by-line and write to its stdin while it runs.
pub struct AssistantProcess {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    chunks: mpsc::Receiver<StreamChunk>,
    _readers: Vec<JoinHandle<()>>,
    started_at: Instant,
}

impl AssistantProcess {
    pub async fn spawn(invocation: AssistantInvocation) -> Result<Self, ProcessError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, value) in &invocation.env {
            command.env(key, value);
        }

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
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::CommandNotFound(invocation.program.clone())
            } else {
                ProcessError::SpawnFailed {
                    command: invocation.program.clone(),
                    source: e,
                }
            }
        })?;

        let pid = child.id().ok_or_else(|| {
            ProcessError::SpawnFailed {
                command: invocation.program.clone(),
                source: std::io::Error::other("child exited before pid was observable"),
            }
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(256);
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = stdout {
            let tx = tx.clone();
            readers.push(tokio::spawn(async move {
                pump_lines(stdout, StreamSource::Stdout, tx).await;
            }));
        }
        if let Some(stderr) = stderr {
            let tx = tx.clone();
            readers.push(tokio::spawn(async move {
                pump_lines(stderr, StreamSource::Stderr, tx).await;
            }));
        }
        drop(tx);

        Ok(Self {
            child,
            pid,
            stdin,
            chunks: rx,
            _readers: readers,
            started_at: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Write additional input to the child's stdin without closing it.
    pub async fn write_stdin(&mut self, data: &str) -> Result<(), ProcessError> {
        if let Some(stdin) = self.stdin.as_mut() {
            stdin.write_all(data.as_bytes()).await?;
            stdin.flush().await?;
        }
        Ok(())
    }

    /// Close stdin, signalling the assistant that no more input is coming.
    pub async fn close_stdin(&mut self) -> Result<(), ProcessError> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        Ok(())
    }

    /// Receive the next stdout/stderr line. Returns `None` once both
    /// streams have been fully drained.
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        self.chunks.recv().await
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        let status = self.child.wait().await?;
        Ok(classify_exit(status))
    }

    /// Kill the assistant's whole process group: SIGTERM, a short grace
    /// period, then SIGKILL if it's still alive.
    #[cfg(unix)]
    pub async fn kill(&mut self) -> Result<(), ProcessError> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(-(self.pid as i32));
        signal::kill(pgid, Signal::SIGTERM)
            .map_err(|e| ProcessError::KillFailed(format!("SIGTERM to {}: {e}", self.pid)))?;

        tokio::time::sleep(KILL_GRACE).await;

        if self.child.try_wait().ok().flatten().is_none() {
            let _ = signal::kill(pgid, Signal::SIGKILL);
        }

        let _ = self.child.kill().await;
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn kill(&mut self) -> Result<(), ProcessError> {
        self.child.kill().await.map_err(ProcessError::Io)
    }
}

async fn pump_lines<R>(reader: R, source: StreamSource, tx: mpsc::Sender<StreamChunk>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(StreamChunk { source, line }).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("error reading assistant {:?} stream: {}", source, e);
                return;
            }
        }
    }
}

fn classify_exit(status: std::process::ExitStatus) -> ExitStatus {
    if status.success() {
        return ExitStatus::Success;
    }
    if let Some(code) = status.code() {
        return ExitStatus::Error(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitStatus::Signal(signal);
        }
    }
    ExitStatus::Error(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(program: &str, args: &[&str]) -> AssistantInvocation {
        AssistantInvocation {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: std::env::temp_dir(),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn spawn_and_drain_stdout_lines() {
        let mut process =
            AssistantProcess::spawn(invocation("printf", &["line1\\nline2\\n"])).await.unwrap();
        process.close_stdin().await.unwrap();

        let mut lines = Vec::new();
        while let Some(chunk) = process.next_chunk().await {
            lines.push(chunk.line);
        }
        let status = process.wait().await.unwrap();

        assert_eq!(lines, vec!["line1", "line2"]);
        assert!(status.success());
    }

    #[tokio::test]
    async fn spawn_unknown_program_returns_command_not_found() {
        let err = AssistantProcess::spawn(invocation("definitely-not-a-real-binary", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::CommandNotFound(_)));
    }

    #[tokio::test]
    async fn write_stdin_reaches_cat_before_close() {
        let mut process = AssistantProcess::spawn(invocation("cat", &[])).await.unwrap();
        process.write_stdin("hello\n").await.unwrap();
        process.close_stdin().await.unwrap();

        let chunk = process.next_chunk().await.unwrap();
        assert_eq!(chunk.line, "hello");
        assert_eq!(chunk.source, StreamSource::Stdout);

        let status = process.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn kill_terminates_a_long_running_process() {
        let mut process = AssistantProcess::spawn(invocation("sleep", &["30"])).await.unwrap();
        process.kill().await.unwrap();
        let status = process.wait().await.unwrap();
        assert!(!status.success());
    }
}
