//! Log Tailer: resolve a session's log among several candidate paths, then
//! incrementally stream new bytes as the file grows.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use crate::paths;
use crate::session::SessionId;
use crate::Result;

/// Minimum poll interval when following a growing log.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One candidate log location, in priority order.
#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    source: &'static str,
}

fn candidates(data_root: &Path, id: &SessionId) -> Vec<Candidate> {
    vec![
        Candidate {
            path: paths::log_path(data_root, id),
            source: "session-log",
        },
        Candidate {
            path: paths::sessions_dir(data_root).join(format!("{id}.log")),
            source: "session-log-flat",
        },
        Candidate {
            path: paths::registry_dir(data_root).join(id.as_str()).join("worker.log"),
            source: "worker-log",
        },
        Candidate {
            path: paths::context_events_path(data_root, id),
            source: "context-monitor-log",
        },
        Candidate {
            path: paths::worker_log_path(data_root, id),
            source: "worker-log-flat",
        },
    ]
}

async fn exists_and_non_empty(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len() > 0,
        Err(_) => false,
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// One chunk of tailed output, annotated with which candidate it came from
/// (meaningful only in aggregate mode, where more than one source may
/// contribute).
#[derive(Debug, Clone)]
pub struct TailChunk {
    pub source: &'static str,
    pub text: String,
}

/// Resolves and incrementally streams a session's log.
pub struct LogTailer {
    data_root: PathBuf,
}

impl LogTailer {
    pub fn new(data_root: PathBuf) -> Self {
        Self { data_root }
    }

    /// First candidate whose file exists and is non-empty wins. Returns
    /// `None` if no candidate exists at all (not merely empty — an empty
    /// but present file is still a valid resolution target, so it returns
    /// empty content rather than "not found").
    pub async fn resolve(&self, id: &SessionId) -> Option<PathBuf> {
        let cands = candidates(&self.data_root, id);
        for c in &cands {
            if exists_and_non_empty(&c.path).await {
                return Some(c.path.clone());
            }
        }
        // None are non-empty; fall back to the first that exists at all so
        // an empty-but-present log still resolves instead of "not found".
        for c in &cands {
            if exists(&c.path).await {
                return Some(c.path.clone());
            }
        }
        None
    }

    /// Aggregate every non-empty candidate in ascending mtime order,
    /// annotated with source markers, for the case where no single
    /// candidate wins outright.
    pub async fn resolve_aggregate(&self, id: &SessionId) -> Vec<(PathBuf, &'static str)> {
        let cands = candidates(&self.data_root, id);
        let mut with_mtime = Vec::new();
        for c in &cands {
            if let Ok(meta) = tokio::fs::metadata(&c.path).await {
                if meta.len() > 0 {
                    let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                    with_mtime.push((mtime, c.path.clone(), c.source));
                }
            }
        }
        with_mtime.sort_by_key(|(mtime, _, _)| *mtime);
        with_mtime.into_iter().map(|(_, p, s)| (p, s)).collect()
    }

    /// Read the whole resolved log once (used by one-shot `tail` without
    /// `--follow`). Returns an empty string, not an error, for a present
    /// but empty file.
    pub async fn read_once(&self, id: &SessionId) -> Result<Option<String>> {
        let Some(path) = self.resolve(id).await else {
            return Ok(None);
        };
        Ok(Some(tokio::fs::read_to_string(&path).await?))
    }

    /// Poll the resolved log at `interval` (clamped to ≥1s) and forward new
    /// bytes to `tx` as they appear. Returns once `stop` resolves to
    /// `true` on a poll tick. If the primary candidate disappears mid-tail
    /// (e.g. log rotation), re-resolves from scratch and restarts the
    /// offset at 0.
    pub async fn follow<F>(&self, id: &SessionId, interval: Duration, tx: mpsc::Sender<TailChunk>, mut stop: F)
    where
        F: FnMut() -> bool,
    {
        let interval = interval.max(MIN_POLL_INTERVAL);
        let mut current_path = self.resolve(id).await;
        let mut offset: u64 = 0;

        loop {
            if stop() {
                return;
            }

            match &current_path {
                Some(path) if exists(path).await => {
                    if let Ok(meta) = tokio::fs::metadata(path).await {
                        if meta.len() > offset {
                            if let Ok(mut file) = tokio::fs::File::open(path).await {
                                if file.seek(std::io::SeekFrom::Start(offset)).await.is_ok() {
                                    let mut buf = Vec::new();
                                    if file.read_to_end(&mut buf).await.is_ok() {
                                        offset += buf.len() as u64;
                                        let text = String::from_utf8_lossy(&buf).to_string();
                                        if tx.send(TailChunk { source: "session-log", text }).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                _ => {
                    current_path = self.resolve(id).await;
                    offset = 0;
                }
            }

            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn resolve_prefers_first_existing_nonempty_candidate() {
        let dir = TempDir::new().unwrap();
        let id = SessionId::from_string("afk-1".to_string());
        let tailer = LogTailer::new(dir.path().to_path_buf());

        let worker_log = paths::registry_dir(dir.path()).join(id.as_str()).join("worker.log");
        tokio::fs::create_dir_all(worker_log.parent().unwrap()).await.unwrap();
        tokio::fs::write(&worker_log, "hello").await.unwrap();

        let resolved = tailer.resolve(&id).await.unwrap();
        assert_eq!(resolved, worker_log);
    }

    #[tokio::test]
    async fn resolve_falls_back_to_empty_present_file() {
        let dir = TempDir::new().unwrap();
        let id = SessionId::from_string("afk-2".to_string());
        let tailer = LogTailer::new(dir.path().to_path_buf());

        let log_path = paths::log_path(dir.path(), &id);
        tokio::fs::create_dir_all(log_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&log_path, "").await.unwrap();

        let resolved = tailer.resolve(&id).await.unwrap();
        assert_eq!(resolved, log_path);

        let content = tailer.read_once(&id).await.unwrap().unwrap();
        assert_eq!(content, "");
    }

    #[tokio::test]
    async fn resolve_returns_none_when_no_candidate_exists() {
        let dir = TempDir::new().unwrap();
        let id = SessionId::from_string("afk-missing".to_string());
        let tailer = LogTailer::new(dir.path().to_path_buf());
        assert!(tailer.resolve(&id).await.is_none());
    }

    #[tokio::test]
    async fn higher_priority_candidate_wins_over_lower() {
        let dir = TempDir::new().unwrap();
        let id = SessionId::from_string("afk-3".to_string());
        let tailer = LogTailer::new(dir.path().to_path_buf());

        let primary = paths::log_path(dir.path(), &id);
        tokio::fs::create_dir_all(primary.parent().unwrap()).await.unwrap();
        tokio::fs::write(&primary, "primary").await.unwrap();

        let worker_log = paths::registry_dir(dir.path()).join(id.as_str()).join("worker.log");
        tokio::fs::create_dir_all(worker_log.parent().unwrap()).await.unwrap();
        tokio::fs::write(&worker_log, "worker").await.unwrap();

        let resolved = tailer.resolve(&id).await.unwrap();
        assert_eq!(resolved, primary);
    }
}
