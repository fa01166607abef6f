//! Progress Tracker: per-session structured record of iterations,
//! persisted as a sidecar document after every mutation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::session::persistence::{read_json, write_json_atomic};
use crate::session::{IterationRecord, IterationStatus};
use crate::Result;

/// The progress sidecar document: an ordered sequence of iterations plus
/// any milestones the assistant reported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressDocument {
    pub iterations: Vec<IterationRecord>,
    #[serde(default)]
    pub milestones: Vec<String>,
}

/// Outcome passed to `complete_iteration`.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub summary: String,
}

pub struct ProgressTracker {
    path: PathBuf,
    doc: ProgressDocument,
    /// Stdout chunks observed for the current running iteration. Not
    /// persisted on its own — folded into `actions` at `complete_iteration`
    /// so a chunk arriving doesn't force a sidecar write on every read.
    current_chunk_count: u32,
}

impl ProgressTracker {
    /// Load an existing sidecar or start a fresh one.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let doc = read_json(&path).await?.unwrap_or_default();
        Ok(Self { path, doc, current_chunk_count: 0 })
    }

    pub fn document(&self) -> &ProgressDocument {
        &self.doc
    }

    /// Per-chunk feed from the Iteration Runner's stdout consumer. Counts
    /// the chunk against the current iteration without touching disk; the
    /// count is folded into `actions` once the iteration completes.
    pub fn observe_chunk(&mut self, _chunk: &str) {
        self.current_chunk_count += 1;
    }

    /// Append a new running iteration and persist.
    pub async fn start_iteration(&mut self, number: u32, goal: &str) -> Result<()> {
        self.current_chunk_count = 0;
        self.doc.iterations.push(IterationRecord {
            number,
            goal: goal.to_string(),
            start: chrono::Utc::now().timestamp_millis(),
            end: None,
            status: IterationStatus::Running,
            actions: Vec::new(),
            achievements: Vec::new(),
            challenges: Vec::new(),
            next_steps: Vec::new(),
            duration_sec: None,
        });
        self.save().await
    }

    /// Stamp the most recent iteration as complete and persist.
    pub async fn complete_iteration(&mut self, outcome: IterationOutcome) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(record) = self.doc.iterations.last_mut() {
            record.end = Some(now);
            record.duration_sec = Some((now - record.start) as f64 / 1000.0);
            record.status = if outcome.success {
                IterationStatus::Completed
            } else {
                IterationStatus::Failed
            };
            record.achievements.push(outcome.summary);
            if let Some(code) = outcome.exit_code {
                record.actions.push(format!("exited with code {code}"));
            }
            if self.current_chunk_count > 0 {
                record
                    .actions
                    .push(format!("observed {} stdout chunks", self.current_chunk_count));
            }
        }
        self.current_chunk_count = 0;
        self.save().await
    }

    /// Mark the most recent running iteration as stopped (user-initiated).
    pub async fn stop_current_iteration(&mut self) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(record) = self.doc.iterations.last_mut() {
            if record.status == IterationStatus::Running {
                record.end = Some(now);
                record.duration_sec = Some((now - record.start) as f64 / 1000.0);
                record.status = IterationStatus::Stopped;
            }
        }
        self.save().await
    }

    pub async fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.doc).await
    }

    /// Most recent write timestamp to this sidecar, used by the Reconciler
    /// as a liveness heartbeat alongside the Context Monitor's log mtime.
    pub async fn last_activity(&self) -> Option<std::time::SystemTime> {
        tokio::fs::metadata(&self.path).await.ok()?.modified().ok()
    }

    /// Reap stale sidecars under `sessions_dir` older than `older_than_days`.
    pub async fn cleanup(sessions_dir: &std::path::Path, older_than_days: i64) -> Result<u64> {
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs((older_than_days.max(0) as u64) * 86_400);
        let mut removed = 0u64;
        let mut entries = match tokio::fs::read_dir(sessions_dir).await {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };
        while let Some(entry) = entries.next_entry().await? {
            let progress_file = entry.path().join("progress.json");
            if let Ok(meta) = tokio::fs::metadata(&progress_file).await {
                if let Ok(modified) = meta.modified() {
                    if modified < cutoff {
                        let _ = tokio::fs::remove_dir_all(entry.path()).await;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn start_then_complete_iteration_persists_and_stamps_duration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        let mut tracker = ProgressTracker::load(path.clone()).await.unwrap();

        tracker.start_iteration(1, "implement feature").await.unwrap();
        assert_eq!(tracker.document().iterations.len(), 1);
        assert_eq!(tracker.document().iterations[0].status, IterationStatus::Running);

        tracker
            .complete_iteration(IterationOutcome {
                success: true,
                exit_code: Some(0),
                summary: "done".to_string(),
            })
            .await
            .unwrap();

        let record = &tracker.document().iterations[0];
        assert_eq!(record.status, IterationStatus::Completed);
        assert!(record.duration_sec.is_some());
        assert!(record.end.is_some());

        let reloaded = ProgressTracker::load(path).await.unwrap();
        assert_eq!(reloaded.document().iterations.len(), 1);
    }

    #[tokio::test]
    async fn stop_current_iteration_only_affects_running_iteration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        let mut tracker = ProgressTracker::load(path).await.unwrap();
        tracker.start_iteration(1, "goal").await.unwrap();
        tracker
            .complete_iteration(IterationOutcome {
                success: true,
                exit_code: Some(0),
                summary: "ok".to_string(),
            })
            .await
            .unwrap();
        tracker.start_iteration(2, "goal 2").await.unwrap();
        tracker.stop_current_iteration().await.unwrap();

        assert_eq!(tracker.document().iterations[0].status, IterationStatus::Completed);
        assert_eq!(tracker.document().iterations[1].status, IterationStatus::Stopped);
    }

    #[tokio::test]
    async fn cleanup_leaves_fresh_sidecars_alone() {
        let dir = TempDir::new().unwrap();
        let fresh = dir.path().join("afk-fresh");
        tokio::fs::create_dir_all(&fresh).await.unwrap();
        tokio::fs::write(fresh.join("progress.json"), "{}").await.unwrap();

        let removed = ProgressTracker::cleanup(dir.path(), 7).await.unwrap();
        assert_eq!(removed, 0);
        assert!(fresh.join("progress.json").exists());
    }

    #[tokio::test]
    async fn cleanup_removes_sidecars_older_than_cutoff() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("afk-old");
        tokio::fs::create_dir_all(&stale).await.unwrap();
        tokio::fs::write(stale.join("progress.json"), "{}").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let removed = ProgressTracker::cleanup(dir.path(), -1).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!stale.exists());
    }
}
