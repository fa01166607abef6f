//! Context Monitor: per-session event log and report of context/compact
//! events. The monitor's log file mtime is the liveness heartbeat the
//! Reconciler consults for sessions without a live pid.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::classifier;
use crate::session::{ContextEvent, ContextEventKind};
use crate::Result;

const RING_CAPACITY: usize = 256;

/// Aggregated summary written by `generate_report`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextReport {
    pub total_events: usize,
    pub context_limit_count: usize,
    pub compact_suggestion_count: usize,
    pub compact_attempt_count: usize,
    pub compact_success_count: usize,
    pub compact_failure_count: usize,
    /// Mean milliseconds between consecutive `context_limit` events.
    pub context_limit_mean_interarrival_ms: Option<f64>,
    pub compact_success_rate: Option<f64>,
}

/// Per-session context event log plus the derived report.
pub struct ContextMonitor {
    events_path: PathBuf,
    report_path: PathBuf,
    ring: VecDeque<ContextEvent>,
}

impl ContextMonitor {
    pub fn new(events_path: PathBuf, report_path: PathBuf) -> Self {
        Self {
            events_path,
            report_path,
            ring: VecDeque::with_capacity(RING_CAPACITY),
        }
    }

    /// Append an event to the in-memory ring and the on-disk JSON-lines log.
    pub async fn log_event(&mut self, kind: ContextEventKind, payload: serde_json::Value) -> Result<()> {
        let event = ContextEvent {
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
            payload,
        };

        if self.ring.len() == RING_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(event.clone());

        if let Some(parent) = self.events_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await?;
        let line = serde_json::to_string(&event)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// Run the classifier's context/compact patterns over `chunk` and log
    /// any matches. Returns `true` if a context-limit pattern fired.
    pub async fn monitor_output(&mut self, chunk: &str) -> Result<bool> {
        let hits = classifier::classify(chunk);
        let mut saw_context_limit = false;
        for hit in hits {
            match hit.kind {
                classifier::ClassificationKind::ContextLimit => {
                    saw_context_limit = true;
                    self.log_event(
                        ContextEventKind::ContextLimit,
                        serde_json::json!({ "matched": hit.matched, "context": hit.context }),
                    )
                    .await?;
                }
                classifier::ClassificationKind::CompactSuggestion => {
                    self.log_event(
                        ContextEventKind::CompactSuggestion,
                        serde_json::json!({ "matched": hit.matched, "context": hit.context }),
                    )
                    .await?;
                }
                _ => {}
            }
        }
        Ok(saw_context_limit)
    }

    pub async fn log_compact_attempt(
        &mut self,
        method: &str,
        success: bool,
        err: Option<&str>,
    ) -> Result<()> {
        let kind = if success {
            ContextEventKind::CompactAttempt
        } else {
            ContextEventKind::CompactFailure
        };
        self.log_event(
            kind,
            serde_json::json!({ "method": method, "success": success, "error": err }),
        )
        .await
    }

    /// Heartbeat timestamp the Reconciler consults: the log file's mtime.
    pub async fn last_activity(&self) -> Option<std::time::SystemTime> {
        let meta = tokio::fs::metadata(&self.events_path).await.ok()?;
        meta.modified().ok()
    }

    /// Aggregate the in-memory ring into a report and persist it atomically.
    pub async fn generate_report(&self) -> Result<ContextReport> {
        let mut report = ContextReport::default();
        report.total_events = self.ring.len();

        let mut context_limit_timestamps = Vec::new();
        for event in &self.ring {
            match event.kind {
                ContextEventKind::ContextLimit => {
                    report.context_limit_count += 1;
                    context_limit_timestamps.push(event.timestamp);
                }
                ContextEventKind::CompactSuggestion => report.compact_suggestion_count += 1,
                ContextEventKind::CompactAttempt => {
                    report.compact_attempt_count += 1;
                    report.compact_success_count += 1;
                }
                ContextEventKind::CompactFailure => {
                    report.compact_attempt_count += 1;
                    report.compact_failure_count += 1;
                }
                ContextEventKind::IterationStart | ContextEventKind::IterationEnd => {}
            }
        }

        if context_limit_timestamps.len() >= 2 {
            let mut diffs = Vec::new();
            for w in context_limit_timestamps.windows(2) {
                diffs.push((w[1] - w[0]) as f64);
            }
            report.context_limit_mean_interarrival_ms =
                Some(diffs.iter().sum::<f64>() / diffs.len() as f64);
        }

        if report.compact_attempt_count > 0 {
            report.compact_success_rate =
                Some(report.compact_success_count as f64 / report.compact_attempt_count as f64);
        }

        crate::session::persistence::write_json_atomic(&self.report_path, &report).await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn monitor(dir: &TempDir) -> ContextMonitor {
        ContextMonitor::new(
            dir.path().join("context-events.jsonl"),
            dir.path().join("context-report.json"),
        )
    }

    #[tokio::test]
    async fn monitor_output_detects_context_limit() {
        let dir = TempDir::new().unwrap();
        let mut m = monitor(&dir);
        let hit = m.monitor_output("Prompt is too long").await.unwrap();
        assert!(hit);
    }

    #[tokio::test]
    async fn monitor_output_on_plain_text_does_not_fire() {
        let dir = TempDir::new().unwrap();
        let mut m = monitor(&dir);
        let hit = m.monitor_output("everything looks fine").await.unwrap();
        assert!(!hit);
    }

    #[tokio::test]
    async fn log_event_appends_json_lines() {
        let dir = TempDir::new().unwrap();
        let mut m = monitor(&dir);
        m.log_event(ContextEventKind::IterationStart, serde_json::json!({"n": 1}))
            .await
            .unwrap();
        m.log_event(ContextEventKind::IterationEnd, serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let contents = tokio::fs::read_to_string(dir.path().join("context-events.jsonl"))
            .await
            .unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn generate_report_computes_compact_success_rate() {
        let dir = TempDir::new().unwrap();
        let mut m = monitor(&dir);
        m.log_compact_attempt("/compact\\n", true, None).await.unwrap();
        m.log_compact_attempt("\\ncompact\\n", false, Some("stdin closed"))
            .await
            .unwrap();
        let report = m.generate_report().await.unwrap();
        assert_eq!(report.compact_attempt_count, 2);
        assert_eq!(report.compact_success_rate, Some(0.5));
    }

    #[tokio::test]
    async fn generate_report_persists_to_disk() {
        let dir = TempDir::new().unwrap();
        let m = monitor(&dir);
        m.generate_report().await.unwrap();
        assert!(dir.path().join("context-report.json").exists());
    }
}
