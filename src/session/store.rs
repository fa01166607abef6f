//! The Session Store: durable, indexed, multi-process-safe persistence for
//! `Session` rows, backed by SQLite through `sqlx` as the single-writer
//! embedded relational store for a data root shared by the CLI process and
//! any detached worker processes.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::model::{Session, SessionId, SessionMetadata, SessionStatus, SessionType};
use crate::{Error, Result};

/// Aggregate counts returned by `stats()`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SessionStats {
    pub total: u64,
    pub running: u64,
    pub completed: u64,
    pub error: u64,
    pub stopped: u64,
    pub failed: u64,
    pub pending: u64,
}

/// The result of `allWithChecksum`: consumers diff the checksum to skip
/// redraws when nothing changed.
#[derive(Debug, Clone)]
pub struct SessionsWithChecksum {
    pub sessions: Vec<Session>,
    pub checksum: String,
}

/// Patch applied by `update`. `None` means "leave unchanged".
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub pid: Option<Option<u32>>,
    pub iterations_completed: Option<u32>,
    pub current_iteration: Option<u32>,
    pub completed_at: Option<Option<i64>>,
    pub ended_at: Option<Option<i64>>,
    pub exit_code: Option<Option<i32>>,
    pub error: Option<Option<String>>,
    pub metadata: Option<SessionMetadata>,
}

/// Durable persistence for sessions. All operations must be safe to call
/// concurrently from multiple Supervisors in different processes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<Session>;
    async fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<bool>;
    async fn get(&self, id: &SessionId) -> Result<Option<Session>>;
    async fn find_by_partial_id(&self, prefix: &str) -> Result<Option<Session>>;
    async fn all(&self) -> Result<Vec<Session>>;
    async fn by_status(&self, status: SessionStatus) -> Result<Vec<Session>>;
    async fn active(&self) -> Result<Vec<Session>>;
    async fn recent(&self, limit: u32) -> Result<Vec<Session>>;
    async fn search(&self, substring: &str) -> Result<Vec<Session>>;
    async fn since(&self, ts: i64) -> Result<Vec<Session>>;
    async fn all_with_checksum(&self) -> Result<SessionsWithChecksum>;
    async fn delete(&self, id: &SessionId) -> Result<bool>;
    async fn cleanup_terminated(&self, older_than_days: i64) -> Result<u64>;
    async fn stats(&self) -> Result<SessionStats>;
}

/// SQLite-backed implementation. WAL journal mode and a ≥30s busy timeout
/// are set once at connect time so worker and UI processes can open the
/// same file concurrently without spurious `SQLITE_BUSY` errors.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Resource(format!("cannot create data directory: {e}")))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(Error::Database)?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(Error::Database)?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await.map_err(Error::Database)?;
        sqlx::query("PRAGMA busy_timeout=30000").execute(&pool).await.map_err(Error::Database)?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(Error::Database)?;
        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                task TEXT NOT NULL,
                status TEXT NOT NULL,
                pid INTEGER,
                iterations_planned INTEGER NOT NULL,
                iterations_completed INTEGER NOT NULL,
                current_iteration INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER,
                ended_at INTEGER,
                exit_code INTEGER,
                error TEXT,
                working_directory TEXT NOT NULL,
                model TEXT,
                metadata TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_type ON sessions(type)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_started_at ON sessions(started_at)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await.map_err(Error::Database)?;
        }

        tracing::debug!("session store schema ready");
        Ok(())
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
        let kind_str: String = row.try_get("type").map_err(Error::Database)?;
        let status_str: String = row.try_get("status").map_err(Error::Database)?;
        let metadata_str: String = row.try_get("metadata").map_err(Error::Database)?;

        Ok(Session {
            id: SessionId::from_string(row.try_get("id").map_err(Error::Database)?),
            kind: if kind_str == "afk" {
                SessionType::Afk
            } else {
                SessionType::Afk
            },
            task: row.try_get("task").map_err(Error::Database)?,
            status: status_str.parse()?,
            pid: row
                .try_get::<Option<i64>, _>("pid")
                .map_err(Error::Database)?
                .map(|v| v as u32),
            iterations_planned: row
                .try_get::<i64, _>("iterations_planned")
                .map_err(Error::Database)? as u32,
            iterations_completed: row
                .try_get::<i64, _>("iterations_completed")
                .map_err(Error::Database)? as u32,
            current_iteration: row
                .try_get::<i64, _>("current_iteration")
                .map_err(Error::Database)? as u32,
            started_at: row.try_get("started_at").map_err(Error::Database)?,
            updated_at: row.try_get("updated_at").map_err(Error::Database)?,
            completed_at: row.try_get("completed_at").map_err(Error::Database)?,
            ended_at: row.try_get("ended_at").map_err(Error::Database)?,
            exit_code: row
                .try_get::<Option<i64>, _>("exit_code")
                .map_err(Error::Database)?
                .map(|v| v as i32),
            error: row.try_get("error").map_err(Error::Database)?,
            working_directory: row.try_get("working_directory").map_err(Error::Database)?,
            model: row.try_get("model").map_err(Error::Database)?,
            metadata: serde_json::from_str(&metadata_str)?,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, mut session: Session) -> Result<Session> {
        if session.task.trim().is_empty() {
            return Err(Error::Validation("task must not be empty".to_string()));
        }
        if session.iterations_planned == 0 {
            return Err(Error::Validation(
                "iterations_planned must be positive".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp_millis();
        session.started_at = now;
        session.updated_at = now;

        let metadata_json = serde_json::to_string(&session.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, type, task, status, pid, iterations_planned, iterations_completed,
                current_iteration, started_at, updated_at, completed_at, ended_at,
                exit_code, error, working_directory, model, metadata
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(session.id.as_str())
        .bind(session.kind.to_string())
        .bind(&session.task)
        .bind(session.status.as_str())
        .bind(session.pid.map(|p| p as i64))
        .bind(session.iterations_planned as i64)
        .bind(session.iterations_completed as i64)
        .bind(session.current_iteration as i64)
        .bind(session.started_at)
        .bind(session.updated_at)
        .bind(session.completed_at)
        .bind(session.ended_at)
        .bind(session.exit_code.map(|c| c as i64))
        .bind(&session.error)
        .bind(&session.working_directory)
        .bind(&session.model)
        .bind(metadata_json)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(session)
    }

    async fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<bool> {
        let Some(mut session) = self.get(id).await? else {
            return Ok(false);
        };

        // Terminal statuses are absorbing: a write attempting to un-terminalize
        // a session is ignored rather than rejected, so a late-arriving stale
        // update can never resurrect an already-finished session.
        if session.status.is_terminal() {
            if let Some(new_status) = patch.status {
                if !new_status.is_terminal() {
                    return self.update(
                        id,
                        SessionPatch {
                            status: None,
                            ..patch
                        },
                    )
                    .await;
                }
            }
        }

        if let Some(status) = patch.status {
            session.status = status;
        }
        if let Some(pid) = patch.pid {
            session.pid = pid;
        }
        if let Some(v) = patch.iterations_completed {
            session.iterations_completed = v;
        }
        if let Some(v) = patch.current_iteration {
            session.current_iteration = v;
        }
        if let Some(v) = patch.completed_at {
            session.completed_at = v;
        }
        if let Some(v) = patch.ended_at {
            session.ended_at = v;
        }
        if let Some(v) = patch.exit_code {
            session.exit_code = v;
        }
        if let Some(v) = patch.error {
            session.error = v;
        }
        if let Some(v) = patch.metadata {
            session.metadata = v;
        }
        session.updated_at = chrono::Utc::now().timestamp_millis();

        let metadata_json = serde_json::to_string(&session.metadata)?;

        let result = sqlx::query(
            r#"
            UPDATE sessions SET
                status=?, pid=?, iterations_completed=?, current_iteration=?,
                updated_at=?, completed_at=?, ended_at=?, exit_code=?, error=?, metadata=?
            WHERE id=?
            "#,
        )
        .bind(session.status.as_str())
        .bind(session.pid.map(|p| p as i64))
        .bind(session.iterations_completed as i64)
        .bind(session.current_iteration as i64)
        .bind(session.updated_at)
        .bind(session.completed_at)
        .bind(session.ended_at)
        .bind(session.exit_code.map(|c| c as i64))
        .bind(&session.error)
        .bind(metadata_json)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn find_by_partial_id(&self, prefix: &str) -> Result<Option<Session>> {
        if let Some(exact) = self.get(&SessionId::from_string(prefix.to_string())).await? {
            return Ok(Some(exact));
        }
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE id LIKE ? ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(format!("{prefix}%"))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.first().map(Self::row_to_session).transpose()
    }

    async fn all(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY started_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE status = ? ORDER BY started_at DESC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn active(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE status IN ('running','starting','created') ORDER BY started_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn recent(&self, limit: u32) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY started_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn search(&self, substring: &str) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE task LIKE ? ORDER BY started_at DESC")
            .bind(format!("%{substring}%"))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn since(&self, ts: i64) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE started_at >= ? ORDER BY started_at DESC")
            .bind(ts)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn all_with_checksum(&self) -> Result<SessionsWithChecksum> {
        let sessions = self.all().await?;
        let checksum = Session::checksum_of(&sessions);
        Ok(SessionsWithChecksum { sessions, checksum })
    }

    async fn delete(&self, id: &SessionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_terminated(&self, older_than_days: i64) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp_millis() - older_than_days * 86_400_000;
        let result = sqlx::query(
            "DELETE FROM sessions WHERE status IN ('completed','error','stopped','failed') AND COALESCE(completed_at, updated_at) < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<SessionStats> {
        let sessions = self.all().await?;
        let mut stats = SessionStats::default();
        stats.total = sessions.len() as u64;
        for s in &sessions {
            match s.status {
                SessionStatus::Running => stats.running += 1,
                SessionStatus::Completed => stats.completed += 1,
                SessionStatus::Error => stats.error += 1,
                SessionStatus::Stopped => stats.stopped += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::Created | SessionStatus::Starting => stats.pending += 1,
            }
        }
        Ok(stats)
    }
}

/// In-memory test double, following this codebase's convention of a
/// `Mutex<HashMap>`-backed implementation for fast unit tests.
#[cfg(test)]
pub struct InMemorySessionStore {
    sessions: std::sync::Mutex<std::collections::HashMap<SessionId, Session>>,
}

#[cfg(test)]
impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, mut session: Session) -> Result<Session> {
        if session.task.trim().is_empty() {
            return Err(Error::Validation("task must not be empty".to_string()));
        }
        if session.iterations_planned == 0 {
            return Err(Error::Validation(
                "iterations_planned must be positive".to_string(),
            ));
        }
        let now = chrono::Utc::now().timestamp_millis();
        session.started_at = now;
        session.updated_at = now;
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<bool> {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(id) else {
            return Ok(false);
        };
        if session.status.is_terminal() {
            if let Some(new_status) = patch.status {
                if !new_status.is_terminal() {
                    // ignore attempt to un-terminalize; apply rest of patch
                    if let Some(pid) = patch.pid {
                        session.pid = pid;
                    }
                    session.updated_at = chrono::Utc::now().timestamp_millis();
                    return Ok(true);
                }
            }
        }
        if let Some(status) = patch.status {
            session.status = status;
        }
        if let Some(pid) = patch.pid {
            session.pid = pid;
        }
        if let Some(v) = patch.iterations_completed {
            session.iterations_completed = v;
        }
        if let Some(v) = patch.current_iteration {
            session.current_iteration = v;
        }
        if let Some(v) = patch.completed_at {
            session.completed_at = v;
        }
        if let Some(v) = patch.ended_at {
            session.ended_at = v;
        }
        if let Some(v) = patch.exit_code {
            session.exit_code = v;
        }
        if let Some(v) = patch.error {
            session.error = v;
        }
        if let Some(v) = patch.metadata {
            session.metadata = v;
        }
        session.updated_at = chrono::Utc::now().timestamp_millis();
        Ok(true)
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>> {
        Ok(self.sessions.lock().unwrap().get(id).cloned())
    }

    async fn find_by_partial_id(&self, prefix: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.lock().unwrap();
        if let Some(exact) = sessions.get(&SessionId::from_string(prefix.to_string())) {
            return Ok(Some(exact.clone()));
        }
        let mut matches: Vec<&Session> = sessions
            .values()
            .filter(|s| s.id.as_str().starts_with(prefix))
            .collect();
        matches.sort_by_key(|s| std::cmp::Reverse(s.updated_at));
        Ok(matches.first().map(|s| (*s).clone()))
    }

    async fn all(&self) -> Result<Vec<Session>> {
        let mut v: Vec<Session> = self.sessions.lock().unwrap().values().cloned().collect();
        v.sort_by_key(|s| std::cmp::Reverse(s.started_at));
        Ok(v)
    }

    async fn by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        Ok(self.all().await?.into_iter().filter(|s| s.status == status).collect())
    }

    async fn active(&self) -> Result<Vec<Session>> {
        Ok(self.all().await?.into_iter().filter(|s| s.status.is_active()).collect())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<Session>> {
        Ok(self.all().await?.into_iter().take(limit as usize).collect())
    }

    async fn search(&self, substring: &str) -> Result<Vec<Session>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|s| s.task.contains(substring))
            .collect())
    }

    async fn since(&self, ts: i64) -> Result<Vec<Session>> {
        Ok(self.all().await?.into_iter().filter(|s| s.started_at >= ts).collect())
    }

    async fn all_with_checksum(&self) -> Result<SessionsWithChecksum> {
        let sessions = self.all().await?;
        let checksum = Session::checksum_of(&sessions);
        Ok(SessionsWithChecksum { sessions, checksum })
    }

    async fn delete(&self, id: &SessionId) -> Result<bool> {
        Ok(self.sessions.lock().unwrap().remove(id).is_some())
    }

    async fn cleanup_terminated(&self, older_than_days: i64) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp_millis() - older_than_days * 86_400_000;
        let mut sessions = self.sessions.lock().unwrap();
        let to_remove: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.status.is_terminal() && s.completed_at.unwrap_or(s.updated_at) < cutoff)
            .map(|s| s.id.clone())
            .collect();
        let n = to_remove.len() as u64;
        for id in to_remove {
            sessions.remove(&id);
        }
        Ok(n)
    }

    async fn stats(&self) -> Result<SessionStats> {
        let sessions = self.all().await?;
        let mut stats = SessionStats {
            total: sessions.len() as u64,
            ..Default::default()
        };
        for s in &sessions {
            match s.status {
                SessionStatus::Running => stats.running += 1,
                SessionStatus::Completed => stats.completed += 1,
                SessionStatus::Error => stats.error += 1,
                SessionStatus::Stopped => stats.stopped += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::Created | SessionStatus::Starting => stats.pending += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(task: &str, iterations: u32) -> Session {
        Session {
            id: SessionId::new(),
            kind: SessionType::Afk,
            task: task.to_string(),
            status: SessionStatus::Running,
            pid: None,
            iterations_planned: iterations,
            iterations_completed: 0,
            current_iteration: 0,
            started_at: 0,
            updated_at: 0,
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
    async fn create_rejects_empty_task() {
        let store = SqliteSessionStore::connect_in_memory().await.unwrap();
        let err = store.create(make_session("", 1)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn create_rejects_zero_iterations() {
        let store = SqliteSessionStore::connect_in_memory().await.unwrap();
        let err = store.create(make_session("t", 0)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = SqliteSessionStore::connect_in_memory().await.unwrap();
        let created = store.create(make_session("do the thing", 5)).await.unwrap();
        let fetched = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.task, "do the thing");
        assert_eq!(fetched.iterations_planned, 5);
        assert_eq!(fetched.started_at, fetched.updated_at);
    }

    #[tokio::test]
    async fn update_advances_updated_at_and_persists_patch() {
        let store = SqliteSessionStore::connect_in_memory().await.unwrap();
        let created = store.create(make_session("t", 3)).await.unwrap();
        let before = created.updated_at;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let touched = store
            .update(
                &created.id,
                SessionPatch {
                    iterations_completed: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(touched);

        let fetched = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.iterations_completed, 1);
        assert!(fetched.updated_at > before);
    }

    #[tokio::test]
    async fn update_on_missing_row_returns_false_not_error() {
        let store = SqliteSessionStore::connect_in_memory().await.unwrap();
        let touched = store
            .update(&SessionId::from_string("afk-missing".into()), SessionPatch::default())
            .await
            .unwrap();
        assert!(!touched);
    }

    #[tokio::test]
    async fn terminal_status_is_absorbing() {
        let store = SqliteSessionStore::connect_in_memory().await.unwrap();
        let created = store.create(make_session("t", 1)).await.unwrap();
        store
            .update(
                &created.id,
                SessionPatch {
                    status: Some(SessionStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Attempt to un-terminalize.
        store
            .update(
                &created.id,
                SessionPatch {
                    status: Some(SessionStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let fetched = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn find_by_partial_id_prefers_most_recent() {
        let store = SqliteSessionStore::connect_in_memory().await.unwrap();
        let a = Session {
            id: SessionId::from_string("afk-000001-aaaaaaaa".into()),
            started_at: 100,
            updated_at: 100,
            ..make_session("a", 1)
        };
        let b = Session {
            id: SessionId::from_string("afk-000001-bbbbbbbb".into()),
            started_at: 200,
            updated_at: 200,
            ..make_session("b", 1)
        };
        store.create(a).await.unwrap();
        store.create(b).await.unwrap();

        let found = store.find_by_partial_id("afk-000001").await.unwrap().unwrap();
        assert_eq!(found.task, "b");
    }

    #[tokio::test]
    async fn cleanup_terminated_only_removes_older_than_cutoff() {
        let store = SqliteSessionStore::connect_in_memory().await.unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        let old = Session {
            status: SessionStatus::Completed,
            completed_at: Some(now - 10 * 86_400_000),
            ..make_session("old", 1)
        };
        let recent = Session {
            status: SessionStatus::Completed,
            completed_at: Some(now - 86_400_000),
            ..make_session("recent", 1)
        };
        store.create(old).await.unwrap();
        store.create(recent).await.unwrap();

        let removed = store.cleanup_terminated(7).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        let store = SqliteSessionStore::connect_in_memory().await.unwrap();
        let created = store.create(make_session("t", 1)).await.unwrap();
        assert!(store.delete(&created.id).await.unwrap());
        assert!(store.get(&created.id).await.unwrap().is_none());
        assert!(!store.delete(&created.id).await.unwrap());
    }

    #[tokio::test]
    async fn checksum_changes_when_row_updates() {
        let store = SqliteSessionStore::connect_in_memory().await.unwrap();
        let created = store.create(make_session("t", 3)).await.unwrap();
        let first = store.all_with_checksum().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .update(
                &created.id,
                SessionPatch {
                    iterations_completed: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let second = store.all_with_checksum().await.unwrap();
        assert_ne!(first.checksum, second.checksum);
    }
}
