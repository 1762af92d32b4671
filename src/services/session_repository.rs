//! Durable mirror of upload sessions.
//!
//! One record per session, keyed by `upload_id`. Records are created once,
//! rewritten in place on every mutation, and deleted on cleanup. An update to
//! a record that no longer exists reports `NotFound` instead of recreating it,
//! so a destroyed session can never come back through a late write.

use crate::models::upload_session::{UploadSession, UploadSessionRow};
use crate::services::upload_service::{UploadError, UploadResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::debug;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const SESSION_COLUMNS: &str = "upload_id, owner_id, resume_token, total_size, chunk_size, \
     total_chunks, uploaded_chunks, chunk_digests, started_at, last_activity_at, finalized_at";

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Store a brand new session.
    async fn insert(&self, session: &UploadSession) -> UploadResult<()>;

    /// Overwrite an existing session. `NotFound` if it was deleted.
    async fn update(&self, session: &UploadSession) -> UploadResult<()>;

    async fn load(&self, upload_id: &str) -> UploadResult<Option<UploadSession>>;

    async fn load_by_token(&self, resume_token: &str) -> UploadResult<Option<UploadSession>>;

    /// Delete a session record. Deleting a missing record is not an error.
    async fn delete(&self, upload_id: &str) -> UploadResult<()>;

    /// Every stored session, oldest first.
    async fn list(&self) -> UploadResult<Vec<UploadSession>>;

    /// Cheap connectivity check for readiness.
    async fn ping(&self) -> UploadResult<()>;

    /// Ids of sessions with no activity since `cutoff`.
    async fn inactive_since(&self, cutoff: DateTime<Utc>) -> UploadResult<Vec<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|session| session.last_activity_at < cutoff)
            .map(|session| session.upload_id)
            .collect())
    }
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(db: &SqlitePool) -> UploadResult<()> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    debug!("Running {} migration statements", statements.len());

    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// Session records stored in the `upload_sessions` SQLite table.
#[derive(Clone)]
pub struct SqliteSessionRepository {
    db: Arc<SqlitePool>,
}

impl SqliteSessionRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn insert(&self, session: &UploadSession) -> UploadResult<()> {
        let row = UploadSessionRow::from_session(session)?;
        sqlx::query(
            "INSERT INTO upload_sessions (
                upload_id, owner_id, resume_token, total_size, chunk_size, total_chunks,
                uploaded_chunks, chunk_digests, started_at, last_activity_at, finalized_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.upload_id)
        .bind(&row.owner_id)
        .bind(&row.resume_token)
        .bind(row.total_size)
        .bind(row.chunk_size)
        .bind(row.total_chunks)
        .bind(&row.uploaded_chunks)
        .bind(&row.chunk_digests)
        .bind(row.started_at)
        .bind(row.last_activity_at)
        .bind(row.finalized_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn update(&self, session: &UploadSession) -> UploadResult<()> {
        let row = UploadSessionRow::from_session(session)?;
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET uploaded_chunks = ?, chunk_digests = ?, last_activity_at = ?, finalized_at = ?
             WHERE upload_id = ?",
        )
        .bind(&row.uploaded_chunks)
        .bind(&row.chunk_digests)
        .bind(row.last_activity_at)
        .bind(row.finalized_at)
        .bind(&row.upload_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::NotFound(session.upload_id.clone()));
        }
        Ok(())
    }

    async fn load(&self, upload_id: &str) -> UploadResult<Option<UploadSession>> {
        let row = sqlx::query_as::<_, UploadSessionRow>(&format!(
            "SELECT {} FROM upload_sessions WHERE upload_id = ?",
            SESSION_COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(UploadSessionRow::into_session).transpose()?)
    }

    async fn load_by_token(&self, resume_token: &str) -> UploadResult<Option<UploadSession>> {
        let row = sqlx::query_as::<_, UploadSessionRow>(&format!(
            "SELECT {} FROM upload_sessions WHERE resume_token = ?",
            SESSION_COLUMNS
        ))
        .bind(resume_token)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(UploadSessionRow::into_session).transpose()?)
    }

    async fn delete(&self, upload_id: &str) -> UploadResult<()> {
        sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn list(&self) -> UploadResult<Vec<UploadSession>> {
        let rows = sqlx::query_as::<_, UploadSessionRow>(&format!(
            "SELECT {} FROM upload_sessions ORDER BY started_at ASC",
            SESSION_COLUMNS
        ))
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter()
            .map(|row| row.into_session().map_err(UploadError::from))
            .collect()
    }

    async fn ping(&self) -> UploadResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// Process-local repository for running without a database file. Sessions
/// do not survive a restart.
#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: RwLock<HashMap<String, UploadSession>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn insert(&self, session: &UploadSession) -> UploadResult<()> {
        let mut sessions = self.sessions.write().await;
        let token_taken = sessions
            .values()
            .any(|existing| existing.resume_token == session.resume_token);
        if token_taken || sessions.contains_key(&session.upload_id) {
            return Err(UploadError::Validation(format!(
                "upload `{}` already exists",
                session.upload_id
            )));
        }
        sessions.insert(session.upload_id.clone(), session.clone());
        Ok(())
    }

    async fn update(&self, session: &UploadSession) -> UploadResult<()> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.upload_id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(UploadError::NotFound(session.upload_id.clone())),
        }
    }

    async fn load(&self, upload_id: &str) -> UploadResult<Option<UploadSession>> {
        Ok(self.sessions.read().await.get(upload_id).cloned())
    }

    async fn load_by_token(&self, resume_token: &str) -> UploadResult<Option<UploadSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|session| session.resume_token == resume_token)
            .cloned())
    }

    async fn delete(&self, upload_id: &str) -> UploadResult<()> {
        self.sessions.write().await.remove(upload_id);
        Ok(())
    }

    async fn list(&self) -> UploadResult<Vec<UploadSession>> {
        let mut sessions: Vec<UploadSession> =
            self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|session| session.started_at);
        Ok(sessions)
    }

    async fn ping(&self) -> UploadResult<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Single-connection in-memory database with the schema applied.
    pub(crate) async fn memory_pool() -> Arc<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        Arc::new(pool)
    }

    fn session(id: &str, token: &str) -> UploadSession {
        UploadSession::new(
            id.into(),
            "owner-1".into(),
            token.into(),
            25,
            10,
            3,
            Utc::now(),
        )
    }

    async fn exercise(repo: &dyn SessionRepository) {
        let mut s = session("a1", "tok-a1");
        repo.insert(&s).await.unwrap();
        assert!(repo.insert(&s).await.is_err());

        s.record_chunk(2, Some("d41d8cd98f00b204e9800998ecf8427e".into()), Utc::now());
        s.record_chunk(0, None, Utc::now());
        repo.update(&s).await.unwrap();

        let loaded = repo.load("a1").await.unwrap().unwrap();
        assert_eq!(loaded.uploaded_chunks, s.uploaded_chunks);
        assert_eq!(loaded.chunk_digests, s.chunk_digests);
        assert_eq!(loaded.total_chunks, 3);

        let by_token = repo.load_by_token("tok-a1").await.unwrap().unwrap();
        assert_eq!(by_token.upload_id, "a1");
        assert!(repo.load_by_token("a1").await.unwrap().is_none());

        repo.delete("a1").await.unwrap();
        repo.delete("a1").await.unwrap();
        assert!(repo.load("a1").await.unwrap().is_none());
        assert!(matches!(
            repo.update(&s).await.unwrap_err(),
            UploadError::NotFound(_)
        ));
        assert!(repo.load("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_repository_round_trips_sessions() {
        let repo = SqliteSessionRepository::new(memory_pool().await);
        exercise(&repo).await;
        repo.ping().await.unwrap();
    }

    #[tokio::test]
    async fn memory_repository_matches_sqlite_semantics() {
        exercise(&MemorySessionRepository::new()).await;
    }

    #[tokio::test]
    async fn inactive_since_filters_by_last_activity() {
        let repo = SqliteSessionRepository::new(memory_pool().await);
        let mut stale = session("stale", "tok-stale");
        stale.last_activity_at = Utc::now() - Duration::hours(30);
        let fresh = session("fresh", "tok-fresh");
        repo.insert(&stale).await.unwrap();
        repo.insert(&fresh).await.unwrap();

        let ids = repo
            .inactive_since(Utc::now() - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(ids, vec!["stale".to_string()]);
        assert_eq!(repo.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
    }
}
