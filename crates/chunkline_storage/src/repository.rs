use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chunkline_contract::{ChunkStatus, SessionStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{timestamp, OpenedSession, SessionRecord, SessionStore};

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

const SESSION_COLUMNS: &str = "session_id, filename, total_size, total_chunks, status, final_hash, failure_reason, created_at, updated_at";

const OPEN_SESSION_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct ChunklineStorage {
    pool: SqlitePool,
}

impl ChunklineStorage {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let uri = normalize_sqlite_uri(&config.sqlite_path);
        let options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {}", uri))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }
        info!("chunkline sqlite schema ready");
        Ok(())
    }

    async fn find_live_session(
        &self,
        filename: &str,
        total_size: i64,
    ) -> Result<Option<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE filename = ? AND total_size = ? AND status = ?"
        ))
        .bind(filename)
        .bind(total_size)
        .bind(SessionStatus::Uploading.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query live session for {filename}"))
    }
}

#[async_trait]
impl SessionStore for ChunklineStorage {
    async fn open_session(
        &self,
        filename: &str,
        total_size: u64,
        total_chunks: u64,
    ) -> Result<OpenedSession> {
        let total_size = i64::try_from(total_size).context("total size exceeds i64")?;
        let total_chunks = i64::try_from(total_chunks).context("chunk count exceeds i64")?;

        for _ in 0..OPEN_SESSION_ATTEMPTS {
            let now = timestamp(Utc::now());
            let session_id = Uuid::now_v7().to_string();

            // The partial unique index on (filename, total_size) WHERE status = 'uploading'
            // turns this into insert-if-absent.
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO upload_sessions(session_id, filename, total_size, total_chunks, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&session_id)
            .bind(filename)
            .bind(total_size)
            .bind(total_chunks)
            .bind(SessionStatus::Uploading.as_str())
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await
            .context("insert upload session")?
            .rows_affected()
                == 1;

            if let Some(session) = self.find_live_session(filename, total_size).await? {
                let created = inserted && session.session_id == session_id;
                debug!(session_id = %session.session_id, created, "live upload session resolved");
                return Ok(OpenedSession { session, created });
            }
        }

        bail!("live session for {filename} kept changing state during handshake")
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE session_id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query session {session_id}"))
    }

    async fn upsert_chunk(
        &self,
        session_id: &str,
        chunk_index: u64,
        status: ChunkStatus,
    ) -> Result<()> {
        let chunk_index = i64::try_from(chunk_index).context("chunk index exceeds i64")?;
        let now = timestamp(Utc::now());
        sqlx::query(
            "INSERT INTO upload_chunks(session_id, chunk_index, status, updated_at) VALUES (?, ?, ?, ?) ON CONFLICT(session_id, chunk_index) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at WHERE upload_chunks.status <> 'completed' OR excluded.status = 'completed'",
        )
        .bind(session_id)
        .bind(chunk_index)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert chunk {chunk_index} of {session_id}"))?;
        Ok(())
    }

    async fn completed_chunks(&self, session_id: &str) -> Result<Vec<u64>> {
        let rows = sqlx::query_scalar::<_, i64>(
            "SELECT chunk_index FROM upload_chunks WHERE session_id = ? AND status = ? ORDER BY chunk_index ASC",
        )
        .bind(session_id)
        .bind(ChunkStatus::Completed.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("query completed chunks of {session_id}"))?;

        rows.into_iter()
            .map(|index| u64::try_from(index).context("negative chunk index in store"))
            .collect()
    }

    async fn count_completed_chunks(&self, session_id: &str) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM upload_chunks WHERE session_id = ? AND status = ?",
        )
        .bind(session_id)
        .bind(ChunkStatus::Completed.as_str())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("count completed chunks of {session_id}"))?;

        u64::try_from(count).context("negative chunk count")
    }

    async fn transition_status(
        &self,
        session_id: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = ?, updated_at = ? WHERE session_id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(now)
        .bind(session_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("transition {session_id} from {from} to {to}"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_session(&self, session_id: &str, final_hash: &str) -> Result<bool> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = ?, final_hash = ?, updated_at = ? WHERE session_id = ? AND status = ?",
        )
        .bind(SessionStatus::Completed.as_str())
        .bind(final_hash)
        .bind(now)
        .bind(session_id)
        .bind(SessionStatus::Processing.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("complete session {session_id}"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_session(&self, session_id: &str, reason: &str) -> Result<bool> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = ?, failure_reason = ?, updated_at = ? WHERE session_id = ? AND status = ?",
        )
        .bind(SessionStatus::Failed.as_str())
        .bind(reason)
        .bind(now)
        .bind(session_id)
        .bind(SessionStatus::Processing.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("fail session {session_id}"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_orphans(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE status = ? AND created_at < ? ORDER BY created_at ASC"
        ))
        .bind(SessionStatus::Uploading.as_str())
        .bind(timestamp(cutoff))
        .fetch_all(&self.pool)
        .await
        .context("query orphaned sessions")
    }

    async fn delete_orphan(&self, session_id: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("begin orphan delete for {session_id}"))?;

        sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("delete chunks of {session_id}"))?;

        let deleted = sqlx::query(
            "DELETE FROM upload_sessions WHERE session_id = ? AND status = ? AND created_at < ?",
        )
        .bind(session_id)
        .bind(SessionStatus::Uploading.as_str())
        .bind(timestamp(cutoff))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("delete session {session_id}"))?
        .rows_affected();

        if deleted == 0 {
            tx.rollback()
                .await
                .with_context(|| format!("rollback orphan delete for {session_id}"))?;
            return Ok(false);
        }

        tx.commit()
            .await
            .with_context(|| format!("commit orphan delete for {session_id}"))?;
        Ok(true)
    }
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
