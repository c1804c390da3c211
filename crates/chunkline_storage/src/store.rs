use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use chunkline_contract::{ChunkStatus, SessionStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    pub session_id: String,
    pub filename: String,
    pub total_size: i64,
    pub total_chunks: i64,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub final_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SessionRecord {
    pub fn total_size(&self) -> u64 {
        u64::try_from(self.total_size).unwrap_or_default()
    }

    pub fn total_chunks(&self) -> u64 {
        u64::try_from(self.total_chunks).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct OpenedSession {
    pub session: SessionRecord,
    pub created: bool,
}

/// Race-deciding methods must each be a single conditional write.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn open_session(
        &self,
        filename: &str,
        total_size: u64,
        total_chunks: u64,
    ) -> Result<OpenedSession>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// A `completed` chunk never moves back to `uploading`.
    async fn upsert_chunk(
        &self,
        session_id: &str,
        chunk_index: u64,
        status: ChunkStatus,
    ) -> Result<()>;

    async fn completed_chunks(&self, session_id: &str) -> Result<Vec<u64>>;

    async fn count_completed_chunks(&self, session_id: &str) -> Result<u64>;

    async fn transition_status(
        &self,
        session_id: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool>;

    async fn complete_session(&self, session_id: &str, final_hash: &str) -> Result<bool>;

    async fn fail_session(&self, session_id: &str, reason: &str) -> Result<bool>;

    async fn list_orphans(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionRecord>>;

    async fn delete_orphan(&self, session_id: &str, cutoff: DateTime<Utc>) -> Result<bool>;
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
