use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use chunkline_contract::{
    ChunkAck, ChunkLayout, ChunkStatus, FinalizeResponse, HandshakeRequest, HandshakeResponse,
    LayoutError, SessionStatus, SessionStatusResponse,
};
use chunkline_storage::{file_digest, ChunkWriter, SessionRecord, SessionStore};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::validation::AssemblyValidator;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upload session not found: {0}")]
    SessionNotFound(String),
    #[error("upload session {session_id} is {status}, not uploading")]
    NotUploading {
        session_id: String,
        status: SessionStatus,
    },
    #[error("finalize failed for {session_id}: {reason}")]
    Integrity { session_id: String, reason: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<LayoutError> for CoordinatorError {
    fn from(err: LayoutError) -> Self {
        CoordinatorError::InvalidRequest(err.to_string())
    }
}

pub struct UploadCoordinator {
    store: Arc<dyn SessionStore>,
    writer: ChunkWriter,
    validator: Arc<dyn AssemblyValidator>,
    chunk_size: u64,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        writer: ChunkWriter,
        validator: Arc<dyn AssemblyValidator>,
        chunk_size: u64,
    ) -> Self {
        Self {
            store,
            writer,
            validator,
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub async fn handshake(
        &self,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, CoordinatorError> {
        validate_filename(&request.filename)?;
        if request.total_size == 0 {
            return Err(CoordinatorError::InvalidRequest(
                "total size must be greater than zero".to_string(),
            ));
        }
        if i64::try_from(request.total_size).is_err() {
            return Err(CoordinatorError::InvalidRequest(format!(
                "total size {} exceeds {}",
                request.total_size,
                i64::MAX
            )));
        }
        let layout = ChunkLayout::new(request.total_size, self.chunk_size)?;
        layout.check_declared_chunks(request.total_chunks)?;

        let opened = self
            .store
            .open_session(&request.filename, request.total_size, request.total_chunks)
            .await?;
        let session_id = opened.session.session_id;
        let existing_chunks = self.store.completed_chunks(&session_id).await?;

        info!(
            session_id = %session_id,
            filename = %request.filename,
            created = opened.created,
            resumed_chunks = existing_chunks.len(),
            "upload handshake"
        );

        Ok(HandshakeResponse {
            session_id,
            existing_chunks,
        })
    }

    pub async fn accept_chunk(
        &self,
        session_id: &str,
        chunk_index: u64,
        payload: &[u8],
    ) -> Result<ChunkAck, CoordinatorError> {
        let session = self.require_session(session_id).await?;
        if session.status != SessionStatus::Uploading {
            return Err(CoordinatorError::NotUploading {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }

        let layout = self.layout_for(&session)?;
        let offset = layout.offset(chunk_index)?;
        let expected_len = layout.chunk_len(chunk_index)?;
        if payload.len() as u64 != expected_len {
            return Err(CoordinatorError::InvalidRequest(format!(
                "chunk {chunk_index} must be {expected_len} bytes, got {}",
                payload.len()
            )));
        }

        self.store
            .upsert_chunk(session_id, chunk_index, ChunkStatus::Uploading)
            .await?;
        let bytes_written = self.writer.write_at(session_id, offset, payload).await?;

        // Finalize or cleanup may have claimed the session while we were writing.
        let current = self.store.get_session(session_id).await?.map(|s| s.status);
        if current != Some(SessionStatus::Uploading) {
            if current != Some(SessionStatus::Processing) {
                self.discard_scratch(session_id).await;
            }
            warn!(session_id, chunk_index, status = ?current, "chunk landed after session closed");
            return Err(match current {
                Some(status) => CoordinatorError::NotUploading {
                    session_id: session_id.to_string(),
                    status,
                },
                None => CoordinatorError::SessionNotFound(session_id.to_string()),
            });
        }

        self.store
            .upsert_chunk(session_id, chunk_index, ChunkStatus::Completed)
            .await?;

        Ok(ChunkAck {
            session_id: session_id.to_string(),
            chunk_index,
            bytes_written,
        })
    }

    pub async fn finalize(&self, session_id: &str) -> Result<FinalizeResponse, CoordinatorError> {
        let session = self.require_session(session_id).await?;

        let claimed = self
            .store
            .transition_status(session_id, SessionStatus::Uploading, SessionStatus::Processing)
            .await?;
        if !claimed {
            let current = self.require_session(session_id).await?;
            info!(session_id, status = %current.status, "finalize already claimed");
            return Ok(FinalizeResponse::observed(current.status));
        }

        let result: Result<FinalizeResponse, CoordinatorError> = match self.assemble(&session).await {
            Ok((files, hash)) => match self.store.complete_session(session_id, &hash).await {
                Ok(true) => {
                    info!(session_id, hash = %hash, "upload session completed");
                    Ok(FinalizeResponse::completed(files, hash))
                }
                Ok(false) => Err(anyhow!("session {session_id} left processing during finalize").into()),
                Err(err) => {
                    error!(session_id, error = %err, "failed to record completed session");
                    self.record_failure(session_id, &format!("failed to record completion: {err:#}"))
                        .await;
                    Err(CoordinatorError::Storage(err))
                }
            },
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(session_id, reason = %reason, "finalize failed");
                self.record_failure(session_id, &reason).await;
                Err(CoordinatorError::Integrity {
                    session_id: session_id.to_string(),
                    reason,
                })
            }
        };
        // Late chunk writes can recreate the scratch file while we hold `processing`.
        self.discard_scratch(session_id).await;
        result
    }

    async fn record_failure(&self, session_id: &str, reason: &str) {
        match self.store.fail_session(session_id, reason).await {
            Ok(true) => {}
            Ok(false) => warn!(session_id, "session left processing before it could be failed"),
            Err(err) => error!(
                session_id,
                error = %err,
                "failed to record failed session; it stays processing"
            ),
        }
    }

    async fn discard_scratch(&self, session_id: &str) {
        if let Err(err) = self.writer.remove(session_id).await {
            warn!(session_id, error = %err, "scratch file left behind");
        }
    }

    pub async fn cleanup_orphans(&self, max_age: Duration) -> Result<u64, CoordinatorError> {
        let max_age = chrono::Duration::from_std(max_age).context("orphan age out of range")?;
        let cutoff = Utc::now() - max_age;
        let orphans = self.store.list_orphans(cutoff).await?;

        let mut reclaimed = 0;
        for orphan in orphans {
            match self.store.delete_orphan(&orphan.session_id, cutoff).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(session_id = %orphan.session_id, error = %err, "orphan delete failed");
                    continue;
                }
            }
            reclaimed += 1;

            if let Err(err) = self.writer.remove(&orphan.session_id).await {
                warn!(session_id = %orphan.session_id, error = %err, "scratch file left behind");
            }
            info!(
                session_id = %orphan.session_id,
                filename = %orphan.filename,
                created_at = %orphan.created_at,
                "orphaned upload reclaimed"
            );
        }

        Ok(reclaimed)
    }

    pub async fn status(&self, session_id: &str) -> Result<SessionStatusResponse, CoordinatorError> {
        let session = self.require_session(session_id).await?;
        let completed_chunks = self.store.count_completed_chunks(session_id).await?;
        Ok(SessionStatusResponse {
            total_size: session.total_size(),
            total_chunks: session.total_chunks(),
            session_id: session.session_id,
            filename: session.filename,
            completed_chunks,
            status: session.status,
            final_hash: session.final_hash,
            failure_reason: session.failure_reason,
            created_at: session.created_at,
        })
    }

    async fn assemble(&self, session: &SessionRecord) -> anyhow::Result<(Vec<String>, String)> {
        let session_id = session.session_id.as_str();
        let completed = self.store.count_completed_chunks(session_id).await?;
        if completed != session.total_chunks() {
            bail!(
                "{completed} of {} chunks completed",
                session.total_chunks()
            );
        }

        let path = self.writer.assemble(session_id, &session.filename).await?;

        let validator = Arc::clone(&self.validator);
        let expected_size = session.total_size();
        let check_path = path.clone();
        let files = tokio::task::spawn_blocking(move || validator.validate(&check_path, expected_size))
            .await
            .context("validation task panicked")??;

        let hash = file_digest(&path).await?;
        Ok((files, hash))
    }

    async fn require_session(&self, session_id: &str) -> Result<SessionRecord, CoordinatorError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::SessionNotFound(session_id.to_string()))
    }

    fn layout_for(&self, session: &SessionRecord) -> Result<ChunkLayout, CoordinatorError> {
        Ok(ChunkLayout::new(session.total_size(), self.chunk_size)?)
    }
}

fn validate_filename(filename: &str) -> Result<(), CoordinatorError> {
    let invalid = filename.trim().is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\', '\0']);
    if invalid {
        return Err(CoordinatorError::InvalidRequest(format!(
            "invalid filename {filename:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{CoordinatorError, UploadCoordinator};
    use crate::validation::{AssemblyValidator, SizeValidator, ValidationError};
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use chunkline_contract::{ChunkStatus, HandshakeRequest, SessionStatus};
    use chunkline_storage::{
        timestamp, ChunkWriter, ChunklineStorage, OpenedSession, SessionRecord, SessionStore,
        StorageConfig,
    };
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    const CHUNK: u64 = 5 * 1024;

    struct Harness {
        _dir: TempDir,
        storage: ChunklineStorage,
        writer: ChunkWriter,
        coordinator: Arc<UploadCoordinator>,
    }

    async fn harness_with(validator: Arc<dyn AssemblyValidator>) -> Harness {
        harness_over(validator, |storage| -> Arc<dyn SessionStore> { Arc::new(storage) }).await
    }

    async fn harness_over(
        validator: Arc<dyn AssemblyValidator>,
        wrap: impl FnOnce(ChunklineStorage) -> Arc<dyn SessionStore>,
    ) -> Harness {
        let dir = TempDir::new().expect("temp dir");
        let storage = ChunklineStorage::connect(&StorageConfig {
            sqlite_path: dir.path().join("meta.db").display().to_string(),
        })
        .await
        .expect("storage");
        let writer = ChunkWriter::create(&dir.path().join("data")).await.expect("writer");
        let coordinator = Arc::new(UploadCoordinator::new(
            wrap(storage.clone()),
            writer.clone(),
            validator,
            CHUNK,
        ));
        Harness {
            _dir: dir,
            storage,
            writer,
            coordinator,
        }
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(SizeValidator)).await
    }

    fn file_bytes(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    fn request(filename: &str, total_size: u64) -> HandshakeRequest {
        HandshakeRequest {
            filename: filename.to_string(),
            total_size,
            total_chunks: total_size.div_ceil(CHUNK),
        }
    }

    fn chunk(data: &[u8], index: u64) -> &[u8] {
        let start = (index * CHUNK) as usize;
        let end = (start + CHUNK as usize).min(data.len());
        &data[start..end]
    }

    async fn upload_all(h: &Harness, session_id: &str, data: &[u8]) {
        for index in 0..(data.len() as u64).div_ceil(CHUNK) {
            h.coordinator
                .accept_chunk(session_id, index, chunk(data, index))
                .await
                .expect("accept");
        }
    }

    async fn backdate(h: &Harness, session_id: &str, hours: i64) {
        sqlx::query("UPDATE upload_sessions SET created_at = ? WHERE session_id = ?")
            .bind(timestamp(Utc::now() - ChronoDuration::hours(hours)))
            .bind(session_id)
            .execute(h.storage.pool())
            .await
            .expect("backdate");
    }

    struct CountingValidator {
        calls: AtomicUsize,
    }

    impl AssemblyValidator for CountingValidator {
        fn validate(&self, path: &Path, expected_size: u64) -> Result<Vec<String>, ValidationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            SizeValidator.validate(path, expected_size)
        }
    }

    struct RejectingValidator;

    impl AssemblyValidator for RejectingValidator {
        fn validate(&self, _path: &Path, _expected_size: u64) -> Result<Vec<String>, ValidationError> {
            Err(ValidationError::Rejected("central directory missing".to_string()))
        }
    }

    #[tokio::test]
    async fn handshake_is_idempotent_before_progress() {
        let h = harness().await;

        let first = h.coordinator.handshake(&request("a.bin", 12 * 1024)).await.expect("handshake");
        let second = h.coordinator.handshake(&request("a.bin", 12 * 1024)).await.expect("handshake");

        assert_eq!(first.session_id, second.session_id);
        assert!(second.existing_chunks.is_empty());
    }

    #[tokio::test]
    async fn handshake_reports_resume_set_after_partial_progress() {
        let h = harness().await;
        let data = file_bytes(12 * 1024);
        let session = h.coordinator.handshake(&request("a.bin", 12 * 1024)).await.expect("handshake");

        for index in [0, 2] {
            h.coordinator
                .accept_chunk(&session.session_id, index, chunk(&data, index))
                .await
                .expect("accept");
        }

        let resumed = h.coordinator.handshake(&request("a.bin", 12 * 1024)).await.expect("handshake");
        assert_eq!(resumed.session_id, session.session_id);
        assert_eq!(resumed.existing_chunks, vec![0, 2]);

        h.coordinator
            .accept_chunk(&session.session_id, 1, chunk(&data, 1))
            .await
            .expect("accept");
        let finalized = h.coordinator.finalize(&session.session_id).await.expect("finalize");
        assert_eq!(finalized.status, SessionStatus::Completed);

        let status = h.coordinator.status(&session.session_id).await.expect("status");
        assert_eq!(status.completed_chunks, 3);
    }

    #[tokio::test]
    async fn handshake_rejects_malformed_requests() {
        let h = harness().await;
        let mut wrong_count = request("a.bin", 12 * 1024);
        wrong_count.total_chunks = 2;

        for bad in [
            wrong_count,
            request("", 100),
            request("../etc/passwd", 100),
            request("a.bin", 0),
            request("huge.bin", u64::MAX),
        ] {
            let err = h.coordinator.handshake(&bad).await.expect_err("invalid");
            assert!(matches!(err, CoordinatorError::InvalidRequest(_)), "{err}");
        }

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions")
            .fetch_one(h.storage.pool())
            .await
            .expect("count");
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn accept_chunk_validates_index_length_and_session() {
        let h = harness().await;
        let session = h.coordinator.handshake(&request("a.bin", 12 * 1024)).await.expect("handshake");
        let id = session.session_id.as_str();

        let out_of_range = h.coordinator.accept_chunk(id, 3, &[0u8; 10]).await;
        assert!(matches!(out_of_range, Err(CoordinatorError::InvalidRequest(_))));

        let short_full_chunk = h.coordinator.accept_chunk(id, 0, &[0u8; 10]).await;
        assert!(matches!(short_full_chunk, Err(CoordinatorError::InvalidRequest(_))));

        let long_tail = h.coordinator.accept_chunk(id, 2, &[0u8; CHUNK as usize]).await;
        assert!(matches!(long_tail, Err(CoordinatorError::InvalidRequest(_))));

        let missing = h.coordinator.accept_chunk("nope", 0, &[0u8; 10]).await;
        assert!(matches!(missing, Err(CoordinatorError::SessionNotFound(_))));

        assert!(!h.writer.scratch_path(id).exists());
    }

    #[tokio::test]
    async fn duplicate_chunk_delivery_is_absorbed() {
        let h = harness().await;
        let data = file_bytes(8 * 1024);
        let session = h.coordinator.handshake(&request("dup.bin", 8 * 1024)).await.expect("handshake");
        let id = session.session_id.as_str();

        upload_all(&h, id, &data).await;
        h.coordinator.accept_chunk(id, 1, chunk(&data, 1)).await.expect("resend");
        h.coordinator.accept_chunk(id, 0, chunk(&data, 0)).await.expect("resend");

        let status = h.coordinator.status(id).await.expect("status");
        assert_eq!(status.completed_chunks, 2);
        let scratch = tokio::fs::read(h.writer.scratch_path(id)).await.expect("read");
        assert_eq!(scratch, data);
    }

    #[tokio::test]
    async fn finalize_with_missing_chunks_fails_session() {
        let h = harness().await;
        let data = file_bytes(12 * 1024);
        let session = h.coordinator.handshake(&request("gap.bin", 12 * 1024)).await.expect("handshake");
        let id = session.session_id.as_str();
        h.coordinator.accept_chunk(id, 0, chunk(&data, 0)).await.expect("accept");

        let err = h.coordinator.finalize(id).await.expect_err("incomplete");
        assert!(matches!(err, CoordinatorError::Integrity { .. }));

        let status = h.coordinator.status(id).await.expect("status");
        assert_eq!(status.status, SessionStatus::Failed);
        assert!(status.failure_reason.unwrap_or_default().contains("1 of 3"));

        let again = h.coordinator.finalize(id).await.expect("informational");
        assert_eq!(again.status, SessionStatus::Failed);
        assert!(again.hash.is_none());

        let late = h.coordinator.accept_chunk(id, 1, chunk(&data, 1)).await;
        assert!(matches!(late, Err(CoordinatorError::NotUploading { .. })));
    }

    #[tokio::test]
    async fn finalize_surfaces_validator_rejection() {
        let h = harness_with(Arc::new(RejectingValidator)).await;
        let data = file_bytes(3 * 1024);
        let session = h.coordinator.handshake(&request("bad.zip", 3 * 1024)).await.expect("handshake");
        upload_all(&h, &session.session_id, &data).await;

        let err = h.coordinator.finalize(&session.session_id).await.expect_err("rejected");
        match err {
            CoordinatorError::Integrity { reason, .. } => {
                assert!(reason.contains("central directory missing"))
            }
            other => panic!("unexpected error {other}"),
        }
        let status = h.coordinator.status(&session.session_id).await.expect("status");
        assert_eq!(status.status, SessionStatus::Failed);
        assert!(status.final_hash.is_none());
    }

    #[tokio::test]
    async fn concurrent_finalize_assembles_once() {
        let validator = Arc::new(CountingValidator {
            calls: AtomicUsize::new(0),
        });
        let h = harness_with(validator.clone()).await;
        let data = file_bytes(11 * 1024);
        let session = h.coordinator.handshake(&request("race.bin", 11 * 1024)).await.expect("handshake");
        upload_all(&h, &session.session_id, &data).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let coordinator = Arc::clone(&h.coordinator);
            let id = session.session_id.clone();
            handles.push(tokio::spawn(async move { coordinator.finalize(&id).await }));
        }

        let mut winners = 0;
        for handle in handles {
            let response = handle.await.expect("join").expect("no finalize error");
            if response.hash.is_some() {
                winners += 1;
                assert_eq!(response.status, SessionStatus::Completed);
                assert!(response.files.is_some());
            } else {
                assert!(matches!(
                    response.status,
                    SessionStatus::Processing | SessionStatus::Completed
                ));
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
        let assembled = h
            .writer
            .files_dir()
            .join(format!("{}_race.bin", session.session_id));
        assert_eq!(tokio::fs::read(assembled).await.expect("read"), data);
    }

    #[tokio::test]
    async fn completed_session_hash_matches_content() {
        let h = harness().await;
        let data = file_bytes(6 * 1024);
        let session = h.coordinator.handshake(&request("hash.bin", 6 * 1024)).await.expect("handshake");
        upload_all(&h, &session.session_id, &data).await;

        let response = h.coordinator.finalize(&session.session_id).await.expect("finalize");
        let expected = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(&data))
        };
        assert_eq!(response.hash.as_deref(), Some(expected.as_str()));
        assert_eq!(
            response.files,
            Some(vec![format!("{}_hash.bin", session.session_id)])
        );
    }

    #[tokio::test]
    async fn cleanup_only_reclaims_old_uploading_sessions() {
        let h = harness().await;
        let data = file_bytes(4 * 1024);

        let old = h.coordinator.handshake(&request("old.bin", 4 * 1024)).await.expect("handshake");
        h.coordinator.accept_chunk(&old.session_id, 0, &data).await.expect("accept");
        backdate(&h, &old.session_id, 48).await;

        let fresh = h.coordinator.handshake(&request("fresh.bin", 4 * 1024)).await.expect("handshake");
        h.coordinator.accept_chunk(&fresh.session_id, 0, &data).await.expect("accept");

        let done = h.coordinator.handshake(&request("done.bin", 4 * 1024)).await.expect("handshake");
        h.coordinator.accept_chunk(&done.session_id, 0, &data).await.expect("accept");
        h.coordinator.finalize(&done.session_id).await.expect("finalize");
        backdate(&h, &done.session_id, 48).await;

        let reclaimed = h
            .coordinator
            .cleanup_orphans(Duration::from_secs(24 * 3600))
            .await
            .expect("cleanup");

        assert_eq!(reclaimed, 1);
        assert!(matches!(
            h.coordinator.status(&old.session_id).await,
            Err(CoordinatorError::SessionNotFound(_))
        ));
        assert!(!h.writer.scratch_path(&old.session_id).exists());
        assert!(h.writer.scratch_path(&fresh.session_id).exists());
        assert_eq!(
            h.coordinator.status(&done.session_id).await.expect("status").status,
            SessionStatus::Completed
        );

        let again = h
            .coordinator
            .cleanup_orphans(Duration::from_secs(24 * 3600))
            .await
            .expect("cleanup");
        assert_eq!(again, 0);
    }

    struct GatedStore {
        inner: ChunklineStorage,
        hold_next_read: AtomicBool,
        hold_next_upsert: AtomicBool,
        parked: Notify,
        resume: Notify,
        fail_complete: AtomicBool,
        fail_fail: AtomicBool,
    }

    impl GatedStore {
        async fn park(&self, flag: &AtomicBool) {
            if flag.swap(false, Ordering::SeqCst) {
                self.parked.notify_one();
                self.resume.notified().await;
            }
        }

        fn new(inner: ChunklineStorage) -> Self {
            Self {
                inner,
                hold_next_read: AtomicBool::new(false),
                hold_next_upsert: AtomicBool::new(false),
                parked: Notify::new(),
                resume: Notify::new(),
                fail_complete: AtomicBool::new(false),
                fail_fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl SessionStore for GatedStore {
        async fn open_session(
            &self,
            filename: &str,
            total_size: u64,
            total_chunks: u64,
        ) -> anyhow::Result<OpenedSession> {
            self.inner.open_session(filename, total_size, total_chunks).await
        }

        async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
            let record = self.inner.get_session(session_id).await?;
            self.park(&self.hold_next_read).await;
            Ok(record)
        }

        async fn upsert_chunk(
            &self,
            session_id: &str,
            chunk_index: u64,
            status: ChunkStatus,
        ) -> anyhow::Result<()> {
            self.inner.upsert_chunk(session_id, chunk_index, status).await?;
            self.park(&self.hold_next_upsert).await;
            Ok(())
        }

        async fn completed_chunks(&self, session_id: &str) -> anyhow::Result<Vec<u64>> {
            self.inner.completed_chunks(session_id).await
        }

        async fn count_completed_chunks(&self, session_id: &str) -> anyhow::Result<u64> {
            self.inner.count_completed_chunks(session_id).await
        }

        async fn transition_status(
            &self,
            session_id: &str,
            from: SessionStatus,
            to: SessionStatus,
        ) -> anyhow::Result<bool> {
            self.inner.transition_status(session_id, from, to).await
        }

        async fn complete_session(&self, session_id: &str, final_hash: &str) -> anyhow::Result<bool> {
            if self.fail_complete.load(Ordering::SeqCst) {
                bail!("database is locked");
            }
            self.inner.complete_session(session_id, final_hash).await
        }

        async fn fail_session(&self, session_id: &str, reason: &str) -> anyhow::Result<bool> {
            if self.fail_fail.load(Ordering::SeqCst) {
                bail!("database is locked");
            }
            self.inner.fail_session(session_id, reason).await
        }

        async fn list_orphans(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<SessionRecord>> {
            self.inner.list_orphans(cutoff).await
        }

        async fn delete_orphan(&self, session_id: &str, cutoff: DateTime<Utc>) -> anyhow::Result<bool> {
            self.inner.delete_orphan(session_id, cutoff).await
        }
    }

    async fn gated_harness() -> (Harness, Arc<GatedStore>) {
        let mut gated = None;
        let h = harness_over(Arc::new(SizeValidator), |storage| {
            let store = Arc::new(GatedStore::new(storage));
            gated = Some(Arc::clone(&store));
            let store: Arc<dyn SessionStore> = store;
            store
        })
        .await;
        (h, gated.expect("gated store"))
    }

    #[tokio::test]
    async fn chunk_landing_after_finalize_is_rejected_and_scratch_removed() {
        let (h, store) = gated_harness().await;
        let data = file_bytes(8 * 1024);
        let session = h.coordinator.handshake(&request("late.bin", 8 * 1024)).await.expect("handshake");
        let id = session.session_id.clone();
        upload_all(&h, &id, &data).await;

        store.hold_next_read.store(true, Ordering::SeqCst);
        let coordinator = Arc::clone(&h.coordinator);
        let late_id = id.clone();
        let resend = chunk(&data, 1).to_vec();
        let late = tokio::spawn(async move { coordinator.accept_chunk(&late_id, 1, &resend).await });
        store.parked.notified().await;

        let done = h.coordinator.finalize(&id).await.expect("finalize");
        assert_eq!(done.status, SessionStatus::Completed);
        store.resume.notify_one();

        let late = late.await.expect("join");
        assert!(matches!(
            late,
            Err(CoordinatorError::NotUploading {
                status: SessionStatus::Completed,
                ..
            })
        ));
        assert!(!h.writer.scratch_path(&id).exists());

        let status = h.coordinator.status(&id).await.expect("status");
        assert_eq!(status.status, SessionStatus::Completed);
        assert_eq!(status.final_hash, done.hash);
        assert_eq!(status.completed_chunks, 2);
    }

    #[tokio::test]
    async fn chunk_landing_after_cleanup_is_rejected_and_scratch_removed() {
        let (h, store) = gated_harness().await;
        let data = file_bytes(8 * 1024);
        let session = h.coordinator.handshake(&request("stale.bin", 8 * 1024)).await.expect("handshake");
        let id = session.session_id.clone();
        h.coordinator.accept_chunk(&id, 0, chunk(&data, 0)).await.expect("accept");
        backdate(&h, &id, 48).await;

        store.hold_next_upsert.store(true, Ordering::SeqCst);
        let coordinator = Arc::clone(&h.coordinator);
        let late_id = id.clone();
        let resend = chunk(&data, 1).to_vec();
        let late = tokio::spawn(async move { coordinator.accept_chunk(&late_id, 1, &resend).await });
        store.parked.notified().await;

        let reclaimed = h
            .coordinator
            .cleanup_orphans(Duration::from_secs(24 * 3600))
            .await
            .expect("cleanup");
        assert_eq!(reclaimed, 1);
        store.resume.notify_one();

        let late = late.await.expect("join");
        assert!(matches!(late, Err(CoordinatorError::SessionNotFound(_))));
        assert!(!h.writer.scratch_path(&id).exists());
    }

    #[tokio::test]
    async fn completion_write_failure_fails_session_instead_of_stranding_it() {
        let (h, store) = gated_harness().await;
        let data = file_bytes(6 * 1024);
        let session = h.coordinator.handshake(&request("locked.bin", 6 * 1024)).await.expect("handshake");
        let id = session.session_id.as_str();
        upload_all(&h, id, &data).await;

        store.fail_complete.store(true, Ordering::SeqCst);
        let err = h.coordinator.finalize(id).await.expect_err("completion not recorded");
        assert!(matches!(err, CoordinatorError::Storage(_)));

        let status = h.coordinator.status(id).await.expect("status");
        assert_eq!(status.status, SessionStatus::Failed);
        assert!(status
            .failure_reason
            .unwrap_or_default()
            .contains("failed to record completion"));

        let again = h.coordinator.finalize(id).await.expect("informational");
        assert_eq!(again.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn failure_write_error_still_reports_integrity() {
        let (h, store) = gated_harness().await;
        let data = file_bytes(12 * 1024);
        let session = h.coordinator.handshake(&request("gap2.bin", 12 * 1024)).await.expect("handshake");
        let id = session.session_id.as_str();
        h.coordinator.accept_chunk(id, 0, chunk(&data, 0)).await.expect("accept");

        store.fail_fail.store(true, Ordering::SeqCst);
        let err = h.coordinator.finalize(id).await.expect_err("incomplete");
        assert!(matches!(err, CoordinatorError::Integrity { .. }));
    }
}
