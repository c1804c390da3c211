use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chunkline_contract::{
    ChunkLayout, FinalizeResponse, HandshakeRequest, LayoutError, SessionId, SessionStatus,
    DEFAULT_CHUNK_SIZE,
};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::progress::{ChunkState, ProgressBoard, TransferSnapshot, TransferState};
use crate::retry::RetryPolicy;
use crate::source::read_chunk;
use crate::transport::{TransportError, UploadTransport};
use crate::DEFAULT_CONCURRENCY;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub chunk_size: u64,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("source file is empty")]
    EmptySource,
    #[error("source file has no usable name: {0}")]
    UnnamedSource(String),
    #[error("failed to read source file: {0}")]
    Source(#[from] std::io::Error),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("handshake failed: {0}")]
    Handshake(#[source] TransportError),
    #[error("chunk {index} failed: {source}")]
    Chunk {
        index: u64,
        #[source]
        source: TransportError,
    },
    #[error("failed to read chunk {index}: {source}")]
    ChunkSource {
        index: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("finalize failed: {0}")]
    Finalize(#[source] TransportError),
    #[error("server reported session {session_id} as {status}")]
    FinalizeStatus {
        session_id: SessionId,
        status: SessionStatus,
    },
    #[error("upload worker stopped unexpectedly: {0}")]
    Worker(String),
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub session_id: SessionId,
    pub resumed_chunks: usize,
    pub sent_chunks: usize,
    pub finalize: FinalizeResponse,
    pub snapshot: TransferSnapshot,
}

pub struct TransferScheduler {
    transport: Arc<dyn UploadTransport>,
    source: PathBuf,
    filename: String,
    config: SchedulerConfig,
    progress: watch::Sender<TransferSnapshot>,
}

impl TransferScheduler {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        source: impl Into<PathBuf>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let source = source.into();
        let filename = source
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| SchedulerError::UnnamedSource(source.display().to_string()))?;
        let (progress, _) = watch::channel(TransferSnapshot::idle());

        Ok(Self {
            transport,
            source,
            filename,
            config,
            progress,
        })
    }

    /// Uploads under `filename` instead of the source's own file name.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferSnapshot> {
        self.progress.subscribe()
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.progress.borrow().clone()
    }

    pub async fn start(&self) -> Result<TransferReport, SchedulerError> {
        let total_size = tokio::fs::metadata(&self.source).await?.len();
        if total_size == 0 {
            return Err(SchedulerError::EmptySource);
        }
        let layout = ChunkLayout::new(total_size, self.config.chunk_size)?;
        let board = Arc::new(StdMutex::new(ProgressBoard::new(layout, Instant::now())));
        publish(&board, &self.progress);

        let request = HandshakeRequest {
            filename: self.filename.clone(),
            total_size,
            total_chunks: layout.total_chunks(),
        };
        let handshake = match with_retry(&self.config.retry, "handshake", || {
            self.transport.handshake(&request)
        })
        .await
        {
            Ok(handshake) => handshake,
            Err(err) => {
                self.conclude(&board, TransferState::Error);
                return Err(SchedulerError::Handshake(err));
            }
        };
        let session_id = handshake.session_id;

        let pending = {
            let mut board = lock(&board);
            for index in &handshake.existing_chunks {
                board.mark_resumed(*index);
            }
            board.pending()
        };
        publish(&board, &self.progress);

        let total_chunks = layout.total_chunks() as usize;
        let sent_chunks = pending.len();
        info!(
            session_id = %session_id,
            filename = %self.filename,
            total_chunks,
            resumed = total_chunks - sent_chunks,
            "upload session ready"
        );

        let dispatch = Arc::new(Dispatch {
            transport: Arc::clone(&self.transport),
            source: self.source.clone(),
            session_id: session_id.clone(),
            layout,
            retry: self.config.retry,
            queue: Mutex::new(VecDeque::from(pending)),
            abort: CancellationToken::new(),
            failure: StdMutex::new(None),
            board: Arc::clone(&board),
            progress: self.progress.clone(),
        });

        let workers = self.config.concurrency.max(1).min(sent_chunks.max(1));
        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(Arc::clone(&dispatch).run_worker());
        }
        while let Some(joined) = set.join_next().await {
            if let Err(err) = joined {
                dispatch.abort.cancel();
                dispatch.record_failure(SchedulerError::Worker(err.to_string()));
            }
        }

        let failure = dispatch
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(failure) = failure {
            self.conclude(&board, TransferState::Error);
            return Err(failure);
        }
        if !lock(&board).all_succeeded() {
            self.conclude(&board, TransferState::Error);
            return Err(SchedulerError::Worker(
                "workers exited with chunks outstanding".to_string(),
            ));
        }

        let finalize = match with_retry(&self.config.retry, "finalize", || {
            self.transport.finalize(&session_id)
        })
        .await
        {
            Ok(finalize) => finalize,
            Err(err) => {
                self.conclude(&board, TransferState::Error);
                return Err(SchedulerError::Finalize(err));
            }
        };

        match finalize.status {
            SessionStatus::Completed | SessionStatus::Processing => {
                let snapshot = self.conclude(&board, TransferState::Completed);
                info!(
                    session_id = %session_id,
                    status = %finalize.status,
                    hash = finalize.hash.as_deref().unwrap_or("-"),
                    "upload finished"
                );
                Ok(TransferReport {
                    session_id,
                    resumed_chunks: total_chunks - sent_chunks,
                    sent_chunks,
                    finalize,
                    snapshot,
                })
            }
            status => {
                self.conclude(&board, TransferState::Error);
                Err(SchedulerError::FinalizeStatus { session_id, status })
            }
        }
    }

    fn conclude(&self, board: &StdMutex<ProgressBoard>, state: TransferState) -> TransferSnapshot {
        lock(board).set_state(state);
        publish(board, &self.progress)
    }
}

struct Dispatch {
    transport: Arc<dyn UploadTransport>,
    source: PathBuf,
    session_id: SessionId,
    layout: ChunkLayout,
    retry: RetryPolicy,
    queue: Mutex<VecDeque<u64>>,
    abort: CancellationToken,
    failure: StdMutex<Option<SchedulerError>>,
    board: Arc<StdMutex<ProgressBoard>>,
    progress: watch::Sender<TransferSnapshot>,
}

impl Dispatch {
    async fn run_worker(self: Arc<Self>) {
        while let Some(index) = self.next_chunk().await {
            self.upload_chunk(index).await;
        }
    }

    async fn next_chunk(&self) -> Option<u64> {
        let mut queue = self.queue.lock().await;
        let index = queue.pop_front()?;
        // Abort may have fired while this worker waited for the lock.
        if self.abort.is_cancelled() {
            queue.push_front(index);
            return None;
        }
        Some(index)
    }

    async fn upload_chunk(&self, index: u64) {
        self.mark(index, ChunkState::Uploading);

        let payload = match self.read(index).await {
            Ok(payload) => payload,
            Err(source) => {
                self.fail(index, SchedulerError::ChunkSource { index, source });
                return;
            }
        };

        let mut retry = 0;
        loop {
            match self
                .transport
                .send_chunk(&self.session_id, index, payload.clone())
                .await
            {
                Ok(_) => {
                    debug!(session_id = %self.session_id, chunk_index = index, "chunk sent");
                    self.mark(index, ChunkState::Success);
                    return;
                }
                Err(err) if err.is_transient() && retry < self.retry.max_retries => {
                    let delay = self.retry.delay_for(retry);
                    retry += 1;
                    warn!(
                        session_id = %self.session_id,
                        chunk_index = index,
                        attempt = retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chunk upload failed, retrying"
                    );
                    tokio::select! {
                        _ = self.abort.cancelled() => {
                            self.mark(index, ChunkState::Pending);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(source) => {
                    self.fail(index, SchedulerError::Chunk { index, source });
                    return;
                }
            }
        }
    }

    async fn read(&self, index: u64) -> std::io::Result<bytes::Bytes> {
        let range = self
            .layout
            .range(index)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
        read_chunk(Path::new(&self.source), range).await
    }

    fn fail(&self, index: u64, error: SchedulerError) {
        warn!(
            session_id = %self.session_id,
            chunk_index = index,
            error = %error,
            "chunk failed, aborting transfer"
        );
        self.mark(index, ChunkState::Error);
        self.record_failure(error);
        self.abort.cancel();
    }

    fn record_failure(&self, error: SchedulerError) {
        let mut failure = self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    fn mark(&self, index: u64, state: ChunkState) {
        lock(&self.board).mark(index, state);
        publish(&self.board, &self.progress);
    }
}

fn lock(board: &StdMutex<ProgressBoard>) -> std::sync::MutexGuard<'_, ProgressBoard> {
    board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn publish(
    board: &StdMutex<ProgressBoard>,
    progress: &watch::Sender<TransferSnapshot>,
) -> TransferSnapshot {
    let snapshot = lock(board).snapshot(Instant::now());
    progress.send_replace(snapshot.clone());
    snapshot
}

async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut retry = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                retry += 1;
                warn!(operation, attempt = retry, error = %err, "request failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
