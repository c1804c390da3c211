use async_trait::async_trait;
use bytes::Bytes;
use chunkline_contract::{ChunkAck, FinalizeResponse, HandshakeRequest, HandshakeResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// 4xx responses are final.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Unavailable(_) | TransportError::InvalidResponse(_) => true,
            TransportError::Rejected { status, .. } => *status >= 500,
        }
    }
}

#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn handshake(
        &self,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, TransportError>;

    async fn send_chunk(
        &self,
        session_id: &str,
        chunk_index: u64,
        payload: Bytes,
    ) -> Result<ChunkAck, TransportError>;

    async fn finalize(&self, session_id: &str) -> Result<FinalizeResponse, TransportError>;
}
