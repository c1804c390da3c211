use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chunkline_contract::{ChunkAck, FinalizeResponse, HandshakeRequest, HandshakeResponse};
use chunkline_control_plane::{CoordinatorError, UploadCoordinator};
use chunkline_transfer::{TransportError, UploadTransport};

#[derive(Clone)]
pub struct InProcessTransport {
    coordinator: Arc<UploadCoordinator>,
}

impl InProcessTransport {
    pub fn new(coordinator: Arc<UploadCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl UploadTransport for InProcessTransport {
    async fn handshake(
        &self,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, TransportError> {
        self.coordinator
            .handshake(request)
            .await
            .map_err(into_transport)
    }

    async fn send_chunk(
        &self,
        session_id: &str,
        chunk_index: u64,
        payload: Bytes,
    ) -> Result<ChunkAck, TransportError> {
        self.coordinator
            .accept_chunk(session_id, chunk_index, &payload)
            .await
            .map_err(into_transport)
    }

    async fn finalize(&self, session_id: &str) -> Result<FinalizeResponse, TransportError> {
        self.coordinator
            .finalize(session_id)
            .await
            .map_err(into_transport)
    }
}

fn into_transport(err: CoordinatorError) -> TransportError {
    let status = match &err {
        CoordinatorError::InvalidRequest(_) => 400,
        CoordinatorError::SessionNotFound(_) => 404,
        CoordinatorError::NotUploading { .. } => 409,
        CoordinatorError::Integrity { .. } => 422,
        CoordinatorError::Storage(_) => return TransportError::Unavailable(err.to_string()),
    };
    TransportError::Rejected {
        status,
        message: err.to_string(),
    }
}
