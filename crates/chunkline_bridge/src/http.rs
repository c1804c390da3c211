use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chunkline_contract::{ChunkAck, FinalizeResponse, HandshakeRequest, HandshakeResponse};
use chunkline_transfer::{TransportError, UploadTransport};
use reqwest::{header::CONTENT_TYPE, Client as HttpClient, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const USER_AGENT: &str = concat!("chunkline/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    endpoint: Url,
    client: HttpClient,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, BridgeError> {
        let mut endpoint = Url::parse(endpoint).map_err(|err| BridgeError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(BridgeError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: "not a base URL".to_string(),
            });
        }
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let client = HttpClient::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { endpoint, client })
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.endpoint
            .join(path)
            .map_err(|err| TransportError::InvalidResponse(format!("bad request path {path}: {err}")))
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn handshake(
        &self,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, TransportError> {
        let url = self.url("v1/uploads/handshake")?;
        let res = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(request_error)?;
        decode(res).await
    }

    async fn send_chunk(
        &self,
        session_id: &str,
        chunk_index: u64,
        payload: Bytes,
    ) -> Result<ChunkAck, TransportError> {
        let url = self.url(&format!("v1/uploads/{session_id}/chunks/{chunk_index}"))?;
        debug!(session_id, chunk_index, len = payload.len(), "sending chunk");
        let res = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await
            .map_err(request_error)?;
        decode(res).await
    }

    async fn finalize(&self, session_id: &str) -> Result<FinalizeResponse, TransportError> {
        let url = self.url(&format!("v1/uploads/{session_id}/finalize"))?;
        let res = self
            .client
            .post(url)
            .send()
            .await
            .map_err(request_error)?;
        decode(res).await
    }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, TransportError> {
    let status = res.status();
    if status.is_success() {
        return res
            .json()
            .await
            .map_err(|err| TransportError::InvalidResponse(err.to_string()));
    }

    let text = res.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiError>(&text) {
        Ok(api) if api.detail.is_empty() => api.error,
        Ok(api) => format!("{}: {}", api.error, api.detail),
        Err(_) => text,
    };
    Err(TransportError::Rejected {
        status: status.as_u16(),
        message,
    })
}

fn request_error(err: reqwest::Error) -> TransportError {
    if err.is_decode() {
        TransportError::InvalidResponse(err.to_string())
    } else {
        TransportError::Unavailable(err.to_string())
    }
}
