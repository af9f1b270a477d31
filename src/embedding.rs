//! Client for the language-processing service.
//!
//! The service exposes a liveness probe at `GET /` answering
//! `{"status":"OK"}`, and `GET /embedding` which takes UTF-8 text as the
//! request body and answers with a protobuf [`VectorResponse`] as
//! `application/octet-stream`.

use std::fmt;

use bytes::Bytes;
use prost::Message;
use reqwest::{StatusCode, header::CONTENT_TYPE};
use serde::Deserialize;
use tracing_error::SpanTrace;

use crate::transport::{DownstreamSettings, TransportError};

/// Embedding vector returned by the service.
#[derive(Clone, PartialEq, Message)]
pub struct VectorResponse {
    #[prost(float, repeated, tag = "1")]
    pub value: Vec<f32>,
}

/// Encode `vector` exactly as the service puts it on the wire.
pub fn encode_vector(vector: &[f32]) -> Bytes {
    VectorResponse {
        value: vector.to_vec(),
    }
    .encode_to_vec()
    .into()
}

#[derive(Deserialize)]
struct Health {
    status: String,
}

#[derive(Clone)]
pub struct EmbeddingClient {
    client: reqwest::Client,
    base: String,
}

impl EmbeddingClient {
    pub fn new(settings: &DownstreamSettings) -> Result<Self, TransportError> {
        Ok(Self {
            client: settings.client()?,
            base: settings.base(),
        })
    }

    /// Probe the service; succeeds only on `{"status":"OK"}`.
    #[tracing::instrument(skip(self))]
    pub async fn health(&self) -> Result<(), EmbeddingError> {
        let body = self.fetch(self.client.get(format!("{}/", self.base))).await?;
        let health: Health = serde_json::from_slice(&body)
            .map_err(|e| EmbeddingError::new(EmbeddingErrorKind::Unhealthy(e.to_string())))?;
        if health.status == "OK" {
            Ok(())
        } else {
            Err(EmbeddingError::new(EmbeddingErrorKind::Unhealthy(
                health.status,
            )))
        }
    }

    /// Compute the embedding of `text`.
    #[tracing::instrument(skip(self, text), fields(len = text.len()))]
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let request = self
            .client
            .get(format!("{}/embedding", self.base))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(text.to_owned());
        let body = self.fetch(request).await?;
        let response = VectorResponse::decode(body)
            .map_err(|e| EmbeddingError::new(EmbeddingErrorKind::Decode(e)))?;
        Ok(response.value)
    }

    async fn fetch(&self, request: reqwest::RequestBuilder) -> Result<Bytes, EmbeddingError> {
        let response = request.send().await.map_err(TransportError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(EmbeddingError::new(EmbeddingErrorKind::Status(status)));
        }
        Ok(response.bytes().await.map_err(TransportError::from)?)
    }
}

/// Error returned by [`EmbeddingClient`].
#[derive(Debug)]
pub struct EmbeddingError {
    context: SpanTrace,
    kind: EmbeddingErrorKind,
}

#[derive(Debug)]
pub enum EmbeddingErrorKind {
    /// No response was obtained.
    Transport(TransportError),
    /// The service answered with a non-success status.
    Status(StatusCode),
    /// The liveness probe did not report `OK`.
    Unhealthy(String),
    /// The body is not a valid `VectorResponse`.
    Decode(prost::DecodeError),
}

impl EmbeddingError {
    fn new(kind: EmbeddingErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &EmbeddingErrorKind {
        &self.kind
    }
}

impl From<TransportError> for EmbeddingError {
    fn from(err: TransportError) -> Self {
        Self::new(EmbeddingErrorKind::Transport(err))
    }
}

impl fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EmbeddingErrorKind::Transport(err) => writeln!(f, "{}", err.summary()),
            EmbeddingErrorKind::Status(status) => {
                writeln!(f, "Embedding service answered {status}")
            }
            EmbeddingErrorKind::Unhealthy(status) => {
                writeln!(f, "Embedding service unhealthy: {status}")
            }
            EmbeddingErrorKind::Decode(err) => writeln!(f, "Malformed vector response: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for EmbeddingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            EmbeddingErrorKind::Transport(err) => Some(err),
            EmbeddingErrorKind::Decode(err) => Some(err),
            EmbeddingErrorKind::Status(_) | EmbeddingErrorKind::Unhealthy(_) => None,
        }
    }
}
