//! Transport Reader: opens the streamed response and yields raw chunks.
//!
//! Framing and classification never see the transport, so any byte source
//! that can produce a [`ChunkStream`] can drive a turn.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::config::CoachConfig;
use crate::constants::LOG_SNIPPET_CHARS;
use crate::hardening::RetryPolicy;
use crate::str_utils::snippet;
use crate::types::{ChatRequest, CoachError, ObservedError, Result};

/// Lazy, finite sequence of raw chunks in network order. Dropping it releases
/// the underlying connection.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub trait Transport: Send + Sync {
    /// Opens a response stream for `request`. Failing to obtain a streamable
    /// body is a transport error; failures while reading the returned stream
    /// are `StreamInterrupted`.
    fn open(&self, request: ChatRequest) -> impl Future<Output = Result<ChunkStream>> + Send;
}

/// POSTs the request as JSON and streams the response body.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, config: &CoachConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint(),
            retry: RetryPolicy::new(config.max_retries, config.retry_base_ms),
        }
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send_once(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| ObservedError::from(CoachError::Network(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(text) => text,
                Err(_) => "Unknown error".to_string(),
            };
            tracing::warn!(
                "[⚙️  -> ☁️ ] Upstream rejected stream (status {}): {}",
                status,
                snippet(&body, LOG_SNIPPET_CHARS)
            );
            return Err(CoachError::Upstream(status.as_u16(), body).into());
        }

        if response.content_length() == Some(0) {
            return Err(CoachError::Transport(format!(
                "response (status {}) carries no streamable body",
                status
            ))
            .into());
        }

        Ok(response)
    }
}

impl Transport for HttpTransport {
    async fn open(&self, request: ChatRequest) -> Result<ChunkStream> {
        tracing::debug!(
            "[⚙️  -> ☁️ ] Opening stream at {} ({} messages)",
            self.endpoint,
            request.messages.len()
        );

        let response = self
            .retry
            .execute_with_retry(|| self.send_once(&request))
            .await?;

        tracing::debug!("[☁️  -> ⚙️ ] Stream opened (status {})", response.status());

        let chunks = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| ObservedError::from(CoachError::StreamInterrupted(e.to_string())))
        });
        Ok(Box::pin(chunks))
    }
}
