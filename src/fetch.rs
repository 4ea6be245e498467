//! Conditional HTTP fetching.
//!
//! [`Transport`] is the seam to the network: one conditional GET able to
//! carry an `If-None-Match` precondition and report the entity tag of the
//! response. [`ConditionalFetch`] wraps it with the etag protocol the loading
//! pipeline consumes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ETAG, IF_NONE_MATCH};

use crate::error::TransportError;

/// Raw transport response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub body: Bytes,
}

/// Generic conditional GET.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url`, attaching `etag` as an `If-None-Match` precondition when
    /// present. `timeout` is a best-effort transport-level deadline.
    async fn get(
        &self,
        url: &str,
        etag: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(Self::user_agent())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn user_agent() -> &'static str {
        concat!("affresco/", env!("CARGO_PKG_VERSION"))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        url: &str,
        etag: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self.client.get(url);
        if let Some(tag) = etag {
            request = request.header(IF_NONE_MATCH, tag);
        }
        if let Some(deadline) = timeout {
            request = request.timeout(deadline);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await?;
        Ok(TransportResponse { status, etag, body })
    }
}

/// Result of one conditional fetch, as consumed by the loading pipeline.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Fresh body; `etag` is the server's new entity tag, if any.
    Fresh { body: Bytes, etag: Option<String> },
    /// The precondition held; the persisted bytes remain canonical.
    NotModified,
    /// Transport or server failure. `code` is the HTTP status, or 0 when the
    /// request never produced a response.
    Failed { code: i32, message: String },
}

/// Etag-aware wrapper over a [`Transport`].
#[derive(Clone)]
pub struct ConditionalFetch {
    transport: Arc<dyn Transport>,
}

impl ConditionalFetch {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        timeout: Option<Duration>,
    ) -> FetchOutcome {
        match self.transport.get(url, etag, timeout).await {
            Ok(response) if response.status == 304 => FetchOutcome::NotModified,
            Ok(response) if (200..300).contains(&response.status) => FetchOutcome::Fresh {
                body: response.body,
                etag: response.etag,
            },
            Ok(response) => FetchOutcome::Failed {
                code: i32::from(response.status),
                message: format!("server returned status {}", response.status),
            },
            Err(err) => FetchOutcome::Failed {
                code: 0,
                message: err.to_string(),
            },
        }
    }
}
