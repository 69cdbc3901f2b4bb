//! HTTP transport
//!
//! The engine talks to the network through the [`Transport`] trait: one call
//! opens a GET at a byte offset and hands back status information plus a chunk
//! stream. [`HttpTransport`] is the reqwest implementation; tests substitute a
//! scripted transport.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::downloader::config::DownloadConfig;
use crate::downloader::core::{DownloadError, Result};

/// Response head plus streaming body of one GET
pub struct TransferResponse {
    pub status: u16,
    /// True when the body starts at the requested offset (206)
    pub partial: bool,
    /// Size of the whole resource, when the server reports it
    pub total_size: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferResponse")
            .field("status", &self.status)
            .field("partial", &self.partial)
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

/// Network seam used by the transfer engine
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a GET for `url` starting at byte `offset`
    ///
    /// A non-success status is returned as [`DownloadError::ServerError`]. An
    /// offset of 0 must not send a range header.
    async fn fetch(&self, url: &Url, offset: u64) -> Result<TransferResponse>;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    connect_timeout: Duration,
}

impl HttpTransport {
    /// Create a new HTTP transport from download configuration
    pub fn from_config(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| DownloadError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
                field: None,
                suggestion: Some("Check the user agent and TLS setup".to_string()),
            })?;

        Ok(Self {
            client,
            connect_timeout: config.connect_timeout,
        })
    }

    /// Wrap an existing client
    pub fn with_client(client: Client, connect_timeout: Duration) -> Self {
        Self {
            client,
            connect_timeout,
        }
    }

    fn map_error(&self, url: &str, error: reqwest::Error) -> DownloadError {
        if error.is_timeout() {
            DownloadError::NetworkTimeout {
                url: url.to_string(),
                duration_secs: self.connect_timeout.as_secs(),
            }
        } else {
            DownloadError::HttpRequest {
                url: url.to_string(),
                source: error,
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &Url, offset: u64) -> Result<TransferResponse> {
        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
            debug!("Requesting range: bytes={}-", offset);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_error(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::from_status(url.as_str(), status.as_u16()));
        }

        let partial = status == StatusCode::PARTIAL_CONTENT;
        let content_length = response.content_length();
        let total_size = if partial {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .or_else(|| content_length.map(|len| offset + len))
        } else {
            content_length
        };

        debug!(
            "GET {} -> {} (partial: {}, total: {:?})",
            url, status, partial, total_size
        );

        let transport = self.clone();
        let url_text = url.to_string();
        let body = response
            .bytes_stream()
            .map_err(move |e| transport.map_error(&url_text, e))
            .boxed();

        Ok(TransferResponse {
            status: status.as_u16(),
            partial,
            total_size,
            body,
        })
    }
}

/// Total length from a `Content-Range: bytes start-end/total` header
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}
