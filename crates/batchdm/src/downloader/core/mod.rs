//! Core types used throughout the download manager
//!
//! This module contains the fundamental types that all other modules depend on:
//! the download descriptor, transfer outcomes, errors, hashing and the HTTP seam.

pub mod error;
pub mod files;
pub mod hash;
pub mod http;
pub mod metrics;
pub mod progress;

// Re-export main types for convenience
pub use error::{DownloadError, ErrorKind, ErrorSeverity, FileOperation, Result};
pub use hash::{ComputedDigest, HashAlgorithm, HashVerifier};
pub use http::{HttpTransport, Transport, TransferResponse};
pub use metrics::{DownloadMetrics, DownloadMetricsSnapshot};
pub use progress::{DataObserver, RateSampler, SchedulerEvent, TaskRate, UiObserver};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

const SUPPORTED_SCHEMES: &str = "http, https";

/// One remote file to fetch
///
/// This is the caller-facing input that flows into a batch. Every field but the
/// URL and destination is optional; a missing size is learned from the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDescriptor {
    /// Remote location, `http` or `https`
    pub url: String,
    /// Final path of the file on disk
    pub destination: PathBuf,
    /// Expected byte size, if known up front
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    /// Expected digest, hex (any case) or base64 for xxHash64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    /// Overrides the scheduler-wide algorithm for this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<HashAlgorithm>,
}

impl DownloadDescriptor {
    /// Create a descriptor with just a URL and destination path
    pub fn new<S: Into<String>, P: Into<PathBuf>>(url: S, destination: P) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            expected_size: None,
            expected_hash: None,
            hash_algorithm: None,
        }
    }

    /// Set the expected size
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// Set the expected digest, verified with the scheduler's algorithm
    pub fn with_expected_hash<S: Into<String>>(mut self, digest: S) -> Self {
        self.expected_hash = Some(digest.into());
        self
    }

    /// Set the expected digest together with the algorithm that produced it
    pub fn with_hash<S: Into<String>>(mut self, algorithm: HashAlgorithm, digest: S) -> Self {
        self.hash_algorithm = Some(algorithm);
        self.expected_hash = Some(digest.into());
        self
    }

    /// Check the URL and destination, returning the parsed URL
    pub fn validate(&self) -> Result<Url> {
        let url = Url::parse(&self.url).map_err(|source| {
            let mut error = DownloadError::from(source);
            if let DownloadError::InvalidUrl { url, .. } = &mut error {
                *url = self.url.clone();
            }
            error
        })?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(DownloadError::UnsupportedUrl {
                    url: self.url.clone(),
                    scheme: other.to_string(),
                    supported_schemes: SUPPORTED_SCHEMES.to_string(),
                });
            }
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(self.invalid("URL has no host"));
        }

        if self.destination.as_os_str().is_empty() {
            return Err(self.invalid("destination path is empty"));
        }

        if self.destination.file_name().is_none() {
            return Err(self.invalid("destination path does not name a file"));
        }

        if let Some(digest) = &self.expected_hash {
            if digest.trim().is_empty() {
                return Err(self.invalid("expected hash is empty"));
            }
        }

        Ok(url)
    }

    /// Algorithm used for this file, given the scheduler-wide default
    pub fn effective_algorithm(&self, default: HashAlgorithm) -> HashAlgorithm {
        self.hash_algorithm.unwrap_or(default)
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    fn invalid(&self, reason: &str) -> DownloadError {
        DownloadError::InvalidDescriptor {
            url: self.url.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Result of a completed transfer
///
/// `Restarted` marks a transfer that had a partial file but had to start over
/// because the server ignored the byte-range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// File was downloaded from the first byte
    Downloaded { size: u64 },
    /// Partial file was continued from its resumable offset
    Resumed { size: u64, offset: u64 },
    /// Partial file was discarded because the server sent the full body
    Restarted { size: u64, discarded: u64 },
    /// Destination already existed and passed verification
    AlreadyExists { size: u64 },
}

impl TransferOutcome {
    pub fn size(&self) -> u64 {
        match *self {
            TransferOutcome::Downloaded { size }
            | TransferOutcome::Resumed { size, .. }
            | TransferOutcome::Restarted { size, .. }
            | TransferOutcome::AlreadyExists { size } => size,
        }
    }
}
