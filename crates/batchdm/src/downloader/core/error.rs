//! Error types for the download manager with context and recovery information

use std::error::Error;
use std::path::PathBuf;
use thiserror::Error;

use super::hash::HashAlgorithm;

/// Every failure the scheduler, engine or a task can report
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Descriptor rejected before any transfer was attempted
    #[error("Invalid download descriptor for '{url}': {reason}")]
    InvalidDescriptor {
        url: String,
        reason: String,
    },

    /// URL parsing errors with helpful suggestions
    #[error("Invalid URL '{url}': {suggestion}")]
    InvalidUrl {
        url: String,
        suggestion: String,
        #[source]
        source: url::ParseError,
    },

    /// Unsupported URL schemes
    #[error("Unsupported URL scheme in '{url}' (supported: {supported_schemes})")]
    UnsupportedUrl {
        url: String,
        scheme: String,
        supported_schemes: String,
    },

    /// Transport-level HTTP failure (connect, TLS, body read)
    #[error("HTTP request to '{url}' failed")]
    HttpRequest {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// No bytes arrived within the configured window
    #[error("Request to '{url}' timed out after {duration_secs}s (try increasing timeout or check network)")]
    NetworkTimeout {
        url: String,
        duration_secs: u64,
    },

    /// Connection dropped mid-stream
    #[error("Connection to '{url}' lost: {reason}")]
    ConnectionLost {
        url: String,
        reason: String,
    },

    /// Server answered with a status that does not carry the file
    #[error("Server returned HTTP {status} for '{url}'")]
    ServerError {
        url: String,
        status: u16,
    },

    /// File system I/O errors with file context
    #[error("File operation failed on '{path}' while {operation}")]
    FileSystem {
        path: PathBuf,
        operation: FileOperation,
        #[source]
        source: std::io::Error,
    },

    /// Computed digest differs from the expected one
    #[error("Hash mismatch for '{file}': expected {algorithm} {expected}, got {actual}")]
    HashMismatch {
        file: PathBuf,
        algorithm: HashAlgorithm,
        expected: String,
        actual: String,
    },

    /// File size validation with helpful context
    #[error("File size mismatch for '{file}': expected {expected} bytes, got {actual} bytes (difference: {diff} bytes)")]
    SizeMismatch {
        file: PathBuf,
        expected: u64,
        actual: u64,
        diff: i64,
    },

    /// Retry exhaustion, wrapping the last transient error
    #[error("Maximum retry attempts ({max_retries}) exceeded for '{url}'")]
    MaxRetriesExceeded {
        url: String,
        max_retries: usize,
        #[source]
        last_error: Box<DownloadError>,
    },

    /// Configuration errors
    #[error("Invalid configuration: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
        suggestion: Option<String>,
    },

    /// Download cancelled by the caller
    #[error("Download cancelled: {reason}")]
    Cancelled {
        reason: String,
        url: Option<String>,
    },

    /// A task handle outlived the task it designates
    #[error("Task {task_id} is not known to this scheduler")]
    TaskNotFound {
        task_id: u64,
    },
}

/// Types of file operations for error context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Read,
    Write,
    Create,
    Delete,
    Move,
    Metadata,
    CreateDir,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOperation::Read => write!(f, "reading"),
            FileOperation::Write => write!(f, "writing"),
            FileOperation::Create => write!(f, "creating"),
            FileOperation::Delete => write!(f, "deleting"),
            FileOperation::Move => write!(f, "moving"),
            FileOperation::Metadata => write!(f, "reading metadata"),
            FileOperation::CreateDir => write!(f, "creating directory"),
        }
    }
}

/// Coarse error taxonomy shown to observers and used for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidDescriptor,
    TransientNetwork,
    Server,
    Disk,
    HashMismatch,
    SizeMismatch,
    Cancelled,
    Configuration,
}

pub type Result<T> = std::result::Result<T, DownloadError>;

impl DownloadError {
    /// Build a file system error for `path`
    pub fn fs(path: impl Into<PathBuf>, operation: FileOperation, source: std::io::Error) -> Self {
        DownloadError::FileSystem {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Map an HTTP status code to the matching error
    pub fn from_status(url: impl Into<String>, status: u16) -> Self {
        DownloadError::ServerError {
            url: url.into(),
            status,
        }
    }

    /// Taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::InvalidDescriptor { .. }
            | DownloadError::InvalidUrl { .. }
            | DownloadError::UnsupportedUrl { .. }
            | DownloadError::TaskNotFound { .. } => ErrorKind::InvalidDescriptor,
            DownloadError::HttpRequest { .. }
            | DownloadError::NetworkTimeout { .. }
            | DownloadError::ConnectionLost { .. }
            | DownloadError::MaxRetriesExceeded { .. } => ErrorKind::TransientNetwork,
            DownloadError::ServerError { .. } => ErrorKind::Server,
            DownloadError::FileSystem { .. } => ErrorKind::Disk,
            DownloadError::HashMismatch { .. } => ErrorKind::HashMismatch,
            DownloadError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            DownloadError::Cancelled { .. } => ErrorKind::Cancelled,
            DownloadError::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Check if error is recoverable (should retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            DownloadError::HttpRequest { source, .. } => {
                // A status attached to a transport error follows the status rules
                source
                    .status()
                    .map_or(true, |status| is_transient_status(status.as_u16()))
            }
            DownloadError::NetworkTimeout { .. } => true,
            DownloadError::ConnectionLost { .. } => true,
            DownloadError::ServerError { status, .. } => is_transient_status(*status),
            DownloadError::MaxRetriesExceeded { .. } => false, // Already exhausted retries
            DownloadError::FileSystem { .. } => false,
            DownloadError::HashMismatch { .. } => false,
            DownloadError::SizeMismatch { .. } => false,
            DownloadError::InvalidDescriptor { .. } => false,
            DownloadError::InvalidUrl { .. } => false,
            DownloadError::UnsupportedUrl { .. } => false,
            DownloadError::Configuration { .. } => false,
            DownloadError::Cancelled { .. } => false,
            DownloadError::TaskNotFound { .. } => false,
        }
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            DownloadError::InvalidDescriptor { .. } => "invalid_descriptor",
            DownloadError::InvalidUrl { .. } => "invalid_url",
            DownloadError::UnsupportedUrl { .. } => "unsupported_url",
            DownloadError::HttpRequest { .. } => "http_request",
            DownloadError::NetworkTimeout { .. } => "network_timeout",
            DownloadError::ConnectionLost { .. } => "connection_lost",
            DownloadError::ServerError { .. } => "server_error",
            DownloadError::FileSystem { .. } => "file_system",
            DownloadError::HashMismatch { .. } => "hash_mismatch",
            DownloadError::SizeMismatch { .. } => "size_mismatch",
            DownloadError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            DownloadError::Configuration { .. } => "configuration",
            DownloadError::Cancelled { .. } => "cancelled",
            DownloadError::TaskNotFound { .. } => "task_not_found",
        }
    }

    /// Get severity level for error prioritization
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DownloadError::Cancelled { .. } => ErrorSeverity::Low,
            DownloadError::HttpRequest { .. }
            | DownloadError::NetworkTimeout { .. }
            | DownloadError::ConnectionLost { .. }
            | DownloadError::ServerError { .. }
            | DownloadError::TaskNotFound { .. } => ErrorSeverity::Medium,
            DownloadError::InvalidDescriptor { .. }
            | DownloadError::InvalidUrl { .. }
            | DownloadError::UnsupportedUrl { .. }
            | DownloadError::HashMismatch { .. }
            | DownloadError::SizeMismatch { .. }
            | DownloadError::MaxRetriesExceeded { .. }
            | DownloadError::Configuration { .. } => ErrorSeverity::High,
            DownloadError::FileSystem { .. } => ErrorSeverity::Critical,
        }
    }

    /// Get user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            DownloadError::NetworkTimeout { .. } => {
                Some("Check your internet connection or try increasing the timeout value")
            }
            DownloadError::InvalidUrl { suggestion, .. } => Some(suggestion),
            DownloadError::UnsupportedUrl { .. } => Some("Use a supported URL scheme (http/https)"),
            DownloadError::HashMismatch { .. } => {
                Some("The server delivered different content than expected; check the source or the expected digest")
            }
            DownloadError::FileSystem { .. } => {
                Some("Check free disk space and permissions of the destination directory")
            }
            DownloadError::Configuration { suggestion, .. } => suggestion.as_deref(),
            _ => None,
        }
    }

    /// Create a detailed error report for debugging
    pub fn detailed_report(&self) -> String {
        let mut report = format!("Error: {}\n", self);
        report.push_str(&format!("Category: {}\n", self.category()));
        report.push_str(&format!("Severity: {:?}\n", self.severity()));
        report.push_str(&format!("Recoverable: {}\n", self.is_recoverable()));

        if let Some(suggestion) = self.suggestion() {
            report.push_str(&format!("Suggestion: {}\n", suggestion));
        }

        if let Some(source) = self.source() {
            report.push_str(&format!("Root cause: {}\n", source));
        }

        report
    }
}

/// 408, 429 and 5xx are worth another attempt; every other status is final
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Error severity levels for prioritization
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<url::ParseError> for DownloadError {
    fn from(error: url::ParseError) -> Self {
        let suggestion = match error {
            url::ParseError::EmptyHost => "URL must have a valid hostname",
            url::ParseError::InvalidPort => "Port number must be between 1 and 65535",
            url::ParseError::InvalidIpv4Address => "Invalid IPv4 address format",
            url::ParseError::InvalidIpv6Address => "Invalid IPv6 address format",
            url::ParseError::RelativeUrlWithoutBase => "URL must be absolute (include http:// or https://)",
            _ => "Check URL format and try again",
        }
        .to_string();

        DownloadError::InvalidUrl {
            url: "<unparseable>".to_string(),
            suggestion,
            source: error,
        }
    }
}
