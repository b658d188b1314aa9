//! Error taxonomy shared by every pipeline stage

use std::time::Duration;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error types for pipeline operations
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Bad input, oversize file, unsupported format. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Timeout, rate limit or 5xx from a remote backend.
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Remote backend rejected the request for a reason retrying will not fix.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    /// Transcoder or probe failure.
    #[error("Media processing failed: {0}")]
    Media(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The worker no longer owns the job lease.
    #[error("Lease lost for job {0}")]
    LeaseLost(String),

    /// Another worker started this video recently; the attempt backs off.
    #[error("Video {0} is already being processed by another worker")]
    DuplicateInFlight(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether a call site should retry the same remote call.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient(_) | PipelineError::Timeout(..))
    }

    /// Whether the queue should schedule another attempt of the whole job.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PipelineError::Validation(_))
    }

    /// Classify a non-success HTTP status from a remote backend.
    pub fn from_status(backend: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("{} returned {}: {}", backend, status, truncate(body, 300));
        if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            PipelineError::Transient(message)
        } else {
            PipelineError::Backend(message)
        }
    }

    /// Classify a transport-level reqwest failure.
    pub fn from_reqwest(backend: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            PipelineError::Transient(format!("{}: {}", backend, err))
        } else if err.is_decode() {
            PipelineError::Backend(format!("{} sent an unreadable response: {}", backend, err))
        } else if let Some(status) = err.status() {
            Self::from_status(backend, status, &err.to_string())
        } else {
            PipelineError::Transient(format!("{}: {}", backend, err))
        }
    }
}

/// Cut a message to at most `max_chars` characters on a char boundary.
pub fn truncate(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &message[..byte_idx]),
        None => message.to_string(),
    }
}
