use cadence_core::{CadenceError, ErrorKind};
use cadence_telemetry::DataSanitizer;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use thiserror::Error;

const MAX_ERROR_BODY_CHARS: usize = 300;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP error during {operation}: {source}")]
    Http {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Network error during {operation}: {message}")]
    Network { operation: String, message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebDriver command '{command}' failed: {message}")]
    WebDriver { command: String, message: String },

    #[error("In-page script failed: {message}")]
    Script { message: String },

    #[error("{backend} backend used before initialize()")]
    NotInitialized { backend: String },

    #[error("Invalid session state: {message}")]
    InvalidSession { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Network timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
}

impl BackendError {
    pub fn http(operation: impl Into<String>, source: reqwest::Error) -> Self {
        BackendError::Http {
            operation: operation.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Http { source, .. } => classify_reqwest(source),
            BackendError::Status { status, .. } => classify_status(*status),
            BackendError::Network { .. } => ErrorKind::Network,
            BackendError::Json(_) => ErrorKind::Unknown,
            BackendError::WebDriver { .. } => ErrorKind::BackendUnavailable,
            BackendError::Script { .. } => ErrorKind::Unknown,
            BackendError::NotInitialized { .. } => ErrorKind::ContractViolation,
            BackendError::InvalidSession { .. } => ErrorKind::SessionInvalid,
            BackendError::Configuration { .. } => ErrorKind::ContractViolation,
            BackendError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Build a `Status` error from a non-2xx reply. The body is truncated
    /// and scrubbed before it becomes part of the message.
    pub fn from_status(
        status: u16,
        body: &str,
        retry_after_ms: Option<u64>,
        sanitizer: &DataSanitizer,
    ) -> Self {
        let body: String = body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
        let message = if body.is_empty() {
            format!("request failed with status {}", status)
        } else {
            sanitizer.sanitize_text(&body)
        };
        BackendError::Status {
            status,
            message,
            retry_after_ms,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            BackendError::Status { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// Map an HTTP status code onto the error taxonomy.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::SessionExpired,
        403 => ErrorKind::AuthRequired,
        408 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::BackendUnavailable,
        _ => ErrorKind::Unknown,
    }
}

fn classify_reqwest(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() || err.is_request() {
        ErrorKind::Network
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16())
    } else {
        ErrorKind::Unknown
    }
}

/// `Retry-After` in delta-seconds, converted to milliseconds. HTTP-date
/// values are ignored and the caller falls back to its own backoff.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    parse_retry_after_value(headers.get(RETRY_AFTER)?.to_str().ok()?)
}

pub fn parse_retry_after_value(value: &str) -> Option<u64> {
    let seconds = value.trim().parse::<f64>().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some((seconds * 1000.0) as u64)
    } else {
        None
    }
}

impl From<BackendError> for CadenceError {
    fn from(err: BackendError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        match (kind, err) {
            (ErrorKind::RateLimited, err) => CadenceError::RateLimited {
                message,
                retry_after_ms: err.retry_after_ms(),
            },
            (ErrorKind::Timeout, BackendError::Timeout { operation, timeout_ms }) => {
                CadenceError::Timeout {
                    operation,
                    duration_ms: timeout_ms,
                }
            }
            (ErrorKind::ContractViolation, _) => CadenceError::ContractViolation { message },
            (kind, _) => CadenceError::from_kind(kind, message),
        }
    }
}
