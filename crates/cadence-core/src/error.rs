use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CadenceError>;

/// Classification of every failure that can cross a crate boundary.
///
/// Callers decide between re-authenticating, waiting and abandoning an
/// operation by looking at the kind rather than at the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthRequired,
    AuthFailed,
    SessionExpired,
    SessionInvalid,
    Network,
    Timeout,
    RateLimited,
    BackendUnavailable,
    ContractViolation,
    IntegrityCheckFailed,
    Unknown,
}

impl ErrorKind {
    /// Transient failures worth another attempt, possibly on another backend.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::BackendUnavailable
        )
    }

    /// Failures that require the caller to log in again.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            ErrorKind::AuthRequired
                | ErrorKind::AuthFailed
                | ErrorKind::SessionExpired
                | ErrorKind::SessionInvalid
        )
    }

    /// Programming errors. Never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::ContractViolation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthRequired => "auth_required",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::SessionInvalid => "session_invalid",
            ErrorKind::Network => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::ContractViolation => "contract_violation",
            ErrorKind::IntegrityCheckFailed => "integrity_check_failed",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Authentication required: {message}")]
    AuthRequired { message: String },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("Login method '{method}' is not supported by the {backend} backend")]
    UnsupportedLoginMethod { method: String, backend: String },

    #[error("Session expired: {message}")]
    SessionExpired { message: String },

    #[error("Session invalid: {message}")]
    SessionInvalid { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Operation '{operation}' timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Rate limited: {message}, retry after: {retry_after_ms:?}ms")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Backend '{backend}' unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    #[error("Backend '{backend}' is not healthy")]
    BackendNotHealthy { backend: String },

    #[error("Contract violation: {message}")]
    ContractViolation { message: String },

    #[error("Integrity check failed: {message}")]
    IntegrityCheckFailed { message: String },

    #[error("All {attempts} attempts failed, last on {backend}: {last}")]
    RetriesExhausted {
        attempts: u32,
        backend: String,
        #[source]
        last: Box<CadenceError>,
    },

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

impl CadenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CadenceError::Io(_) => ErrorKind::Unknown,
            CadenceError::Serialization(_) => ErrorKind::Unknown,
            CadenceError::Config { .. } => ErrorKind::ContractViolation,
            CadenceError::AuthRequired { .. } => ErrorKind::AuthRequired,
            CadenceError::AuthFailed { .. } => ErrorKind::AuthFailed,
            CadenceError::UnsupportedLoginMethod { .. } => ErrorKind::AuthFailed,
            CadenceError::SessionExpired { .. } => ErrorKind::SessionExpired,
            CadenceError::SessionInvalid { .. } => ErrorKind::SessionInvalid,
            CadenceError::Network { .. } => ErrorKind::Network,
            CadenceError::Timeout { .. } => ErrorKind::Timeout,
            CadenceError::RateLimited { .. } => ErrorKind::RateLimited,
            CadenceError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            CadenceError::BackendNotHealthy { .. } => ErrorKind::BackendUnavailable,
            CadenceError::ContractViolation { .. } => ErrorKind::ContractViolation,
            CadenceError::IntegrityCheckFailed { .. } => ErrorKind::IntegrityCheckFailed,
            CadenceError::RetriesExhausted { last, .. } => last.kind(),
            CadenceError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Server-specified delay before the next attempt, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            CadenceError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            CadenceError::RetriesExhausted { last, .. } => last.retry_after_ms(),
            _ => None,
        }
    }

    /// Rebuild an error from a kind and message, e.g. from an `OperationResult`.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::AuthRequired => CadenceError::AuthRequired { message },
            ErrorKind::AuthFailed => CadenceError::AuthFailed { message },
            ErrorKind::SessionExpired => CadenceError::SessionExpired { message },
            ErrorKind::SessionInvalid => CadenceError::SessionInvalid { message },
            ErrorKind::Network => CadenceError::Network { message },
            ErrorKind::Timeout => CadenceError::Timeout {
                operation: message,
                duration_ms: 0,
            },
            ErrorKind::RateLimited => CadenceError::RateLimited {
                message,
                retry_after_ms: None,
            },
            ErrorKind::BackendUnavailable => CadenceError::BackendUnavailable {
                backend: "unknown".to_string(),
                message,
            },
            ErrorKind::ContractViolation => CadenceError::ContractViolation { message },
            ErrorKind::IntegrityCheckFailed => CadenceError::IntegrityCheckFailed { message },
            ErrorKind::Unknown => CadenceError::Unknown { message },
        }
    }

    pub fn not_initialized(backend: impl fmt::Display) -> Self {
        CadenceError::ContractViolation {
            message: format!("{} backend used before initialize()", backend),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::BackendUnavailable.is_retryable());
        assert!(!ErrorKind::ContractViolation.is_retryable());
        assert!(!ErrorKind::AuthRequired.is_retryable());
        assert!(!ErrorKind::IntegrityCheckFailed.is_retryable());
    }

    #[test]
    fn test_exhausted_error_reports_last_kind() {
        let err = CadenceError::RetriesExhausted {
            attempts: 3,
            backend: "api".to_string(),
            last: Box::new(CadenceError::RateLimited {
                message: "slow down".to_string(),
                retry_after_ms: Some(1500),
            }),
        };

        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after_ms(), Some(1500));
        assert!(err.to_string().contains("slow down"));
    }

    #[test]
    fn test_from_kind_round_trips_kind() {
        let kinds = [
            ErrorKind::AuthRequired,
            ErrorKind::SessionExpired,
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::RateLimited,
            ErrorKind::BackendUnavailable,
            ErrorKind::ContractViolation,
            ErrorKind::Unknown,
        ];
        for kind in kinds {
            assert_eq!(CadenceError::from_kind(kind, "x").kind(), kind);
        }
    }

    #[test]
    fn test_not_initialized_is_fatal() {
        let err = CadenceError::not_initialized("api");
        assert!(err.kind().is_fatal());
        assert!(err.to_string().contains("initialize"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
    }
}
