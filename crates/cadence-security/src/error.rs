use cadence_core::CadenceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vault payload is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Vault record is corrupted or the passphrase is wrong")]
    IntegrityCheckFailed,

    #[error("Vault record is truncated ({len} bytes)")]
    Truncated { len: usize },

    #[error("Vault file encoding is invalid: {message}")]
    Encoding { message: String },

    #[error("Unsupported vault payload version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Stored session is {age_hours}h old, older than the {max_hours}h limit")]
    Expired { age_hours: i64, max_hours: u64 },

    #[error("Cryptographic failure: {message}")]
    Crypto { message: String },

    #[error("Vault configuration error: {message}")]
    Config { message: String },
}

impl VaultError {
    /// Failures that mean "the stored record cannot be trusted". Such
    /// records are purged and treated as absent.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            VaultError::IntegrityCheckFailed
                | VaultError::Truncated { .. }
                | VaultError::Encoding { .. }
                | VaultError::VersionMismatch { .. }
                | VaultError::Serialization(_)
        )
    }
}

impl From<VaultError> for CadenceError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Io(e) => CadenceError::Io(e),
            VaultError::Expired { .. } => CadenceError::SessionExpired {
                message: err.to_string(),
            },
            VaultError::Config { message } => CadenceError::Config { message },
            other if other.is_integrity_failure() => CadenceError::IntegrityCheckFailed {
                message: other.to_string(),
            },
            other => CadenceError::Unknown {
                message: other.to_string(),
            },
        }
    }
}
