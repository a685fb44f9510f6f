//! # Cadence Telemetry
//!
//! Logging bootstrap for Cadence binaries and the sanitizer backends use to
//! keep credentials out of log lines and error messages.
//!
//! ```rust,no_run
//! use cadence_telemetry::{TelemetryConfig, TelemetrySystem};
//!
//! # fn main() -> cadence_telemetry::Result<()> {
//! let _guard = TelemetrySystem::init(TelemetryConfig::default())?;
//! tracing::info!("Application started");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod sanitization;
pub mod system;

pub use config::{LogFormat, LogLevel, LoggingConfig, PrivacyConfig, TelemetryConfig};
pub use sanitization::DataSanitizer;
pub use system::{TelemetryGuard, TelemetrySystem};

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Telemetry-specific errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Telemetry system error: {message}")]
    System { message: String },
}
