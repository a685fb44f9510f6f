//! Logging and redaction settings, read from `telemetry.toml` next to the
//! main config and overridable through `CADENCE_LOG_*` variables.

use crate::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `false` silences every layer, including `RUST_LOG`-less defaults.
    pub enabled: bool,

    pub logging: LoggingConfig,

    pub privacy: PrivacyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    pub format: LogFormat,

    /// Console output goes to stderr; stdout is reserved for command output.
    pub console_enabled: bool,

    /// Daily-rolling file output under `log_dir`
    pub file_enabled: bool,

    pub log_dir: PathBuf,

    /// Base filename for logs; the date is appended on rotation
    pub log_file_name: String,

    /// Emit `file:line` with each event.
    pub include_location: bool,

    pub include_thread_ids: bool,
}

/// Privacy settings applied by [`crate::DataSanitizer`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub sanitize_enabled: bool,

    /// Regex patterns to redact. A first capture group is kept as the field
    /// name; everything else in the match is replaced.
    pub redaction_patterns: Vec<String>,

    /// JSON keys whose values are always redacted (case-insensitive substring)
    pub redacted_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(Error::Config {
                message: format!("Unknown log level '{}'", s),
            }),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level: Level = (*self).into();
        write!(f, "{}", level.as_str().to_lowercase())
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON format
    Json,
    /// Human-readable pretty format
    Pretty,
    /// Compact single-line format
    Compact,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(Error::Config {
                message: format!("Unknown log format '{}'", s),
            }),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            logging: LoggingConfig::default(),
            privacy: PrivacyConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let log_dir = project_dirs()
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|_| PathBuf::from("./logs"));

        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            console_enabled: true,
            file_enabled: false,
            log_dir,
            log_file_name: "cadence.log".to_string(),
            include_location: false,
            include_thread_ids: false,
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            sanitize_enabled: true,
            redaction_patterns: vec![
                // key=value / key: value credentials
                r#"(?i)\b(api_?key|access_?token|token|secret|password|session_?id|sid)\s*[:=]\s*['"]?[a-zA-Z0-9_\-\.~+/=%]+['"]?"#
                    .to_string(),
                // Cookie headers keep only the header name
                r"(?i)(cookie|set-cookie)\s*:\s*[^\r\n]+".to_string(),
                // Authorization headers and bearer tokens
                r"(?i)(authorization)\s*:\s*[^\r\n]+".to_string(),
                r"(?i)(bearer)\s+[a-zA-Z0-9_\-\.~+/=]+".to_string(),
            ],
            redacted_fields: vec![
                "password".to_string(),
                "secret".to_string(),
                "token".to_string(),
                "authorization".to_string(),
                "cookie".to_string(),
                "session_blob".to_string(),
            ],
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "cadence", "cadence").ok_or_else(|| Error::Config {
        message: "no home directory to place telemetry files under".to_string(),
    })
}

impl TelemetryConfig {
    /// Read `config_path`, or the per-user `telemetry.toml`, falling back to
    /// defaults when the file is missing. Environment overrides apply last.
    pub async fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => project_dirs()?.config_dir().join("telemetry.toml"),
        };

        let mut config: Self = match tokio::fs::read_to_string(&path).await {
            Ok(text) => toml::from_str(&text).map_err(|e| Error::Config {
                message: format!("{}: {}", path.display(), e),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.load_env_overrides();
        Ok(config)
    }

    /// Load environment variable overrides. Unparseable values keep the
    /// current setting.
    pub fn load_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("CADENCE_LOG_LEVEL") {
            self.logging.level = level.parse().unwrap_or(self.logging.level);
        }

        if let Ok(format) = std::env::var("CADENCE_LOG_FORMAT") {
            self.logging.format = format.parse().unwrap_or(self.logging.format);
        }

        if let Ok(enabled) = std::env::var("CADENCE_FILE_LOGGING") {
            self.logging.file_enabled = enabled.parse().unwrap_or(self.logging.file_enabled);
        }

        if let Ok(dir) = std::env::var("CADENCE_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.logging.file_enabled {
            std::fs::create_dir_all(&self.logging.log_dir)?;
        }

        if self.logging.log_file_name.trim().is_empty() {
            return Err(Error::Config {
                message: "log_file_name must not be empty".to_string(),
            });
        }

        for pattern in &self.privacy.redaction_patterns {
            regex::Regex::new(pattern).map_err(|e| Error::Config {
                message: format!("Invalid redaction pattern '{}': {}", pattern, e),
            })?;
        }

        Ok(())
    }
}
