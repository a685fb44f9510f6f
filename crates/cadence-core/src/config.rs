use crate::backend::BackendIdentity;
use crate::error::{CadenceError, Result};
use crate::session::LoginMethodKind;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub router: RouterConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub backends: BackendsConfig,
}

/// How the router orders backends when choosing one for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    #[default]
    Auto,
    PreferPrimary,
    PreferSecondary,
    PrimaryOnly,
    SecondaryOnly,
}

impl SelectionMode {
    /// Ordered candidate list. The secondary (API) backend is favored for
    /// throughput; the primary (browser) backend is the resilient fallback.
    pub fn candidates(&self) -> Vec<BackendIdentity> {
        match self {
            SelectionMode::PrimaryOnly => vec![BackendIdentity::Primary],
            SelectionMode::SecondaryOnly => vec![BackendIdentity::Secondary],
            SelectionMode::PreferPrimary => {
                vec![BackendIdentity::Primary, BackendIdentity::Secondary]
            }
            SelectionMode::PreferSecondary | SelectionMode::Auto => {
                vec![BackendIdentity::Secondary, BackendIdentity::Primary]
            }
        }
    }

    pub fn allows(&self, identity: BackendIdentity) -> bool {
        self.candidates().contains(&identity)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMode::Auto => "auto",
            SelectionMode::PreferPrimary => "prefer-primary",
            SelectionMode::PreferSecondary => "prefer-secondary",
            SelectionMode::PrimaryOnly => "primary-only",
            SelectionMode::SecondaryOnly => "secondary-only",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionMode {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        match normalized.as_str() {
            "auto" => Ok(SelectionMode::Auto),
            "prefer-primary" | "prefer-browser" => Ok(SelectionMode::PreferPrimary),
            "prefer-secondary" | "prefer-api" => Ok(SelectionMode::PreferSecondary),
            "primary-only" | "browser-only" => Ok(SelectionMode::PrimaryOnly),
            "secondary-only" | "api-only" => Ok(SelectionMode::SecondaryOnly),
            _ => Err(CadenceError::Config {
                message: format!(
                    "Unknown execution mode '{}' (expected auto, prefer-primary, prefer-secondary, primary-only or secondary-only)",
                    s
                ),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub mode: SelectionMode,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    /// Per-attempt budget inside `execute`.
    pub fallback_timeout_ms: u64,
    pub retry_attempts: u32,
    /// Consecutive failures after which a backend is marked unhealthy.
    pub failure_threshold: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: SelectionMode::Auto,
            health_check_interval_ms: 60_000,
            health_check_timeout_ms: 5_000,
            fallback_timeout_ms: 30_000,
            retry_attempts: 3,
            failure_threshold: 3,
            retry_backoff_base_ms: 500,
            retry_backoff_max_ms: 30_000,
        }
    }
}

impl RouterConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    /// Exponential delay for the given 1-based attempt, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .retry_backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: PathBuf,
    pub vault_file: String,
    pub cache_file: String,
    pub kdf_iterations: u32,
    /// Explicit vault passphrase. A machine-derived one is used when absent.
    pub passphrase: Option<String>,
    pub max_session_age_hours: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".storage"),
            vault_file: "session.vault".to_string(),
            cache_file: "session-cache.json".to_string(),
            kdf_iterations: 100_000,
            passphrase: None,
            max_session_age_hours: None,
        }
    }
}

impl StorageConfig {
    pub fn vault_path(&self) -> PathBuf {
        self.dir.join(&self.vault_file)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.dir.join(&self.cache_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub login_timeout_ms: u64,
    pub default_method: LoginMethodKind,
    pub login_url: String,
    /// The interactive flow is complete once the browser lands on a URL
    /// starting with this prefix.
    pub success_url_prefix: String,
    /// Cookie a session-token login installs.
    pub session_cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_timeout_ms: 120_000,
            default_method: LoginMethodKind::Interactive,
            login_url: "https://creators.example.com/login".to_string(),
            success_url_prefix: "https://creators.example.com/dashboard".to_string(),
            session_cookie_name: "session".to_string(),
        }
    }
}

impl AuthConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub api: ApiBackendConfig,
    pub browser: BrowserBackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiBackendConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for ApiBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://creators.example.com/api".to_string(),
            timeout_ms: 15_000,
            user_agent: format!("cadence/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserBackendConfig {
    pub webdriver_url: String,
    /// API root the in-page requests are sent to.
    pub base_url: String,
    /// Page opened after session start so in-page requests share its origin.
    pub home_url: String,
    pub headless: bool,
    pub timeout_ms: u64,
}

impl Default for BrowserBackendConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            base_url: "https://creators.example.com/api".to_string(),
            home_url: "https://creators.example.com/".to_string(),
            headless: true,
            timeout_ms: 30_000,
        }
    }
}

impl Config {
    pub async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let mut config = Self::read_file(&config_file).await?;
        config.load_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    async fn read_file(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            info!("No config file found, using defaults");
            return Ok(Self::default());
        }
        info!("Loading config from: {}", config_file.display());
        let content = tokio::fs::read_to_string(config_file).await?;
        toml::from_str(&content).map_err(|e| CadenceError::Config {
            message: format!("Failed to parse {}: {}", config_file.display(), e),
        })
    }

    /// Apply `edit` to the file contents only, so environment overrides and
    /// secrets supplied through the environment are never written back.
    /// Returns the path written.
    pub async fn update_file<F>(config_path: Option<&Path>, edit: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut Config),
    {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let mut config = Self::read_file(&config_file).await?;
        edit(&mut config);
        config.validate()?;

        let content = toml::to_string_pretty(&config).map_err(|e| CadenceError::Config {
            message: format!("Failed to serialize config: {}", e),
        })?;
        if let Some(parent) = config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&config_file, content).await?;
        info!("Saved config to: {}", config_file.display());
        Ok(config_file)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "cadence", "cadence").ok_or_else(|| CadenceError::Config {
                message: "Could not determine config directory".to_string(),
            })?;

        Ok(project_dirs.config_dir().join("config.toml"))
    }

    pub fn load_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("CADENCE_STORAGE_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }
        if let Ok(passphrase) = std::env::var("CADENCE_VAULT_PASSPHRASE") {
            self.storage.passphrase = Some(passphrase);
        }
        if let Ok(interval) = std::env::var("CADENCE_HEALTH_CHECK_INTERVAL_MS") {
            self.router.health_check_interval_ms = parse_env("CADENCE_HEALTH_CHECK_INTERVAL_MS", &interval)?;
        }
        if let Ok(attempts) = std::env::var("CADENCE_RETRY_ATTEMPTS") {
            self.router.retry_attempts = parse_env("CADENCE_RETRY_ATTEMPTS", &attempts)?;
        }
        if let Ok(timeout) = std::env::var("CADENCE_FALLBACK_TIMEOUT_MS") {
            self.router.fallback_timeout_ms = parse_env("CADENCE_FALLBACK_TIMEOUT_MS", &timeout)?;
        }
        if let Ok(mode) = std::env::var("CADENCE_EXECUTION_MODE") {
            self.router.mode = mode.parse()?;
        }
        if let Ok(base_url) = std::env::var("CADENCE_API_BASE_URL") {
            self.backends.api.base_url = base_url;
        }
        if let Ok(url) = std::env::var("CADENCE_WEBDRIVER_URL") {
            self.backends.browser.webdriver_url = url;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let router = &self.router;
        if router.retry_attempts == 0 {
            return Err(config_error("router.retry_attempts must be at least 1"));
        }
        if router.failure_threshold == 0 {
            return Err(config_error("router.failure_threshold must be at least 1"));
        }
        if router.health_check_interval_ms == 0
            || router.health_check_timeout_ms == 0
            || router.fallback_timeout_ms == 0
        {
            return Err(config_error("router intervals and timeouts must be non-zero"));
        }
        if self.storage.kdf_iterations == 0 {
            return Err(config_error("storage.kdf_iterations must be non-zero"));
        }
        if self.auth.login_timeout_ms == 0 {
            return Err(config_error("auth.login_timeout_ms must be non-zero"));
        }

        for (name, url) in [
            ("backends.api.base_url", &self.backends.api.base_url),
            ("backends.browser.base_url", &self.backends.browser.base_url),
            ("backends.browser.webdriver_url", &self.backends.browser.webdriver_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(config_error(&format!(
                    "{} must start with http:// or https://",
                    name
                )));
            }
        }

        Ok(())
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| CadenceError::Config {
        message: format!("{} has an invalid value '{}'", name, value),
    })
}

fn config_error(message: &str) -> CadenceError {
    CadenceError::Config {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tokio::fs;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.router.mode, SelectionMode::Auto);
        assert_eq!(config.router.health_check_interval_ms, 60_000);
        assert_eq!(config.router.retry_attempts, 3);
        assert_eq!(config.router.failure_threshold, 3);
        assert_eq!(config.storage.dir, PathBuf::from(".storage"));
        assert_eq!(config.auth.login_timeout_ms, 120_000);
        assert!(config.storage.passphrase.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_selection_mode_candidates() {
        use BackendIdentity::*;
        assert_eq!(SelectionMode::PrimaryOnly.candidates(), vec![Primary]);
        assert_eq!(SelectionMode::SecondaryOnly.candidates(), vec![Secondary]);
        assert_eq!(
            SelectionMode::PreferPrimary.candidates(),
            vec![Primary, Secondary]
        );
        assert_eq!(
            SelectionMode::PreferSecondary.candidates(),
            vec![Secondary, Primary]
        );
        assert_eq!(SelectionMode::Auto.candidates(), vec![Secondary, Primary]);
    }

    #[test]
    fn test_selection_mode_parsing() {
        assert_eq!(
            "prefer_primary".parse::<SelectionMode>().unwrap(),
            SelectionMode::PreferPrimary
        );
        assert_eq!(
            "API-ONLY".parse::<SelectionMode>().unwrap(),
            SelectionMode::SecondaryOnly
        );
        assert!(matches!(
            "fastest".parse::<SelectionMode>(),
            Err(CadenceError::Config { .. })
        ));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let router = RouterConfig {
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(router.backoff_for(1), Duration::from_millis(100));
        assert_eq!(router.backoff_for(2), Duration::from_millis(200));
        assert_eq!(router.backoff_for(3), Duration::from_millis(400));
        assert_eq!(router.backoff_for(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.router.retry_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut config = Config::default();
        config.backends.api.base_url = "creators.example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            [router]
            mode = "prefer-primary"
            retry_attempts = 5

            [storage]
            dir = "/tmp/cadence-test"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.router.mode, SelectionMode::PreferPrimary);
        assert_eq!(config.router.retry_attempts, 5);
        assert_eq!(config.router.failure_threshold, 3);
        assert_eq!(config.storage.dir, PathBuf::from("/tmp/cadence-test"));
        assert_eq!(config.storage.vault_file, "session.vault");
        assert_eq!(config.auth.login_timeout_ms, 120_000);
    }

    #[tokio::test]
    #[serial]
    async fn test_update_file_persists_mode_only() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, "[router]\nretry_attempts = 7\n").await.unwrap();

        env::set_var("CADENCE_VAULT_PASSPHRASE", "from-env");
        Config::update_file(Some(&path), |c| c.router.mode = SelectionMode::PrimaryOnly)
            .await
            .unwrap();
        env::remove_var("CADENCE_VAULT_PASSPHRASE");

        let written = fs::read_to_string(&path).await.unwrap();
        assert!(!written.contains("from-env"));
        let config = Config::load(Some(&path)).await.unwrap();
        assert_eq!(config.router.mode, SelectionMode::PrimaryOnly);
        assert_eq!(config.router.retry_attempts, 7);
    }

    #[tokio::test]
    #[serial]
    async fn test_load_with_nonexistent_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&temp_dir.path().join("missing.toml")))
            .await
            .unwrap();
        assert_eq!(config.router.retry_attempts, 3);
    }

    #[tokio::test]
    #[serial]
    async fn test_load_with_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        fs::write(&config_path, "router = {{{").await.unwrap();

        let result = Config::load(Some(&config_path)).await;
        assert!(matches!(result, Err(CadenceError::Config { .. })));
    }

    #[tokio::test]
    #[serial]
    async fn test_load_with_existing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
                [router]
                mode = "secondary-only"
                health_check_interval_ms = 1000

                [auth]
                default_method = "session_token"
            "#,
        )
        .await
        .unwrap();

        let config = Config::load(Some(&config_path)).await.unwrap();
        assert_eq!(config.router.mode, SelectionMode::SecondaryOnly);
        assert_eq!(config.router.health_check_interval_ms, 1000);
        assert_eq!(config.auth.default_method, LoginMethodKind::SessionToken);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var("CADENCE_STORAGE_DIR", "/tmp/cadence-env");
        env::set_var("CADENCE_RETRY_ATTEMPTS", "5");
        env::set_var("CADENCE_EXECUTION_MODE", "prefer-primary");
        env::set_var("CADENCE_FALLBACK_TIMEOUT_MS", "2500");

        let mut config = Config::default();
        let result = config.load_env_overrides();

        env::remove_var("CADENCE_STORAGE_DIR");
        env::remove_var("CADENCE_RETRY_ATTEMPTS");
        env::remove_var("CADENCE_EXECUTION_MODE");
        env::remove_var("CADENCE_FALLBACK_TIMEOUT_MS");

        result.unwrap();
        assert_eq!(config.storage.dir, PathBuf::from("/tmp/cadence-env"));
        assert_eq!(config.router.retry_attempts, 5);
        assert_eq!(config.router.mode, SelectionMode::PreferPrimary);
        assert_eq!(config.router.fallback_timeout_ms, 2500);
    }

    #[test]
    #[serial]
    fn test_env_override_rejects_garbage() {
        env::set_var("CADENCE_RETRY_ATTEMPTS", "many");
        let mut config = Config::default();
        let result = config.load_env_overrides();
        env::remove_var("CADENCE_RETRY_ATTEMPTS");

        assert!(matches!(result, Err(CadenceError::Config { .. })));
    }

    #[test]
    fn test_storage_paths() {
        let storage = StorageConfig::default();
        assert_eq!(storage.vault_path(), PathBuf::from(".storage/session.vault"));
        assert_eq!(
            storage.cache_path(),
            PathBuf::from(".storage/session-cache.json")
        );
    }
}
