//! Browser-driven backend.
//!
//! Data calls run as `fetch` requests inside the automated page, so they
//! carry whatever cookies the browser holds for the platform origin. This
//! backend also owns the interactive login flow.

use crate::api::endpoint_url;
use crate::error::{parse_retry_after_value, BackendError, Result};
use crate::state::{Cookie, SessionState};
use crate::wire::{ListResponse, MeResponse, PublishResponse};
use async_trait::async_trait;
use cadence_core::config::{AuthConfig, BrowserBackendConfig};
use cadence_core::{
    Authenticator, Backend, BackendIdentity, CadenceError, ErrorKind, HealthCheckResult,
    LoginMethod, LoginMethodKind, LoginOutcome, OperationResult, PublishOptions, PublishOutcome,
    Resource, Show, UserIdentity,
};
use cadence_telemetry::DataSanitizer;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const LOGIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runs inside the page. The last argument is the WebDriver completion
/// callback.
const FETCH_SCRIPT: &str = r#"
const [url, method, body, done] = arguments;
const init = {
  method,
  credentials: 'include',
  headers: { 'Accept': 'application/json', 'Content-Type': 'application/json' },
};
if (body !== null) { init.body = JSON.stringify(body); }
fetch(url, init)
  .then(async (r) => done({ status: r.status, retryAfter: r.headers.get('Retry-After'), body: await r.text() }))
  .catch((e) => done({ status: 0, error: String(e) }));
"#;

/// The minimal browser surface the backend needs. `WebDriverClient` is the
/// production implementation.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn navigate(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// Run an asynchronous script; it must call its last argument with the
    /// result.
    async fn execute_async(&self, script: &str, args: Vec<Value>) -> Result<Value>;

    async fn cookies(&self) -> Result<Vec<Cookie>>;

    async fn add_cookie(&self, cookie: &Cookie) -> Result<()>;

    async fn delete_cookies(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct FetchReply {
    status: u16,
    #[serde(default, rename = "retryAfter")]
    retry_after: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct BrowserBackend {
    config: BrowserBackendConfig,
    auth: AuthConfig,
    driver: Arc<dyn BrowserDriver>,
    initialized: AtomicBool,
    lifecycle: Mutex<()>,
    logged_in: AtomicBool,
    /// Session handed over before the browser was started.
    pending: Mutex<Option<SessionState>>,
    sanitizer: DataSanitizer,
}

impl BrowserBackend {
    pub fn new(
        config: BrowserBackendConfig,
        auth: AuthConfig,
        driver: Arc<dyn BrowserDriver>,
    ) -> Self {
        Self {
            config,
            auth,
            driver,
            initialized: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            logged_in: AtomicBool::new(false),
            pending: Mutex::new(None),
            sanitizer: DataSanitizer::default(),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: DataSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::NotInitialized {
                backend: BackendIdentity::Primary.transport().to_string(),
            })
        }
    }

    /// Run one in-page request and return the response body.
    #[instrument(skip(self, body), fields(backend = "browser"))]
    async fn fetch(
        &self,
        method: &str,
        segments: &[&str],
        body: Option<Value>,
        operation: &str,
    ) -> Result<String> {
        self.ensure_initialized()?;
        let url = endpoint_url(&self.config.base_url, segments)?;
        debug!(method, path = url.path(), "Running in-page request");

        let args = vec![
            json!(url.as_str()),
            json!(method),
            body.unwrap_or(Value::Null),
        ];
        let raw = tokio::time::timeout(
            Duration::from_millis(self.config.timeout_ms),
            self.driver.execute_async(FETCH_SCRIPT, args),
        )
        .await
        .map_err(|_| BackendError::Timeout {
            operation: operation.to_string(),
            timeout_ms: self.config.timeout_ms,
        })??;

        let reply: FetchReply = serde_json::from_value(raw)?;
        let body = reply.body.unwrap_or_default();
        match reply.status {
            0 => Err(BackendError::Network {
                operation: operation.to_string(),
                message: reply
                    .error
                    .map(|e| self.sanitizer.sanitize_text(&e))
                    .unwrap_or_else(|| "request did not complete".to_string()),
            }),
            200..=299 => Ok(body),
            status => {
                let retry_after_ms = reply.retry_after.as_deref().and_then(parse_retry_after_value);
                let err = BackendError::from_status(status, &body, retry_after_ms, &self.sanitizer);
                warn!(status, retry_after_ms = ?retry_after_ms, error = %err, "In-page request failed");
                Err(err)
            }
        }
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        method: &str,
        segments: &[&str],
        body: Option<Value>,
        operation: &str,
    ) -> Result<T> {
        let text = self.fetch(method, segments, body, operation).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn install(&self, state: &SessionState) -> Result<()> {
        for cookie in &state.cookies {
            self.driver.add_cookie(cookie).await?;
        }
        if let Some(token) = &state.token {
            self.driver
                .add_cookie(&Cookie::new(self.auth.session_cookie_name.clone(), token.clone()))
                .await?;
        }
        self.logged_in.store(!state.is_empty(), Ordering::SeqCst);
        debug!(
            cookies = state.cookies.len(),
            has_token = state.token.is_some(),
            "Installed session in browser"
        );
        Ok(())
    }

    async fn export_state(&self) -> Result<SessionState> {
        Ok(SessionState {
            cookies: self.driver.cookies().await?,
            token: None,
        })
    }

    async fn publish_inner(
        &self,
        resource_id: &str,
        options: &PublishOptions,
    ) -> Result<PublishOutcome> {
        let body = serde_json::to_value(options)?;
        let reply: PublishResponse = self
            .fetch_json(
                "POST",
                &["resources", resource_id, "publish"],
                Some(body),
                "publish_one",
            )
            .await?;
        Ok(reply.into_outcome(resource_id))
    }

    async fn wait_for_login_redirect(&self) -> Result<String> {
        loop {
            let url = self.driver.current_url().await?;
            if url.starts_with(&self.auth.success_url_prefix) {
                return Ok(url);
            }
            tokio::time::sleep(LOGIN_POLL_INTERVAL).await;
        }
    }

    async fn interactive_login(&self) -> cadence_core::Result<LoginOutcome> {
        Backend::initialize(self).await?;
        self.driver.navigate(&self.auth.login_url).await?;
        info!(login_url = %self.auth.login_url, "Waiting for login to complete in the browser");

        let timeout = self.auth.login_timeout();
        match tokio::time::timeout(timeout, self.wait_for_login_redirect()).await {
            Ok(landed) => {
                let landed = landed?;
                debug!(url = %landed, "Login redirect observed");
            }
            Err(_) => {
                return Ok(LoginOutcome::failed(format!(
                    "Interactive login did not complete within {}ms",
                    timeout.as_millis()
                )))
            }
        }

        let state = self.export_state().await?;
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(LoginOutcome::succeeded(state.to_value()))
    }

    async fn token_login(&self, token: &str) -> cadence_core::Result<LoginOutcome> {
        Backend::initialize(self).await?;
        self.driver
            .add_cookie(&Cookie::new(
                self.auth.session_cookie_name.clone(),
                token.to_string(),
            ))
            .await?;

        match self.fetch("GET", &["me"], None, "verify_token").await {
            Ok(_) => {
                let state = self.export_state().await?;
                self.logged_in.store(true, Ordering::SeqCst);
                Ok(LoginOutcome::succeeded(state.to_value()))
            }
            Err(e) if e.kind().requires_reauthentication() => {
                if let Err(clear) = self.driver.delete_cookies().await {
                    warn!(error = %clear, "Failed to drop rejected session cookie");
                }
                Ok(LoginOutcome::failed(format!("Session token was rejected: {}", e)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Backend for BrowserBackend {
    fn identity(&self) -> BackendIdentity {
        BackendIdentity::Primary
    }

    async fn initialize(&self) -> cadence_core::Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.driver.start().await?;
        if let Err(e) = self.driver.navigate(&self.config.home_url).await {
            if let Err(close) = self.driver.close().await {
                warn!(error = %close, "Failed to close browser after start-up error");
            }
            return Err(e.into());
        }
        self.initialized.store(true, Ordering::SeqCst);

        if let Some(state) = self.pending.lock().await.take() {
            self.install(&state).await?;
        }

        info!(
            webdriver_url = %self.config.webdriver_url,
            headless = self.config.headless,
            "Browser backend initialized"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let result = self.fetch("GET", &["health"], None, "health_check").await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(_) => HealthCheckResult::healthy(latency_ms),
            Err(e) => HealthCheckResult::unhealthy(latency_ms, e.to_string()),
        }
    }

    async fn dispose(&self) -> cadence_core::Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.logged_in.store(false, Ordering::SeqCst);

        if let Err(e) = self.driver.close().await {
            warn!(error = %e, "Browser did not close cleanly");
        } else {
            debug!("Browser backend disposed");
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn list_shows(&self) -> OperationResult<Vec<Show>> {
        self.fetch_json::<ListResponse<Show>>("GET", &["shows"], None, "list_shows")
            .await
            .map(ListResponse::into_vec)
            .map_err(CadenceError::from)
            .into()
    }

    async fn list_resources(&self, show_id: &str) -> OperationResult<Vec<Resource>> {
        self.fetch_json::<ListResponse<Resource>>(
            "GET",
            &["shows", show_id, "resources"],
            None,
            "list_resources",
        )
        .await
        .map(ListResponse::into_vec)
        .map_err(CadenceError::from)
        .into()
    }

    async fn publish_one(
        &self,
        resource_id: &str,
        options: &PublishOptions,
    ) -> OperationResult<PublishOutcome> {
        match self.publish_inner(resource_id, options).await {
            Ok(outcome) if outcome.success => OperationResult::ok(outcome),
            Ok(outcome) => {
                let message = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "publish rejected".to_string());
                OperationResult::partial(outcome, ErrorKind::Unknown, message)
            }
            Err(e) => OperationResult::from_error(&CadenceError::from(e)),
        }
    }

    async fn restore_session(&self, state: &Value) -> cadence_core::Result<()> {
        let parsed = SessionState::from_value(state)?;
        if self.initialized.load(Ordering::SeqCst) {
            self.install(&parsed).await?;
        } else {
            self.logged_in.store(!parsed.is_empty(), Ordering::SeqCst);
            *self.pending.lock().await = Some(parsed);
        }
        Ok(())
    }

    async fn clear_session(&self) -> cadence_core::Result<()> {
        *self.pending.lock().await = None;
        self.logged_in.store(false, Ordering::SeqCst);
        if self.initialized.load(Ordering::SeqCst) {
            self.driver.delete_cookies().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Authenticator for BrowserBackend {
    fn name(&self) -> &str {
        "browser"
    }

    fn supported_methods(&self) -> Vec<LoginMethodKind> {
        vec![LoginMethodKind::Interactive, LoginMethodKind::SessionToken]
    }

    #[instrument(skip(self), fields(backend = "browser"))]
    async fn login(&self, method: &LoginMethod) -> cadence_core::Result<LoginOutcome> {
        match method {
            LoginMethod::Interactive => self.interactive_login().await,
            LoginMethod::SessionToken { token } => self.token_login(token).await,
            LoginMethod::Credentials { .. } => Err(CadenceError::UnsupportedLoginMethod {
                method: LoginMethodKind::Credentials.to_string(),
                backend: self.name().to_string(),
            }),
        }
    }

    async fn extract_identity(&self) -> cadence_core::Result<UserIdentity> {
        let me: MeResponse = self.fetch_json("GET", &["me"], None, "extract_identity").await?;
        Ok(me.into())
    }

    async fn export_session(&self) -> cadence_core::Result<Option<Value>> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Ok(self.pending.lock().await.as_ref().map(SessionState::to_value));
        }
        let state = self.export_state().await?;
        Ok((!state.is_empty()).then(|| state.to_value()))
    }

    async fn has_live_session(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn logout(&self) -> cadence_core::Result<()> {
        Backend::clear_session(self).await
    }
}
