use crate::error::{parse_retry_after, BackendError, Result};
use crate::state::SessionState;
use crate::wire::{ListResponse, PublishResponse};
use async_trait::async_trait;
use cadence_core::config::ApiBackendConfig;
use cadence_core::{
    Backend, BackendIdentity, CadenceError, HealthCheckResult, OperationResult, PublishOptions,
    PublishOutcome, Resource, Show,
};
use cadence_telemetry::DataSanitizer;
use reqwest::{header, Client, Method, Response, Url};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Join path segments onto `base`, percent-encoding each segment.
pub(crate) fn endpoint_url(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base).map_err(|e| BackendError::Configuration {
        message: format!("Invalid base URL '{}': {}", base, e),
    })?;
    url.path_segments_mut()
        .map_err(|_| BackendError::Configuration {
            message: format!("Base URL '{}' cannot carry a path", base),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Direct-API backend: JSON over HTTP, authenticated with the cookies or
/// bearer token from the stored session.
pub struct ApiBackend {
    config: ApiBackendConfig,
    client: RwLock<Option<Client>>,
    session: RwLock<SessionState>,
    initialized: AtomicBool,
    sanitizer: DataSanitizer,
}

impl ApiBackend {
    pub fn new(config: ApiBackendConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            session: RwLock::new(SessionState::default()),
            initialized: AtomicBool::new(false),
            sanitizer: DataSanitizer::default(),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: DataSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    fn build_client(&self) -> Result<Client> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        Client::builder()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .connect_timeout(Duration::from_millis(self.config.timeout_ms))
            .user_agent(self.config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| BackendError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })
    }

    async fn client(&self) -> Result<Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| BackendError::NotInitialized {
                backend: BackendIdentity::Secondary.transport().to_string(),
            })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        endpoint_url(&self.config.base_url, segments)
    }

    #[instrument(skip(self, body), fields(backend = "api"))]
    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<serde_json::Value>,
        operation: &str,
    ) -> Result<Response> {
        let client = self.client().await?;
        let url = self.endpoint(segments)?;
        debug!(%method, path = url.path(), "Sending API request");

        let mut request = client.request(method, url);
        {
            let session = self.session.read().await;
            if let Some(cookies) = session.cookie_header() {
                request = request.header(header::COOKIE, cookies);
            }
            if let Some(token) = &session.token {
                request = request.bearer_auth(token);
            }
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::http(operation, e))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(self.error_from_response(response).await)
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<serde_json::Value>,
        operation: &str,
    ) -> Result<T> {
        self.send(method, segments, body, operation)
            .await?
            .json::<T>()
            .await
            .map_err(|e| BackendError::http(operation, e))
    }

    async fn error_from_response(&self, response: Response) -> BackendError {
        let status = response.status().as_u16();
        let retry_after_ms = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let err = BackendError::from_status(status, &body, retry_after_ms, &self.sanitizer);

        warn!(status, retry_after_ms = ?retry_after_ms, error = %err, "API request failed");
        err
    }

    async fn publish_inner(
        &self,
        resource_id: &str,
        options: &PublishOptions,
    ) -> Result<PublishOutcome> {
        let body = serde_json::to_value(options)?;
        let response: PublishResponse = self
            .request(
                Method::POST,
                &["resources", resource_id, "publish"],
                Some(body),
                "publish_one",
            )
            .await?;
        Ok(response.into_outcome(resource_id))
    }
}

#[async_trait]
impl Backend for ApiBackend {
    fn identity(&self) -> BackendIdentity {
        BackendIdentity::Secondary
    }

    async fn initialize(&self) -> cadence_core::Result<()> {
        let mut client = self.client.write().await;
        if client.is_some() {
            return Ok(());
        }
        *client = Some(self.build_client()?);
        self.initialized.store(true, Ordering::SeqCst);
        info!(base_url = %self.config.base_url, "API backend initialized");
        Ok(())
    }

    async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let result = self
            .send(Method::GET, &["health"], None, "health_check")
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(_) => HealthCheckResult::healthy(latency_ms),
            Err(e) => HealthCheckResult::unhealthy(latency_ms, e.to_string()),
        }
    }

    async fn dispose(&self) -> cadence_core::Result<()> {
        let previous = self.client.write().await.take();
        self.initialized.store(false, Ordering::SeqCst);
        if previous.is_some() {
            debug!("API backend disposed");
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn list_shows(&self) -> OperationResult<Vec<Show>> {
        let result = self
            .request::<ListResponse<Show>>(Method::GET, &["shows"], None, "list_shows")
            .await
            .map(ListResponse::into_vec)
            .map_err(CadenceError::from);
        result.into()
    }

    async fn list_resources(&self, show_id: &str) -> OperationResult<Vec<Resource>> {
        let result = self
            .request::<ListResponse<Resource>>(
                Method::GET,
                &["shows", show_id, "resources"],
                None,
                "list_resources",
            )
            .await
            .map(ListResponse::into_vec)
            .map_err(CadenceError::from);
        result.into()
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
                OperationResult::partial(outcome, cadence_core::ErrorKind::Unknown, message)
            }
            Err(e) => OperationResult::from_error(&CadenceError::from(e)),
        }
    }

    async fn restore_session(&self, state: &serde_json::Value) -> cadence_core::Result<()> {
        let parsed = SessionState::from_value(state)?;
        debug!(
            cookies = parsed.cookies.len(),
            has_token = parsed.token.is_some(),
            "Installing session on API backend"
        );
        *self.session.write().await = parsed;
        Ok(())
    }

    async fn clear_session(&self) -> cadence_core::Result<()> {
        *self.session.write().await = SessionState::default();
        Ok(())
    }
}
