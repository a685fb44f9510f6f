//! In-memory backend and authenticator.
//!
//! Used by tests to script failures and by the CLI's `--offline` mode so
//! the routing and session layers can be exercised without a browser or
//! network.

use async_trait::async_trait;
use cadence_core::{
    Authenticator, Backend, BackendIdentity, CadenceError, ErrorKind, HealthCheckResult,
    LoginMethod, LoginMethodKind, LoginOutcome, OperationResult, PublishOptions, PublishOutcome,
    Resource, ResourceStatus, Show, UserIdentity,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct ScriptedFailure {
    kind: ErrorKind,
    retry_after_ms: Option<u64>,
}

impl ScriptedFailure {
    fn into_result<T>(self, backend: BackendIdentity) -> OperationResult<T> {
        let message = format!("scripted {} failure on mock {}", self.kind, backend);
        let mut result = OperationResult::failure(self.kind, message);
        result.retry_after_ms = self.retry_after_ms;
        result
    }
}

#[derive(Default)]
struct MockState {
    healthy: bool,
    init_failure: Option<ErrorKind>,
    queued: VecDeque<ScriptedFailure>,
    always: Option<ScriptedFailure>,
    failing_resources: HashSet<String>,
    shows: Vec<Show>,
    resources: HashMap<String, Vec<Resource>>,
    restored: Vec<Value>,
    session: Option<Value>,
}

/// Scriptable backend. Healthy and empty by default.
pub struct MockBackend {
    identity: BackendIdentity,
    latency: Option<Duration>,
    initialized: AtomicBool,
    state: Mutex<MockState>,
    operation_calls: AtomicUsize,
    health_checks: AtomicUsize,
    initialize_calls: AtomicUsize,
    dispose_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new(identity: BackendIdentity) -> Self {
        Self {
            identity,
            latency: None,
            initialized: AtomicBool::new(false),
            state: Mutex::new(MockState {
                healthy: true,
                ..Default::default()
            }),
            operation_calls: AtomicUsize::new(0),
            health_checks: AtomicUsize::new(0),
            initialize_calls: AtomicUsize::new(0),
            dispose_calls: AtomicUsize::new(0),
        }
    }

    /// A backend preloaded with a couple of shows and draft resources.
    pub fn with_sample_data(identity: BackendIdentity) -> Self {
        let mock = Self::new(identity);
        mock.add_show(Show {
            id: "show-1".to_string(),
            title: "Morning Notes".to_string(),
            description: Some("Daily short-form episodes".to_string()),
            resource_count: Some(2),
        });
        mock.add_show(Show {
            id: "show-2".to_string(),
            title: "Deep Dives".to_string(),
            description: None,
            resource_count: Some(1),
        });
        for (show_id, id, title, status) in [
            ("show-1", "res-1", "Episode 1", ResourceStatus::Published),
            ("show-1", "res-2", "Episode 2", ResourceStatus::Draft),
            ("show-2", "res-3", "Pilot", ResourceStatus::Draft),
        ] {
            mock.add_resource(Resource {
                id: id.to_string(),
                show_id: show_id.to_string(),
                title: title.to_string(),
                status,
                updated_at: None,
            });
        }
        mock
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state().healthy = healthy;
    }

    /// Fail the next data operation with `kind`. Calls queue up.
    pub fn fail_next(&self, kind: ErrorKind) {
        self.state().queued.push_back(ScriptedFailure {
            kind,
            retry_after_ms: None,
        });
    }

    pub fn fail_next_rate_limited(&self, retry_after_ms: Option<u64>) {
        self.state().queued.push_back(ScriptedFailure {
            kind: ErrorKind::RateLimited,
            retry_after_ms,
        });
    }

    /// Fail every data operation with `kind` until reset with `None`.
    pub fn fail_always(&self, kind: Option<ErrorKind>) {
        self.state().always = kind.map(|kind| ScriptedFailure {
            kind,
            retry_after_ms: None,
        });
    }

    pub fn fail_initialize(&self, kind: ErrorKind) {
        self.state().init_failure = Some(kind);
    }

    pub fn fail_resource(&self, resource_id: impl Into<String>) {
        self.state().failing_resources.insert(resource_id.into());
    }

    pub fn add_show(&self, show: Show) {
        self.state().shows.push(show);
    }

    pub fn add_resource(&self, resource: Resource) {
        self.state()
            .resources
            .entry(resource.show_id.clone())
            .or_default()
            .push(resource);
    }

    /// Data operations attempted, including scripted failures.
    pub fn operation_calls(&self) -> usize {
        self.operation_calls.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    /// Session blobs passed to `restore_session`, oldest first.
    pub fn restored_sessions(&self) -> Vec<Value> {
        self.state().restored.clone()
    }

    pub fn installed_session(&self) -> Option<Value> {
        self.state().session.clone()
    }

    async fn begin<T>(&self, operation: &str) -> Option<OperationResult<T>> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.operation_calls.fetch_add(1, Ordering::SeqCst);
        debug!(backend = %self.identity, operation, "Mock operation");

        if !self.initialized.load(Ordering::SeqCst) {
            return Some(OperationResult::from_error(&CadenceError::not_initialized(
                self.identity,
            )));
        }

        let mut state = self.state();
        let failure = state.queued.pop_front().or(state.always);
        failure.map(|f| f.into_result(self.identity))
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn identity(&self) -> BackendIdentity {
        self.identity
    }

    async fn initialize(&self) -> cadence_core::Result<()> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.state().init_failure {
            return Err(CadenceError::from_kind(
                kind,
                format!("mock {} failed to initialize", self.identity),
            ));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> HealthCheckResult {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let latency_ms = self.latency.map(|l| l.as_millis() as u64).unwrap_or(0);

        if !self.initialized.load(Ordering::SeqCst) {
            return HealthCheckResult::unhealthy(latency_ms, "not initialized");
        }
        if self.state().healthy {
            HealthCheckResult::healthy(latency_ms)
        } else {
            HealthCheckResult::unhealthy(latency_ms, "mock backend marked unhealthy")
        }
    }

    async fn dispose(&self) -> cadence_core::Result<()> {
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn list_shows(&self) -> OperationResult<Vec<Show>> {
        if let Some(failure) = self.begin("list_shows").await {
            return failure;
        }
        OperationResult::ok(self.state().shows.clone())
    }

    async fn list_resources(&self, show_id: &str) -> OperationResult<Vec<Resource>> {
        if let Some(failure) = self.begin("list_resources").await {
            return failure;
        }
        let resources = self
            .state()
            .resources
            .get(show_id)
            .cloned()
            .unwrap_or_default();
        OperationResult::ok(resources)
    }

    async fn publish_one(
        &self,
        resource_id: &str,
        _options: &PublishOptions,
    ) -> OperationResult<PublishOutcome> {
        if let Some(failure) = self.begin("publish_one").await {
            return failure;
        }
        if self.state().failing_resources.contains(resource_id) {
            let message = format!("resource {} was rejected", resource_id);
            return OperationResult::partial(
                PublishOutcome::failed(resource_id, message.clone()),
                ErrorKind::Unknown,
                message,
            );
        }
        OperationResult::ok(PublishOutcome {
            resource_id: resource_id.to_string(),
            success: true,
            published_at: Some(Utc::now()),
            url: Some(format!("mock://{}/{}", self.identity, resource_id)),
            error: None,
        })
    }

    async fn restore_session(&self, state: &Value) -> cadence_core::Result<()> {
        let mut guard = self.state();
        guard.restored.push(state.clone());
        guard.session = Some(state.clone());
        Ok(())
    }

    async fn clear_session(&self) -> cadence_core::Result<()> {
        self.state().session = None;
        Ok(())
    }
}

/// What the next `MockAuthenticator::login` call does.
#[derive(Debug, Clone)]
pub enum ScriptedLogin {
    Succeed(Value),
    Reject(String),
    /// Never completes; exercises the caller's timeout.
    Hang,
}

/// Authenticator with a scripted login flow.
pub struct MockAuthenticator {
    login: Mutex<ScriptedLogin>,
    identity: Mutex<Option<UserIdentity>>,
    live: AtomicBool,
    login_calls: AtomicUsize,
    logout_calls: AtomicUsize,
}

impl Default for MockAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAuthenticator {
    /// Logs in successfully as user `mock-user`.
    pub fn new() -> Self {
        Self {
            login: Mutex::new(ScriptedLogin::Succeed(json!({
                "cookies": [{"name": "session", "value": "mock-session"}]
            }))),
            identity: Mutex::new(Some(UserIdentity::new("mock-user", "Mock Creator"))),
            live: AtomicBool::new(false),
            login_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
        }
    }

    pub fn script_login(&self, login: ScriptedLogin) {
        *self.login.lock().unwrap_or_else(|p| p.into_inner()) = login;
    }

    /// `None` makes identity extraction fail.
    pub fn script_identity(&self, identity: Option<UserIdentity>) {
        *self.identity.lock().unwrap_or_else(|p| p.into_inner()) = identity;
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    fn name(&self) -> &str {
        "mock"
    }

    fn supported_methods(&self) -> Vec<LoginMethodKind> {
        vec![LoginMethodKind::Interactive, LoginMethodKind::SessionToken]
    }

    async fn login(&self, method: &LoginMethod) -> cadence_core::Result<LoginOutcome> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supported_methods().contains(&method.kind()) {
            return Err(CadenceError::UnsupportedLoginMethod {
                method: method.kind().to_string(),
                backend: self.name().to_string(),
            });
        }

        let script = self.login.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match script {
            ScriptedLogin::Succeed(state) => {
                self.live.store(true, Ordering::SeqCst);
                Ok(LoginOutcome::succeeded(state))
            }
            ScriptedLogin::Reject(reason) => Ok(LoginOutcome::failed(reason)),
            ScriptedLogin::Hang => {
                std::future::pending::<()>().await;
                Ok(LoginOutcome::failed("unreachable"))
            }
        }
    }

    async fn extract_identity(&self) -> cadence_core::Result<UserIdentity> {
        self.identity
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| CadenceError::Unknown {
                message: "identity endpoint unavailable".to_string(),
            })
    }

    async fn export_session(&self) -> cadence_core::Result<Option<Value>> {
        if !self.live.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match &*self.login.lock().unwrap_or_else(|p| p.into_inner()) {
            ScriptedLogin::Succeed(state) => Ok(Some(state.clone())),
            _ => Ok(None),
        }
    }

    async fn has_live_session(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn logout(&self) -> cadence_core::Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
        Ok(())
    }
}
