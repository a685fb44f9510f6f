//! Backend selection, failover and health tracking.
//!
//! The router owns one [`BackendHandle`] per [`BackendIdentity`]. Calls go
//! through [`ExecutionRouter::execute`], which picks a backend from the
//! configured [`SelectionMode`], retries on another backend when one fails,
//! and only surfaces an error once every attempt is used up. A background
//! task probes both backends on a fixed interval so a demoted backend can
//! come back without traffic.

use crate::handle::{BackendHandle, HandleSnapshot};
use cadence_core::{
    Backend, BackendIdentity, CadenceError, ErrorKind, HealthCheckResult, OperationResult, Result,
    RouterConfig, SelectionMode,
};
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Per-call switches for [`ExecutionRouter::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// After a secondary failure, try the same call once on the primary.
    pub fallback_to_primary: bool,
    /// Use the configured number of attempts instead of one.
    pub retry_on_failure: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            fallback_to_primary: true,
            retry_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStatus {
    pub mode: SelectionMode,
    pub current: Option<BackendIdentity>,
    pub backends: Vec<HandleSnapshot>,
    /// Times every candidate was down and one was used anyway.
    pub forced_unhealthy_uses: u64,
    pub health_task_running: bool,
}

pub struct ExecutionRouter {
    config: RouterConfig,
    mode: RwLock<SelectionMode>,
    /// Indexed by [`slot`].
    handles: [Arc<BackendHandle>; 2],
    current: RwLock<Option<BackendIdentity>>,
    forced_unhealthy_uses: AtomicU64,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

fn slot(identity: BackendIdentity) -> usize {
    match identity {
        BackendIdentity::Primary => 0,
        BackendIdentity::Secondary => 1,
    }
}

impl ExecutionRouter {
    pub fn new(
        config: RouterConfig,
        primary: Arc<dyn Backend>,
        secondary: Arc<dyn Backend>,
    ) -> Result<Self> {
        if primary.identity() != BackendIdentity::Primary
            || secondary.identity() != BackendIdentity::Secondary
        {
            return Err(CadenceError::ContractViolation {
                message: format!(
                    "router needs one primary and one secondary backend, got {} and {}",
                    primary.identity(),
                    secondary.identity()
                ),
            });
        }

        if config.health_check_interval_ms == 0 {
            return Err(CadenceError::Config {
                message: "router.health_check_interval_ms must be greater than zero".to_string(),
            });
        }

        let threshold = config.failure_threshold;
        Ok(Self {
            mode: RwLock::new(config.mode),
            handles: [
                Arc::new(BackendHandle::new(primary, threshold)),
                Arc::new(BackendHandle::new(secondary, threshold)),
            ],
            current: RwLock::new(None),
            forced_unhealthy_uses: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
            config,
        })
    }

    fn handle(&self, identity: BackendIdentity) -> &Arc<BackendHandle> {
        &self.handles[slot(identity)]
    }

    pub fn backend(&self, identity: BackendIdentity) -> Arc<dyn Backend> {
        self.handle(identity).backend()
    }

    pub async fn mode(&self) -> SelectionMode {
        *self.mode.read().await
    }

    /// Initialize every backend and start the health task. Succeeds as long
    /// as at least one backend came up; the others start out unhealthy.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(CadenceError::ContractViolation {
                message: "router used after dispose()".to_string(),
            });
        }

        let mut ready = 0;
        let mut failures = Vec::new();
        for handle in &self.handles {
            match handle.backend().initialize().await {
                Ok(()) => {
                    ready += 1;
                    debug!(backend = %handle.identity(), "Backend initialized");
                }
                Err(e) => {
                    warn!(backend = %handle.identity(), error = %e, "Backend failed to initialize");
                    handle.mark_unhealthy(e.to_string()).await;
                    failures.push(format!("{}: {}", handle.identity(), e));
                }
            }
        }

        if ready == 0 {
            return Err(CadenceError::BackendUnavailable {
                backend: "all".to_string(),
                message: failures.join("; "),
            });
        }

        self.start_health_task().await;
        info!(ready, mode = %self.mode().await, "Execution router initialized");
        Ok(())
    }

    async fn start_health_task(&self) {
        let mut task = self.health_task.lock().await;
        if task.is_some() {
            return;
        }

        let period = self.config.health_check_interval();
        let timeout = self.config.health_check_timeout();
        let handles = self.handles.clone();
        let cancel = self.shutdown.child_token();

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        join_all(handles.iter().map(|h| probe(h, timeout))).await;
                    }
                }
            }
            debug!("Health check task stopped");
        }));
        debug!(interval_ms = self.config.health_check_interval_ms, "Health check task started");
    }

    /// Pick a backend for the next call. Never fails: when no candidate is
    /// healthy, even after a fresh probe, the first candidate is used.
    pub async fn select_backend(&self) -> BackendIdentity {
        let candidates = self.mode().await.candidates();

        for identity in &candidates {
            if self.handle(*identity).is_healthy().await {
                return *identity;
            }
        }

        let timeout = self.config.health_check_timeout();
        for identity in &candidates {
            if probe(self.handle(*identity), timeout).await.healthy {
                return *identity;
            }
        }

        let forced = candidates[0];
        let uses = self.forced_unhealthy_uses.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(backend = %forced, forced_unhealthy_uses = uses, "No healthy backend, using first candidate anyway");
        forced
    }

    /// The memoized backend, resolved on first use.
    pub async fn current_backend(&self) -> BackendIdentity {
        if let Some(identity) = *self.current.read().await {
            return identity;
        }
        let selected = self.select_backend().await;
        *self.current.write().await = Some(selected);
        selected
    }

    async fn invalidate_current(&self) {
        *self.current.write().await = None;
    }

    pub async fn set_mode(&self, mode: SelectionMode) {
        *self.mode.write().await = mode;
        self.invalidate_current().await;
        info!(mode = %mode, "Execution mode changed");
    }

    /// Switch to `identity` after confirming it is healthy.
    #[instrument(skip(self))]
    pub async fn force_backend(&self, identity: BackendIdentity) -> Result<()> {
        let result = probe(self.handle(identity), self.config.health_check_timeout()).await;
        if !result.healthy {
            return Err(CadenceError::BackendNotHealthy {
                backend: identity.to_string(),
            });
        }
        *self.current.write().await = Some(identity);
        info!(backend = %identity, "Backend forced");
        Ok(())
    }

    /// Probe every backend once, concurrently.
    pub async fn check_all_backends(&self) -> Vec<(BackendIdentity, HealthCheckResult)> {
        let timeout = self.config.health_check_timeout();
        let results = join_all(self.handles.iter().map(|h| probe(h, timeout))).await;
        self.handles
            .iter()
            .map(|h| h.identity())
            .zip(results)
            .collect()
    }

    pub async fn status(&self) -> RouterStatus {
        let mut backends = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            backends.push(handle.snapshot().await);
        }
        let health_task_running = self
            .health_task
            .lock()
            .await
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false);

        RouterStatus {
            mode: self.mode().await,
            current: *self.current.read().await,
            backends,
            forced_unhealthy_uses: self.forced_unhealthy_uses.load(Ordering::SeqCst),
            health_task_running,
        }
    }

    /// Run `operation` against the selected backend, failing over and
    /// retrying as configured.
    ///
    /// A failed result that still carries data (a batch publish where some
    /// items went through) is returned as-is so committed items are never
    /// published twice. It still counts as a failure against the backend,
    /// and a fatal or auth error kind is surfaced instead of the data.
    #[instrument(skip(self, operation), fields(operation = name))]
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        options: ExecuteOptions,
        operation: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = OperationResult<T>>,
    {
        let attempts = if options.retry_on_failure {
            self.config.retry_attempts.max(1)
        } else {
            1
        };
        let mut last: Option<(BackendIdentity, CadenceError)> = None;

        for attempt in 1..=attempts {
            let identity = self.current_backend().await;
            let err = match self.attempt(identity, name, &operation).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if stops_retrying(&err) {
                return Err(err);
            }
            self.invalidate_current().await;

            let (failed_on, err) = if self.should_fall_back(identity, options).await {
                debug!(attempt, "Falling back to primary for this call");
                match self.attempt(BackendIdentity::Primary, name, &operation).await {
                    Ok(value) => return Ok(value),
                    Err(fallback) if stops_retrying(&fallback) => return Err(fallback),
                    Err(fallback) => (BackendIdentity::Primary, fallback),
                }
            } else {
                (identity, err)
            };

            warn!(
                attempt,
                attempts,
                backend = %failed_on,
                error = %err,
                "Attempt failed"
            );

            if attempt < attempts && err.kind() == ErrorKind::RateLimited {
                let delay = self.rate_limit_delay(&err, attempt);
                debug!(delay_ms = delay.as_millis() as u64, "Rate limited, backing off");
                tokio::time::sleep(delay).await;
            }
            last = Some((failed_on, err));
        }

        let (backend, last) = last.unwrap_or((
            BackendIdentity::Secondary,
            CadenceError::Unknown {
                message: "no attempt was made".to_string(),
            },
        ));
        Err(CadenceError::RetriesExhausted {
            attempts,
            backend: backend.to_string(),
            last: Box::new(last),
        })
    }

    async fn attempt<T, F, Fut>(
        &self,
        identity: BackendIdentity,
        name: &str,
        operation: &F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = OperationResult<T>>,
    {
        let handle = self.handle(identity);
        let budget = self.config.attempt_timeout();
        let started = Instant::now();

        let outcome = tokio::time::timeout(budget, operation(handle.backend())).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let err = match outcome {
            Ok(result) if result.success => {
                handle.record_success().await;
                debug!(backend = %identity, latency_ms = elapsed_ms, "Operation completed");
                return match result.data {
                    Some(data) => Ok(data),
                    None => Err(CadenceError::ContractViolation {
                        message: format!("{} returned success without data", name),
                    }),
                };
            }
            Ok(mut result) => {
                let err = result.to_error().unwrap_or_else(|| CadenceError::Unknown {
                    message: format!("{} failed without an error", name),
                });
                match result.data.take() {
                    Some(partial) if !stops_retrying(&err) => {
                        let failures = handle.record_failure(&err.to_string()).await;
                        warn!(
                            backend = %identity,
                            consecutive_failures = failures,
                            error = %err,
                            "Operation partially failed, returning committed results"
                        );
                        return Ok(partial);
                    }
                    _ => err,
                }
            }
            Err(_) => CadenceError::Timeout {
                operation: name.to_string(),
                duration_ms: budget.as_millis() as u64,
            },
        };

        if !err.kind().requires_reauthentication() {
            let failures = handle.record_failure(&err.to_string()).await;
            debug!(backend = %identity, consecutive_failures = failures, "Recorded failure");
        }
        Err(err)
    }

    async fn should_fall_back(&self, failed: BackendIdentity, options: ExecuteOptions) -> bool {
        options.fallback_to_primary
            && failed == BackendIdentity::Secondary
            && self.mode().await != SelectionMode::SecondaryOnly
            && self.handle(BackendIdentity::Primary).is_healthy().await
    }

    fn rate_limit_delay(&self, err: &CadenceError, attempt: u32) -> Duration {
        if let Some(ms) = err.retry_after_ms() {
            return Duration::from_millis(ms.min(self.config.retry_backoff_max_ms));
        }
        let base = self.config.backoff_for(attempt);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 10);
        base + Duration::from_millis(jitter_ms)
    }

    /// Hand a persisted session to every backend. All backends are tried;
    /// the first error is returned.
    pub async fn restore_session(&self, state: &serde_json::Value) -> Result<()> {
        let mut first_error = None;
        for handle in &self.handles {
            if let Err(e) = handle.backend().restore_session(state).await {
                warn!(backend = %handle.identity(), error = %e, "Backend rejected session state");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn clear_session(&self) -> Result<()> {
        let mut first_error = None;
        for handle in &self.handles {
            if let Err(e) = handle.backend().clear_session().await {
                warn!(backend = %handle.identity(), error = %e, "Backend failed to clear session");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop the health task and dispose every backend. Disposal errors are
    /// logged. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();
        if let Some(task) = self.health_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Health check task ended abnormally");
            }
        }

        for handle in &self.handles {
            if let Err(e) = handle.backend().dispose().await {
                warn!(backend = %handle.identity(), error = %e, "Backend dispose failed");
            }
        }
        info!("Execution router disposed");
        Ok(())
    }
}

impl Drop for ExecutionRouter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Errors that need the caller to act rather than another attempt.
fn stops_retrying(err: &CadenceError) -> bool {
    let kind = err.kind();
    kind.is_fatal() || kind.requires_reauthentication()
}

async fn probe(handle: &BackendHandle, timeout: Duration) -> HealthCheckResult {
    let result = match tokio::time::timeout(timeout, handle.backend().health_check()).await {
        Ok(result) => result,
        Err(_) => HealthCheckResult::unhealthy(
            timeout.as_millis() as u64,
            format!("health check exceeded {}ms", timeout.as_millis()),
        ),
    };
    handle.record_probe(&result).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_backend::MockBackend;

    fn router(mode: SelectionMode) -> (ExecutionRouter, Arc<MockBackend>, Arc<MockBackend>) {
        let primary = Arc::new(MockBackend::new(BackendIdentity::Primary));
        let secondary = Arc::new(MockBackend::new(BackendIdentity::Secondary));
        let config = RouterConfig {
            mode,
            retry_backoff_base_ms: 10,
            ..Default::default()
        };
        let router = ExecutionRouter::new(config, primary.clone(), secondary.clone()).unwrap();
        (router, primary, secondary)
    }

    #[test]
    fn test_new_rejects_swapped_backends() {
        let primary = Arc::new(MockBackend::new(BackendIdentity::Primary));
        let secondary = Arc::new(MockBackend::new(BackendIdentity::Secondary));
        let result = ExecutionRouter::new(RouterConfig::default(), secondary, primary);
        assert!(matches!(result, Err(CadenceError::ContractViolation { .. })));
    }

    #[tokio::test]
    async fn test_selection_follows_mode() {
        let (router, _primary, _secondary) = router(SelectionMode::Auto);
        router.initialize().await.unwrap();
        assert_eq!(router.select_backend().await, BackendIdentity::Secondary);

        router.set_mode(SelectionMode::PreferPrimary).await;
        assert_eq!(router.current_backend().await, BackendIdentity::Primary);
        router.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_unhealthy_use_is_counted() {
        let (router, primary, secondary) = router(SelectionMode::PrimaryOnly);
        router.initialize().await.unwrap();
        primary.set_healthy(false);
        secondary.set_healthy(false);
        router
            .handle(BackendIdentity::Primary)
            .mark_unhealthy("down")
            .await;

        assert_eq!(router.select_backend().await, BackendIdentity::Primary);
        assert_eq!(router.status().await.forced_unhealthy_uses, 1);
        router.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_force_backend_requires_health() {
        let (router, primary, _secondary) = router(SelectionMode::Auto);
        router.initialize().await.unwrap();

        primary.set_healthy(false);
        let err = router
            .force_backend(BackendIdentity::Primary)
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::BackendNotHealthy { .. }));
        assert_eq!(router.current_backend().await, BackendIdentity::Secondary);

        primary.set_healthy(true);
        router.force_backend(BackendIdentity::Primary).await.unwrap();
        assert_eq!(router.current_backend().await, BackendIdentity::Primary);
        router.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_tolerates_one_failure() {
        let (router, primary, _secondary) = router(SelectionMode::Auto);
        primary.fail_initialize(ErrorKind::BackendUnavailable);
        router.initialize().await.unwrap();

        let status = router.status().await;
        assert!(!status.backends[0].healthy);
        assert!(status.backends[1].healthy);
        assert!(status.health_task_running);
        router.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_fails_when_nothing_starts() {
        let (router, primary, secondary) = router(SelectionMode::Auto);
        primary.fail_initialize(ErrorKind::Network);
        secondary.fail_initialize(ErrorKind::Network);
        let err = router.initialize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }

    #[tokio::test]
    async fn test_contract_violation_is_not_retried() {
        let (router, _primary, secondary) = router(SelectionMode::Auto);
        // Not initialized: every call is a contract violation.
        let err = router
            .execute("list_shows", ExecuteOptions::default(), |b| async move {
                b.list_shows().await
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert_eq!(secondary.operation_calls(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_short_circuits_without_health_penalty() {
        let (router, primary, secondary) = router(SelectionMode::Auto);
        router.initialize().await.unwrap();
        secondary.fail_next(ErrorKind::SessionExpired);

        let err = router
            .execute("list_shows", ExecuteOptions::default(), |b| async move {
                b.list_shows().await
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionExpired);
        assert_eq!(primary.operation_calls(), 0);
        assert_eq!(
            router
                .handle(BackendIdentity::Secondary)
                .consecutive_failures()
                .await,
            0
        );
        router.dispose().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_for_server_delay() {
        let (router, _primary, secondary) = router(SelectionMode::SecondaryOnly);
        router.initialize().await.unwrap();
        secondary.fail_next_rate_limited(Some(1_500));

        let started = tokio::time::Instant::now();
        let shows = router
            .execute("list_shows", ExecuteOptions::default(), |b| async move {
                b.list_shows().await
            })
            .await
            .unwrap();
        assert!(shows.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(1_500));
        assert_eq!(secondary.operation_calls(), 2);
        router.dispose().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let primary = Arc::new(MockBackend::new(BackendIdentity::Primary));
        let secondary = Arc::new(
            MockBackend::new(BackendIdentity::Secondary).with_latency(Duration::from_secs(10)),
        );
        let config = RouterConfig {
            mode: SelectionMode::SecondaryOnly,
            fallback_timeout_ms: 1_000,
            retry_attempts: 2,
            health_check_timeout_ms: 20_000,
            ..Default::default()
        };
        let router = ExecutionRouter::new(config, primary, secondary.clone()).unwrap();
        router.initialize().await.unwrap();

        let err = router
            .execute("list_shows", ExecuteOptions::default(), |b| async move {
                b.list_shows().await
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(matches!(err, CadenceError::RetriesExhausted { attempts: 2, .. }));
        router.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_batch_is_returned_without_retry() {
        let (router, primary, secondary) = router(SelectionMode::Auto);
        router.initialize().await.unwrap();
        secondary.fail_resource("b");

        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let options = cadence_core::PublishOptions::default();
        let ids_ref = &ids;
        let options_ref = &options;
        let outcomes = router
            .execute("publish_many", ExecuteOptions::default(), move |b| async move {
                b.publish_many(ids_ref, options_ref).await
            })
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(!outcomes[1].success);
        assert_eq!(secondary.operation_calls(), 3);
        assert_eq!(primary.operation_calls(), 0);
        assert_eq!(
            router
                .handle(BackendIdentity::Secondary)
                .consecutive_failures()
                .await,
            1
        );
        router.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_uninitialized_batch_surfaces_contract_violation() {
        let (router, primary, secondary) = router(SelectionMode::Auto);
        let ids = vec!["a".to_string(), "b".to_string()];
        let options = cadence_core::PublishOptions::default();
        let ids_ref = &ids;
        let options_ref = &options;

        let err = router
            .execute("publish_many", ExecuteOptions::default(), move |b| async move {
                b.publish_many(ids_ref, options_ref).await
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert_eq!(primary.operation_calls(), 0);
        assert_eq!(secondary.operation_calls(), 2);
    }

    #[tokio::test]
    async fn test_zero_health_interval_rejected() {
        let primary = Arc::new(MockBackend::new(BackendIdentity::Primary));
        let secondary = Arc::new(MockBackend::new(BackendIdentity::Secondary));
        let config = RouterConfig {
            health_check_interval_ms: 0,
            ..Default::default()
        };
        let result = ExecutionRouter::new(config, primary, secondary);
        assert!(matches!(result, Err(CadenceError::Config { .. })));
    }
}
