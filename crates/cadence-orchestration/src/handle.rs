//! Per-backend health bookkeeping owned by the router.

use cadence_core::{Backend, BackendIdentity, HealthCheckResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct HandleState {
    healthy: bool,
    consecutive_failures: u32,
    last_health_check_at: Option<DateTime<Utc>>,
    last_latency_ms: Option<u64>,
    last_error: Option<String>,
}

/// Point-in-time view of a handle, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleSnapshot {
    pub identity: BackendIdentity,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// One backend plus its health state. Every transition goes through the
/// state mutex, so a failing call and a concurrent probe never interleave
/// their read-modify-write.
pub struct BackendHandle {
    identity: BackendIdentity,
    backend: Arc<dyn Backend>,
    failure_threshold: u32,
    state: Mutex<HandleState>,
}

impl BackendHandle {
    pub fn new(backend: Arc<dyn Backend>, failure_threshold: u32) -> Self {
        Self {
            identity: backend.identity(),
            backend,
            failure_threshold: failure_threshold.max(1),
            state: Mutex::new(HandleState {
                healthy: true,
                consecutive_failures: 0,
                last_health_check_at: None,
                last_latency_ms: None,
                last_error: None,
            }),
        }
    }

    pub fn identity(&self) -> BackendIdentity {
        self.identity
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub async fn is_healthy(&self) -> bool {
        self.state.lock().await.healthy
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        if !state.healthy {
            info!(backend = %self.identity, "Backend recovered");
        }
        state.healthy = true;
        state.consecutive_failures = 0;
        state.last_error = None;
    }

    /// Count a failed operation. Returns the new consecutive-failure count.
    pub async fn record_failure(&self, error: &str) -> u32 {
        let mut state = self.state.lock().await;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error.to_string());

        if state.healthy && state.consecutive_failures >= self.failure_threshold {
            state.healthy = false;
            warn!(
                backend = %self.identity,
                consecutive_failures = state.consecutive_failures,
                "Backend marked unhealthy"
            );
        }
        state.consecutive_failures
    }

    /// Apply a health probe result. A healthy probe also clears the failure
    /// streak.
    pub async fn record_probe(&self, result: &HealthCheckResult) {
        let mut state = self.state.lock().await;
        state.last_health_check_at = Some(Utc::now());
        state.last_latency_ms = Some(result.latency_ms);

        if result.healthy {
            if !state.healthy {
                info!(backend = %self.identity, latency_ms = result.latency_ms, "Health probe succeeded, backend restored");
            }
            state.healthy = true;
            state.consecutive_failures = 0;
            state.last_error = None;
        } else {
            if state.healthy {
                warn!(backend = %self.identity, error = ?result.error, "Health probe failed");
            }
            state.healthy = false;
            state.last_error = result.error.clone();
        }
    }

    pub async fn mark_unhealthy(&self, reason: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.healthy = false;
        state.last_error = Some(reason.into());
    }

    pub async fn snapshot(&self) -> HandleSnapshot {
        let state = self.state.lock().await;
        HandleSnapshot {
            identity: self.identity,
            healthy: state.healthy,
            consecutive_failures: state.consecutive_failures,
            last_health_check_at: state.last_health_check_at,
            last_latency_ms: state.last_latency_ms,
            last_error: state.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_backend::MockBackend;

    fn handle() -> BackendHandle {
        BackendHandle::new(Arc::new(MockBackend::new(BackendIdentity::Secondary)), 3)
    }

    #[tokio::test]
    async fn test_three_failures_flip_to_unhealthy() {
        let handle = handle();
        assert_eq!(handle.record_failure("boom").await, 1);
        assert_eq!(handle.record_failure("boom").await, 2);
        assert!(handle.is_healthy().await);

        assert_eq!(handle.record_failure("boom").await, 3);
        assert!(!handle.is_healthy().await);
    }

    #[tokio::test]
    async fn test_single_success_resets() {
        let handle = handle();
        for _ in 0..4 {
            handle.record_failure("boom").await;
        }
        handle.record_success().await;

        let snapshot = handle.snapshot().await;
        assert!(snapshot.healthy);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_probe_results_update_health() {
        let handle = handle();
        handle
            .record_probe(&HealthCheckResult::unhealthy(12, "connection refused"))
            .await;
        let snapshot = handle.snapshot().await;
        assert!(!snapshot.healthy);
        assert_eq!(snapshot.last_latency_ms, Some(12));
        assert!(snapshot.last_health_check_at.is_some());

        handle.record_failure("still down").await;
        handle.record_probe(&HealthCheckResult::healthy(3)).await;
        assert!(handle.is_healthy().await);
        assert_eq!(handle.consecutive_failures().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let handle = Arc::new(BackendHandle::new(
            Arc::new(MockBackend::new(BackendIdentity::Primary)),
            100,
        ));
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    handle.record_failure("x").await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(handle.consecutive_failures().await, 50);
    }
}
