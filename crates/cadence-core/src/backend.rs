//! The capability surface every execution backend implements.
//!
//! Data-fetch and publish operations report failures as values
//! ([`OperationResult`]) so the router can tell retryable backend failures
//! apart from contract violations without unwinding through `?`.

use crate::error::{CadenceError, ErrorKind, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which of the two interchangeable backends a value refers to.
///
/// `Primary` is the browser-driven backend, `Secondary` the direct-API one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendIdentity {
    Primary,
    Secondary,
}

impl BackendIdentity {
    pub const ALL: [BackendIdentity; 2] = [BackendIdentity::Primary, BackendIdentity::Secondary];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendIdentity::Primary => "primary",
            BackendIdentity::Secondary => "secondary",
        }
    }

    /// Human-facing description of the transport behind the identity.
    pub fn transport(&self) -> &'static str {
        match self {
            BackendIdentity::Primary => "browser",
            BackendIdentity::Secondary => "api",
        }
    }

    pub fn other(&self) -> BackendIdentity {
        match self {
            BackendIdentity::Primary => BackendIdentity::Secondary,
            BackendIdentity::Secondary => BackendIdentity::Primary,
        }
    }
}

impl fmt::Display for BackendIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendIdentity {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "primary" | "browser" => Ok(BackendIdentity::Primary),
            "secondary" | "api" => Ok(BackendIdentity::Secondary),
            other => Err(CadenceError::Config {
                message: format!("Unknown backend '{}'", other),
            }),
        }
    }
}

/// Outcome of a single health probe. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            error: None,
        }
    }

    pub fn unhealthy(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms,
            error: Some(error.into()),
        }
    }
}

/// Result of every data-fetch and publish call on a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl<T> OperationResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            retry_after_ms: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_kind: Some(kind),
            retry_after_ms: None,
        }
    }

    /// A failed result that still carries partial data (batch operations).
    pub fn partial(data: T, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Some(data),
            error: Some(message.into()),
            error_kind: Some(kind),
            retry_after_ms: None,
        }
    }

    pub fn from_error(err: &CadenceError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            retry_after_ms: err.retry_after_ms(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        if self.success {
            None
        } else {
            Some(self.error_kind.unwrap_or(ErrorKind::Unknown))
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> OperationResult<U> {
        OperationResult {
            success: self.success,
            data: self.data.map(f),
            error: self.error,
            error_kind: self.error_kind,
            retry_after_ms: self.retry_after_ms,
        }
    }

    /// Rebuild the typed error for a failed result.
    pub fn to_error(&self) -> Option<CadenceError> {
        if self.success {
            return None;
        }
        let kind = self.error_kind.unwrap_or(ErrorKind::Unknown);
        let message = self
            .error
            .clone()
            .unwrap_or_else(|| "operation failed without an error message".to_string());
        Some(match kind {
            ErrorKind::RateLimited => CadenceError::RateLimited {
                message,
                retry_after_ms: self.retry_after_ms,
            },
            other => CadenceError::from_kind(other, message),
        })
    }

    pub fn into_result(self) -> Result<T> {
        if let Some(err) = self.to_error() {
            return Err(err);
        }
        self.data.ok_or_else(|| CadenceError::ContractViolation {
            message: "successful operation returned no data".to_string(),
        })
    }
}

impl<T> From<Result<T>> for OperationResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => OperationResult::ok(data),
            Err(err) => OperationResult::from_error(&err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Show {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resource_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Draft,
    Scheduled,
    Published,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub show_id: String,
    pub title: String,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
    Private,
}

impl FromStr for Visibility {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "unlisted" => Ok(Visibility::Unlisted),
            "private" => Ok(Visibility::Private),
            other => Err(CadenceError::Config {
                message: format!("Unknown visibility '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PublishOptions {
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub notify_subscribers: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub resource_id: String,
    pub success: bool,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PublishOutcome {
    pub fn failed(resource_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            success: false,
            published_at: None,
            url: None,
            error: Some(error.into()),
        }
    }
}

/// Uniform contract implemented by the browser-driven and direct-API backends.
///
/// The router holds implementations behind `Arc<dyn Backend>` and never
/// downcasts. New capabilities are added as methods with default bodies so
/// existing implementations keep compiling.
#[async_trait]
pub trait Backend: Send + Sync {
    fn identity(&self) -> BackendIdentity;

    /// Allocate backend resources. Calling it again on an initialized
    /// backend is a no-op.
    async fn initialize(&self) -> Result<()>;

    /// Cheap, side-effect-free probe bounded by the backend's own timeout.
    async fn health_check(&self) -> HealthCheckResult;

    /// Release all resources. Safe to call repeatedly.
    async fn dispose(&self) -> Result<()>;

    fn is_initialized(&self) -> bool;

    async fn list_shows(&self) -> OperationResult<Vec<Show>>;

    async fn list_resources(&self, show_id: &str) -> OperationResult<Vec<Resource>>;

    async fn publish_one(
        &self,
        resource_id: &str,
        options: &PublishOptions,
    ) -> OperationResult<PublishOutcome>;

    async fn publish_many(
        &self,
        resource_ids: &[String],
        options: &PublishOptions,
    ) -> OperationResult<Vec<PublishOutcome>> {
        publish_sequentially(self, resource_ids, options).await
    }

    /// Install previously persisted session state (cookies, tokens).
    async fn restore_session(&self, _state: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Forget any installed session state.
    async fn clear_session(&self) -> Result<()> {
        Ok(())
    }
}

/// Batch publishing for backends without a native batch primitive.
///
/// Items are published one after another; a failing item does not stop the
/// rest. The overall result is successful only if every item succeeded. When
/// at least one item went through, the failed result still carries one
/// outcome per requested id; when none did, it carries no data, so nothing
/// has been committed and the whole batch may be retried elsewhere.
pub async fn publish_sequentially<B>(
    backend: &B,
    resource_ids: &[String],
    options: &PublishOptions,
) -> OperationResult<Vec<PublishOutcome>>
where
    B: Backend + ?Sized,
{
    let mut outcomes = Vec::with_capacity(resource_ids.len());
    let mut first_failure: Option<(ErrorKind, String)> = None;

    for resource_id in resource_ids {
        let result = backend.publish_one(resource_id, options).await;
        let kind = result.kind();
        match (result.success, result.data) {
            (true, Some(outcome)) => outcomes.push(outcome),
            (_, data) => {
                let message = result
                    .error
                    .unwrap_or_else(|| "publish failed".to_string());
                tracing::warn!(
                    backend = %backend.identity(),
                    resource_id = %resource_id,
                    error = %message,
                    "Publishing item failed, continuing with remaining items"
                );
                if first_failure.is_none() {
                    first_failure = Some((kind.unwrap_or(ErrorKind::Unknown), message.clone()));
                }
                outcomes.push(
                    data.filter(|o| !o.success)
                        .unwrap_or_else(|| PublishOutcome::failed(resource_id.clone(), message)),
                );
            }
        }
    }

    match first_failure {
        None => OperationResult::ok(outcomes),
        Some((kind, message)) if !outcomes.iter().any(|o| o.success) => OperationResult::failure(
            kind,
            format!(
                "all {} items failed to publish; first error: {}",
                resource_ids.len(),
                message
            ),
        ),
        Some((kind, message)) => {
            let failed = outcomes.iter().filter(|o| !o.success).count();
            OperationResult::partial(
                outcomes,
                kind,
                format!(
                    "{} of {} items failed to publish; first error: {}",
                    failed,
                    resource_ids.len(),
                    message
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyPublisher {
        failing: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Backend for FlakyPublisher {
        fn identity(&self) -> BackendIdentity {
            BackendIdentity::Secondary
        }

        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn health_check(&self) -> HealthCheckResult {
            HealthCheckResult::healthy(1)
        }

        async fn dispose(&self) -> Result<()> {
            Ok(())
        }

        fn is_initialized(&self) -> bool {
            true
        }

        async fn list_shows(&self) -> OperationResult<Vec<Show>> {
            OperationResult::ok(vec![])
        }

        async fn list_resources(&self, _show_id: &str) -> OperationResult<Vec<Resource>> {
            OperationResult::ok(vec![])
        }

        async fn publish_one(
            &self,
            resource_id: &str,
            _options: &PublishOptions,
        ) -> OperationResult<PublishOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if resource_id == self.failing {
                return OperationResult::failure(ErrorKind::Network, "connection reset");
            }
            OperationResult::ok(PublishOutcome {
                resource_id: resource_id.to_string(),
                success: true,
                published_at: Some(Utc::now()),
                url: None,
                error: None,
            })
        }
    }

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_publish_many_keeps_going_after_failure() {
        let backend = FlakyPublisher {
            failing: "b",
            calls: AtomicUsize::new(0),
        };

        let result = backend
            .publish_many(&ids(&["a", "b", "c"]), &PublishOptions::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Network));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

        let outcomes = result.data.expect("partial outcomes");
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert_eq!(outcomes[1].resource_id, "b");
        assert!(outcomes[2].success);
    }

    #[tokio::test]
    async fn test_publish_many_with_no_success_carries_no_data() {
        let backend = FlakyPublisher {
            failing: "only",
            calls: AtomicUsize::new(0),
        };

        let result = backend
            .publish_many(&ids(&["only"]), &PublishOptions::default())
            .await;

        assert!(!result.success);
        assert!(result.data.is_none());
        assert_eq!(result.error_kind, Some(ErrorKind::Network));
        assert!(result.error.unwrap().starts_with("all 1 items failed"));
    }

    #[tokio::test]
    async fn test_publish_many_all_succeed() {
        let backend = FlakyPublisher {
            failing: "none",
            calls: AtomicUsize::new(0),
        };

        let result = backend
            .publish_many(&ids(&["a", "b"]), &PublishOptions::default())
            .await;

        assert!(result.success);
        assert_eq!(result.data.unwrap().len(), 2);
    }

    #[test]
    fn test_operation_result_into_result() {
        let ok: OperationResult<u32> = OperationResult::ok(7);
        assert_eq!(ok.into_result().unwrap(), 7);

        let failed: OperationResult<u32> = OperationResult::failure(ErrorKind::Timeout, "slow");
        let err = failed.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_rate_limit_delay_survives_round_trip() {
        let err = CadenceError::RateLimited {
            message: "429".to_string(),
            retry_after_ms: Some(2000),
        };
        let result: OperationResult<()> = OperationResult::from_error(&err);
        assert_eq!(result.retry_after_ms, Some(2000));

        let rebuilt = result.to_error().unwrap();
        assert_eq!(rebuilt.retry_after_ms(), Some(2000));
    }

    #[test]
    fn test_successful_result_without_data_is_contract_violation() {
        let result: OperationResult<u32> = OperationResult {
            success: true,
            data: None,
            error: None,
            error_kind: None,
            retry_after_ms: None,
        };
        assert_eq!(
            result.into_result().unwrap_err().kind(),
            ErrorKind::ContractViolation
        );
    }

    #[test]
    fn test_backend_identity_parsing() {
        assert_eq!(
            "browser".parse::<BackendIdentity>().unwrap(),
            BackendIdentity::Primary
        );
        assert_eq!(
            "API".parse::<BackendIdentity>().unwrap(),
            BackendIdentity::Secondary
        );
        assert!("ftp".parse::<BackendIdentity>().is_err());
        assert_eq!(BackendIdentity::Primary.other(), BackendIdentity::Secondary);
    }

    #[test]
    fn test_unknown_resource_status_deserializes() {
        let resource: Resource = serde_json::from_str(
            r#"{"id":"r1","show_id":"s1","title":"Ep 1","status":"archived"}"#,
        )
        .unwrap();
        assert_eq!(resource.status, ResourceStatus::Unknown);
    }
}
