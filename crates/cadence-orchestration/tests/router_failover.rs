//! Failover and health behaviour of the execution router over mock backends.

use cadence_backend::MockBackend;
use cadence_core::{
    BackendIdentity, CadenceError, ErrorKind, PublishOptions, PublishOutcome, RouterConfig,
    SelectionMode,
};
use cadence_orchestration::{ExecuteOptions, ExecutionRouter};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    router: ExecutionRouter,
    primary: Arc<MockBackend>,
    secondary: Arc<MockBackend>,
}

async fn fixture(config: RouterConfig) -> Fixture {
    let primary = Arc::new(MockBackend::with_sample_data(BackendIdentity::Primary));
    let secondary = Arc::new(MockBackend::with_sample_data(BackendIdentity::Secondary));
    let router = ExecutionRouter::new(config, primary.clone(), secondary.clone()).unwrap();
    router.initialize().await.unwrap();
    Fixture {
        router,
        primary,
        secondary,
    }
}

fn config(mode: SelectionMode) -> RouterConfig {
    RouterConfig {
        mode,
        retry_backoff_base_ms: 1,
        retry_backoff_max_ms: 10,
        ..Default::default()
    }
}

async fn list_shows(router: &ExecutionRouter, options: ExecuteOptions) -> cadence_core::Result<usize> {
    router
        .execute("list_shows", options, |b| async move { b.list_shows().await })
        .await
        .map(|shows| shows.len())
}

async fn publish_batch(
    router: &ExecutionRouter,
    ids: &[&str],
) -> cadence_core::Result<Vec<PublishOutcome>> {
    let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
    let options = PublishOptions::default();
    let (ids, options) = (&ids, &options);
    router
        .execute("publish_many", ExecuteOptions::default(), move |b| async move {
            b.publish_many(ids, options).await
        })
        .await
}

fn no_fallback_single_attempt() -> ExecuteOptions {
    ExecuteOptions {
        fallback_to_primary: false,
        retry_on_failure: false,
    }
}

#[tokio::test]
async fn test_three_consecutive_failures_mark_unhealthy_and_one_success_restores() {
    let f = fixture(config(SelectionMode::SecondaryOnly)).await;

    for expected in 1..=3u32 {
        f.secondary.fail_next(ErrorKind::Network);
        assert!(list_shows(&f.router, no_fallback_single_attempt()).await.is_err());
        let snapshot = &f.router.status().await.backends[1];
        assert_eq!(snapshot.consecutive_failures, expected);
        assert_eq!(snapshot.healthy, expected < 3);
    }

    // Selection re-probes the demoted backend, the probe passes, and the
    // call succeeds.
    assert_eq!(list_shows(&f.router, no_fallback_single_attempt()).await.unwrap(), 2);
    let snapshot = &f.router.status().await.backends[1];
    assert!(snapshot.healthy);
    assert_eq!(snapshot.consecutive_failures, 0);

    f.router.dispose().await.unwrap();
}

#[tokio::test]
async fn test_auto_mode_routes_to_primary_when_secondary_is_down() {
    let f = fixture(config(SelectionMode::Auto)).await;
    f.secondary.set_healthy(false);
    f.router.check_all_backends().await;

    assert_eq!(list_shows(&f.router, ExecuteOptions::default()).await.unwrap(), 2);
    assert_eq!(f.primary.operation_calls(), 1);
    assert_eq!(f.secondary.operation_calls(), 0);
    assert_eq!(f.router.current_backend().await, BackendIdentity::Primary);

    f.router.dispose().await.unwrap();
}

#[tokio::test]
async fn test_secondary_failure_falls_back_within_the_same_call() {
    let f = fixture(config(SelectionMode::Auto)).await;
    f.secondary.fail_next(ErrorKind::BackendUnavailable);

    assert_eq!(list_shows(&f.router, ExecuteOptions::default()).await.unwrap(), 2);
    assert_eq!(f.secondary.operation_calls(), 1);
    assert_eq!(f.primary.operation_calls(), 1);

    f.router.dispose().await.unwrap();
}

#[tokio::test]
async fn test_secondary_only_never_touches_primary() {
    let f = fixture(config(SelectionMode::SecondaryOnly)).await;
    f.secondary.fail_always(Some(ErrorKind::Network));

    let err = list_shows(&f.router, ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(f.primary.operation_calls(), 0);

    f.router.dispose().await.unwrap();
}

#[tokio::test]
async fn test_both_backends_failing_exhausts_after_configured_attempts() {
    let f = fixture(RouterConfig {
        retry_attempts: 3,
        ..config(SelectionMode::PreferPrimary)
    })
    .await;
    f.primary.fail_always(Some(ErrorKind::Network));
    f.secondary.fail_always(Some(ErrorKind::Timeout));

    let err = list_shows(&f.router, ExecuteOptions::default()).await.unwrap_err();
    match &err {
        CadenceError::RetriesExhausted { attempts, backend, last } => {
            assert_eq!(*attempts, 3);
            assert_eq!(backend, "primary");
            assert_eq!(last.kind(), ErrorKind::Network);
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(
        f.primary.operation_calls() + f.secondary.operation_calls(),
        3
    );

    f.router.dispose().await.unwrap();
}

#[tokio::test]
async fn test_single_attempt_when_retry_disabled() {
    let f = fixture(config(SelectionMode::PrimaryOnly)).await;
    f.primary.fail_always(Some(ErrorKind::Network));

    let err = list_shows(&f.router, no_fallback_single_attempt())
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::RetriesExhausted { attempts: 1, .. }));
    assert_eq!(f.primary.operation_calls(), 1);

    f.router.dispose().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_probe_restores_demoted_backend() {
    let f = fixture(RouterConfig {
        health_check_interval_ms: 1_000,
        ..config(SelectionMode::Auto)
    })
    .await;

    f.secondary.set_healthy(false);
    f.router.check_all_backends().await;
    assert!(!f.router.status().await.backends[1].healthy);

    f.secondary.set_healthy(true);
    let probes_before = f.secondary.health_checks();
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(f.secondary.health_checks() > probes_before);
    assert!(f.router.status().await.backends[1].healthy);

    f.router.dispose().await.unwrap();
}

#[tokio::test]
async fn test_dispose_is_idempotent_and_stops_health_task() {
    let f = fixture(config(SelectionMode::Auto)).await;
    assert!(f.router.status().await.health_task_running);

    f.router.dispose().await.unwrap();
    f.router.dispose().await.unwrap();

    let status = f.router.status().await;
    assert!(!status.health_task_running);
    assert_eq!(f.primary.dispose_calls(), 1);
    assert_eq!(f.secondary.dispose_calls(), 1);
    assert!(f.router.initialize().await.is_err());
}

#[tokio::test]
async fn test_session_state_fans_out_to_both_backends() {
    let f = fixture(config(SelectionMode::Auto)).await;
    let state = serde_json::json!({"cookies": [{"name": "sid", "value": "abc"}]});

    f.router.restore_session(&state).await.unwrap();
    assert_eq!(f.primary.installed_session(), Some(state.clone()));
    assert_eq!(f.secondary.installed_session(), Some(state));

    f.router.clear_session().await.unwrap();
    assert!(f.primary.installed_session().is_none());
    assert!(f.secondary.installed_session().is_none());

    f.router.dispose().await.unwrap();
}

#[tokio::test]
async fn test_failed_batch_counts_against_backend_and_falls_back() {
    let f = fixture(config(SelectionMode::Auto)).await;
    f.secondary.fail_always(Some(ErrorKind::Network));

    for expected in 1..=3u32 {
        let outcomes = publish_batch(&f.router, &["a", "b", "c"]).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.success));

        let snapshot = &f.router.status().await.backends[1];
        assert_eq!(snapshot.consecutive_failures, expected);
        assert_eq!(snapshot.healthy, expected < 3);
    }
    assert_eq!(f.secondary.operation_calls(), 9);
    assert_eq!(f.primary.operation_calls(), 9);

    // Demoted: the next batch goes straight to the primary.
    publish_batch(&f.router, &["d"]).await.unwrap();
    assert_eq!(f.secondary.operation_calls(), 9);
    assert_eq!(f.primary.operation_calls(), 10);
    assert_eq!(f.router.current_backend().await, BackendIdentity::Primary);

    f.router.dispose().await.unwrap();
}

#[tokio::test]
async fn test_failed_batch_without_fallback_exhausts_retries() {
    let f = fixture(config(SelectionMode::SecondaryOnly)).await;
    f.secondary.fail_always(Some(ErrorKind::Timeout));

    let err = publish_batch(&f.router, &["a", "b"]).await.unwrap_err();
    match &err {
        CadenceError::RetriesExhausted { attempts, backend, last } => {
            assert_eq!(*attempts, 3);
            assert_eq!(backend, "secondary");
            assert_eq!(last.kind(), ErrorKind::Timeout);
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(f.secondary.operation_calls(), 6);
    assert_eq!(f.primary.operation_calls(), 0);
    assert!(!f.router.status().await.backends[1].healthy);

    f.router.dispose().await.unwrap();
}

#[tokio::test]
async fn test_partially_published_batch_is_not_repeated() {
    let f = fixture(config(SelectionMode::Auto)).await;
    f.secondary.fail_resource("b");

    let outcomes = publish_batch(&f.router, &["a", "b", "c"]).await.unwrap();
    assert!(outcomes[0].success);
    assert!(!outcomes[1].success);
    assert!(outcomes[2].success);
    assert_eq!(f.secondary.operation_calls(), 3);
    assert_eq!(f.primary.operation_calls(), 0);
    assert_eq!(f.router.status().await.backends[1].consecutive_failures, 1);

    f.router.dispose().await.unwrap();
}
