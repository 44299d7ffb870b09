//! Session wrapper and probe behavior against the mock driver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pg_pool_testing::MockDriver;
use pg_session_pool::{
    ConnectOptions, PoolError, ProbeOutcome, QueryDefinitions, SessionDriver, SessionWrapper,
    probe,
};

const LIFESPAN: Duration = Duration::from_secs(300);

fn opts() -> ConnectOptions {
    ConnectOptions {
        url: "mock://".to_string(),
        user: String::new(),
        password: String::new(),
    }
}

fn driver() -> (Arc<dyn SessionDriver>, MockDriver) {
    let mock = MockDriver::new();
    (Arc::new(mock.clone()), mock)
}

async fn establish(driver: &Arc<dyn SessionDriver>, id: u64) -> Arc<SessionWrapper> {
    SessionWrapper::establish(driver, &opts(), id, LIFESPAN, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn borrow_is_exclusive_until_release() {
    let (driver, _mock) = driver();
    let wrapper = establish(&driver, 1).await;

    assert!(!wrapper.in_use());
    assert!(wrapper.borrow().is_some());
    assert!(wrapper.in_use());
    assert!(wrapper.borrow().is_none());

    wrapper.release().await;
    assert!(!wrapper.in_use());
    assert!(wrapper.borrow().is_some());
}

#[tokio::test]
async fn establish_fails_when_backend_pid_is_unavailable() {
    let (driver, mock) = driver();
    mock.backend().fail_backend_pid(true);

    let err = SessionWrapper::establish(&driver, &opts(), 1, LIFESPAN, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::EstablishFailed { .. }));
    // The unidentifiable session must not be leaked.
    assert_eq!(mock.backend().session_closes(), 1);
}

#[tokio::test]
async fn close_is_idempotent() {
    let (driver, mock) = driver();
    let wrapper = establish(&driver, 1).await;

    wrapper.close().await.unwrap();
    assert!(wrapper.is_closed());
    assert_eq!(mock.backend().session_closes(), 1);

    wrapper.close().await.unwrap();
    assert_eq!(mock.backend().session_closes(), 1);
}

#[tokio::test]
async fn closed_wrapper_refuses_borrows() {
    let (driver, _mock) = driver();
    let wrapper = establish(&driver, 1).await;
    wrapper.close().await.unwrap();
    assert!(wrapper.borrow().is_none());
}

#[tokio::test]
async fn close_aggregates_the_most_recent_failure() {
    let (driver, mock) = driver();
    let wrapper = establish(&driver, 1).await;
    wrapper.query_handle("SELECT 1").await.unwrap();

    mock.backend().fail_closes(true);
    let err = wrapper.close().await.unwrap_err();
    assert!(matches!(err, PoolError::CloseAggregate { .. }));
    assert!(wrapper.is_closed());
    // Both the cached handle and the session were attempted.
    assert_eq!(mock.backend().handle_closes(), 1);
    assert_eq!(mock.backend().session_closes(), 1);

    // Second close does no further work and succeeds.
    wrapper.close().await.unwrap();
    assert_eq!(mock.backend().session_closes(), 1);
}

#[tokio::test]
async fn ad_hoc_handles_do_not_outlive_the_checkout() {
    let (driver, mock) = driver();
    let wrapper = establish(&driver, 1).await;

    assert!(wrapper.borrow().is_some());
    wrapper.query_handle("SELECT now()").await.unwrap();
    wrapper.query_handle("SELECT now()").await.unwrap();
    // The second lookup reuses the cached handle.
    assert_eq!(mock.backend().prepares(), 1);

    wrapper.release().await;
    assert_eq!(mock.backend().handle_closes(), 1);

    // A later checkout prepares afresh.
    assert!(wrapper.borrow().is_some());
    wrapper.query_handle("SELECT now()").await.unwrap();
    assert_eq!(mock.backend().prepares(), 2);
}

#[tokio::test]
async fn registered_definitions_persist_across_checkouts() {
    let (driver, mock) = driver();
    let registry = QueryDefinitions::new(10, 100);
    let defs: HashMap<String, String> =
        [("find_user".to_string(), "SELECT 1".to_string())].into();
    registry.add(defs, None).unwrap();

    let wrapper = SessionWrapper::establish(&driver, &opts(), 1, LIFESPAN, Some(&registry))
        .await
        .unwrap();
    assert_eq!(wrapper.cached_statement_count(), 1);
    assert_eq!(mock.backend().prepares(), 1);

    assert!(wrapper.borrow().is_some());
    let handle = wrapper.query_handle("find_user").await.unwrap();
    assert_eq!(handle.text(), "SELECT 1");
    wrapper.release().await;

    // Registered handles survive release.
    assert_eq!(mock.backend().handle_closes(), 0);
    wrapper.query_handle("find_user").await.unwrap();
    assert_eq!(mock.backend().prepares(), 1);
}

#[tokio::test]
async fn empty_key_is_rejected() {
    let (driver, _mock) = driver();
    let wrapper = establish(&driver, 1).await;
    let err = wrapper.query_handle("").await.unwrap_err();
    assert!(matches!(err, PoolError::NullKey));
}

#[tokio::test]
async fn expiry_and_replacement_grace() {
    let (driver, _mock) = driver();

    let short = SessionWrapper::establish(&driver, &opts(), 1, Duration::from_millis(40), None)
        .await
        .unwrap();
    // Already inside the two-minute replacement window.
    assert!(!short.within_replacement_grace());
    assert!(!short.has_expired());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(short.has_expired());

    let long = SessionWrapper::establish(&driver, &opts(), 2, Duration::from_secs(600), None)
        .await
        .unwrap();
    assert!(long.within_replacement_grace());
    assert!(!long.has_expired());
}

#[tokio::test]
async fn probe_reclaims_an_idle_backend() {
    let (driver, mock) = driver();
    let prober = establish(&driver, 1).await;
    let target = establish(&driver, 2).await;

    assert!(target.borrow().is_some());
    mock.backend().set_state(target.backend_pid(), "idle");

    assert_eq!(probe(&prober, &target).await, ProbeOutcome::Reclaimed);
    assert!(!target.in_use());
    assert!(!target.is_closed());
}

#[tokio::test]
async fn probe_leaves_a_working_backend_alone() {
    let (driver, mock) = driver();
    let prober = establish(&driver, 1).await;
    let target = establish(&driver, 2).await;

    assert!(target.borrow().is_some());
    // Freshly connected backends report "active".
    assert_eq!(probe(&prober, &target).await, ProbeOutcome::Busy);
    assert!(target.in_use());

    // A transaction left open is still the borrower's business.
    mock.backend().set_state(target.backend_pid(), "idle in transaction");
    assert_eq!(probe(&prober, &target).await, ProbeOutcome::Busy);
    assert!(target.in_use());
}

#[tokio::test]
async fn probe_closes_a_vanished_backend() {
    let (driver, mock) = driver();
    let prober = establish(&driver, 1).await;
    let target = establish(&driver, 2).await;

    assert!(target.borrow().is_some());
    mock.backend().drop_backend(target.backend_pid());

    assert_eq!(probe(&prober, &target).await, ProbeOutcome::Gone);
    assert!(target.is_closed());
}

#[tokio::test]
async fn probe_failure_changes_nothing() {
    let (driver, mock) = driver();
    let prober = establish(&driver, 1).await;
    let target = establish(&driver, 2).await;

    assert!(target.borrow().is_some());
    mock.backend().set_state(target.backend_pid(), "idle");
    mock.backend().fail_state_probes(true);

    assert_eq!(probe(&prober, &target).await, ProbeOutcome::Skipped);
    assert!(target.in_use());
    assert!(!target.is_closed());

    // Once the view answers again the reclaim goes through.
    mock.backend().fail_state_probes(false);
    assert_eq!(probe(&prober, &target).await, ProbeOutcome::Reclaimed);
    assert!(!target.in_use());
}
