//! End-to-end pool behavior against the mock driver.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pg_pool_testing::{MockBackend, MockDriver};
use pg_session_pool::{Pool, PoolConfig, PoolError};

/// A tick fast enough that tests settle within a few dozen milliseconds.
fn base_config() -> PoolConfig {
    PoolConfig::new()
        .url("mock://pool")
        .management_tick_interval(Duration::from_millis(10))
        .connection_lifespan(Duration::from_secs(300))
}

async fn pool_with(config: PoolConfig) -> (Pool, Arc<MockBackend>) {
    let driver = MockDriver::new();
    let backend = driver.backend();
    let pool = Pool::new(config, Arc::new(driver)).await.unwrap();
    (pool, backend)
}

/// Several reconciliation passes' worth of waiting.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

#[tokio::test]
async fn warm_pool_serves_distinct_sessions_until_exhausted() {
    let (pool, _backend) = pool_with(base_config().min_connections(2).max_connections(2)).await;
    assert_eq!(pool.status().live, 2);

    let first = pool.borrow_connection().await.unwrap();
    let second = pool.borrow_connection().await.unwrap();
    assert_ne!(first.backend_pid(), second.backend_pid());

    let err = pool
        .borrow_connection_timeout(Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::PoolExhausted { .. }));
    assert_eq!(pool.metrics().checkouts_failed, 1);

    first.release().await;
    let again = pool.borrow_connection().await.unwrap();
    assert_eq!(again.id(), first.id());

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn expired_sessions_are_closed_and_replaced() {
    let (pool, _backend) = pool_with(
        base_config()
            .min_connections(1)
            .max_connections(1)
            .connection_lifespan(Duration::from_millis(120)),
    )
    .await;

    let first = pool.borrow_connection().await.unwrap();
    let old_pid = first.backend_pid();

    // The lifespan elapses while the session is still lent out.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(first.is_closed());

    let replacement = pool.borrow_connection().await.unwrap();
    assert_ne!(replacement.backend_pid(), old_pid);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn idle_backends_are_reclaimed_in_place() {
    let (pool, backend) = pool_with(base_config().min_connections(1).max_connections(1)).await;

    let wrapper = pool.borrow_connection().await.unwrap();
    let pid = wrapper.backend_pid();

    // The borrower goes quiet and its backend sits idle on the server.
    backend.set_state(pid, "idle");
    settle().await;

    assert!(!wrapper.in_use());
    assert!(!wrapper.is_closed());
    assert!(pool.metrics().sessions_reclaimed >= 1);

    // The same session is lent out again, cache intact.
    let again = pool.borrow_connection().await.unwrap();
    assert_eq!(again.backend_pid(), pid);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn probe_failures_defer_reclamation() {
    let (pool, backend) = pool_with(base_config().min_connections(1).max_connections(1)).await;

    let wrapper = pool.borrow_connection().await.unwrap();
    backend.set_state(wrapper.backend_pid(), "idle");
    backend.fail_state_probes(true);
    settle().await;

    // Nothing is reclaimed on hearsay.
    assert!(wrapper.in_use());
    assert!(pool.metrics().probes_skipped >= 1);

    backend.fail_state_probes(false);
    settle().await;
    assert!(!wrapper.in_use());

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn vanished_backends_are_closed_and_replaced() {
    let (pool, backend) = pool_with(base_config().min_connections(1).max_connections(1)).await;

    let wrapper = pool.borrow_connection().await.unwrap();
    let old_pid = wrapper.backend_pid();
    backend.drop_backend(old_pid);
    settle().await;

    assert!(wrapper.is_closed());

    let replacement = pool.borrow_connection().await.unwrap();
    assert_ne!(replacement.backend_pid(), old_pid);

    pool.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_session_is_lent_twice_under_contention() {
    let (pool, _backend) = pool_with(base_config().min_connections(4).max_connections(4)).await;
    let pool = Arc::new(pool);
    let lent: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let lent = lent.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                match pool.borrow_connection_timeout(Duration::from_millis(20)).await {
                    Ok(wrapper) => {
                        assert!(
                            lent.lock().insert(wrapper.id()),
                            "session lent to two borrowers at once"
                        );
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        lent.lock().remove(&wrapper.id());
                        wrapper.release().await;
                    }
                    Err(PoolError::PoolExhausted { .. }) => {}
                    Err(e) => panic!("unexpected borrow failure: {e}"),
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(pool.status().live <= 4);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_everything_and_is_idempotent() {
    let (pool, backend) = pool_with(base_config().min_connections(2).max_connections(2)).await;

    pool.shutdown().await.unwrap();
    assert!(pool.is_closed());
    // Two pool sessions plus the prober.
    assert_eq!(backend.session_closes(), 3);

    let err = pool.borrow_connection().await.unwrap_err();
    assert!(matches!(err, PoolError::PoolClosed));

    pool.shutdown().await.unwrap();
    assert_eq!(backend.session_closes(), 3);
}

#[tokio::test]
async fn registered_definitions_reach_pooled_sessions() {
    let (pool, backend) = pool_with(base_config().min_connections(1).max_connections(1)).await;

    let defs: HashMap<String, String> = [(
        "find_user".to_string(),
        "SELECT * FROM users WHERE id = $1".to_string(),
    )]
    .into();
    assert_eq!(pool.add_query_definitions(defs).unwrap(), 1);
    settle().await;

    let wrapper = pool.borrow_connection().await.unwrap();
    assert_eq!(wrapper.cached_statement_count(), 1);
    let handle = wrapper.query_handle("find_user").await.unwrap();
    assert_eq!(handle.text(), "SELECT * FROM users WHERE id = $1");
    // The live session adopted the definition exactly once.
    assert_eq!(backend.prepares(), 1);

    wrapper.release().await;
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn definition_admission_is_all_or_nothing() {
    let (pool, _backend) = pool_with(
        base_config()
            .min_connections(1)
            .max_connections(1)
            .max_cached_queries(2),
    )
    .await;

    let batch: HashMap<String, String> = [
        ("a".to_string(), "SELECT 1".to_string()),
        ("b".to_string(), "SELECT 2".to_string()),
    ]
    .into();
    assert_eq!(pool.add_query_definitions(batch).unwrap(), 2);

    // One duplicate, one over capacity: the whole batch is refused.
    let overflow: HashMap<String, String> = [
        ("a".to_string(), "SELECT 1".to_string()),
        ("c".to_string(), "SELECT 3".to_string()),
    ]
    .into();
    let err = pool.add_query_definitions(overflow).unwrap_err();
    assert!(matches!(err, PoolError::DefinitionsRejected { .. }));

    // Duplicates alone are a no-op, not an error.
    let dups: HashMap<String, String> = [("b".to_string(), "SELECT 2".to_string())].into();
    assert_eq!(pool.add_query_definitions(dups).unwrap(), 0);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn pool_creation_fails_without_a_prober() {
    let driver = MockDriver::new();
    driver.backend().fail_connects(true);

    let err = Pool::new(base_config(), Arc::new(driver)).await.unwrap_err();
    assert!(matches!(err, PoolError::EstablishFailed { .. }));
}

#[tokio::test]
async fn status_reflects_borrows() {
    let (pool, _backend) = pool_with(base_config().min_connections(2).max_connections(2)).await;

    let status = pool.status();
    assert_eq!(status.live, 2);
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 2);
    assert!(status.is_at_capacity());

    let wrapper = pool.borrow_connection().await.unwrap();
    let status = pool.status();
    assert_eq!(status.in_use, 1);
    assert!((status.utilization() - 50.0).abs() < f64::EPSILON);

    wrapper.release().await;
    pool.shutdown().await.unwrap();
}
