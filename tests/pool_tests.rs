use std::sync::Arc;
use std::time::Duration;

use aviary::core::driver::{FailureInjection, FakeConnector};
use aviary::core::pool::{ConnectionPool, PoolConfig, PoolManager};
use aviary::errors::Error;

fn config(min: usize, max: usize) -> PoolConfig {
    PoolConfig {
        min_connections: min,
        max_connections: max,
        ttl: Duration::from_secs(300),
        health_check_interval: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn concurrent_checkouts_never_exceed_max() {
    let connector = Arc::new(FakeConnector::new());
    let pool = Arc::new(ConnectionPool::new(
        "test:///pool",
        config(1, 2),
        connector.clone(),
    ));

    // Three concurrent checkouts with nothing returned: the pool grows to
    // two connections and serves the third caller from an existing handle.
    let checkouts = futures::future::join_all((0..3).map(|_| {
        let pool = pool.clone();
        async move { pool.get_connection().await }
    }))
    .await;

    for checkout in &checkouts {
        assert!(checkout.is_ok());
    }
    assert_eq!(pool.size().await, 2);

    let metrics = pool.metrics().await;
    assert_eq!(metrics.checkout_count, 3);
    assert_eq!(metrics.pool_size, 2);
}

#[tokio::test]
async fn checkout_reuses_returned_connection() {
    let connector = Arc::new(FakeConnector::new());
    let pool = ConnectionPool::new("test:///pool", config(1, 2), connector);

    let first = pool.get_connection().await.unwrap();
    pool.return_connection(&first).await;
    let second = pool.get_connection().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(pool.size().await, 1);
}

#[tokio::test]
async fn exhausted_pool_is_retryable_not_fatal() {
    let connector = Arc::new(FakeConnector::new());
    connector.inject_failures(
        "test:///down",
        FailureInjection {
            fail_connect: true,
            ..Default::default()
        },
    );
    let pool = ConnectionPool::new("test:///down", config(1, 2), connector.clone());

    let err = pool.get_connection().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionUnavailable { .. }));
    assert!(err.is_retryable());

    // The endpoint comes back; the same pool serves again.
    connector.inject_failures("test:///down", FailureInjection::default());
    assert!(pool.get_connection().await.is_ok());
}

#[tokio::test]
async fn health_check_replaces_unhealthy_connections() {
    let connector = Arc::new(FakeConnector::new());
    let pool = ConnectionPool::new(
        "test:///flappy",
        PoolConfig {
            min_connections: 1,
            max_connections: 4,
            ttl: Duration::from_secs(300),
            // Zero interval: every checkout runs the health check.
            health_check_interval: Duration::from_secs(0),
        },
        connector.clone(),
    );

    let first = pool.get_connection().await.unwrap();
    pool.return_connection(&first).await;

    // The endpoint starts failing pings: the next checkout drops the dead
    // handle and replaces it to stay at min_connections.
    connector.inject_failures(
        "test:///flappy",
        FailureInjection {
            fail_ping: true,
            ..Default::default()
        },
    );
    let second = pool.get_connection().await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    let metrics = pool.metrics().await;
    assert!(metrics.reconnect_count >= 1);
    assert!(metrics.pool_size >= 1);
    assert_eq!(connector.closed_handles("test:///flappy"), 1);
}

#[tokio::test]
async fn expired_connections_are_evicted() {
    let connector = Arc::new(FakeConnector::new());
    let pool = ConnectionPool::new(
        "test:///ttl",
        PoolConfig {
            min_connections: 0,
            max_connections: 2,
            ttl: Duration::from_millis(20),
            health_check_interval: Duration::from_secs(60),
        },
        connector.clone(),
    );

    let first = pool.get_connection().await.unwrap();
    pool.return_connection(&first).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = pool.get_connection().await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(connector.closed_handles("test:///ttl"), 1);
    assert_eq!(pool.size().await, 1);
}

#[tokio::test]
async fn close_all_releases_every_handle() {
    let connector = Arc::new(FakeConnector::new());
    let pool = ConnectionPool::new("test:///closing", config(2, 4), connector.clone());

    pool.get_connection().await.unwrap();
    assert_eq!(pool.size().await, 2);

    pool.close_all().await;
    assert_eq!(pool.size().await, 0);
    assert_eq!(connector.closed_handles("test:///closing"), 2);
}

#[tokio::test]
async fn manager_keeps_one_pool_per_uri() {
    let connector = Arc::new(FakeConnector::new());
    let manager = PoolManager::new(connector, config(1, 4));

    manager.get_connection("test:///a").await.unwrap();
    manager.get_connection("test:///a").await.unwrap();
    manager.get_connection("test:///b").await.unwrap();

    let metrics = manager.metrics().await;
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics["test:///a"].checkout_count, 2);
    assert_eq!(metrics["test:///b"].checkout_count, 1);
}

#[tokio::test]
async fn with_connection_runs_driver_calls_off_the_scheduler() {
    let connector = Arc::new(FakeConnector::new());
    connector.add_system(
        "test:///driver",
        aviary::core::driver::SystemRecord {
            id: "vm-1".into(),
            name: "vm-1".into(),
            power_state: aviary::core::driver::PowerState::On,
            vcpus: 2,
            memory_mib: 2048,
            boot_override: None,
            attached_iso: None,
        },
    );
    let manager = PoolManager::new(connector, config(1, 4));

    let systems = manager
        .with_connection("test:///driver", |handle| handle.list_systems())
        .await
        .unwrap();
    assert_eq!(systems.len(), 1);
    assert_eq!(systems[0].id, "vm-1");
}
