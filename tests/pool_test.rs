//! Integration tests for the connection pool.

mod common;

use common::{MockAdapter, pooled_endpoint};
use db_bridge::adapters::Adapter;
use db_bridge::config::{EngineType, PoolOptions};
use db_bridge::db::ConnectionPool;
use db_bridge::error::ErrorKind;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn pool_with(mock: &Arc<MockAdapter>, options: PoolOptions) -> Arc<ConnectionPool> {
    let adapter: Arc<dyn Adapter> = mock.clone();
    let config = common::endpoint("pool").with_pool(options);
    ConnectionPool::new(adapter, Arc::new(config)).await.unwrap()
}

async fn pool(mock: &Arc<MockAdapter>, min: u32, max: u32, acquire_timeout_secs: u64) -> Arc<ConnectionPool> {
    let adapter: Arc<dyn Adapter> = mock.clone();
    let config = pooled_endpoint("pool", min, max, acquire_timeout_secs);
    ConnectionPool::new(adapter, Arc::new(config)).await.unwrap()
}

/// Let spawned tasks run until they block.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn test_opens_min_connections() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool(&mock, 2, 5, 5).await;

    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.active, 0);
    assert_eq!(mock.connects(), 2);
}

#[tokio::test]
async fn test_first_connect_failure_fails_creation() {
    let mock = MockAdapter::new(EngineType::Postgres);
    mock.fail_connects(true);
    let adapter: Arc<dyn Adapter> = mock.clone();
    let err = ConnectionPool::new(adapter, Arc::new(pooled_endpoint("pool", 1, 5, 5)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test(start_paused = true)]
async fn test_sixth_acquire_waits_for_release() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool(&mock, 2, 5, 30).await;

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire().await.unwrap());
    }
    assert_eq!(pool.stats().active, 5);
    assert_eq!(pool.stats().total, 5);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    settle().await;
    assert_eq!(pool.stats().waiting, 1);
    assert!(!waiter.is_finished());

    let released = held.pop().unwrap();
    let released_id = released.id().to_string();
    pool.release(released).await;

    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(conn.id(), released_id);
    let stats = pool.stats();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.active, 5);
    assert_eq!(stats.waiting, 0);
    assert_eq!(mock.connects(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_timeout() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool(&mock, 1, 1, 2).await;

    let _held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AcquireTimeout);
    assert_eq!(pool.stats().waiting, 0);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_served_fifo() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool(&mock, 1, 1, 30).await;
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = pool.acquire().await.unwrap();

    let mut tasks = Vec::new();
    for name in ["first", "second", "third"] {
        let pool = pool.clone();
        let order = order.clone();
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            order.lock().unwrap().push(name);
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.release(conn).await;
        }));
        settle().await;
    }
    assert_eq!(pool.stats().waiting, 3);

    pool.release(held).await;
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test(start_paused = true)]
async fn test_never_exceeds_max() {
    let mut rng = rand::thread_rng();
    for _ in 0..5 {
        let max = rng.gen_range(1..=6u32);
        let callers = rng.gen_range(1..=20usize);
        let holds: Vec<u64> = (0..callers).map(|_| rng.gen_range(1..50)).collect();

        let mock = MockAdapter::new(EngineType::MySql);
        let pool = pool(&mock, 1, max, 60).await;

        let tasks: Vec<_> = holds
            .into_iter()
            .map(|hold_ms| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let conn = pool.acquire().await.unwrap();
                    let stats = pool.stats();
                    assert!(stats.active <= max as usize, "{:?}", stats);
                    assert!(stats.total <= max as usize, "{:?}", stats);
                    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    pool.release(conn).await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert!(stats.total <= max as usize);
        assert!(mock.connects() <= max as usize);
    }
}

#[tokio::test]
async fn test_failed_release_validation_replaces_connection() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool_with(
        &mock,
        PoolOptions {
            min_connections: Some(1),
            max_connections: Some(2),
            validate_on_release: Some(true),
            ..Default::default()
        },
    )
    .await;

    let conn = pool.acquire().await.unwrap();
    let bad_id = conn.id().to_string();

    mock.fail_pings(true);
    pool.release(conn).await;
    mock.fail_pings(false);

    assert_eq!(mock.disconnects(), 1);
    // replaced to keep the minimum
    assert_eq!(mock.connects(), 2);
    assert_eq!(pool.stats().total, 1);

    let next = pool.acquire().await.unwrap();
    assert_ne!(next.id(), bad_id);
}

#[tokio::test]
async fn test_broken_connection_not_reused() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool(&mock, 0, 2, 5).await;

    let mut conn = pool.acquire().await.unwrap();
    let id = conn.id().to_string();
    conn.mark_broken();
    pool.release(conn).await;

    assert_eq!(pool.stats().total, 0);
    assert_eq!(mock.disconnects(), 1);
    let next = pool.acquire().await.unwrap();
    assert_ne!(next.id(), id);
}

#[tokio::test]
async fn test_idle_validation_on_acquire() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool(&mock, 1, 2, 5).await;

    mock.fail_pings(true);
    // the idle connection fails its ping; the replacement is not pinged
    let conn = pool.acquire().await.unwrap();
    mock.fail_pings(false);

    assert_eq!(mock.disconnects(), 1);
    assert_eq!(mock.connects(), 2);
    assert_eq!(pool.stats().total, 1);
    pool.release(conn).await;
}

#[tokio::test]
async fn test_release_inside_transaction_rolls_back() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool(&mock, 1, 1, 5).await;

    let mut conn = pool.acquire().await.unwrap();
    conn.in_transaction = true;
    pool.release(conn).await;

    assert_eq!(mock.calls(), vec!["ROLLBACK"]);
    let conn = pool.acquire().await.unwrap();
    assert!(!conn.in_transaction);
}

#[tokio::test(start_paused = true)]
async fn test_reap_idle_keeps_minimum() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool_with(
        &mock,
        PoolOptions {
            min_connections: Some(1),
            max_connections: Some(3),
            idle_timeout_secs: Some(1),
            reap_interval_secs: Some(3600),
            ..Default::default()
        },
    )
    .await;

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    pool.release(a).await;
    pool.release(b).await;
    pool.release(c).await;
    assert_eq!(pool.stats().idle, 3);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(pool.reap_idle().await, 2);

    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(mock.disconnects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_drain_rejects_waiters() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool(&mock, 1, 1, 30).await;

    let held = pool.acquire().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    settle().await;
    assert_eq!(pool.stats().waiting, 1);

    pool.drain().await;
    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(pool.is_closed());

    // checked-out connections from the old generation are closed on release
    pool.release(held).await;
    assert_eq!(mock.disconnects(), 1);
    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.active, 0);
}

#[tokio::test]
async fn test_reconnect_opens_fresh_generation() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool(&mock, 2, 4, 5).await;

    pool.reconnect().await.unwrap();

    assert!(!pool.is_closed());
    assert_eq!(mock.disconnects(), 2);
    assert_eq!(mock.connects(), 4);
    assert_eq!(pool.stats().total, 2);
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let adapter: Arc<dyn Adapter> = mock.clone();
    let config = common::endpoint("pool").with_pool(PoolOptions {
        min_connections: Some(5),
        max_connections: Some(2),
        ..Default::default()
    });
    let err = ConnectionPool::new(adapter, Arc::new(config)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(mock.connects(), 0);
}

#[tokio::test]
async fn test_release_and_reap_run_on_spawned_tasks() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let pool = pool(&mock, 1, 2, 5).await;

    let conn = pool.acquire().await.unwrap();
    let background = pool.clone();
    tokio::spawn(async move {
        background.release(conn).await;
        background.reap_idle().await
    })
    .await
    .unwrap();
    assert_eq!(pool.stats().idle, 1);

    // releasing into a drained pool closes the connection from a task too
    let conn = pool.acquire().await.unwrap();
    pool.drain().await;
    let background = pool.clone();
    tokio::spawn(async move { background.release(conn).await }).await.unwrap();
    assert_eq!(mock.disconnects(), 1);
}
