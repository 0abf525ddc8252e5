//! Integration tests for the connection manager and its health monitor.

mod common;

use common::{MockAdapter, endpoint, pooled_endpoint};
use db_bridge::adapters::Adapter;
use db_bridge::config::{EndpointConfig, EngineType};
use db_bridge::db::ConnectionManager;
use db_bridge::error::{DbError, ErrorKind};
use db_bridge::models::Connection;
use std::sync::Arc;
use std::time::Duration;

async fn open(mock: &Arc<MockAdapter>, config: EndpointConfig) -> Arc<ConnectionManager> {
    let adapter: Arc<dyn Adapter> = mock.clone();
    ConnectionManager::open(adapter, config).await.unwrap()
}

fn recovering(alias: &str) -> EndpointConfig {
    endpoint(alias)
        .with_option("reconnect_attempts", "2")
        .with_option("reconnect_delay_ms", "100")
}

#[tokio::test]
async fn test_single_connection_is_reused() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let manager = open(&mock, endpoint("single")).await;
    assert!(!manager.is_pooled());

    let first = manager.acquire().await.unwrap();
    let id = first.id().to_string();
    assert_eq!(manager.stats().active, 1);
    manager.release(first).await;

    let second = manager.acquire().await.unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(mock.connects(), 1);
    manager.release(second).await;
    assert_eq!(manager.stats().idle, 1);
}

#[tokio::test(start_paused = true)]
async fn test_single_connection_serializes_callers() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let manager = open(&mock, endpoint("single")).await;

    let held = manager.acquire().await.unwrap();
    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire().await.map(|conn| conn.id().to_string()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    let id = held.id().to_string();
    manager.release(held).await;
    assert_eq!(waiter.await.unwrap().unwrap(), id);
}

#[tokio::test]
async fn test_execute_with_connection_releases_on_error() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let manager = open(&mock, pooled_endpoint("pooled", 1, 2, 5)).await;

    let result: Result<(), DbError> = manager
        .execute_with_connection(async |_conn: &mut Connection| Err(DbError::invalid_input("bad request")))
        .await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidInput);

    let stats = manager.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn test_execute_with_connection_panic_discards_connection() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let manager = open(&mock, endpoint("single")).await;

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .execute_with_connection(async |_conn: &mut Connection| -> Result<(), DbError> { panic!("driver exploded") })
                .await
        })
    };
    assert!(task.await.unwrap_err().is_panic());
    assert_eq!(mock.disconnects(), 1);

    // the slot is free again and a fresh connection is opened
    let conn = manager.acquire().await.unwrap();
    assert!(conn.is_usable());
    assert_eq!(mock.connects(), 2);
}

#[tokio::test]
async fn test_failed_disconnect_still_frees_single_slot() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let manager = open(&mock, endpoint("single")).await;

    let mut conn = manager.acquire().await.unwrap();
    conn.mark_broken();
    mock.fail_disconnects(true);
    manager.release(conn).await;
    assert_eq!(mock.disconnects(), 1);

    mock.fail_disconnects(false);
    let conn = manager.acquire().await.unwrap();
    assert!(conn.is_usable());
    assert_eq!(mock.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_health_check_reconnects() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let manager = open(&mock, recovering("single")).await;

    mock.fail_pings(true);
    manager.check_health().await.unwrap();
    mock.fail_pings(false);

    assert_eq!(mock.connects(), 2);
    assert_eq!(mock.disconnects(), 1);
    let health = manager.health();
    assert!(health.healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.reconnect_attempts, 0);
    assert!(!health.fatal);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnects_are_fatal() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let manager = open(&mock, recovering("single")).await;

    mock.fail_pings(true);
    mock.fail_connects(true);
    let started = tokio::time::Instant::now();
    let err = manager.check_health().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReconnectFailed);
    // 100ms + 200ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(300));

    let health = manager.health();
    assert!(health.fatal);
    assert!(!health.healthy);
    assert_eq!(health.reconnect_attempts, 2);
    assert_eq!(health.consecutive_failures, 1);

    mock.fail_connects(false);
    let err = manager.acquire().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReconnectFailed);
}

#[tokio::test(start_paused = true)]
async fn test_background_monitor_recovers() {
    let mock = MockAdapter::new(EngineType::MySql);
    let config = EndpointConfig::new("monitored", EngineType::MySql, "db.test")
        .with_option("health_check_interval", "1")
        .with_option("reconnect_delay_ms", "10");
    let manager = open(&mock, config).await;

    mock.fail_pings(true);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    mock.fail_pings(false);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(mock.connects() >= 2);
    assert!(manager.health().healthy);
    manager.close().await;
}

#[tokio::test]
async fn test_pooled_reconnect_replaces_connections() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let manager = open(&mock, pooled_endpoint("pooled", 2, 4, 5)).await;
    assert!(manager.is_pooled());

    manager.reconnect().await.unwrap();
    assert_eq!(mock.connects(), 4);
    assert_eq!(mock.disconnects(), 2);
    assert_eq!(manager.stats().total, 2);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let adapter: Arc<dyn Adapter> = mock.clone();
    let err = ConnectionManager::open(adapter, EndpointConfig::new("", EngineType::Postgres, "h"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(mock.connects(), 0);
}

#[tokio::test]
async fn test_debug_output_names_alias_and_mode() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let manager = open(&mock, pooled_endpoint("reporting", 1, 2, 5)).await;

    let rendered = format!("{:?}", manager);
    assert!(rendered.starts_with("ConnectionManager"), "{}", rendered);
    assert!(rendered.contains("\"reporting\""), "{}", rendered);
    assert!(rendered.contains("pooled: true"), "{}", rendered);
    assert!(rendered.contains("healthy"), "{}", rendered);
}

#[tokio::test]
async fn test_close_disconnects() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let manager = open(&mock, endpoint("single")).await;
    manager.close().await;
    assert_eq!(mock.disconnects(), 1);
    assert!(manager.acquire().await.is_err());
}
