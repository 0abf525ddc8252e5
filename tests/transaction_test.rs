//! Integration tests for nested transactions and savepoints.

mod common;

use common::{MockAdapter, endpoint};
use db_bridge::adapters::Adapter;
use db_bridge::config::EngineType;
use db_bridge::db::TransactionManager;
use db_bridge::error::ErrorKind;
use db_bridge::models::{Connection, IsolationLevel, TransactionOptions};
use std::sync::Arc;

async fn setup(mock: &Arc<MockAdapter>) -> (TransactionManager, Connection) {
    let adapter: Arc<dyn Adapter> = mock.clone();
    let conn = adapter.connect(&endpoint("tx")).await.unwrap();
    (TransactionManager::new(adapter), conn)
}

fn opts() -> TransactionOptions {
    TransactionOptions::default()
}

#[tokio::test]
async fn test_nested_commit_issues_one_commit() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let (tx, mut conn) = setup(&mock).await;

    assert_eq!(tx.begin(&mut conn, &opts()).await.unwrap(), 1);
    assert_eq!(tx.begin(&mut conn, &opts()).await.unwrap(), 2);
    assert!(conn.in_transaction);
    assert_eq!(conn.transaction_level, 2);

    tx.commit(&mut conn).await.unwrap();
    assert_eq!(tx.depth(conn.id()), 1);
    tx.commit(&mut conn).await.unwrap();

    assert_eq!(mock.count("COMMIT"), 1);
    assert_eq!(mock.count("SAVEPOINT"), 1);
    assert_eq!(mock.count("RELEASE"), 1);

    let calls = mock.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0], "BEGIN");
    assert!(calls[1].starts_with("SAVEPOINT sp_2_"));
    assert_eq!(calls[2], calls[1].replace("SAVEPOINT", "RELEASE"));
    assert_eq!(calls[3], "COMMIT");

    assert!(!conn.in_transaction);
    assert!(!tx.is_active(conn.id()));
}

#[tokio::test]
async fn test_inner_rollback_keeps_outer_open() {
    let mock = MockAdapter::new(EngineType::MySql);
    let (tx, mut conn) = setup(&mock).await;

    tx.begin(&mut conn, &opts()).await.unwrap();
    tx.begin(&mut conn, &opts()).await.unwrap();
    let inner = tx.info(conn.id()).unwrap().savepoints[0].clone();

    tx.rollback(&mut conn, None).await.unwrap();
    assert_eq!(tx.depth(conn.id()), 1);
    assert!(conn.in_transaction);
    assert_eq!(mock.calls().last().unwrap(), &format!("ROLLBACK TO {}", inner));
    assert!(!mock.calls().iter().any(|c| c == "ROLLBACK"));

    tx.rollback(&mut conn, None).await.unwrap();
    assert_eq!(mock.calls().last().unwrap(), "ROLLBACK");
    assert!(!conn.in_transaction);
    assert_eq!(tx.depth(conn.id()), 0);
}

#[tokio::test]
async fn test_rollback_to_named_savepoint_truncates_levels() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let (tx, mut conn) = setup(&mock).await;

    tx.begin(&mut conn, &opts()).await.unwrap();
    tx.savepoint(&mut conn, "before_orders").await.unwrap();
    tx.begin(&mut conn, &opts()).await.unwrap();
    tx.savepoint(&mut conn, "before_items").await.unwrap();
    tx.begin(&mut conn, &opts()).await.unwrap();
    assert_eq!(tx.depth(conn.id()), 3);

    tx.rollback(&mut conn, Some("before_orders")).await.unwrap();
    let info = tx.info(conn.id()).unwrap();
    assert_eq!(info.depth, 1);
    assert_eq!(info.savepoints, vec!["before_orders"]);
    assert_eq!(conn.savepoints, vec!["before_orders"]);
    assert_eq!(mock.calls().last().unwrap(), "ROLLBACK TO before_orders");

    tx.commit(&mut conn).await.unwrap();
    assert_eq!(mock.count("COMMIT"), 1);
}

#[tokio::test]
async fn test_rollback_to_level_savepoint_drops_that_level() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let (tx, mut conn) = setup(&mock).await;

    tx.begin(&mut conn, &opts()).await.unwrap();
    tx.begin(&mut conn, &opts()).await.unwrap();
    let level_two = tx.info(conn.id()).unwrap().savepoints[0].clone();
    tx.begin(&mut conn, &opts()).await.unwrap();

    tx.rollback(&mut conn, Some(&level_two)).await.unwrap();
    assert_eq!(tx.depth(conn.id()), 1);
    assert!(tx.info(conn.id()).unwrap().savepoints.is_empty());
}

#[tokio::test]
async fn test_unknown_savepoint_rejected() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let (tx, mut conn) = setup(&mock).await;

    tx.begin(&mut conn, &opts()).await.unwrap();
    let err = tx.rollback(&mut conn, Some("missing")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(tx.depth(conn.id()), 1);
}

#[tokio::test]
async fn test_duplicate_savepoint_rejected() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let (tx, mut conn) = setup(&mock).await;

    tx.begin(&mut conn, &opts()).await.unwrap();
    tx.savepoint(&mut conn, "a").await.unwrap();
    let err = tx.savepoint(&mut conn, "a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(mock.count("SAVEPOINT"), 1);
}

#[tokio::test]
async fn test_release_savepoint_releases_later_ones() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let (tx, mut conn) = setup(&mock).await;

    tx.begin(&mut conn, &opts()).await.unwrap();
    for name in ["a", "b", "c"] {
        tx.savepoint(&mut conn, name).await.unwrap();
    }
    tx.release_savepoint(&mut conn, "b").await.unwrap();

    assert_eq!(tx.info(conn.id()).unwrap().savepoints, vec!["a"]);
    assert_eq!(mock.calls().last().unwrap(), "RELEASE b");
}

#[tokio::test]
async fn test_nesting_without_savepoints_is_unsupported() {
    let mock = MockAdapter::without_savepoints(EngineType::Redis);
    let (tx, mut conn) = setup(&mock).await;

    tx.begin(&mut conn, &opts()).await.unwrap();
    let err = tx.begin(&mut conn, &opts()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    assert_eq!(tx.depth(conn.id()), 1);

    let err = tx.savepoint(&mut conn, "a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);

    tx.commit(&mut conn).await.unwrap();
    assert_eq!(mock.calls(), vec!["BEGIN", "COMMIT"]);
}

#[tokio::test]
async fn test_commit_without_transaction() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let (tx, mut conn) = setup(&mock).await;

    assert_eq!(tx.commit(&mut conn).await.unwrap_err().kind(), ErrorKind::NoActiveTransaction);
    assert_eq!(
        tx.rollback(&mut conn, None).await.unwrap_err().kind(),
        ErrorKind::NoActiveTransaction
    );
    assert_eq!(
        tx.savepoint(&mut conn, "a").await.unwrap_err().kind(),
        ErrorKind::NoActiveTransaction
    );
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn test_isolation_level_applies_to_outer_level() {
    let mock = MockAdapter::new(EngineType::SqlServer);
    let (tx, mut conn) = setup(&mock).await;

    tx.begin(&mut conn, &TransactionOptions::with_isolation(IsolationLevel::Serializable))
        .await
        .unwrap();
    tx.begin(&mut conn, &TransactionOptions::with_isolation(IsolationLevel::ReadCommitted))
        .await
        .unwrap();

    let calls = mock.calls();
    assert_eq!(calls[0], "BEGIN SERIALIZABLE");
    assert!(calls[1].starts_with("SAVEPOINT"));
}

#[tokio::test]
async fn test_failed_commit_clears_stack() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let (tx, mut conn) = setup(&mock).await;

    tx.begin(&mut conn, &opts()).await.unwrap();
    mock.fail_commits(true);
    let err = tx.commit(&mut conn).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
    assert!(!tx.is_active(conn.id()));
    assert!(!conn.in_transaction);
}

#[tokio::test]
async fn test_stacks_are_per_connection() {
    let mock = MockAdapter::new(EngineType::Postgres);
    let (tx, mut first) = setup(&mock).await;
    let mut second = mock.connect(&endpoint("tx")).await.unwrap();

    tx.begin(&mut first, &opts()).await.unwrap();
    tx.begin(&mut first, &opts()).await.unwrap();
    tx.begin(&mut second, &opts()).await.unwrap();

    assert_eq!(tx.depth(first.id()), 2);
    assert_eq!(tx.depth(second.id()), 1);
    tx.discard(first.id());
    assert_eq!(tx.depth(first.id()), 0);
    assert_eq!(tx.depth(second.id()), 1);
}
