//! Integration tests for the alias-keyed registry.

mod common;

use common::{Failure, MockAdapter, endpoint, pooled_endpoint};
use db_bridge::config::{EndpointConfig, EngineType};
use db_bridge::db::{DatabaseRegistry, RetryPolicy};
use db_bridge::error::{DbError, ErrorKind, OperationCode};
use db_bridge::models::{QueryParam, TransactionOptions};
use db_bridge::result::{ExportFormat, ExportOptions};
use serde_json::{Map, Value as JsonValue, json};
use std::sync::Arc;

async fn open(registry: &DatabaseRegistry, config: EndpointConfig) -> Arc<MockAdapter> {
    let mock = MockAdapter::new(config.engine);
    registry.open_with_adapter(config, mock.clone()).await.unwrap();
    mock
}

fn row(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

#[tokio::test]
async fn test_unknown_alias() {
    let registry = DatabaseRegistry::new();
    let err = registry.query("missing", "SELECT 1", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionNotFound);
    assert_eq!(registry.close("missing").await.unwrap_err().kind(), ErrorKind::ConnectionNotFound);
    assert_eq!(registry.begin("missing", TransactionOptions::default()).await.unwrap_err().kind(), ErrorKind::ConnectionNotFound);
}

#[tokio::test]
async fn test_open_twice_rejected() {
    let registry = DatabaseRegistry::new();
    open(&registry, endpoint("main")).await;

    let err = registry
        .open_with_adapter(endpoint("main"), MockAdapter::new(EngineType::Postgres))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(registry.aliases().await, vec!["main"]);
}

#[tokio::test]
async fn test_open_failure_is_wrapped() {
    let registry = DatabaseRegistry::new();
    let mock = MockAdapter::new(EngineType::Postgres);
    mock.fail_connects(true);

    let err = registry.open_with_adapter(endpoint("main"), mock).await.unwrap_err();
    assert_eq!(err.operation(), Some(OperationCode::ConnectionFailed));
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(!registry.contains("main").await);
}

#[tokio::test]
async fn test_query_failure_carries_context() {
    let registry = DatabaseRegistry::with_retry_policy(RetryPolicy::none());
    let mock = open(&registry, endpoint("main")).await;
    mock.fail_next_queries(1, Failure::Fatal);

    let params = [QueryParam::Int(7), QueryParam::from("x")];
    let err = registry
        .query("main", "SELECT * FORM users WHERE id = ? AND tag = ?", &params)
        .await
        .unwrap_err();

    assert_eq!(err.operation(), Some(OperationCode::QueryFailed));
    assert_eq!(err.kind(), ErrorKind::Query);
    let context = err.context().unwrap();
    assert_eq!(context.alias.as_deref(), Some("main"));
    assert_eq!(context.sql.as_deref(), Some("SELECT * FORM users WHERE id = ? AND tag = ?"));
    assert_eq!(context.params, params.to_vec());
}

#[tokio::test]
async fn test_transaction_pins_connection() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, pooled_endpoint("main", 1, 3, 5)).await;

    assert_eq!(registry.begin("main", TransactionOptions::default()).await.unwrap(), 1);
    registry.query("main", "UPDATE accounts SET balance = balance - 10 WHERE id = ?", &[QueryParam::Int(1)]).await.unwrap();
    registry.query("main", "UPDATE accounts SET balance = balance + 10 WHERE id = ?", &[QueryParam::Int(2)]).await.unwrap();

    let stats = registry.stats("main").await.unwrap();
    assert_eq!(stats.transaction_depth, 1);
    assert_eq!(stats.pool.active, 1);
    // every statement ran on the pinned connection
    assert_eq!(stats.pool.total, 1);

    registry.commit("main").await.unwrap();
    let stats = registry.stats("main").await.unwrap();
    assert_eq!(stats.transaction_depth, 0);
    assert_eq!(stats.pool.active, 0);
    assert!(registry.transaction_info("main").await.unwrap().is_none());

    let calls = mock.calls();
    assert_eq!(calls.first().unwrap(), "BEGIN");
    assert_eq!(calls.last().unwrap(), "COMMIT");
    assert_eq!(mock.count("QUERY UPDATE"), 2);
}

#[tokio::test]
async fn test_nested_levels_through_registry() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, endpoint("main")).await;

    registry.begin("main", TransactionOptions::default()).await.unwrap();
    assert_eq!(registry.begin("main", TransactionOptions::default()).await.unwrap(), 2);
    registry.savepoint("main", "checkpoint").await.unwrap();

    let info = registry.transaction_info("main").await.unwrap().unwrap();
    assert_eq!(info.depth, 2);
    assert_eq!(info.savepoints.len(), 2);
    assert_eq!(info.savepoints[1], "checkpoint");

    registry.rollback("main", None).await.unwrap();
    assert_eq!(registry.transaction_info("main").await.unwrap().unwrap().depth, 1);
    registry.commit("main").await.unwrap();

    assert_eq!(mock.count("COMMIT"), 1);
    assert!(!mock.calls().iter().any(|c| c == "ROLLBACK"));
}

#[tokio::test]
async fn test_commit_without_begin() {
    let registry = DatabaseRegistry::new();
    open(&registry, endpoint("main")).await;

    let err = registry.commit("main").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveTransaction);
    assert_eq!(err.operation(), Some(OperationCode::TransactionCommitFailed));

    let err = registry.savepoint("main", "a").await.unwrap_err();
    assert_eq!(err.operation(), Some(OperationCode::SavepointFailed));
}

#[tokio::test]
async fn test_failed_commit_discards_connection() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, pooled_endpoint("main", 1, 2, 5)).await;

    registry.begin("main", TransactionOptions::default()).await.unwrap();
    mock.fail_commits(true);
    let err = registry.commit("main").await.unwrap_err();
    assert_eq!(err.operation(), Some(OperationCode::TransactionCommitFailed));

    assert!(registry.transaction_info("main").await.unwrap().is_none());
    assert_eq!(mock.disconnects(), 1);
    let stats = registry.stats("main").await.unwrap();
    assert_eq!(stats.pool.active, 0);
}

#[tokio::test]
async fn test_transaction_helper_commits() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, endpoint("main")).await;

    let rows = registry
        .transaction("main", TransactionOptions::default(), async || -> Result<u64, DbError> {
            registry.query("main", "INSERT INTO audit (event) VALUES (?)", &["login".into()]).await?;
            let result = registry.query("main", "SELECT * FROM audit", &[]).await?;
            Ok(result.row_count)
        })
        .await
        .unwrap();

    assert_eq!(rows, 2);
    assert_eq!(
        mock.calls(),
        vec![
            "BEGIN",
            "QUERY INSERT INTO audit (event) VALUES (?)",
            "QUERY SELECT * FROM audit",
            "COMMIT"
        ]
    );
}

#[tokio::test]
async fn test_transaction_helper_rolls_back_on_error() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, endpoint("main")).await;

    let err = registry
        .transaction("main", TransactionOptions::default(), async || -> Result<(), DbError> {
            registry.query("main", "DELETE FROM sessions WHERE user_id = ?", &[QueryParam::Int(5)]).await?;
            Err(DbError::invalid_input("session still referenced"))
        })
        .await
        .unwrap_err();

    // the original error is returned unchanged
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(err.operation(), None);
    assert_eq!(mock.calls().last().unwrap(), "ROLLBACK");
    assert_eq!(mock.count("COMMIT"), 0);
    assert!(registry.transaction_info("main").await.unwrap().is_none());
}

#[tokio::test]
async fn test_execute_batch_rolls_back_on_failure() {
    let registry = DatabaseRegistry::with_retry_policy(RetryPolicy::none());
    let mock = open(&registry, endpoint("main")).await;

    let statements = [
        ("INSERT INTO t (a) VALUES (?)", vec![QueryParam::Int(1)]),
        ("INSERT INTO INVALID", vec![]),
        ("INSERT INTO t (a) VALUES (?)", vec![QueryParam::Int(3)]),
    ];
    let err = registry.execute_batch("main", &statements).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);

    assert_eq!(mock.count("QUERY"), 2);
    assert_eq!(mock.calls().last().unwrap(), "ROLLBACK");

    let ok = registry
        .execute_batch("main", &[("UPDATE t SET a = ?", vec![QueryParam::Int(2)])])
        .await
        .unwrap();
    assert_eq!(ok.len(), 1);
    assert_eq!(ok[0].affected_rows, Some(1));
    assert_eq!(mock.calls().last().unwrap(), "COMMIT");
}

#[tokio::test]
async fn test_close_rolls_back_open_transaction() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, endpoint("main")).await;

    registry.begin("main", TransactionOptions::default()).await.unwrap();
    registry.close("main").await.unwrap();

    assert_eq!(mock.calls(), vec!["BEGIN", "ROLLBACK"]);
    assert_eq!(mock.disconnects(), 1);
    assert!(!registry.contains("main").await);
}

#[tokio::test]
async fn test_named_queries() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, endpoint("main")).await;
    registry.register_query("active_users", "SELECT * FROM users WHERE active = ?");

    let result = registry.execute_named("main", "active_users", &[true.into()]).await.unwrap();
    assert_eq!(result.row_count, 2);
    assert_eq!(mock.calls(), vec!["QUERY SELECT * FROM users WHERE active = ?"]);

    let err = registry.execute_named("main", "nope", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_routines() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, endpoint("main")).await;

    let result = registry
        .execute_procedure("main", "refresh_totals", &[QueryParam::Int(2024)])
        .await
        .unwrap();
    assert_eq!(result.rows[0]["result"], "ok");
    assert_eq!(mock.calls(), vec!["CALL refresh_totals(1)"]);

    let err = registry.execute_function("main", "total", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    assert_eq!(err.operation(), Some(OperationCode::ProcedureFailed));
}

#[tokio::test]
async fn test_prepared_statements() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, endpoint("main")).await;

    let stmt = registry.prepare("main", "SELECT * FROM users WHERE id = ?").await.unwrap();
    assert_eq!(stmt.param_count, 1);

    registry.execute_prepared("main", &stmt, &[QueryParam::Int(1)]).await.unwrap();
    registry.execute_prepared("main", &stmt, &[QueryParam::Int(2)]).await.unwrap();
    assert_eq!(mock.count("QUERY SELECT * FROM users WHERE id = ?"), 2);

    let err = registry.execute_prepared("main", &stmt, &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
}

#[tokio::test]
async fn test_prepared_statement_moves_between_pooled_connections() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, pooled_endpoint("main", 2, 2, 5)).await;

    let stmt = registry.prepare("main", "SELECT * FROM users WHERE id = ?").await.unwrap();
    // idle connections are handed out oldest first, so the next call uses the other one
    let result = registry.execute_prepared("main", &stmt, &[QueryParam::Int(1)]).await.unwrap();
    assert_eq!(result.row_count, 2);
    assert_eq!(mock.count("QUERY"), 1);
}

#[tokio::test]
async fn test_bulk_insert() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, endpoint("main")).await;

    assert_eq!(registry.bulk_insert("main", "users", &[]).await.unwrap(), 0);
    assert!(mock.calls().is_empty());

    let rows = vec![row(json!({"id": 1, "name": "a"})), row(json!({"id": 2, "name": "b"}))];
    assert_eq!(registry.bulk_insert("main", "users", &rows).await.unwrap(), 2);
    assert_eq!(mock.calls(), vec!["BULK users 2"]);
}

#[tokio::test]
async fn test_for_each_row() {
    let registry = DatabaseRegistry::new();
    open(&registry, endpoint("main")).await;

    let mut names = Vec::new();
    let seen = registry
        .for_each_row("main", "SELECT * FROM users", &[], |row| {
            names.push(row["name"].as_str().unwrap_or_default().to_string());
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(seen, 2);
    assert_eq!(names, vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_export_then_import() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, endpoint("main")).await;
    let dir = tempfile::tempdir().unwrap();

    let json_path = dir.path().join("out/users.json");
    let summary = registry
        .export("main", "SELECT * FROM users", &[], &json_path, ExportOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.rows, 2);
    assert_eq!(summary.format, ExportFormat::Json);
    assert!(json_path.exists());

    let imported = registry.import(&json_path).unwrap();
    let queried = registry.query("main", "SELECT * FROM users", &[]).await.unwrap();
    assert_eq!(imported.rows, queried.rows);

    let csv_path = dir.path().join("users.csv");
    registry
        .export("main", "SELECT * FROM users", &[], &csv_path, ExportOptions::default())
        .await
        .unwrap();
    assert_eq!(registry.import_into("main", "users_copy", &csv_path).await.unwrap(), 2);
    assert_eq!(mock.calls().last().unwrap(), "BULK users_copy 2");
}

#[tokio::test]
async fn test_import_missing_file() {
    let registry = DatabaseRegistry::new();
    let err = registry.import("/definitely/not/here.csv").unwrap_err();
    assert_eq!(err.operation(), Some(OperationCode::ImportFailed));
}

#[tokio::test]
async fn test_introspection() {
    let registry = DatabaseRegistry::new();
    let mock = open(&registry, endpoint("main")).await;

    registry.ping("main").await.unwrap();
    assert!(mock.pings() >= 1);

    let metadata = registry.metadata("main").await.unwrap();
    assert_eq!(metadata.server_version.as_deref(), Some("mock 1.0"));

    let columns = registry.table_info("main", "users").await.unwrap();
    assert_eq!(columns.len(), 2);

    let stats = registry.stats("main").await.unwrap();
    assert_eq!(stats.alias, "main");
    assert_eq!(stats.engine, EngineType::Postgres);
    assert!(!stats.pooled);
    assert!(stats.healthy);
    assert_eq!(stats.pool.total, 1);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["total"], 1);
    assert_eq!(json["transaction_depth"], 0);

    assert!(registry.health("main").await.unwrap().healthy);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let registry = DatabaseRegistry::new();
    let first = open(&registry, endpoint("first")).await;
    let second = open(&registry, pooled_endpoint("second", 2, 4, 5)).await;

    registry.shutdown().await;
    assert!(registry.aliases().await.is_empty());
    assert_eq!(first.disconnects(), 1);
    assert_eq!(second.disconnects(), 2);
}
