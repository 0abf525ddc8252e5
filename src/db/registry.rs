//! Alias-keyed facade over the connection, transaction and result layers.
//!
//! Every operation names the configured endpoint it runs against. While an
//! alias has an open transaction its connection is pinned to the alias, so
//! later calls on that alias run on the same physical connection until the
//! outermost commit or rollback releases it.

use super::executor::{QueryExecutor, RetryPolicy, Statement};
use super::manager::{ConnectionManager, HealthStatus};
use super::pool::PoolStats;
use super::transaction::{TransactionInfo, TransactionManager};
use crate::adapters::{Adapter, create_adapter};
use crate::config::{EndpointConfig, EngineType};
use crate::error::{DbError, DbResult, OperationCode, OperationContext};
use crate::models::{
    ColumnMetadata, Connection, PreparedStatement, QueryOptions, QueryParam, QueryResult,
    ServerMetadata, TransactionOptions,
};
use crate::result::{ExportOptions, ExportSummary, ResultExporter, ResultImporter};
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::borrow::Cow;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Statistics reported by [`DatabaseRegistry::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub alias: String,
    pub engine: EngineType,
    pub pooled: bool,
    #[serde(flatten)]
    pub pool: PoolStats,
    pub healthy: bool,
    /// Depth of the alias's open transaction, 0 when none
    pub transaction_depth: u32,
}

/// One opened alias.
struct Endpoint {
    manager: Arc<ConnectionManager>,
    executor: QueryExecutor,
    transactions: TransactionManager,
    /// Connection held by the alias's open transaction
    pinned: Mutex<Option<Connection>>,
}

impl Endpoint {
    fn adapter(&self) -> &Arc<dyn Adapter> {
        self.manager.adapter()
    }

    /// Run `op` on the pinned connection, or on a checked-out one.
    async fn with_session<T>(&self, op: impl AsyncFnOnce(&mut Connection) -> DbResult<T>) -> DbResult<T> {
        let mut pinned = self.pinned.lock().await;
        if let Some(conn) = pinned.as_mut() {
            return op(conn).await;
        }
        drop(pinned);
        self.manager.execute_with_connection(op).await
    }

    /// Keep `conn` pinned while its transaction is open, else hand it back.
    async fn settle(&self, pinned: &mut Option<Connection>, mut conn: Connection, failed: bool) {
        if self.transactions.is_active(conn.id()) {
            *pinned = Some(conn);
            return;
        }
        self.transactions.discard(conn.id());
        if failed {
            // a failed COMMIT or ROLLBACK leaves the server-side state unknown
            conn.mark_broken();
        }
        self.manager.release(conn).await;
    }
}

/// Registry of opened endpoints, keyed by alias.
pub struct DatabaseRegistry {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    named_queries: StdRwLock<HashMap<String, String>>,
    policy: RetryPolicy,
}

impl Default for DatabaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(policy: RetryPolicy) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            named_queries: StdRwLock::new(HashMap::new()),
            policy,
        }
    }

    async fn endpoint(&self, alias: &str) -> DbResult<Arc<Endpoint>> {
        self.endpoints
            .read()
            .await
            .get(alias)
            .cloned()
            .ok_or_else(|| DbError::connection_not_found(alias))
    }

    pub async fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.endpoints.read().await.keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub async fn contains(&self, alias: &str) -> bool {
        self.endpoints.read().await.contains_key(alias)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open an endpoint with the adapter for its engine.
    pub async fn open(&self, config: EndpointConfig) -> DbResult<()> {
        let adapter = create_adapter(config.engine);
        self.open_with_adapter(config, adapter).await
    }

    /// Open an endpoint with a caller-supplied adapter.
    pub async fn open_with_adapter(&self, config: EndpointConfig, adapter: Arc<dyn Adapter>) -> DbResult<()> {
        let alias = config.alias.clone();
        if self.contains(&alias).await {
            return Err(DbError::invalid_input(format!("alias '{}' is already open", alias)));
        }

        let policy = match config.option("max_retries").and_then(|v| v.parse().ok()) {
            Some(retries) => self.policy.clone().with_max_retries(retries),
            None => self.policy.clone(),
        };
        let query_timeout = config.query_timeout();
        let description = config.masked();

        let manager = ConnectionManager::open(adapter.clone(), config)
            .await
            .map_err(|e| e.with_operation(OperationCode::ConnectionFailed, OperationContext::new(&alias)))?;
        let endpoint = Arc::new(Endpoint {
            executor: QueryExecutor::new(adapter.clone(), policy, query_timeout),
            transactions: TransactionManager::new(adapter),
            pinned: Mutex::new(None),
            manager,
        });

        let replaced = self.endpoints.write().await.insert(alias.clone(), endpoint);
        if let Some(previous) = replaced {
            // lost a race with a concurrent open of the same alias
            previous.manager.close().await;
        }
        info!(alias = %alias, endpoint = %description, "Endpoint opened");
        Ok(())
    }

    /// Open an alias from `DB_<ALIAS>_*` environment keys.
    pub async fn open_from_env(&self, alias: &str) -> DbResult<()> {
        let config = EndpointConfig::from_env(alias).map_err(DbError::invalid_input)?;
        self.open(config).await
    }

    /// Close an alias, rolling back any open transaction.
    pub async fn close(&self, alias: &str) -> DbResult<()> {
        let endpoint = self
            .endpoints
            .write()
            .await
            .remove(alias)
            .ok_or_else(|| DbError::connection_not_found(alias))?;
        Self::close_endpoint(alias, &endpoint).await;
        Ok(())
    }

    async fn close_endpoint(alias: &str, endpoint: &Endpoint) {
        if let Some(conn) = endpoint.pinned.lock().await.take() {
            warn!(alias, connection_id = %conn.id(), "Closing alias with an open transaction");
            endpoint.transactions.discard(conn.id());
            // release rolls back a connection still inside a transaction
            endpoint.manager.release(conn).await;
        }
        endpoint.manager.close().await;
        info!(alias, "Endpoint closed");
    }

    /// Close every alias.
    pub async fn shutdown(&self) {
        let endpoints: Vec<(String, Arc<Endpoint>)> = self.endpoints.write().await.drain().collect();
        for (alias, endpoint) in endpoints {
            Self::close_endpoint(&alias, &endpoint).await;
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn query(&self, alias: &str, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.query_with(alias, sql, params, &QueryOptions::default()).await
    }

    pub async fn query_with(
        &self,
        alias: &str,
        sql: &str,
        params: &[QueryParam],
        opts: &QueryOptions,
    ) -> DbResult<QueryResult> {
        let endpoint = self.endpoint(alias).await?;
        endpoint
            .with_session(async |conn: &mut Connection| endpoint.executor.execute(conn, sql, params, opts).await)
            .await
            .map_err(|e| {
                e.with_operation(
                    OperationCode::QueryFailed,
                    OperationContext::new(alias).with_sql(sql).with_params(params),
                )
            })
    }

    /// Register statement text under a name for [`Self::execute_named`].
    pub fn register_query(&self, name: impl Into<String>, text: impl Into<String>) {
        self.named_queries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), text.into());
    }

    pub async fn execute_named(&self, alias: &str, name: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let text = self
            .named_queries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::invalid_input(format!("no query registered as '{}'", name)))?;
        self.query(alias, &text, params).await
    }

    pub async fn execute_procedure(&self, alias: &str, name: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.run_routine(alias, Statement::Procedure(name), params).await
    }

    pub async fn execute_function(&self, alias: &str, name: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.run_routine(alias, Statement::Function(name), params).await
    }

    async fn run_routine(&self, alias: &str, statement: Statement<'_>, params: &[QueryParam]) -> DbResult<QueryResult> {
        let endpoint = self.endpoint(alias).await?;
        let name = match statement {
            Statement::Procedure(name) | Statement::Function(name) => name,
            _ => "",
        };
        endpoint
            .with_session(async |conn: &mut Connection| {
                endpoint
                    .executor
                    .run(conn, statement, params, &QueryOptions::default())
                    .await
            })
            .await
            .map_err(|e| {
                e.with_operation(
                    OperationCode::ProcedureFailed,
                    OperationContext::new(alias).with_sql(name).with_params(params),
                )
            })
    }

    /// Prepare a statement on the alias's current connection.
    pub async fn prepare(&self, alias: &str, text: &str) -> DbResult<PreparedStatement> {
        let endpoint = self.endpoint(alias).await?;
        endpoint
            .with_session(async |conn: &mut Connection| endpoint.adapter().prepare(conn, text).await)
            .await
            .map_err(|e| e.with_operation(OperationCode::QueryFailed, OperationContext::new(alias).with_sql(text)))
    }

    /// Execute a prepared statement.
    ///
    /// A statement prepared on a different pooled connection is prepared
    /// again on the one checked out for this call.
    pub async fn execute_prepared(
        &self,
        alias: &str,
        stmt: &PreparedStatement,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        let endpoint = self.endpoint(alias).await?;
        endpoint
            .with_session(async |conn: &mut Connection| {
                let stmt: Cow<'_, PreparedStatement> = if stmt.connection_id == conn.id() {
                    Cow::Borrowed(stmt)
                } else {
                    debug!(alias, statement = %stmt.id, connection_id = %conn.id(), "Re-preparing statement");
                    Cow::Owned(endpoint.adapter().prepare(conn, &stmt.text).await?)
                };
                endpoint
                    .executor
                    .run(conn, Statement::Prepared(&stmt), params, &QueryOptions::default())
                    .await
            })
            .await
            .map_err(|e| {
                e.with_operation(
                    OperationCode::QueryFailed,
                    OperationContext::new(alias).with_sql(&stmt.text).with_params(params),
                )
            })
    }

    /// Insert rows into a table or collection; returns the rows written.
    pub async fn bulk_insert(&self, alias: &str, table: &str, rows: &[Map<String, JsonValue>]) -> DbResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let endpoint = self.endpoint(alias).await?;
        let started = Instant::now();
        let written = endpoint
            .with_session(async |conn: &mut Connection| endpoint.adapter().bulk_insert(conn, table, rows).await)
            .await
            .map_err(|e| {
                e.with_operation(
                    OperationCode::BulkInsertFailed,
                    OperationContext::new(alias).with_sql(table),
                )
            })?;
        info!(alias, table, rows = written, elapsed_ms = started.elapsed().as_millis() as u64, "Bulk insert finished");
        Ok(written)
    }

    /// Stream a query's rows through `f`; returns the number of rows seen.
    pub async fn for_each_row<F>(&self, alias: &str, sql: &str, params: &[QueryParam], mut f: F) -> DbResult<u64>
    where
        F: FnMut(Map<String, JsonValue>) -> DbResult<()>,
    {
        let endpoint = self.endpoint(alias).await?;
        endpoint
            .with_session(async |conn: &mut Connection| {
                let mut rows = endpoint.executor.stream(conn, sql, params).await?;
                let mut seen = 0u64;
                while let Some(row) = rows.next().await {
                    f(row?)?;
                    seen += 1;
                }
                Ok(seen)
            })
            .await
            .map_err(|e| {
                e.with_operation(
                    OperationCode::QueryFailed,
                    OperationContext::new(alias).with_sql(sql).with_params(params),
                )
            })
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begin a transaction level on the alias; returns the new depth.
    ///
    /// The outermost begin checks out a connection and pins it to the alias.
    pub async fn begin(&self, alias: &str, opts: TransactionOptions) -> DbResult<u32> {
        let endpoint = self.endpoint(alias).await?;
        let wrap = |e: DbError| e.with_operation(OperationCode::TransactionBeginFailed, OperationContext::new(alias));

        let mut pinned = endpoint.pinned.lock().await;
        let mut conn = match pinned.take() {
            Some(conn) => conn,
            None => endpoint.manager.acquire().await.map_err(wrap)?,
        };
        let result = endpoint.transactions.begin(&mut conn, &opts).await;
        endpoint.settle(&mut pinned, conn, false).await;
        result.map_err(wrap)
    }

    /// Commit the innermost level.
    pub async fn commit(&self, alias: &str) -> DbResult<()> {
        let endpoint = self.endpoint(alias).await?;
        let wrap = |e: DbError| e.with_operation(OperationCode::TransactionCommitFailed, OperationContext::new(alias));

        let mut pinned = endpoint.pinned.lock().await;
        let mut conn = pinned.take().ok_or_else(|| wrap(DbError::no_active_transaction(alias)))?;
        let result = endpoint.transactions.commit(&mut conn).await;
        endpoint.settle(&mut pinned, conn, result.is_err()).await;
        result.map_err(wrap)
    }

    /// Roll back the innermost level, or back to a named savepoint.
    pub async fn rollback(&self, alias: &str, savepoint: Option<&str>) -> DbResult<()> {
        let endpoint = self.endpoint(alias).await?;
        let wrap = |e: DbError| e.with_operation(OperationCode::TransactionRollbackFailed, OperationContext::new(alias));

        let mut pinned = endpoint.pinned.lock().await;
        let mut conn = pinned.take().ok_or_else(|| wrap(DbError::no_active_transaction(alias)))?;
        let result = endpoint.transactions.rollback(&mut conn, savepoint).await;
        endpoint.settle(&mut pinned, conn, result.is_err()).await;
        result.map_err(wrap)
    }

    /// Create a named savepoint in the current level.
    pub async fn savepoint(&self, alias: &str, name: &str) -> DbResult<()> {
        let endpoint = self.endpoint(alias).await?;
        let wrap = |e: DbError| e.with_operation(OperationCode::SavepointFailed, OperationContext::new(alias));

        let mut pinned = endpoint.pinned.lock().await;
        let conn = pinned.as_mut().ok_or_else(|| wrap(DbError::no_active_transaction(alias)))?;
        endpoint.transactions.savepoint(conn, name).await.map_err(wrap)
    }

    pub async fn release_savepoint(&self, alias: &str, name: &str) -> DbResult<()> {
        let endpoint = self.endpoint(alias).await?;
        let wrap = |e: DbError| e.with_operation(OperationCode::SavepointFailed, OperationContext::new(alias));

        let mut pinned = endpoint.pinned.lock().await;
        let conn = pinned.as_mut().ok_or_else(|| wrap(DbError::no_active_transaction(alias)))?;
        endpoint.transactions.release_savepoint(conn, name).await.map_err(wrap)
    }

    /// Snapshot of the alias's open transaction, if any.
    pub async fn transaction_info(&self, alias: &str) -> DbResult<Option<TransactionInfo>> {
        let endpoint = self.endpoint(alias).await?;
        let pinned = endpoint.pinned.lock().await;
        Ok(pinned.as_ref().and_then(|conn| endpoint.transactions.info(conn.id())))
    }

    /// Run `op` inside a transaction level: commit on success, roll back
    /// and return the original error on failure.
    ///
    /// Calls made by `op` on the same alias run inside the transaction.
    pub async fn transaction<T, F>(&self, alias: &str, opts: TransactionOptions, op: F) -> DbResult<T>
    where
        F: AsyncFnOnce() -> DbResult<T>,
    {
        self.begin(alias, opts).await?;
        let outcome = AssertUnwindSafe(op()).catch_unwind().await;
        match outcome {
            Ok(Ok(value)) => {
                self.commit(alias).await?;
                Ok(value)
            }
            Ok(Err(e)) => {
                if let Err(rollback_err) = self.rollback(alias, None).await {
                    warn!(alias, error = %rollback_err, "Rollback after failure failed");
                }
                Err(e)
            }
            Err(panic) => {
                if let Err(rollback_err) = self.rollback(alias, None).await {
                    warn!(alias, error = %rollback_err, "Rollback after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Run statements in order inside one transaction.
    pub async fn execute_batch(
        &self,
        alias: &str,
        statements: &[(&str, Vec<QueryParam>)],
    ) -> DbResult<Vec<QueryResult>> {
        self.transaction(alias, TransactionOptions::default(), async || {
            let mut results = Vec::with_capacity(statements.len());
            for (sql, params) in statements {
                results.push(self.query(alias, sql, params).await?);
            }
            Ok(results)
        })
        .await
    }

    // =========================================================================
    // Export / import
    // =========================================================================

    /// Run a query and write its result to `path`.
    pub async fn export(
        &self,
        alias: &str,
        sql: &str,
        params: &[QueryParam],
        path: impl AsRef<Path>,
        options: ExportOptions,
    ) -> DbResult<ExportSummary> {
        let result = self.query(alias, sql, params).await?;
        ResultExporter::with_options(&result, options)
            .write(path)
            .map_err(|e| {
                e.with_operation(
                    OperationCode::ExportFailed,
                    OperationContext::new(alias).with_sql(sql).with_params(params),
                )
            })
    }

    /// Read rows from a file in any supported format.
    pub fn import(&self, path: impl AsRef<Path>) -> DbResult<QueryResult> {
        let path = path.as_ref();
        ResultImporter::new(path).read().map_err(|e| {
            e.with_operation(
                OperationCode::ImportFailed,
                OperationContext::default().with_sql(&path.display().to_string()),
            )
        })
    }

    /// Read rows from a file and bulk insert them into `table`.
    pub async fn import_into(&self, alias: &str, table: &str, path: impl AsRef<Path>) -> DbResult<u64> {
        let result = self.import(path)?;
        self.bulk_insert(alias, table, &result.rows).await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub async fn stats(&self, alias: &str) -> DbResult<ConnectionStats> {
        let endpoint = self.endpoint(alias).await?;
        let transaction_depth = endpoint
            .pinned
            .lock()
            .await
            .as_ref()
            .map(|conn| endpoint.transactions.depth(conn.id()))
            .unwrap_or(0);
        Ok(ConnectionStats {
            alias: alias.to_string(),
            engine: endpoint.adapter().engine(),
            pooled: endpoint.manager.is_pooled(),
            pool: endpoint.manager.stats(),
            healthy: endpoint.manager.health().healthy,
            transaction_depth,
        })
    }

    pub async fn health(&self, alias: &str) -> DbResult<HealthStatus> {
        Ok(self.endpoint(alias).await?.manager.health())
    }

    /// Round-trip to the server; returns the latency in milliseconds.
    pub async fn ping(&self, alias: &str) -> DbResult<u64> {
        let endpoint = self.endpoint(alias).await?;
        let started = Instant::now();
        endpoint
            .with_session(async |conn: &mut Connection| endpoint.adapter().ping(conn).await)
            .await
            .map_err(|e| e.with_operation(OperationCode::ConnectionFailed, OperationContext::new(alias)))?;
        Ok(started.elapsed().as_millis() as u64)
    }

    pub async fn metadata(&self, alias: &str) -> DbResult<ServerMetadata> {
        let endpoint = self.endpoint(alias).await?;
        endpoint
            .with_session(async |conn: &mut Connection| endpoint.adapter().metadata(conn).await)
            .await
            .map_err(|e| e.with_operation(OperationCode::QueryFailed, OperationContext::new(alias)))
    }

    pub async fn table_info(&self, alias: &str, table: &str) -> DbResult<Vec<ColumnMetadata>> {
        let endpoint = self.endpoint(alias).await?;
        endpoint
            .with_session(async |conn: &mut Connection| endpoint.adapter().table_info(conn, table).await)
            .await
            .map_err(|e| e.with_operation(OperationCode::QueryFailed, OperationContext::new(alias).with_sql(table)))
    }
}
