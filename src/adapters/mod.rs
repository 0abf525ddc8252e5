//! Engine adapters.
//!
//! Every engine implements the [`Adapter`] contract: lifecycle, query
//! execution, transactions and savepoints, prepared statements, metadata,
//! bulk insert and the optional streaming and cancellation hooks. Native
//! driver errors are classified into the canonical [`ErrorKind`]s before
//! they leave an adapter.
//!
//! # Architecture
//!
//! - `common`: identifier quoting, placeholder rewriting and error classification tables
//! - `command`: command-string parsers for the document and key-value engines
//! - `types` / `params`: row decoding and parameter binding for the sqlx engines
//! - one module per engine, selected by [`create_adapter`]
//!
//! [`ErrorKind`]: crate::error::ErrorKind

pub mod command;
pub mod common;
pub mod mongodb;
pub mod mysql;
pub mod oracle;
pub mod params;
pub mod postgres;
pub mod redis;
pub mod sqlserver;
pub mod types;

use crate::config::{EndpointConfig, EngineType};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnMetadata, Connection, IsolationLevel, PreparedStatement, QueryOptions, QueryParam,
    RawResult, ServerMetadata,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// Lazy, finite, non-restartable sequence of rows.
pub type RowStream<'c> = BoxStream<'c, DbResult<Map<String, JsonValue>>>;

/// Number of rows sent per multi-row INSERT by the default bulk insert.
pub const BULK_INSERT_CHUNK: usize = 500;

/// Optional features an engine supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub savepoints: bool,
    /// Engine has an explicit RELEASE SAVEPOINT statement
    pub release_savepoint: bool,
    pub streaming: bool,
    pub cancel: bool,
    pub prepared_statements: bool,
    pub procedures: bool,
    pub bulk_insert: bool,
}

impl Capabilities {
    /// Full relational feature set.
    pub const fn relational() -> Self {
        Self {
            savepoints: true,
            release_savepoint: true,
            streaming: false,
            cancel: false,
            prepared_statements: true,
            procedures: true,
            bulk_insert: true,
        }
    }
}

/// Best-effort cancellation of an in-flight statement.
///
/// Obtained from [`Adapter::canceller`] before the statement starts, so it
/// never needs the (busy) connection itself.
#[async_trait]
pub trait Canceller: Send + Sync {
    async fn cancel(&self) -> DbResult<()>;
}

/// Canonical database operation contract.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn engine(&self) -> EngineType;

    fn capabilities(&self) -> Capabilities;

    async fn connect(&self, config: &EndpointConfig) -> DbResult<Connection>;

    async fn disconnect(&self, conn: &mut Connection) -> DbResult<()>;

    /// Run a statement or command. `?` is the canonical positional placeholder.
    async fn query(
        &self,
        conn: &mut Connection,
        text: &str,
        params: &[QueryParam],
        opts: &QueryOptions,
    ) -> DbResult<RawResult>;

    async fn execute_procedure(
        &self,
        _conn: &mut Connection,
        _name: &str,
        _params: &[QueryParam],
    ) -> DbResult<RawResult> {
        Err(DbError::unsupported("stored procedures", self.engine()))
    }

    async fn execute_function(
        &self,
        _conn: &mut Connection,
        _name: &str,
        _params: &[QueryParam],
    ) -> DbResult<RawResult> {
        Err(DbError::unsupported("scalar functions", self.engine()))
    }

    async fn begin_transaction(
        &self,
        conn: &mut Connection,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<()>;

    async fn commit(&self, conn: &mut Connection) -> DbResult<()>;

    async fn rollback(&self, conn: &mut Connection) -> DbResult<()>;

    async fn create_savepoint(&self, _conn: &mut Connection, _name: &str) -> DbResult<()> {
        Err(DbError::unsupported("savepoints", self.engine()))
    }

    async fn release_savepoint(&self, _conn: &mut Connection, _name: &str) -> DbResult<()> {
        Err(DbError::unsupported("RELEASE SAVEPOINT", self.engine()))
    }

    async fn rollback_to_savepoint(&self, _conn: &mut Connection, _name: &str) -> DbResult<()> {
        Err(DbError::unsupported("savepoints", self.engine()))
    }

    /// Prepare `text` for repeated execution on `conn`.
    ///
    /// The default keeps the canonical text; drivers with a statement cache
    /// reuse the server-side statement on every execution.
    async fn prepare(&self, conn: &mut Connection, text: &str) -> DbResult<PreparedStatement> {
        if !self.capabilities().prepared_statements {
            return Err(DbError::unsupported("prepared statements", self.engine()));
        }
        Ok(PreparedStatement {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            engine: self.engine(),
            param_count: common::count_placeholders(text),
            connection_id: conn.id().to_string(),
        })
    }

    async fn execute_prepared(
        &self,
        conn: &mut Connection,
        stmt: &PreparedStatement,
        params: &[QueryParam],
    ) -> DbResult<RawResult> {
        common::check_prepared(conn, stmt, params)?;
        self.query(conn, &stmt.text, params, &QueryOptions::default())
            .await
    }

    async fn ping(&self, conn: &mut Connection) -> DbResult<()>;

    async fn metadata(&self, conn: &mut Connection) -> DbResult<ServerMetadata>;

    async fn table_info(&self, conn: &mut Connection, table: &str)
    -> DbResult<Vec<ColumnMetadata>>;

    /// Insert `rows` into `table`; returns the number of rows written.
    ///
    /// The default sends chunked multi-row INSERT statements built from the
    /// first row's keys.
    async fn bulk_insert(
        &self,
        conn: &mut Connection,
        table: &str,
        rows: &[Map<String, JsonValue>],
    ) -> DbResult<u64> {
        let engine = self.engine();
        if !engine.is_relational() {
            return Err(DbError::unsupported("bulk insert", engine));
        }
        let columns = rows.first().map(|row| row.len()).unwrap_or(1);
        let mut written = 0;
        for chunk in rows.chunks(common::bulk_chunk_rows(engine, columns)) {
            let Some((sql, params)) = common::build_bulk_insert(engine, table, chunk)? else {
                continue;
            };
            let raw = self
                .query(conn, &sql, &params, &QueryOptions::default())
                .await?;
            written += raw.affected_rows.unwrap_or(chunk.len() as u64);
        }
        Ok(written)
    }

    /// Lazily stream rows of a query, when the driver supports it.
    fn stream<'c>(
        &'c self,
        _conn: &'c mut Connection,
        _text: &'c str,
        _params: &'c [QueryParam],
    ) -> DbResult<RowStream<'c>> {
        Err(DbError::unsupported("streaming", self.engine()))
    }

    /// Handle for cancelling the statement about to run on `conn`.
    fn canceller(&self, _conn: &Connection) -> Option<Box<dyn Canceller>> {
        None
    }
}

/// Create the adapter for an engine.
pub fn create_adapter(engine: EngineType) -> Arc<dyn Adapter> {
    match engine {
        EngineType::SqlServer => Arc::new(sqlserver::SqlServerAdapter::new()),
        EngineType::MySql => Arc::new(mysql::MySqlAdapter::new()),
        EngineType::Postgres => Arc::new(postgres::PostgresAdapter::new()),
        EngineType::Oracle => Arc::new(oracle::OracleAdapter::new()),
        EngineType::MongoDb => Arc::new(mongodb::MongoAdapter::new()),
        EngineType::Redis => Arc::new(redis::RedisAdapter::new()),
    }
}
