//! PostgreSQL adapter (sqlx).

use super::params::bind_postgres_params;
use super::types::RowToJson;
use super::{Adapter, Canceller, Capabilities, RowStream, common};
use crate::config::{EndpointConfig, EngineType};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnMetadata, Connection, IsolationLevel, QueryOptions, QueryParam, RawResult,
    ServerMetadata,
};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Connection as _, Executor, Row};
use std::time::Instant;
use tokio::time::timeout;
use tracing::debug;

const ENGINE: EngineType = EngineType::Postgres;

/// Driver handle stored in the connection envelope.
pub struct PgSession {
    pub conn: PgConnection,
    pub backend_pid: i32,
    options: PgConnectOptions,
}

pub struct PostgresAdapter;

impl PostgresAdapter {
    pub fn new() -> Self {
        Self
    }

    fn connect_options(config: &EndpointConfig) -> PgConnectOptions {
        let mut opts = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port_or_default());
        if let Some(user) = &config.username {
            opts = opts.username(user);
        }
        if let Some(password) = &config.password {
            opts = opts.password(password);
        }
        if let Some(database) = &config.database {
            opts = opts.database(database);
        }
        if let Some(app) = config.option("application_name") {
            opts = opts.application_name(app);
        }
        let mode = match (config.ssl.enabled, config.ssl.trust_server_certificate) {
            (false, _) => PgSslMode::Prefer,
            (true, true) => PgSslMode::Require,
            (true, false) => PgSslMode::VerifyFull,
        };
        opts = opts.ssl_mode(mode);
        if let Some(ca) = &config.ssl.ca_path {
            opts = opts.ssl_root_cert(ca.as_str());
        }
        opts.disable_statement_logging()
    }

    async fn execute_simple(conn: &mut Connection, sql: &str) -> DbResult<u64> {
        let session = conn.native_mut::<PgSession>()?;
        let result = (&mut session.conn)
            .execute(sql)
            .await
            .map_err(|e| common::from_sqlx(ENGINE, e))?;
        conn.touch();
        Ok(result.rows_affected())
    }

    async fn fetch(
        conn: &mut Connection,
        sql: &str,
        params: &[QueryParam],
        max_rows: Option<usize>,
    ) -> DbResult<Vec<sqlx::postgres::PgRow>> {
        let session = conn.native_mut::<PgSession>()?;
        let limit = max_rows.unwrap_or(usize::MAX);
        let rows: Vec<_> = if params.is_empty() {
            // raw SQL avoids the prepared-statement path for DDL and multi-statement text
            (&mut session.conn).fetch(sql).take(limit).collect().await
        } else {
            let query = bind_postgres_params(params, sqlx::query(sql));
            query.fetch(&mut session.conn).take(limit).collect().await
        };
        conn.touch();
        rows.into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| common::from_sqlx(ENGINE, e))
    }

    fn call_sql(keyword: &str, name: &str, params: &[QueryParam]) -> String {
        let placeholders = vec!["?"; params.len()].join(", ");
        format!(
            "{} {}({})",
            keyword,
            common::quote_identifier(ENGINE, name),
            placeholders
        )
    }
}

impl Default for PostgresAdapter {
    fn default() -> Self {
        Self::new()
    }
}

struct PgCanceller {
    options: PgConnectOptions,
    backend_pid: i32,
}

#[async_trait]
impl Canceller for PgCanceller {
    async fn cancel(&self) -> DbResult<()> {
        let mut conn = self
            .options
            .connect()
            .await
            .map_err(|e| common::from_sqlx(ENGINE, e))?;
        sqlx::query("SELECT pg_cancel_backend($1)")
            .bind(self.backend_pid)
            .execute(&mut conn)
            .await
            .map_err(|e| common::from_sqlx(ENGINE, e))?;
        let _ = conn.close().await;
        Ok(())
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    fn engine(&self) -> EngineType {
        ENGINE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            cancel: true,
            ..Capabilities::relational()
        }
    }

    async fn connect(&self, config: &EndpointConfig) -> DbResult<Connection> {
        let options = Self::connect_options(config);
        let connect_timeout = config.connect_timeout();
        let mut pg = timeout(connect_timeout, options.connect())
            .await
            .map_err(|_| DbError::timeout("connect", connect_timeout.as_millis() as u64))?
            .map_err(|e| common::from_sqlx(ENGINE, e))?;

        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut pg)
            .await
            .map_err(|e| common::from_sqlx(ENGINE, e))?;

        debug!(alias = %config.alias, backend_pid, "PostgreSQL connection established");
        Ok(Connection::new(
            ENGINE,
            PgSession {
                conn: pg,
                backend_pid,
                options,
            },
        ))
    }

    async fn disconnect(&self, conn: &mut Connection) -> DbResult<()> {
        let session = conn.take_native::<PgSession>()?;
        session
            .conn
            .close()
            .await
            .map_err(|e| common::from_sqlx(ENGINE, e))
    }

    async fn query(
        &self,
        conn: &mut Connection,
        text: &str,
        params: &[QueryParam],
        opts: &QueryOptions,
    ) -> DbResult<RawResult> {
        let sql = common::rewrite_placeholders(ENGINE, text);
        let command = common::command_tag(text);
        let start = Instant::now();

        if common::returns_rows(text) {
            let rows = Self::fetch(conn, &sql, params, opts.max_rows).await?;
            let fields = rows.first().map(|r| r.column_metadata()).unwrap_or_default();
            let maps = rows.iter().map(|r| r.to_json_map()).collect();
            return Ok(RawResult::rows(maps, fields)
                .with_command(command)
                .with_metadata("elapsed_ms", common::elapsed_ms(start).into()));
        }

        let affected = if params.is_empty() {
            Self::execute_simple(conn, &sql).await?
        } else {
            let session = conn.native_mut::<PgSession>()?;
            let query = bind_postgres_params(params, sqlx::query(&sql));
            let result = query
                .execute(&mut session.conn)
                .await
                .map_err(|e| common::from_sqlx(ENGINE, e))?;
            conn.touch();
            result.rows_affected()
        };
        Ok(RawResult::affected(affected).with_command(command))
    }

    async fn execute_procedure(
        &self,
        conn: &mut Connection,
        name: &str,
        params: &[QueryParam],
    ) -> DbResult<RawResult> {
        let sql = Self::call_sql("CALL", name, params);
        let sql = common::rewrite_placeholders(ENGINE, &sql);
        let rows = Self::fetch(conn, &sql, params, None).await?;
        let fields = rows.first().map(|r| r.column_metadata()).unwrap_or_default();
        Ok(RawResult::rows(rows.iter().map(|r| r.to_json_map()).collect(), fields)
            .with_command("CALL"))
    }

    async fn execute_function(
        &self,
        conn: &mut Connection,
        name: &str,
        params: &[QueryParam],
    ) -> DbResult<RawResult> {
        let sql = format!("{} AS result", Self::call_sql("SELECT", name, params));
        let sql = common::rewrite_placeholders(ENGINE, &sql);
        let rows = Self::fetch(conn, &sql, params, Some(1)).await?;
        let fields = rows.first().map(|r| r.column_metadata()).unwrap_or_default();
        Ok(RawResult::rows(rows.iter().map(|r| r.to_json_map()).collect(), fields)
            .with_command("SELECT"))
    }

    async fn begin_transaction(
        &self,
        conn: &mut Connection,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<()> {
        let sql = match isolation {
            // PostgreSQL's REPEATABLE READ is snapshot isolation
            Some(IsolationLevel::Snapshot) => "BEGIN ISOLATION LEVEL REPEATABLE READ".to_string(),
            Some(level) => format!("BEGIN ISOLATION LEVEL {}", level.as_sql()),
            None => "BEGIN".to_string(),
        };
        Self::execute_simple(conn, &sql).await?;
        conn.in_transaction = true;
        Ok(())
    }

    async fn commit(&self, conn: &mut Connection) -> DbResult<()> {
        Self::execute_simple(conn, "COMMIT").await?;
        conn.clear_transaction();
        Ok(())
    }

    async fn rollback(&self, conn: &mut Connection) -> DbResult<()> {
        Self::execute_simple(conn, "ROLLBACK").await?;
        conn.clear_transaction();
        Ok(())
    }

    async fn create_savepoint(&self, conn: &mut Connection, name: &str) -> DbResult<()> {
        let sql = format!("SAVEPOINT {}", common::quote_identifier(ENGINE, name));
        Self::execute_simple(conn, &sql).await.map(|_| ())
    }

    async fn release_savepoint(&self, conn: &mut Connection, name: &str) -> DbResult<()> {
        let sql = format!("RELEASE SAVEPOINT {}", common::quote_identifier(ENGINE, name));
        Self::execute_simple(conn, &sql).await.map(|_| ())
    }

    async fn rollback_to_savepoint(&self, conn: &mut Connection, name: &str) -> DbResult<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", common::quote_identifier(ENGINE, name));
        Self::execute_simple(conn, &sql).await.map(|_| ())
    }

    async fn ping(&self, conn: &mut Connection) -> DbResult<()> {
        let session = conn.native_mut::<PgSession>()?;
        session
            .conn
            .ping()
            .await
            .map_err(|e| common::from_sqlx(ENGINE, e))?;
        conn.touch();
        Ok(())
    }

    async fn metadata(&self, conn: &mut Connection) -> DbResult<ServerMetadata> {
        let rows = Self::fetch(
            conn,
            "SELECT version() AS version, current_database() AS database, current_schema() AS schema",
            &[],
            Some(1),
        )
        .await?;
        let row = rows.first();
        let get = |col: &str| -> Option<String> {
            row.and_then(|r| r.try_get::<Option<String>, _>(col).ok().flatten())
        };
        let mut extra = Map::new();
        if let Some(schema) = get("schema") {
            extra.insert("schema".to_string(), JsonValue::String(schema));
        }
        let backend_pid = conn.native::<PgSession>()?.backend_pid;
        extra.insert("backend_pid".to_string(), backend_pid.into());
        Ok(ServerMetadata {
            engine: ENGINE,
            server_version: get("version"),
            database: get("database"),
            extra,
        })
    }

    async fn table_info(
        &self,
        conn: &mut Connection,
        table: &str,
    ) -> DbResult<Vec<ColumnMetadata>> {
        let (schema, name) = match table.split_once('.') {
            Some((s, t)) => (s.to_string(), t.to_string()),
            None => ("public".to_string(), table.to_string()),
        };
        let params = [QueryParam::String(schema), QueryParam::String(name)];
        let rows = Self::fetch(
            conn,
            r#"
            SELECT column_name::text AS name,
                   data_type::text AS type_name,
                   is_nullable = 'YES' AS nullable,
                   character_maximum_length::int4 AS length,
                   numeric_precision::int4 AS precision,
                   numeric_scale::int4 AS scale
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
            &params,
            None,
        )
        .await?;

        if rows.is_empty() {
            return Err(DbError::query(
                format!("table '{}' not found", table),
                "Check the table name and schema",
            ));
        }

        Ok(rows
            .iter()
            .map(|row| {
                let uint = |col: &str| {
                    row.try_get::<Option<i32>, _>(col)
                        .ok()
                        .flatten()
                        .and_then(|v| u32::try_from(v).ok())
                };
                ColumnMetadata::new(
                    row.try_get::<String, _>("name").unwrap_or_default(),
                    row.try_get::<String, _>("type_name").unwrap_or_default(),
                    row.try_get::<bool, _>("nullable").unwrap_or(true),
                )
                .with_length(uint("length"))
                .with_precision(uint("precision"), uint("scale"))
            })
            .collect())
    }

    fn stream<'c>(
        &'c self,
        conn: &'c mut Connection,
        text: &'c str,
        params: &'c [QueryParam],
    ) -> DbResult<RowStream<'c>> {
        let session = conn.native_mut::<PgSession>()?;
        let query = bind_postgres_params(params, sqlx::query(text));
        Ok(query
            .fetch(&mut session.conn)
            .map_ok(|row| row.to_json_map())
            .map_err(|e| common::from_sqlx(ENGINE, e))
            .boxed())
    }

    fn canceller(&self, conn: &Connection) -> Option<Box<dyn Canceller>> {
        let session = conn.native::<PgSession>().ok()?;
        Some(Box::new(PgCanceller {
            options: session.options.clone(),
            backend_pid: session.backend_pid,
        }))
    }
}
