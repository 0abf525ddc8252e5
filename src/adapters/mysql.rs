//! MySQL / MariaDB adapter (sqlx).

use super::params::bind_mysql_params;
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
use serde_json::Map;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::{ConnectOptions, Connection as _, Executor, Row};
use tokio::time::timeout;
use tracing::debug;

const ENGINE: EngineType = EngineType::MySql;

/// Driver handle stored in the connection envelope.
pub struct MySqlSession {
    pub conn: MySqlConnection,
    pub thread_id: u64,
    options: MySqlConnectOptions,
}

pub struct MySqlAdapter;

impl MySqlAdapter {
    pub fn new() -> Self {
        Self
    }

    fn connect_options(config: &EndpointConfig) -> MySqlConnectOptions {
        let mut opts = MySqlConnectOptions::new()
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
        if let Some(charset) = config.option("charset") {
            opts = opts.charset(charset);
        }
        let mode = match (config.ssl.enabled, config.ssl.trust_server_certificate) {
            (false, _) => MySqlSslMode::Preferred,
            (true, true) => MySqlSslMode::Required,
            (true, false) => MySqlSslMode::VerifyIdentity,
        };
        opts = opts.ssl_mode(mode);
        if let Some(ca) = &config.ssl.ca_path {
            opts = opts.ssl_ca(ca.as_str());
        }
        opts.disable_statement_logging()
    }

    async fn execute_simple(conn: &mut Connection, sql: &str) -> DbResult<u64> {
        let session = conn.native_mut::<MySqlSession>()?;
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
    ) -> DbResult<Vec<MySqlRow>> {
        let session = conn.native_mut::<MySqlSession>()?;
        let limit = max_rows.unwrap_or(usize::MAX);
        let rows: Vec<_> = if params.is_empty() {
            // When params is empty, use raw SQL to avoid prepared statement issues
            (&mut session.conn).fetch(sql).take(limit).collect().await
        } else {
            let query = bind_mysql_params(params, sqlx::query(sql));
            query.fetch(&mut session.conn).take(limit).collect().await
        };
        conn.touch();
        rows.into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| common::from_sqlx(ENGINE, e))
    }

    fn rows_result(rows: Vec<MySqlRow>, command: &str) -> RawResult {
        let fields = rows.first().map(|r| r.column_metadata()).unwrap_or_default();
        RawResult::rows(rows.iter().map(|r| r.to_json_map()).collect(), fields)
            .with_command(command)
    }

    fn call_sql(keyword: &str, name: &str, params: &[QueryParam]) -> String {
        format!(
            "{} {}({})",
            keyword,
            common::quote_identifier(ENGINE, name),
            vec!["?"; params.len()].join(", ")
        )
    }
}

impl Default for MySqlAdapter {
    fn default() -> Self {
        Self::new()
    }
}

struct MySqlCanceller {
    options: MySqlConnectOptions,
    thread_id: u64,
}

#[async_trait]
impl Canceller for MySqlCanceller {
    async fn cancel(&self) -> DbResult<()> {
        let mut conn = self
            .options
            .connect()
            .await
            .map_err(|e| common::from_sqlx(ENGINE, e))?;
        // KILL does not accept bind parameters
        let sql = format!("KILL QUERY {}", self.thread_id);
        (&mut conn)
            .execute(sql.as_str())
            .await
            .map_err(|e| common::from_sqlx(ENGINE, e))?;
        let _ = conn.close().await;
        Ok(())
    }
}

#[async_trait]
impl Adapter for MySqlAdapter {
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
        let mut my = timeout(connect_timeout, options.connect())
            .await
            .map_err(|_| DbError::timeout("connect", connect_timeout.as_millis() as u64))?
            .map_err(|e| common::from_sqlx(ENGINE, e))?;

        let thread_id: u64 = sqlx::query_scalar("SELECT CONNECTION_ID()")
            .fetch_one(&mut my)
            .await
            .map_err(|e| common::from_sqlx(ENGINE, e))?;

        debug!(alias = %config.alias, thread_id, "MySQL connection established");
        Ok(Connection::new(
            ENGINE,
            MySqlSession {
                conn: my,
                thread_id,
                options,
            },
        ))
    }

    async fn disconnect(&self, conn: &mut Connection) -> DbResult<()> {
        let session = conn.take_native::<MySqlSession>()?;
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
        let command = common::command_tag(text);

        if common::returns_rows(text) {
            let rows = Self::fetch(conn, text, params, opts.max_rows).await?;
            return Ok(Self::rows_result(rows, &command));
        }

        if params.is_empty() {
            let affected = Self::execute_simple(conn, text).await?;
            return Ok(RawResult::affected(affected).with_command(command));
        }

        let session = conn.native_mut::<MySqlSession>()?;
        let query = bind_mysql_params(params, sqlx::query(text));
        let result = query
            .execute(&mut session.conn)
            .await
            .map_err(|e| common::from_sqlx(ENGINE, e))?;
        conn.touch();
        Ok(RawResult::affected(result.rows_affected())
            .with_command(command)
            .with_metadata("last_insert_id", result.last_insert_id().into()))
    }

    async fn execute_procedure(
        &self,
        conn: &mut Connection,
        name: &str,
        params: &[QueryParam],
    ) -> DbResult<RawResult> {
        let sql = Self::call_sql("CALL", name, params);
        let rows = Self::fetch(conn, &sql, params, None).await?;
        Ok(Self::rows_result(rows, "CALL"))
    }

    async fn execute_function(
        &self,
        conn: &mut Connection,
        name: &str,
        params: &[QueryParam],
    ) -> DbResult<RawResult> {
        let sql = format!("{} AS result", Self::call_sql("SELECT", name, params));
        let rows = Self::fetch(conn, &sql, params, Some(1)).await?;
        Ok(Self::rows_result(rows, "SELECT"))
    }

    async fn begin_transaction(
        &self,
        conn: &mut Connection,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<()> {
        if let Some(level) = isolation {
            let level = match level {
                IsolationLevel::Snapshot => IsolationLevel::RepeatableRead,
                other => other,
            };
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
            Self::execute_simple(conn, &sql).await?;
        }
        Self::execute_simple(conn, "START TRANSACTION").await?;
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
        let session = conn.native_mut::<MySqlSession>()?;
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
            "SELECT VERSION() AS version, DATABASE() AS db_name, @@version_comment AS comment",
            &[],
            Some(1),
        )
        .await?;
        let row = rows.first();
        let get = |col: &str| -> Option<String> {
            row.and_then(|r| r.try_get::<Option<String>, _>(col).ok().flatten())
        };
        let mut extra = Map::new();
        if let Some(comment) = get("comment") {
            extra.insert("version_comment".to_string(), comment.into());
        }
        extra.insert(
            "thread_id".to_string(),
            conn.native::<MySqlSession>()?.thread_id.into(),
        );
        Ok(ServerMetadata {
            engine: ENGINE,
            server_version: get("version"),
            database: get("db_name"),
            extra,
        })
    }

    async fn table_info(
        &self,
        conn: &mut Connection,
        table: &str,
    ) -> DbResult<Vec<ColumnMetadata>> {
        let (schema_filter, params) = match table.split_once('.') {
            Some((schema, name)) => (
                "TABLE_SCHEMA = ?",
                vec![QueryParam::from(schema), QueryParam::from(name)],
            ),
            None => ("TABLE_SCHEMA = DATABASE()", vec![QueryParam::from(table)]),
        };
        let sql = format!(
            "SELECT COLUMN_NAME AS name, COLUMN_TYPE AS type_name, \
             CAST(IS_NULLABLE = 'YES' AS SIGNED) AS nullable, \
             CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) AS length, \
             CAST(NUMERIC_PRECISION AS SIGNED) AS numeric_precision, \
             CAST(NUMERIC_SCALE AS SIGNED) AS numeric_scale \
             FROM information_schema.COLUMNS \
             WHERE {} AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
            schema_filter
        );
        let rows = Self::fetch(conn, &sql, &params, None).await?;
        if rows.is_empty() {
            return Err(DbError::query(
                format!("table '{}' not found", table),
                "Check the table name and the connection's default database",
            ));
        }

        Ok(rows
            .iter()
            .map(|row| {
                let uint = |col: &str| {
                    row.try_get::<Option<i64>, _>(col)
                        .ok()
                        .flatten()
                        .and_then(|v| u32::try_from(v).ok())
                };
                ColumnMetadata::new(
                    row.try_get::<String, _>("name").unwrap_or_default(),
                    row.try_get::<String, _>("type_name").unwrap_or_default(),
                    row.try_get::<i64, _>("nullable").map(|v| v != 0).unwrap_or(true),
                )
                .with_length(uint("length"))
                .with_precision(uint("numeric_precision"), uint("numeric_scale"))
            })
            .collect())
    }

    fn stream<'c>(
        &'c self,
        conn: &'c mut Connection,
        text: &'c str,
        params: &'c [QueryParam],
    ) -> DbResult<RowStream<'c>> {
        let session = conn.native_mut::<MySqlSession>()?;
        let query = bind_mysql_params(params, sqlx::query(text));
        Ok(query
            .fetch(&mut session.conn)
            .map_ok(|row| row.to_json_map())
            .map_err(|e| common::from_sqlx(ENGINE, e))
            .boxed())
    }

    fn canceller(&self, conn: &Connection) -> Option<Box<dyn Canceller>> {
        let session = conn.native::<MySqlSession>().ok()?;
        Some(Box::new(MySqlCanceller {
            options: session.options.clone(),
            thread_id: session.thread_id,
        }))
    }
}
