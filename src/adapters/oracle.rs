//! Oracle adapter (ODPI-C via the `oracle` crate).
//!
//! The driver is blocking, so every call runs on the blocking thread pool
//! against a shared `Arc<oracle::Connection>`. Oracle has no RELEASE
//! SAVEPOINT and no multi-row VALUES list; bulk insert uses array binds.

use super::types::{TypeCategory, categorize_type, encode_binary, float_value};
use super::{Adapter, Canceller, Capabilities, common};
use crate::config::{EndpointConfig, EngineType};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{
    ColumnMetadata, Connection, IsolationLevel, QueryOptions, QueryParam, RawResult,
    ServerMetadata,
};
use async_trait::async_trait;
use oracle::sql_type::ToSql;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use std::time::Instant;
use tokio::task;
use tokio::time::timeout;
use tracing::debug;

const ENGINE: EngineType = EngineType::Oracle;

/// Batch size for array-bound bulk inserts.
const BATCH_ROWS: usize = 500;

/// Driver handle stored in the connection envelope.
pub struct OracleSession {
    pub conn: Arc<oracle::Connection>,
    pub connect_string: String,
}

pub struct OracleAdapter;

impl OracleAdapter {
    pub fn new() -> Self {
        Self
    }

    /// EZConnect string: `//host:port/service`.
    fn connect_string(config: &EndpointConfig) -> String {
        let service = config
            .option("service_name")
            .or(config.database.as_deref())
            .unwrap_or("XEPDB1");
        format!("//{}:{}/{}", config.host, config.port_or_default(), service)
    }

    /// Run a blocking driver call off the async executor.
    async fn run<T, F>(conn: &mut Connection, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&oracle::Connection) -> Result<T, oracle::Error> + Send + 'static,
    {
        let handle = Arc::clone(&conn.native::<OracleSession>()?.conn);
        let result = task::spawn_blocking(move || f(&handle))
            .await
            .map_err(|e| DbError::internal(format!("oracle worker failed: {}", e)))?
            .map_err(from_oracle)?;
        conn.touch();
        Ok(result)
    }

    async fn execute_simple(conn: &mut Connection, sql: &str) -> DbResult<u64> {
        let sql = sql.to_string();
        Self::run(conn, move |c| c.execute(&sql, &[])?.row_count()).await
    }

    fn call_args(params: &[QueryParam]) -> String {
        vec!["?"; params.len()].join(", ")
    }
}

impl Default for OracleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify an `oracle` crate error by its ORA- code.
fn from_oracle(err: oracle::Error) -> DbError {
    match err.db_error() {
        Some(db) => {
            let code = db.code();
            let mut kind = common::classify_oracle(code);
            if kind == ErrorKind::Unknown {
                kind = common::classify_message(db.message());
            }
            common::native_error(ENGINE, kind, Some(format!("ORA-{:05}", code)), db.message())
        }
        None => {
            let message = err.to_string();
            common::native_error(ENGINE, common::classify_message(&message), None, message)
        }
    }
}

/// Owned bind values; booleans bind as 1/0 since older servers lack BOOLEAN.
fn to_sql_values(params: &[QueryParam]) -> Vec<Box<dyn ToSql>> {
    params
        .iter()
        .map(|param| -> Box<dyn ToSql> {
            match param {
                QueryParam::Null => Box::new(Option::<String>::None),
                QueryParam::Bool(v) => Box::new(i64::from(*v)),
                QueryParam::Int(v) => Box::new(*v),
                QueryParam::Float(v) => Box::new(*v),
                QueryParam::String(v) => Box::new(v.clone()),
                QueryParam::Bytes(v) => Box::new(v.clone()),
                QueryParam::Json(v) => Box::new(v.to_string()),
            }
        })
        .collect()
}

/// Column descriptor captured before iterating a result set.
struct OracleColumn {
    name: String,
    type_name: String,
    nullable: bool,
    category: TypeCategory,
}

fn describe_columns(info: &[oracle::ColumnInfo]) -> Vec<OracleColumn> {
    info.iter()
        .map(|col| {
            let type_name = col.oracle_type().to_string();
            let base = type_name.split('(').next().unwrap_or_default().trim().to_string();
            OracleColumn {
                name: col.name().to_string(),
                category: categorize_type(&base, ENGINE),
                type_name,
                nullable: col.nullable(),
            }
        })
        .collect()
}

fn cell_value(row: &oracle::Row, idx: usize, category: TypeCategory) -> JsonValue {
    let text = || row.get::<usize, Option<String>>(idx).ok().flatten();
    match category {
        TypeCategory::Integer => row
            .get::<usize, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::Null),
        TypeCategory::Float => row
            .get::<usize, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(float_value)
            .unwrap_or(JsonValue::Null),
        // NUMBER holds integers too; keep exact text for fractional values
        TypeCategory::Decimal => match text() {
            Some(s) if !s.contains('.') => s
                .parse::<i64>()
                .map(JsonValue::from)
                .unwrap_or(JsonValue::String(s)),
            Some(s) => JsonValue::String(s),
            None => JsonValue::Null,
        },
        TypeCategory::Timestamp | TypeCategory::Date => {
            match row.get::<usize, Option<chrono::NaiveDateTime>>(idx) {
                Ok(Some(dt)) => JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
                Ok(None) => JsonValue::Null,
                Err(_) => text().map(JsonValue::String).unwrap_or(JsonValue::Null),
            }
        }
        TypeCategory::Binary => row
            .get::<usize, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(|b| encode_binary(&b))
            .unwrap_or(JsonValue::Null),
        _ => text().map(JsonValue::String).unwrap_or(JsonValue::Null),
    }
}

/// Run a row-returning statement, capped at `limit` rows.
fn fetch_rows(
    conn: &oracle::Connection,
    sql: &str,
    params: &[QueryParam],
    limit: usize,
) -> Result<(Vec<Map<String, JsonValue>>, Vec<ColumnMetadata>), oracle::Error> {
    let values = to_sql_values(params);
    let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let result_set = conn.query(sql, &refs)?;
    let columns = describe_columns(result_set.column_info());

    let mut rows = Vec::new();
    for row in result_set.take(limit) {
        let row = row?;
        let map = columns
            .iter()
            .enumerate()
            .map(|(idx, col)| (col.name.clone(), cell_value(&row, idx, col.category)))
            .collect();
        rows.push(map);
    }
    let fields = columns
        .into_iter()
        .map(|col| ColumnMetadata::new(col.name, col.type_name, col.nullable))
        .collect();
    Ok((rows, fields))
}

struct OracleCanceller {
    conn: Arc<oracle::Connection>,
}

#[async_trait]
impl Canceller for OracleCanceller {
    async fn cancel(&self) -> DbResult<()> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || conn.break_execution())
            .await
            .map_err(|e| DbError::internal(format!("oracle worker failed: {}", e)))?
            .map_err(from_oracle)
    }
}

#[async_trait]
impl Adapter for OracleAdapter {
    fn engine(&self) -> EngineType {
        ENGINE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            release_savepoint: false,
            cancel: true,
            ..Capabilities::relational()
        }
    }

    async fn connect(&self, config: &EndpointConfig) -> DbResult<Connection> {
        let connect_string = Self::connect_string(config);
        let user = config.username.clone().unwrap_or_default();
        let password = config.password.clone().unwrap_or_default();
        let target = connect_string.clone();
        let connect_timeout = config.connect_timeout();

        let handle = task::spawn_blocking(move || {
            oracle::Connector::new(user, password, target).connect()
        });
        let conn = timeout(connect_timeout, handle)
            .await
            .map_err(|_| DbError::timeout("connect", connect_timeout.as_millis() as u64))?
            .map_err(|e| DbError::internal(format!("oracle worker failed: {}", e)))?
            .map_err(from_oracle)?;

        debug!(alias = %config.alias, %connect_string, "Oracle connection established");
        Ok(Connection::new(
            ENGINE,
            OracleSession {
                conn: Arc::new(conn),
                connect_string,
            },
        ))
    }

    async fn disconnect(&self, conn: &mut Connection) -> DbResult<()> {
        let session = conn.take_native::<OracleSession>()?;
        task::spawn_blocking(move || session.conn.close())
            .await
            .map_err(|e| DbError::internal(format!("oracle worker failed: {}", e)))?
            .map_err(from_oracle)
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
        let params = params.to_vec();
        let start = Instant::now();

        if common::returns_rows(text) {
            let limit = opts.max_rows.unwrap_or(usize::MAX);
            let (rows, fields) =
                Self::run(conn, move |c| fetch_rows(c, &sql, &params, limit)).await?;
            return Ok(RawResult::rows(rows, fields)
                .with_command(command)
                .with_metadata("elapsed_ms", common::elapsed_ms(start).into()));
        }

        // outside an explicit transaction every statement commits on its own
        let autocommit = !conn.in_transaction;
        let affected = Self::run(conn, move |c| {
            let values = to_sql_values(&params);
            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let count = c.execute(&sql, &refs)?.row_count()?;
            if autocommit {
                c.commit()?;
            }
            Ok(count)
        })
        .await?;
        Ok(RawResult::affected(affected).with_command(command))
    }

    async fn execute_procedure(
        &self,
        conn: &mut Connection,
        name: &str,
        params: &[QueryParam],
    ) -> DbResult<RawResult> {
        let sql = format!(
            "BEGIN {}({}); END;",
            common::quote_identifier(ENGINE, name),
            Self::call_args(params)
        );
        let sql = common::rewrite_placeholders(ENGINE, &sql);
        let params = params.to_vec();
        let autocommit = !conn.in_transaction;
        Self::run(conn, move |c| {
            let values = to_sql_values(&params);
            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            c.execute(&sql, &refs)?;
            if autocommit {
                c.commit()?;
            }
            Ok(())
        })
        .await?;
        Ok(RawResult::new(JsonValue::Array(Vec::new())).with_command("CALL"))
    }

    async fn execute_function(
        &self,
        conn: &mut Connection,
        name: &str,
        params: &[QueryParam],
    ) -> DbResult<RawResult> {
        let sql = format!(
            "SELECT {}({}) AS result FROM DUAL",
            common::quote_identifier(ENGINE, name),
            Self::call_args(params)
        );
        let opts = QueryOptions {
            max_rows: Some(1),
            ..Default::default()
        };
        self.query(conn, &sql, params, &opts).await
    }

    async fn begin_transaction(
        &self,
        conn: &mut Connection,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<()> {
        // Oracle offers READ COMMITTED and SERIALIZABLE only
        if let Some(level) = isolation {
            let sql = match level {
                IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => {
                    "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
                }
                _ => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            };
            Self::execute_simple(conn, sql).await?;
        }
        conn.in_transaction = true;
        Ok(())
    }

    async fn commit(&self, conn: &mut Connection) -> DbResult<()> {
        Self::run(conn, |c| c.commit()).await?;
        conn.clear_transaction();
        Ok(())
    }

    async fn rollback(&self, conn: &mut Connection) -> DbResult<()> {
        Self::run(conn, |c| c.rollback()).await?;
        conn.clear_transaction();
        Ok(())
    }

    async fn create_savepoint(&self, conn: &mut Connection, name: &str) -> DbResult<()> {
        let sql = format!("SAVEPOINT {}", common::quote_identifier(ENGINE, name));
        Self::execute_simple(conn, &sql).await.map(|_| ())
    }

    async fn rollback_to_savepoint(&self, conn: &mut Connection, name: &str) -> DbResult<()> {
        let sql = format!(
            "ROLLBACK TO SAVEPOINT {}",
            common::quote_identifier(ENGINE, name)
        );
        Self::execute_simple(conn, &sql).await.map(|_| ())
    }

    async fn ping(&self, conn: &mut Connection) -> DbResult<()> {
        Self::run(conn, |c| c.ping()).await
    }

    async fn metadata(&self, conn: &mut Connection) -> DbResult<ServerMetadata> {
        let (version, banner, database) = Self::run(conn, |c| {
            let (version, banner) = c.server_version()?;
            let database: String = c.query_row_as(
                "SELECT SYS_CONTEXT('USERENV', 'DB_NAME') FROM DUAL",
                &[],
            )?;
            Ok((version.to_string(), banner, database))
        })
        .await?;
        let mut extra = Map::new();
        extra.insert("banner".to_string(), JsonValue::String(banner));
        extra.insert(
            "connect_string".to_string(),
            JsonValue::String(conn.native::<OracleSession>()?.connect_string.clone()),
        );
        Ok(ServerMetadata {
            engine: ENGINE,
            server_version: Some(version),
            database: Some(database),
            extra,
        })
    }

    async fn table_info(
        &self,
        conn: &mut Connection,
        table: &str,
    ) -> DbResult<Vec<ColumnMetadata>> {
        // unquoted Oracle identifiers are stored upper-case
        let (owner, name) = match table.split_once('.') {
            Some((o, t)) => (Some(o.to_uppercase()), t.to_uppercase()),
            None => (None, table.to_uppercase()),
        };
        let rows = Self::run(conn, move |c| {
            let sql = "SELECT column_name, data_type, nullable, data_length, data_precision, data_scale \
                       FROM all_tab_columns \
                       WHERE owner = NVL(:1, SYS_CONTEXT('USERENV', 'CURRENT_SCHEMA')) AND table_name = :2 \
                       ORDER BY column_id";
            let result_set = c.query_as::<(
                String,
                String,
                String,
                Option<u32>,
                Option<u32>,
                Option<u32>,
            )>(sql, &[&owner as &dyn ToSql, &name])?;
            result_set.collect::<Result<Vec<_>, _>>()
        })
        .await?;

        if rows.is_empty() {
            return Err(DbError::query(
                format!("table '{}' not found", table),
                "Check the table name and owner",
            ));
        }

        Ok(rows
            .into_iter()
            .map(|(name, type_name, nullable, length, precision, scale)| {
                let length = match categorize_type(&type_name, ENGINE) {
                    TypeCategory::Text | TypeCategory::Binary => length,
                    _ => None,
                };
                ColumnMetadata::new(name, type_name, nullable == "Y")
                    .with_length(length)
                    .with_precision(precision, scale)
            })
            .collect())
    }

    async fn bulk_insert(
        &self,
        conn: &mut Connection,
        table: &str,
        rows: &[Map<String, JsonValue>],
    ) -> DbResult<u64> {
        let Some((sql, _)) = common::build_bulk_insert(ENGINE, table, &rows[..rows.len().min(1)])?
        else {
            return Ok(0);
        };
        let sql = common::rewrite_placeholders(ENGINE, &sql);
        let columns: Vec<String> = rows[0].keys().cloned().collect();
        let mut params = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            if let Some(extra) = row.keys().find(|k| !rows[0].contains_key(*k)) {
                return Err(DbError::invalid_input(format!(
                    "row {} has column '{}' that is not present in the first row",
                    idx, extra
                )));
            }
            params.push(
                columns
                    .iter()
                    .map(|c| QueryParam::from_json(row.get(c).cloned().unwrap_or(JsonValue::Null)))
                    .collect::<Vec<_>>(),
            );
        }
        let autocommit = !conn.in_transaction;
        let total = params.len() as u64;

        Self::run(conn, move |c| {
            let mut batch = c.batch(&sql, BATCH_ROWS).build()?;
            for row in &params {
                let values = to_sql_values(row);
                let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
                batch.append_row(&refs)?;
            }
            batch.execute()?;
            if autocommit {
                c.commit()?;
            }
            Ok(())
        })
        .await?;
        Ok(total)
    }

    fn canceller(&self, conn: &Connection) -> Option<Box<dyn Canceller>> {
        let session = conn.native::<OracleSession>().ok()?;
        Some(Box::new(OracleCanceller {
            conn: Arc::clone(&session.conn),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_string_prefers_service_name() {
        let config = EndpointConfig::new("ora", EngineType::Oracle, "db.local")
            .with_database("ORCL")
            .with_option("service_name", "PDB1");
        assert_eq!(OracleAdapter::connect_string(&config), "//db.local:1521/PDB1");

        let config = EndpointConfig::new("ora", EngineType::Oracle, "db.local").with_database("ORCL");
        assert_eq!(OracleAdapter::connect_string(&config), "//db.local:1521/ORCL");
    }

    #[test]
    fn test_capabilities() {
        let caps = OracleAdapter::new().capabilities();
        assert!(caps.savepoints);
        assert!(!caps.release_savepoint);
        assert!(!caps.streaming);
    }

    #[test]
    fn test_bool_params_bind_as_numbers() {
        let values = to_sql_values(&[QueryParam::Bool(true), QueryParam::Null]);
        assert_eq!(values.len(), 2);
    }
}
