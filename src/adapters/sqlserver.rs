//! SQL Server adapter (tiberius).
//!
//! Row-returning statements produce the record-set wrapper payload
//! (`recordset`, `recordsets`, `rowsAffected`) that the result parser
//! flattens into canonical rows.

use super::types::{TypeCategory, categorize_type, encode_binary, float_value};
use super::{Adapter, Canceller, Capabilities, RowStream, common};
use crate::config::{EndpointConfig, EngineType};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{
    ColumnMetadata, Connection, IsolationLevel, QueryOptions, QueryParam, RawResult,
    ServerMetadata,
};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt, stream};
use serde_json::{Map, Value as JsonValue, json};
use std::time::Instant;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, Query, Row};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

const ENGINE: EngineType = EngineType::SqlServer;

type SqlClient = Client<Compat<TcpStream>>;

/// Driver handle stored in the connection envelope.
pub struct SqlServerSession {
    pub client: SqlClient,
    pub spid: i16,
    config: Config,
}

pub struct SqlServerAdapter;

impl SqlServerAdapter {
    pub fn new() -> Self {
        Self
    }

    fn build_config(config: &EndpointConfig) -> Config {
        let mut cfg = Config::new();
        cfg.host(&config.host);
        cfg.port(config.port_or_default());
        cfg.authentication(AuthMethod::sql_server(
            config.username.as_deref().unwrap_or("sa"),
            config.password.as_deref().unwrap_or(""),
        ));
        if let Some(database) = &config.database {
            cfg.database(database);
        }
        if let Some(app) = config.option("application_name") {
            cfg.application_name(app);
        }
        if config.ssl.enabled {
            cfg.encryption(EncryptionLevel::Required);
        } else {
            cfg.encryption(EncryptionLevel::NotSupported);
        }
        if config.ssl.trust_server_certificate {
            cfg.trust_cert();
        } else if let Some(ca) = &config.ssl.ca_path {
            cfg.trust_cert_ca(ca);
        }
        cfg
    }

    async fn open(cfg: Config) -> DbResult<SqlClient> {
        let tcp = TcpStream::connect(cfg.get_addr())
            .await
            .map_err(|e| common::native_error(ENGINE, ErrorKind::Connection, None, e.to_string()))?;
        tcp.set_nodelay(true)?;

        match Client::connect(cfg.clone(), tcp.compat_write()).await {
            Ok(client) => Ok(client),
            // Azure SQL gateways answer the login with a redirect
            Err(tiberius::error::Error::Routing { host, port }) => {
                let mut redirected = cfg;
                redirected.host(&host);
                redirected.port(port);
                let tcp = TcpStream::connect(redirected.get_addr())
                    .await
                    .map_err(|e| {
                        common::native_error(ENGINE, ErrorKind::Connection, None, e.to_string())
                    })?;
                tcp.set_nodelay(true)?;
                Client::connect(redirected, tcp.compat_write())
                    .await
                    .map_err(from_tiberius)
            }
            Err(e) => Err(from_tiberius(e)),
        }
    }

    fn bind<'a>(sql: String, params: &[QueryParam]) -> Query<'a> {
        let mut query = Query::new(sql);
        for param in params {
            match param {
                QueryParam::Null => query.bind(Option::<String>::None),
                QueryParam::Bool(v) => query.bind(*v),
                QueryParam::Int(v) => query.bind(*v),
                QueryParam::Float(v) => query.bind(*v),
                QueryParam::String(v) => query.bind(v.clone()),
                QueryParam::Bytes(v) => query.bind(v.clone()),
                QueryParam::Json(v) => query.bind(v.to_string()),
            }
        }
        query
    }

    async fn execute_simple(conn: &mut Connection, sql: &str) -> DbResult<u64> {
        let session = conn.native_mut::<SqlServerSession>()?;
        let result = session
            .client
            .execute(sql, &[])
            .await
            .map_err(from_tiberius)?;
        conn.touch();
        Ok(result.total())
    }

    async fn fetch_sets(
        conn: &mut Connection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Vec<Row>>> {
        let session = conn.native_mut::<SqlServerSession>()?;
        let stream = Self::bind(sql.to_string(), params)
            .query(&mut session.client)
            .await
            .map_err(from_tiberius)?;
        let sets = stream.into_results().await.map_err(from_tiberius)?;
        conn.touch();
        Ok(sets)
    }

    fn call_args(params: &[QueryParam]) -> String {
        vec!["?"; params.len()].join(", ")
    }
}

impl Default for SqlServerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify a tiberius error.
fn from_tiberius(err: tiberius::error::Error) -> DbError {
    use tiberius::error::Error;
    match err {
        Error::Server(token) => {
            let number = token.code();
            let mut kind = common::classify_sqlserver(number);
            if kind == ErrorKind::Unknown {
                kind = common::classify_message(token.message());
            }
            common::native_error(ENGINE, kind, Some(number.to_string()), token.message())
        }
        Error::Io { kind, message } => common::native_error(
            ENGINE,
            ErrorKind::Connection,
            Some(format!("{:?}", kind)),
            message,
        ),
        Error::Tls(message) => {
            common::native_error(ENGINE, ErrorKind::Connection, Some("TLS".into()), message)
        }
        Error::Routing { host, port } => common::native_error(
            ENGINE,
            ErrorKind::Connection,
            None,
            format!("server redirected the login to {}:{}", host, port),
        ),
        other => {
            let message = other.to_string();
            common::native_error(ENGINE, common::classify_message(&message), None, message)
        }
    }
}

fn numeric_text(value: i128, scale: u8) -> String {
    if scale == 0 {
        return value.to_string();
    }
    let digits = value.unsigned_abs().to_string();
    let scale = scale as usize;
    let padded = format!("{:0>width$}", digits, width = scale + 1);
    let (int_part, frac_part) = padded.split_at(padded.len() - scale);
    let sign = if value < 0 { "-" } else { "" };
    format!("{}{}.{}", sign, int_part, frac_part)
}

fn cell_value(row: &Row, idx: usize, data: &ColumnData<'_>) -> JsonValue {
    match data {
        ColumnData::Bit(Some(b)) => JsonValue::Bool(*b),
        ColumnData::U8(Some(v)) => json!(*v),
        ColumnData::I16(Some(v)) => json!(*v),
        ColumnData::I32(Some(v)) => json!(*v),
        ColumnData::I64(Some(v)) => json!(*v),
        ColumnData::F32(Some(v)) => float_value(f64::from(*v)),
        ColumnData::F64(Some(v)) => float_value(*v),
        ColumnData::Numeric(Some(n)) => JsonValue::String(numeric_text(n.value(), n.scale())),
        ColumnData::String(Some(s)) => JsonValue::String(s.to_string()),
        ColumnData::Guid(Some(g)) => JsonValue::String(g.to_string()),
        ColumnData::Binary(Some(b)) => encode_binary(b),
        ColumnData::Xml(Some(xml)) => JsonValue::String(xml.to_string()),
        ColumnData::DateTime(Some(_))
        | ColumnData::SmallDateTime(Some(_))
        | ColumnData::DateTime2(Some(_)) => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .ok()
            .flatten()
            .map(|dt| JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(JsonValue::Null),
        ColumnData::DateTimeOffset(Some(_)) => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .ok()
            .flatten()
            .map(|dt| JsonValue::String(dt.to_rfc3339()))
            .unwrap_or(JsonValue::Null),
        ColumnData::Date(Some(_)) => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .ok()
            .flatten()
            .map(|d| JsonValue::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(JsonValue::Null),
        ColumnData::Time(Some(_)) => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .ok()
            .flatten()
            .map(|t| JsonValue::String(t.format("%H:%M:%S%.f").to_string()))
            .unwrap_or(JsonValue::Null),
        _ => JsonValue::Null,
    }
}

fn row_to_map(row: &Row) -> Map<String, JsonValue> {
    row.cells()
        .enumerate()
        .map(|(idx, (col, data))| (col.name().to_string(), cell_value(row, idx, data)))
        .collect()
}

fn column_metadata(row: &Row) -> Vec<ColumnMetadata> {
    row.columns()
        .iter()
        .map(|col| ColumnMetadata::new(col.name(), format!("{:?}", col.column_type()), true))
        .collect()
}

struct SqlServerCanceller {
    config: Config,
    spid: i16,
}

#[async_trait]
impl Canceller for SqlServerCanceller {
    async fn cancel(&self) -> DbResult<()> {
        let mut client = SqlServerAdapter::open(self.config.clone()).await?;
        client
            .execute(format!("KILL {}", self.spid), &[])
            .await
            .map_err(from_tiberius)?;
        let _ = client.close().await;
        Ok(())
    }
}

#[async_trait]
impl Adapter for SqlServerAdapter {
    fn engine(&self) -> EngineType {
        ENGINE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            release_savepoint: false,
            streaming: true,
            cancel: true,
            ..Capabilities::relational()
        }
    }

    async fn connect(&self, config: &EndpointConfig) -> DbResult<Connection> {
        let cfg = Self::build_config(config);
        let connect_timeout = config.connect_timeout();
        let mut client = timeout(connect_timeout, Self::open(cfg.clone()))
            .await
            .map_err(|_| DbError::timeout("connect", connect_timeout.as_millis() as u64))??;

        let spid = client
            .simple_query("SELECT @@SPID AS spid")
            .await
            .map_err(from_tiberius)?
            .into_row()
            .await
            .map_err(from_tiberius)?
            .and_then(|row| row.try_get::<i16, _>(0).ok().flatten())
            .unwrap_or_default();

        debug!(alias = %config.alias, spid, "SQL Server connection established");
        Ok(Connection::new(
            ENGINE,
            SqlServerSession {
                client,
                spid,
                config: cfg,
            },
        ))
    }

    async fn disconnect(&self, conn: &mut Connection) -> DbResult<()> {
        let session = conn.take_native::<SqlServerSession>()?;
        session.client.close().await.map_err(from_tiberius)
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

        if !common::returns_rows(text) {
            let session = conn.native_mut::<SqlServerSession>()?;
            let result = Self::bind(sql, params)
                .execute(&mut session.client)
                .await
                .map_err(from_tiberius)?;
            conn.touch();
            let counts: Vec<u64> = result.rows_affected().to_vec();
            return Ok(RawResult::affected(result.total())
                .with_command(command)
                .with_metadata("rowsAffected", json!(counts)));
        }

        let sets = Self::fetch_sets(conn, &sql, params).await?;
        let limit = opts.max_rows.unwrap_or(usize::MAX);
        let fields = sets
            .first()
            .and_then(|set| set.first())
            .map(column_metadata)
            .unwrap_or_default();
        let recordsets: Vec<JsonValue> = sets
            .iter()
            .map(|set| {
                JsonValue::Array(
                    set.iter()
                        .take(limit)
                        .map(|row| JsonValue::Object(row_to_map(row)))
                        .collect(),
                )
            })
            .collect();
        let rows_affected: Vec<u64> = sets.iter().map(|set| set.len() as u64).collect();
        let recordset = recordsets.first().cloned().unwrap_or(JsonValue::Array(Vec::new()));

        let mut raw = RawResult::new(json!({
            "recordset": recordset,
            "recordsets": recordsets,
            "rowsAffected": rows_affected,
        }))
        .with_command(command)
        .with_metadata("elapsed_ms", common::elapsed_ms(start).into());
        raw.fields = Some(fields);
        Ok(raw)
    }

    async fn execute_procedure(
        &self,
        conn: &mut Connection,
        name: &str,
        params: &[QueryParam],
    ) -> DbResult<RawResult> {
        let sql = format!(
            "EXEC {} {}",
            common::quote_identifier(ENGINE, name),
            Self::call_args(params)
        );
        self.query(conn, sql.trim_end(), params, &QueryOptions::default())
            .await
    }

    async fn execute_function(
        &self,
        conn: &mut Connection,
        name: &str,
        params: &[QueryParam],
    ) -> DbResult<RawResult> {
        // scalar UDFs must be schema-qualified
        let qualified = if name.contains('.') {
            name.to_string()
        } else {
            format!("dbo.{}", name)
        };
        let sql = format!(
            "SELECT {}({}) AS result",
            common::quote_identifier(ENGINE, &qualified),
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
        let sql = match isolation {
            Some(level) => format!(
                "SET TRANSACTION ISOLATION LEVEL {}; BEGIN TRANSACTION",
                level.as_sql()
            ),
            None => "BEGIN TRANSACTION".to_string(),
        };
        Self::execute_simple(conn, &sql).await?;
        conn.in_transaction = true;
        Ok(())
    }

    async fn commit(&self, conn: &mut Connection) -> DbResult<()> {
        Self::execute_simple(conn, "COMMIT TRANSACTION").await?;
        conn.clear_transaction();
        Ok(())
    }

    async fn rollback(&self, conn: &mut Connection) -> DbResult<()> {
        Self::execute_simple(conn, "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await?;
        conn.clear_transaction();
        Ok(())
    }

    async fn create_savepoint(&self, conn: &mut Connection, name: &str) -> DbResult<()> {
        let sql = format!("SAVE TRANSACTION {}", common::quote_identifier(ENGINE, name));
        Self::execute_simple(conn, &sql).await.map(|_| ())
    }

    async fn rollback_to_savepoint(&self, conn: &mut Connection, name: &str) -> DbResult<()> {
        let sql = format!(
            "ROLLBACK TRANSACTION {}",
            common::quote_identifier(ENGINE, name)
        );
        Self::execute_simple(conn, &sql).await.map(|_| ())
    }

    async fn ping(&self, conn: &mut Connection) -> DbResult<()> {
        let session = conn.native_mut::<SqlServerSession>()?;
        session
            .client
            .simple_query("SELECT 1")
            .await
            .map_err(from_tiberius)?
            .into_results()
            .await
            .map_err(from_tiberius)?;
        conn.touch();
        Ok(())
    }

    async fn metadata(&self, conn: &mut Connection) -> DbResult<ServerMetadata> {
        let sets = Self::fetch_sets(
            conn,
            "SELECT @@VERSION AS version, DB_NAME() AS db_name, CAST(SERVERPROPERTY('Edition') AS NVARCHAR(128)) AS edition",
            &[],
        )
        .await?;
        let row = sets.first().and_then(|set| set.first());
        let text = |col: &str| -> Option<String> {
            row.and_then(|r| r.try_get::<&str, _>(col).ok().flatten())
                .map(str::to_string)
        };
        let mut extra = Map::new();
        let spid = conn.native::<SqlServerSession>()?.spid;
        extra.insert("spid".to_string(), spid.into());
        if let Some(edition) = text("edition") {
            extra.insert("edition".to_string(), JsonValue::String(edition));
        }
        Ok(ServerMetadata {
            engine: ENGINE,
            server_version: text("version"),
            database: text("db_name"),
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
            None => ("dbo".to_string(), table.to_string()),
        };
        let params = [QueryParam::String(schema), QueryParam::String(name)];
        let sets = Self::fetch_sets(
            conn,
            r#"
            SELECT COLUMN_NAME AS name,
                   DATA_TYPE AS type_name,
                   CASE WHEN IS_NULLABLE = 'YES' THEN 1 ELSE 0 END AS nullable,
                   CAST(CHARACTER_MAXIMUM_LENGTH AS INT) AS length,
                   CAST(NUMERIC_PRECISION AS INT) AS precision,
                   CAST(NUMERIC_SCALE AS INT) AS scale
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
            ORDER BY ORDINAL_POSITION
            "#,
            &params,
        )
        .await?;
        let rows = sets.into_iter().next().unwrap_or_default();
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
                    row.try_get::<i32, _>(col)
                        .ok()
                        .flatten()
                        .and_then(|v| u32::try_from(v).ok())
                };
                let type_name = row
                    .try_get::<&str, _>("type_name")
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                let length = match categorize_type(type_name, ENGINE) {
                    TypeCategory::Text | TypeCategory::Binary => uint("length"),
                    _ => None,
                };
                ColumnMetadata::new(
                    row.try_get::<&str, _>("name")
                        .ok()
                        .flatten()
                        .unwrap_or_default(),
                    type_name,
                    row.try_get::<i32, _>("nullable").ok().flatten() != Some(0),
                )
                .with_length(length)
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
        let session = conn.native_mut::<SqlServerSession>()?;
        let query = Self::bind(text.to_string(), params);
        let rows = stream::once(async move {
            query
                .query(&mut session.client)
                .await
                .map(|result| result.into_row_stream())
        })
        .try_flatten()
        .map_ok(|row| row_to_map(&row))
        .map_err(from_tiberius);
        Ok(rows.boxed())
    }

    fn canceller(&self, conn: &Connection) -> Option<Box<dyn Canceller>> {
        let session = match conn.native::<SqlServerSession>() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "cannot build SQL Server canceller");
                return None;
            }
        };
        Some(Box::new(SqlServerCanceller {
            config: session.config.clone(),
            spid: session.spid,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_text_scale() {
        assert_eq!(numeric_text(12345, 2), "123.45");
        assert_eq!(numeric_text(-5, 3), "-0.005");
        assert_eq!(numeric_text(42, 0), "42");
    }

    #[test]
    fn test_capabilities_no_release_savepoint() {
        let caps = SqlServerAdapter::new().capabilities();
        assert!(caps.savepoints);
        assert!(!caps.release_savepoint);
        assert!(caps.cancel);
    }

    #[test]
    fn test_call_args() {
        let params = [QueryParam::Int(1), QueryParam::from("a")];
        assert_eq!(SqlServerAdapter::call_args(&params), "?, ?");
        assert_eq!(SqlServerAdapter::call_args(&[]), "");
    }
}
