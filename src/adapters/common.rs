//! Helpers shared by the engine adapters.
//!
//! Identifier quoting, placeholder rewriting, bulk-insert statement
//! construction and the per-engine error classification tables live here so
//! each adapter only has to extract the native code from its driver error.

use crate::config::EngineType;
use crate::error::{DbError, DbResult, ErrorKind, NativeError};
use crate::models::{Connection, PreparedStatement, QueryParam};
use serde_json::{Map, Value as JsonValue};
use std::time::Instant;

// =============================================================================
// Lexical scanning
// =============================================================================

/// Split SQL into `(is_code, text)` segments.
///
/// String literals, quoted identifiers and comments are returned as non-code
/// segments so placeholder and keyword scans can skip them.
pub fn code_segments(sql: &str) -> Vec<(bool, &str)> {
    let bytes = sql.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let next = bytes.get(i + 1).copied();
        let end = match bytes[i] {
            q @ (b'\'' | b'"' | b'`') => Some(skip_quoted(bytes, i, q)),
            b'-' if next == Some(b'-') => Some(skip_until(bytes, i + 2, b"\n", false)),
            b'/' if next == Some(b'*') => Some(skip_until(bytes, i + 2, b"*/", true)),
            _ => None,
        };
        match end {
            Some(end) => {
                if start < i {
                    segments.push((true, &sql[start..i]));
                }
                segments.push((false, &sql[i..end]));
                start = end;
                i = end;
            }
            None => i += 1,
        }
    }
    if start < bytes.len() {
        segments.push((true, &sql[start..]));
    }
    segments
}

fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quote == b'\'' => i += 2,
            b if b == quote => {
                // doubled quote is an escaped quote
                if bytes.get(i + 1) == Some(&quote) {
                    i += 2;
                } else {
                    return i + 1;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

fn skip_until(bytes: &[u8], from: usize, terminator: &[u8], inclusive: bool) -> usize {
    let mut i = from;
    while i + terminator.len() <= bytes.len() {
        if &bytes[i..i + terminator.len()] == terminator {
            return if inclusive { i + terminator.len() } else { i };
        }
        i += 1;
    }
    bytes.len()
}

/// Number of `?` placeholders outside literals and comments.
pub fn count_placeholders(sql: &str) -> usize {
    code_segments(sql)
        .into_iter()
        .filter(|(code, _)| *code)
        .map(|(_, text)| text.matches('?').count())
        .sum()
}

/// Rewrite canonical `?` placeholders into the engine's native syntax.
///
/// PostgreSQL uses `$n`, SQL Server `@Pn`, Oracle `:n`; MySQL keeps `?`.
pub fn rewrite_placeholders(engine: EngineType, sql: &str) -> String {
    let marker = match engine {
        EngineType::Postgres => "$",
        EngineType::SqlServer => "@P",
        EngineType::Oracle => ":",
        _ => return sql.to_string(),
    };

    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    for (code, text) in code_segments(sql) {
        if !code {
            out.push_str(text);
            continue;
        }
        for ch in text.chars() {
            if ch == '?' {
                n += 1;
                out.push_str(marker);
                out.push_str(&n.to_string());
            } else {
                out.push(ch);
            }
        }
    }
    out
}

/// Quote an identifier for the engine; dotted names are quoted per part.
pub fn quote_identifier(engine: EngineType, name: &str) -> String {
    let (open, close) = match engine {
        EngineType::SqlServer => ('[', ']'),
        EngineType::MySql => ('`', '`'),
        EngineType::Postgres | EngineType::Oracle => ('"', '"'),
        EngineType::MongoDb | EngineType::Redis => return name.to_string(),
    };

    name.split('.')
        .map(|part| {
            let part = part.trim();
            if part == "*" || (part.starts_with(open) && part.ends_with(close) && part.len() > 1) {
                part.to_string()
            } else {
                let escaped = part.replace(close, &format!("{close}{close}"));
                format!("{open}{escaped}{close}")
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

// =============================================================================
// Statement helpers
// =============================================================================

/// Rows per multi-row INSERT, bounded by the engine's bind-parameter limit.
pub fn bulk_chunk_rows(engine: EngineType, columns: usize) -> usize {
    let max_params = match engine {
        EngineType::SqlServer => 2000,
        EngineType::Oracle => 1000,
        _ => 65_535,
    };
    (max_params / columns.max(1)).clamp(1, super::BULK_INSERT_CHUNK)
}

/// Build a multi-row INSERT for `rows`, keyed by the first row's columns.
///
/// Returns `None` for an empty slice. Keys missing from later rows bind NULL;
/// keys absent from the first row are rejected.
pub fn build_bulk_insert(
    engine: EngineType,
    table: &str,
    rows: &[Map<String, JsonValue>],
) -> DbResult<Option<(String, Vec<QueryParam>)>> {
    let Some(first) = rows.first() else {
        return Ok(None);
    };
    let columns: Vec<&String> = first.keys().collect();
    if columns.is_empty() {
        return Err(DbError::invalid_input("bulk insert rows must have at least one column"));
    }

    let mut params = Vec::with_capacity(rows.len() * columns.len());
    let mut tuples = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        if let Some(extra) = row.keys().find(|k| !first.contains_key(*k)) {
            return Err(DbError::invalid_input(format!(
                "row {} has column '{}' that is not present in the first row",
                idx, extra
            )));
        }
        for col in &columns {
            params.push(QueryParam::from_json(
                row.get(*col).cloned().unwrap_or(JsonValue::Null),
            ));
        }
        tuples.push(format!("({})", vec!["?"; columns.len()].join(", ")));
    }

    let column_list = columns
        .iter()
        .map(|c| quote_identifier(engine, c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_identifier(engine, table),
        column_list,
        tuples.join(", ")
    );
    Ok(Some((sql, params)))
}

/// Check a prepared statement belongs to `conn` and gets the right arity.
pub fn check_prepared(
    conn: &Connection,
    stmt: &PreparedStatement,
    params: &[QueryParam],
) -> DbResult<()> {
    if stmt.connection_id != conn.id() {
        return Err(DbError::invalid_input(format!(
            "prepared statement {} belongs to connection {}, not {}",
            stmt.id,
            stmt.connection_id,
            conn.id()
        )));
    }
    if stmt.param_count != params.len() {
        return Err(DbError::query(
            format!(
                "prepared statement expects {} parameters, got {}",
                stmt.param_count,
                params.len()
            ),
            "Pass exactly one value per placeholder",
        ));
    }
    Ok(())
}

/// Milliseconds elapsed since `start`.
pub fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Command tag of a statement (first keyword, upper-cased).
pub fn command_tag(sql: &str) -> String {
    code_segments(sql)
        .into_iter()
        .filter(|(code, _)| *code)
        .flat_map(|(_, text)| text.split_whitespace())
        .next()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_ascii_alphanumeric())
                .to_ascii_uppercase()
        })
        .unwrap_or_default()
}

/// Whether a statement returns rows rather than an affected count.
pub fn returns_rows(sql: &str) -> bool {
    let upper = sql.to_ascii_uppercase();
    matches!(
        command_tag(sql).as_str(),
        "SELECT" | "WITH" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "VALUES" | "PRAGMA" | "EXEC"
            | "EXECUTE" | "CALL"
    ) || upper.contains(" RETURNING ")
        || upper.contains(" OUTPUT ")
}

// =============================================================================
// Error classification
// =============================================================================

/// Classify a PostgreSQL SQLSTATE.
pub fn classify_postgres(sqlstate: &str) -> ErrorKind {
    match sqlstate {
        "23505" => ErrorKind::DuplicateKey,
        "23503" => ErrorKind::ForeignKeyViolation,
        "23502" => ErrorKind::NotNullViolation,
        "28P01" | "28000" => ErrorKind::Authentication,
        "42501" => ErrorKind::PermissionDenied,
        "57014" => ErrorKind::Timeout,
        s if s.starts_with("08") || s.starts_with("57P") => ErrorKind::Connection,
        s if s.starts_with("42") || s.starts_with("22") || s.starts_with("23") => ErrorKind::Query,
        _ => ErrorKind::Unknown,
    }
}

/// Classify a MySQL server error number.
pub fn classify_mysql(number: u32) -> ErrorKind {
    match number {
        1062 | 1586 => ErrorKind::DuplicateKey,
        1451 | 1452 | 1216 | 1217 => ErrorKind::ForeignKeyViolation,
        1048 | 1364 => ErrorKind::NotNullViolation,
        1045 | 1698 => ErrorKind::Authentication,
        1142 | 1143 | 1044 | 1227 => ErrorKind::PermissionDenied,
        3024 | 1205 => ErrorKind::Timeout,
        2002 | 2003 | 2006 | 2013 | 1040 => ErrorKind::Connection,
        1064 | 1054 | 1146 | 1049 | 1149 => ErrorKind::Query,
        _ => ErrorKind::Unknown,
    }
}

/// Classify a SQL Server error number.
pub fn classify_sqlserver(number: u32) -> ErrorKind {
    match number {
        2627 | 2601 => ErrorKind::DuplicateKey,
        547 => ErrorKind::ForeignKeyViolation,
        515 => ErrorKind::NotNullViolation,
        18456 | 18452 => ErrorKind::Authentication,
        229 | 230 | 262 | 297 => ErrorKind::PermissionDenied,
        3617 => ErrorKind::Timeout,
        4060 | 233 | 10054 | 10060 | 10061 => ErrorKind::Connection,
        102 | 156 | 207 | 208 | 2812 | 8114 | 245 => ErrorKind::Query,
        _ => ErrorKind::Unknown,
    }
}

/// Classify an Oracle `ORA-` code (number without the prefix).
pub fn classify_oracle(code: i32) -> ErrorKind {
    match code {
        1 => ErrorKind::DuplicateKey,
        2291 | 2292 => ErrorKind::ForeignKeyViolation,
        1400 | 1407 => ErrorKind::NotNullViolation,
        1017 | 28000 | 28001 => ErrorKind::Authentication,
        1031 | 1749 => ErrorKind::PermissionDenied,
        1013 => ErrorKind::Timeout,
        12170 | 12541 | 12514 | 12537 | 3113 | 3114 | 3135 => ErrorKind::Connection,
        900..=999 | 1722 | 6550 => ErrorKind::Query,
        _ => ErrorKind::Unknown,
    }
}

/// Classify a MongoDB server error code.
pub fn classify_mongo(code: i32) -> ErrorKind {
    match code {
        11000 | 11001 => ErrorKind::DuplicateKey,
        18 => ErrorKind::Authentication,
        13 => ErrorKind::PermissionDenied,
        50 => ErrorKind::Timeout,
        6 | 7 | 89 | 91 | 189 => ErrorKind::Connection,
        2 | 9 | 14 | 26 | 40 | 72 => ErrorKind::Query,
        _ => ErrorKind::Unknown,
    }
}

/// Classify by message text when no native code is available.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        ErrorKind::Timeout
    } else if lower.contains("authentication") || lower.contains("password") || lower.contains("noauth") {
        ErrorKind::Authentication
    } else if lower.contains("permission") || lower.contains("not authorized") || lower.contains("noperm") {
        ErrorKind::PermissionDenied
    } else if lower.contains("connection")
        || lower.contains("refused")
        || lower.contains("reset")
        || lower.contains("broken pipe")
    {
        ErrorKind::Connection
    } else if lower.contains("syntax") || lower.contains("unknown command") {
        ErrorKind::Query
    } else {
        ErrorKind::Unknown
    }
}

/// Build a classified error carrying the native diagnostics and a hint.
pub fn native_error(
    engine: EngineType,
    kind: ErrorKind,
    code: Option<String>,
    message: impl Into<String>,
) -> DbError {
    let message = message.into();
    let suggestion = match kind {
        ErrorKind::Connection => connection_suggestion(engine, &message),
        ErrorKind::Query => "Check the statement syntax and referenced objects".to_string(),
        _ => String::new(),
    };
    DbError::classified(kind, NativeError::new(engine, code, message), suggestion)
}

/// Generate a helpful suggestion for connection errors.
pub fn connection_suggestion(engine: EngineType, message: &str) -> String {
    let error_str = message.to_lowercase();

    if error_str.contains("connection refused") {
        return format!("Check that the {} server is running and accessible", engine);
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the username and password for this endpoint".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") || error_str.contains("certificate") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    format!(
        "Verify host and port ({} listens on {} by default)",
        engine,
        engine.default_port()
    )
}

/// Classify a sqlx error for the MySQL and PostgreSQL adapters.
pub fn from_sqlx(engine: EngineType, err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(db_err) => {
            let (kind, code) = match engine {
                EngineType::MySql => {
                    let number = db_err
                        .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                        .map(|e| u32::from(e.number()));
                    match number {
                        Some(n) => (classify_mysql(n), Some(n.to_string())),
                        None => (ErrorKind::Unknown, db_err.code().map(|c| c.to_string())),
                    }
                }
                _ => {
                    let code = db_err.code().map(|c| c.to_string());
                    let kind = code
                        .as_deref()
                        .map(classify_postgres)
                        .unwrap_or(ErrorKind::Unknown);
                    (kind, code)
                }
            };
            let kind = if kind == ErrorKind::Unknown {
                classify_message(db_err.message())
            } else {
                kind
            };
            native_error(engine, kind, code, db_err.message())
        }
        sqlx::Error::Io(io) => {
            let code = Some(format!("{:?}", io.kind()));
            native_error(engine, ErrorKind::Connection, code, io.to_string())
        }
        sqlx::Error::Tls(e) => native_error(engine, ErrorKind::Connection, Some("TLS".into()), e.to_string()),
        sqlx::Error::PoolTimedOut => DbError::timeout("driver pool acquire", 0),
        sqlx::Error::RowNotFound => native_error(engine, ErrorKind::Query, None, "no rows returned"),
        sqlx::Error::ColumnNotFound(col) => {
            native_error(engine, ErrorKind::Query, None, format!("column not found: {col}"))
        }
        other => {
            let message = other.to_string();
            native_error(engine, classify_message(&message), None, message)
        }
    }
}
