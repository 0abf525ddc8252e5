//! Error types for db-bridge.
//!
//! Every failure surfaced by the layer is a [`DbError`]. Adapters classify
//! native driver errors into one of the canonical kinds and attach a short
//! remediation hint plus the engine-native diagnostic record. The registry
//! wraps failures with an operation-scoped code and context (SQL text,
//! bound parameters) before handing them to callers.

use crate::config::EngineType;
use crate::models::QueryParam;
use serde::Serialize;
use thiserror::Error;

/// Maximum number of characters of SQL text carried in error context.
pub const MAX_CONTEXT_SQL_CHARS: usize = 500;

/// Canonical error kinds shared by all engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Authentication,
    Timeout,
    DuplicateKey,
    ForeignKeyViolation,
    NotNullViolation,
    Query,
    PermissionDenied,
    UnsupportedOperation,
    AcquireTimeout,
    NoActiveTransaction,
    ConnectionNotFound,
    InvalidInput,
    ReconnectFailed,
    Internal,
    Unknown,
}

/// Engine-native diagnostic fields kept alongside a classified error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NativeError {
    pub engine: EngineType,
    /// SQLSTATE, server error number or driver error kind
    pub code: Option<String>,
    pub message: String,
}

impl NativeError {
    pub fn new(engine: EngineType, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            engine,
            code,
            message: message.into(),
        }
    }
}

/// Operation that failed, attached by [`DbError::with_operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationCode {
    ConnectionFailed,
    QueryFailed,
    TransactionBeginFailed,
    TransactionCommitFailed,
    TransactionRollbackFailed,
    SavepointFailed,
    BulkInsertFailed,
    ProcedureFailed,
    ExportFailed,
    ImportFailed,
}

impl OperationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "connection-failed",
            Self::QueryFailed => "query-failed",
            Self::TransactionBeginFailed => "transaction-begin-failed",
            Self::TransactionCommitFailed => "transaction-commit-failed",
            Self::TransactionRollbackFailed => "transaction-rollback-failed",
            Self::SavepointFailed => "savepoint-failed",
            Self::BulkInsertFailed => "bulk-insert-failed",
            Self::ProcedureFailed => "procedure-failed",
            Self::ExportFailed => "export-failed",
            Self::ImportFailed => "import-failed",
        }
    }
}

impl std::fmt::Display for OperationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context recorded with an operation-scoped error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationContext {
    pub alias: Option<String>,
    /// Truncated to [`MAX_CONTEXT_SQL_CHARS`]
    pub sql: Option<String>,
    pub params: Vec<QueryParam>,
}

impl OperationContext {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: Some(alias.into()),
            ..Default::default()
        }
    }

    pub fn with_sql(mut self, sql: &str) -> Self {
        self.sql = Some(truncate_sql(sql));
        self
    }

    pub fn with_params(mut self, params: &[QueryParam]) -> Self {
        self.params = params.to_vec();
        self
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        suggestion: String,
        native: Option<NativeError>,
    },

    #[error("Authentication failed: {message}")]
    Authentication {
        message: String,
        native: Option<NativeError>,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Duplicate key: {message}")]
    DuplicateKey {
        message: String,
        native: Option<NativeError>,
    },

    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation {
        message: String,
        native: Option<NativeError>,
    },

    #[error("Not-null violation: {message}")]
    NotNullViolation {
        message: String,
        native: Option<NativeError>,
    },

    #[error("Query failed: {message}")]
    Query {
        message: String,
        suggestion: String,
        native: Option<NativeError>,
    },

    #[error("Permission denied: {operation} - {reason}")]
    Permission {
        operation: String,
        reason: String,
        native: Option<NativeError>,
    },

    #[error("Unsupported operation: {operation} is not supported by {engine}")]
    Unsupported {
        operation: String,
        engine: EngineType,
    },

    #[error("Timed out after {waited_ms}ms waiting for a pooled connection")]
    AcquireTimeout { waited_ms: u64 },

    #[error("No active transaction on connection {connection_id}")]
    NoActiveTransaction { connection_id: String },

    #[error("Connection not found: {alias}")]
    ConnectionNotFound { alias: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Reconnection failed after {attempts} attempts: {message}")]
    ReconnectFailed { attempts: u32, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Unknown database error: {message}")]
    Unknown {
        message: String,
        native: Option<NativeError>,
    },

    #[error("{code}: {source}")]
    Operation {
        code: OperationCode,
        context: Box<OperationContext>,
        #[source]
        source: Box<DbError>,
    },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
            native: None,
        }
    }

    /// Create an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            native: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a query error (syntax errors included).
    pub fn query(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            suggestion: suggestion.into(),
            native: None,
        }
    }

    /// Create a permission error.
    pub fn permission(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permission {
            operation: operation.into(),
            reason: reason.into(),
            native: None,
        }
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(operation: impl Into<String>, engine: EngineType) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            engine,
        }
    }

    pub fn acquire_timeout(waited_ms: u64) -> Self {
        Self::AcquireTimeout { waited_ms }
    }

    pub fn no_active_transaction(connection_id: impl Into<String>) -> Self {
        Self::NoActiveTransaction {
            connection_id: connection_id.into(),
        }
    }

    pub fn connection_not_found(alias: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            alias: alias.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn reconnect_failed(attempts: u32, message: impl Into<String>) -> Self {
        Self::ReconnectFailed {
            attempts,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Build a classified error for `kind`, carrying the native diagnostics.
    pub fn classified(kind: ErrorKind, native: NativeError, suggestion: impl Into<String>) -> Self {
        let message = native.message.clone();
        let suggestion = suggestion.into();
        let native = Some(native);
        match kind {
            ErrorKind::Connection => Self::Connection {
                message,
                suggestion,
                native,
            },
            ErrorKind::Authentication => Self::Authentication { message, native },
            ErrorKind::Timeout => Self::Timeout {
                operation: message,
                elapsed_ms: 0,
            },
            ErrorKind::DuplicateKey => Self::DuplicateKey { message, native },
            ErrorKind::ForeignKeyViolation => Self::ForeignKeyViolation { message, native },
            ErrorKind::NotNullViolation => Self::NotNullViolation { message, native },
            ErrorKind::Query => Self::Query {
                message,
                suggestion,
                native,
            },
            ErrorKind::PermissionDenied => Self::Permission {
                operation: "statement".to_string(),
                reason: message,
                native,
            },
            _ => Self::Unknown { message, native },
        }
    }

    /// Wrap this error with an operation code and context.
    ///
    /// Already-wrapped errors keep their original code.
    pub fn with_operation(self, code: OperationCode, context: OperationContext) -> Self {
        match self {
            err @ Self::Operation { .. } => err,
            err => Self::Operation {
                code,
                context: Box::new(context),
                source: Box::new(err),
            },
        }
    }

    /// Canonical kind of this error, looking through operation wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            Self::ForeignKeyViolation { .. } => ErrorKind::ForeignKeyViolation,
            Self::NotNullViolation { .. } => ErrorKind::NotNullViolation,
            Self::Query { .. } => ErrorKind::Query,
            Self::Permission { .. } => ErrorKind::PermissionDenied,
            Self::Unsupported { .. } => ErrorKind::UnsupportedOperation,
            Self::AcquireTimeout { .. } => ErrorKind::AcquireTimeout,
            Self::NoActiveTransaction { .. } => ErrorKind::NoActiveTransaction,
            Self::ConnectionNotFound { .. } => ErrorKind::ConnectionNotFound,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::ReconnectFailed { .. } => ErrorKind::ReconnectFailed,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Unknown { .. } => ErrorKind::Unknown,
            Self::Operation { source, .. } => source.kind(),
        }
    }

    /// The innermost (unwrapped) error.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Operation code, if this error was wrapped.
    pub fn operation(&self) -> Option<OperationCode> {
        match self {
            Self::Operation { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Context recorded with the operation wrapper.
    pub fn context(&self) -> Option<&OperationContext> {
        match self {
            Self::Operation { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Engine-native diagnostics, if the error came from a driver.
    pub fn native(&self) -> Option<&NativeError> {
        match self.root() {
            Self::Connection { native, .. }
            | Self::Authentication { native, .. }
            | Self::DuplicateKey { native, .. }
            | Self::ForeignKeyViolation { native, .. }
            | Self::NotNullViolation { native, .. }
            | Self::Query { native, .. }
            | Self::Permission { native, .. }
            | Self::Unknown { native, .. } => native.as_ref(),
            _ => None,
        }
    }

    /// Get the remediation hint for this error.
    pub fn suggestion(&self) -> Option<&str> {
        match self.root() {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Query { suggestion, .. } => Some(suggestion),
            Self::Authentication { .. } => Some("Verify the username and password for this endpoint"),
            Self::DuplicateKey { .. } => Some("A row with the same unique key already exists"),
            Self::ForeignKeyViolation { .. } => {
                Some("Insert the referenced parent row first or fix the foreign key value")
            }
            Self::NotNullViolation { .. } => Some("Provide a value for every NOT NULL column"),
            Self::Permission { .. } => Some("Grant the required privilege to the configured user"),
            Self::AcquireTimeout { .. } => {
                Some("Release connections sooner or raise the pool's max size / acquire timeout")
            }
            Self::Timeout { .. } => Some("Consider increasing the timeout or optimizing the operation"),
            _ => None,
        }
    }

    /// Text used for retry classification: native code plus message.
    pub fn diagnostic_text(&self) -> String {
        let root = self.root();
        match root.native() {
            Some(native) => format!(
                "{} {} {}",
                native.code.as_deref().unwrap_or_default(),
                native.message,
                root
            ),
            None => root.to_string(),
        }
    }
}

/// Truncate SQL text to a safe length for logs and error context.
pub fn truncate_sql(sql: &str) -> String {
    if sql.chars().count() <= MAX_CONTEXT_SQL_CHARS {
        return sql.to_string();
    }
    let truncated: String = sql.chars().take(MAX_CONTEXT_SQL_CHARS).collect();
    format!("{}...", truncated)
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::internal(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::invalid_input(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::query("Syntax error", "Check SQL syntax");
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
    }

    #[test]
    fn test_kind_sees_through_operation_wrapper() {
        let err = DbError::acquire_timeout(1000).with_operation(
            OperationCode::QueryFailed,
            OperationContext::new("main").with_sql("SELECT 1"),
        );
        assert_eq!(err.kind(), ErrorKind::AcquireTimeout);
        assert_eq!(err.operation(), Some(OperationCode::QueryFailed));
        assert!(err.to_string().starts_with("query-failed"));
        assert_eq!(err.context().unwrap().sql.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_wrapping_twice_keeps_first_code() {
        let err = DbError::timeout("query", 10)
            .with_operation(OperationCode::QueryFailed, OperationContext::default())
            .with_operation(OperationCode::ExportFailed, OperationContext::default());
        assert_eq!(err.operation(), Some(OperationCode::QueryFailed));
    }

    #[test]
    fn test_classified_keeps_native_fields() {
        let native = NativeError::new(
            EngineType::Postgres,
            Some("23505".to_string()),
            "duplicate key value violates unique constraint",
        );
        let err = DbError::classified(ErrorKind::DuplicateKey, native, "");
        assert_eq!(err.kind(), ErrorKind::DuplicateKey);
        assert_eq!(err.native().unwrap().code.as_deref(), Some("23505"));
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_truncate_sql() {
        let long = "x".repeat(MAX_CONTEXT_SQL_CHARS + 50);
        let truncated = truncate_sql(&long);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), MAX_CONTEXT_SQL_CHARS + 3);
        assert_eq!(truncate_sql("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn test_diagnostic_text_includes_native_code() {
        let native = NativeError::new(EngineType::MySql, Some("ECONNRESET".to_string()), "reset");
        let err = DbError::classified(ErrorKind::Connection, native, "retry");
        assert!(err.diagnostic_text().contains("ECONNRESET"));
    }
}
