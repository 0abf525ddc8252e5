//! Query-related data models.
//!
//! This module defines query parameters and options, the raw shape adapters
//! hand back, and the canonical result every caller receives.

use crate::config::EngineType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::time::Duration;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Structured value (documents, arrays, JSON columns)
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }

    /// Convert a JSON value into the closest parameter type.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::String(s) => JsonValue::String(s.clone()),
            Self::Bytes(b) => {
                use base64::Engine as _;
                JsonValue::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Self::Json(v) => v.clone(),
        }
    }

    /// Render as plain text (Redis arguments, CSV cells).
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::String(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }
}

impl From<&str> for QueryParam {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for QueryParam {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for QueryParam {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for QueryParam {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for QueryParam {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overrides the endpoint's query timeout
    pub timeout: Option<Duration>,
    /// Overrides the executor's retry count
    pub max_retries: Option<u32>,
    /// Row cap applied by adapters that can push it down
    pub max_rows: Option<usize>,
}

impl QueryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// Native type (e.g. "int8", "NVARCHAR") or an inferred one ("integer", "string")
    pub type_name: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
}

impl ColumnMetadata {
    /// Create new column metadata.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable,
            length: None,
            precision: None,
            scale: None,
        }
    }

    pub fn with_length(mut self, length: Option<u32>) -> Self {
        self.length = length;
        self
    }

    pub fn with_precision(mut self, precision: Option<u32>, scale: Option<u32>) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }
}

/// Adapter output before normalization.
///
/// `payload` is whatever shape is natural for the driver: an array of row
/// objects, a `{"rows": [...]}` object, a record-set wrapper
/// (`{"recordset": [...], "rowsAffected": [n]}`), a single document or a
/// scalar reply.
#[derive(Debug, Clone, Default)]
pub struct RawResult {
    pub payload: JsonValue,
    pub fields: Option<Vec<ColumnMetadata>>,
    pub row_count: Option<u64>,
    pub affected_rows: Option<u64>,
    pub command: Option<String>,
    pub metadata: Map<String, JsonValue>,
}

impl RawResult {
    pub fn new(payload: JsonValue) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Row-returning result with native field descriptors.
    pub fn rows(rows: Vec<Map<String, JsonValue>>, fields: Vec<ColumnMetadata>) -> Self {
        Self {
            payload: JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect()),
            fields: Some(fields),
            ..Default::default()
        }
    }

    /// Result of a statement that only reports affected rows.
    pub fn affected(count: u64) -> Self {
        Self {
            payload: JsonValue::Array(Vec::new()),
            affected_rows: Some(count),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Canonical, normalized query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Map<String, JsonValue>>,
    pub columns: Vec<ColumnMetadata>,
    pub row_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, JsonValue>,
}

impl QueryResult {
    /// Create an empty result (for non-SELECT statements).
    pub fn empty(duration_ms: u64) -> Self {
        Self {
            rows: Vec::new(),
            columns: Vec::new(),
            row_count: 0,
            affected_rows: None,
            duration_ms,
            command: None,
            metadata: Map::new(),
        }
    }

    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.affected_rows.is_none()
    }

    /// First column of the first row, for scalar queries.
    pub fn scalar(&self) -> Option<&JsonValue> {
        self.rows.first().and_then(|row| row.values().next())
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Statement prepared on a specific connection.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedStatement {
    pub id: String,
    /// Statement text with canonical `?` placeholders
    pub text: String,
    pub engine: EngineType,
    pub param_count: usize,
    /// Connection the statement belongs to
    pub connection_id: String,
}

/// Server information reported by `metadata()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub engine: EngineType,
    pub server_version: Option<String>,
    pub database: Option<String>,
    #[serde(default)]
    pub extra: Map<String, JsonValue>,
}
