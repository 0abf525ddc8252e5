//! Row decoding for the sqlx-backed engines.
//!
//! Column type names are first mapped to a [`TypeCategory`]; the category
//! picks the Rust type each cell is decoded through. The SQL Server and
//! Oracle adapters reuse [`categorize_type`] for their own driver rows.

use crate::config::EngineType;
use crate::models::ColumnMetadata;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::{Column, Decode, Row, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Date,
    Time,
    Timestamp,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, engine: EngineType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") || lower.contains("money") {
        return TypeCategory::Decimal;
    }

    // Oracle NUMBER without scale info is decimal as well
    if engine == EngineType::Oracle && lower.starts_with("number") {
        return TypeCategory::Decimal;
    }

    if lower.contains("int") && !lower.contains("interval") || lower.contains("serial") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" || lower == "bit" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" || lower == "uniqueidentifier" {
        return TypeCategory::Uuid;
    }

    if lower.contains("timestamp") || lower.contains("datetime") {
        return TypeCategory::Timestamp;
    }
    if lower == "date" {
        // Oracle DATE carries a time component
        return if engine == EngineType::Oracle {
            TypeCategory::Timestamp
        } else {
            TypeCategory::Date
        };
    }
    if lower == "time" || lower == "timetz" {
        return TypeCategory::Time;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" || lower == "raw" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower.contains("clob") {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

/// DECIMAL/NUMERIC text exactly as the server sent it.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal") || name.contains("money")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Encode binary column data as base64 text.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

/// Convert a float to JSON, falling back to text for NaN/infinity.
pub fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Converts a driver row into the normalized row map plus column metadata.
pub trait RowToJson {
    fn to_json_map(&self) -> serde_json::Map<String, JsonValue>;
    fn column_metadata(&self) -> Vec<ColumnMetadata>;
}

fn text_to_json(text: String, type_name: &str) -> JsonValue {
    // MySQL reports JSON columns in some server versions as text
    if type_name.eq_ignore_ascii_case("json") {
        if let Ok(parsed) = serde_json::from_str(&text) {
            return parsed;
        }
    }
    JsonValue::String(text)
}

fn naive_timestamp(v: chrono::NaiveDateTime) -> JsonValue {
    JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

/// Implements [`RowToJson`] for a sqlx row type.
///
/// `integers` lists the integer widths the engine can hand back, widest
/// first; the first one that decodes wins.
macro_rules! impl_row_to_json {
    ($row:ty, $engine:expr, integers: [$($int:ty),+ $(,)?]) => {
        impl RowToJson for $row {
            fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
                fn fetch<'r, T>(row: &'r $row, idx: usize) -> Option<T>
                where
                    T: Decode<'r, <$row as Row>::Database> + Type<<$row as Row>::Database>,
                {
                    row.try_get::<Option<T>, _>(idx).ok().flatten()
                }

                fn decode(row: &$row, idx: usize, type_name: &str, category: TypeCategory) -> JsonValue {
                    let value = match category {
                        TypeCategory::Decimal => match row.try_get::<Option<RawDecimal>, _>(idx) {
                            Ok(v) => v.map(|d| JsonValue::String(d.0)),
                            Err(e) => {
                                tracing::warn!(column = idx, error = %e, "Undecodable decimal column");
                                None
                            }
                        },
                        TypeCategory::Integer => None
                            $(.or_else(|| fetch::<$int>(row, idx).map(|v| JsonValue::from(v))))+,
                        TypeCategory::Boolean => fetch::<bool>(row, idx).map(JsonValue::Bool),
                        TypeCategory::Float => fetch::<f64>(row, idx)
                            .or_else(|| fetch::<f32>(row, idx).map(f64::from))
                            .map(float_value),
                        TypeCategory::Binary => fetch::<Vec<u8>>(row, idx).map(|b| encode_binary(&b)),
                        TypeCategory::Json => fetch::<JsonValue>(row, idx),
                        TypeCategory::Date => {
                            fetch::<chrono::NaiveDate>(row, idx).map(|d| JsonValue::String(d.to_string()))
                        }
                        TypeCategory::Time => {
                            fetch::<chrono::NaiveTime>(row, idx).map(|t| JsonValue::String(t.to_string()))
                        }
                        TypeCategory::Timestamp => fetch::<chrono::DateTime<chrono::Utc>>(row, idx)
                            .map(|v| JsonValue::String(v.to_rfc3339()))
                            .or_else(|| fetch::<chrono::NaiveDateTime>(row, idx).map(naive_timestamp)),
                        TypeCategory::Uuid | TypeCategory::Text | TypeCategory::Unknown => {
                            fetch::<String>(row, idx).map(|t| text_to_json(t, type_name))
                        }
                    };
                    value.unwrap_or(JsonValue::Null)
                }

                let mut map = serde_json::Map::with_capacity(self.columns().len());
                for (idx, col) in self.columns().iter().enumerate() {
                    let type_name = col.type_info().name();
                    let value = decode(self, idx, type_name, categorize_type(type_name, $engine));
                    map.insert(col.name().to_string(), value);
                }
                map
            }

            fn column_metadata(&self) -> Vec<ColumnMetadata> {
                self.columns()
                    .iter()
                    .map(|col| ColumnMetadata::new(col.name(), col.type_info().name(), true))
                    .collect()
            }
        }
    };
}

impl_row_to_json!(MySqlRow, EngineType::MySql, integers: [i64, i32, i16, i8, u64, u32, u16, u8]);
impl_row_to_json!(PgRow, EngineType::Postgres, integers: [i64, i32, i16]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(categorize_type("INT", EngineType::MySql), TypeCategory::Integer);
        assert_eq!(categorize_type("BIGINT", EngineType::Postgres), TypeCategory::Integer);
        assert_eq!(categorize_type("TINYINT", EngineType::MySql), TypeCategory::Integer);
        assert_eq!(categorize_type("SERIAL", EngineType::Postgres), TypeCategory::Integer);
        assert_eq!(categorize_type("INTERVAL", EngineType::Postgres), TypeCategory::Unknown);
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(categorize_type("DECIMAL", EngineType::MySql), TypeCategory::Decimal);
        assert_eq!(categorize_type("NUMERIC", EngineType::Postgres), TypeCategory::Decimal);
        assert_eq!(categorize_type("NUMBER", EngineType::Oracle), TypeCategory::Decimal);
        assert_eq!(categorize_type("money", EngineType::SqlServer), TypeCategory::Decimal);
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(categorize_type("TIMESTAMPTZ", EngineType::Postgres), TypeCategory::Timestamp);
        assert_eq!(categorize_type("DATETIME2", EngineType::SqlServer), TypeCategory::Timestamp);
        assert_eq!(categorize_type("DATE", EngineType::MySql), TypeCategory::Date);
        assert_eq!(categorize_type("DATE", EngineType::Oracle), TypeCategory::Timestamp);
    }

    #[test]
    fn test_categorize_type_json() {
        assert_eq!(categorize_type("json", EngineType::Postgres), TypeCategory::Json);
        assert_eq!(categorize_type("jsonb", EngineType::Postgres), TypeCategory::Json);
    }

    #[test]
    fn test_encode_binary() {
        assert_eq!(encode_binary(b"hello world"), JsonValue::String("aGVsbG8gd29ybGQ=".into()));
        assert_eq!(encode_binary(&[]), JsonValue::String(String::new()));
    }

    #[test]
    fn test_float_value_non_finite() {
        assert_eq!(float_value(f64::NAN), JsonValue::String("NaN".into()));
        assert_eq!(float_value(1.5), serde_json::json!(1.5));
    }
}
