//! Raw adapter output -> canonical [`QueryResult`].

use crate::models::{ColumnMetadata, QueryResult, RawResult};
use serde_json::{Map, Value as JsonValue};

/// Column name used when a row is a bare scalar.
pub const SCALAR_COLUMN: &str = "value";

pub struct ResultParser;

impl ResultParser {
    /// Normalize a raw result.
    ///
    /// Row count comes from the adapter's explicit count, then the affected
    /// row count, then the number of rows. Columns come from the adapter's
    /// field descriptors when it sent any, else they are inferred from the
    /// first row.
    pub fn parse(raw: RawResult, duration_ms: u64) -> QueryResult {
        let RawResult {
            payload,
            fields,
            row_count,
            affected_rows,
            command,
            mut metadata,
        } = raw;

        let (rows, wrapper_affected) = Self::normalize(payload, &mut metadata);
        let affected_rows = affected_rows.or(wrapper_affected);
        let columns = match fields {
            Some(fields) if !fields.is_empty() => fields,
            _ => infer_columns(&rows),
        };
        let row_count = row_count
            .or(affected_rows)
            .unwrap_or(rows.len() as u64);

        QueryResult {
            rows,
            columns,
            row_count,
            affected_rows,
            duration_ms,
            command,
            metadata,
        }
    }

    /// Extract the row sequence from any supported payload shape.
    ///
    /// Returns the rows plus an affected count found inside a record-set
    /// wrapper. Wrapper fields other than the rows land in `metadata`.
    pub fn normalize(
        payload: JsonValue,
        metadata: &mut Map<String, JsonValue>,
    ) -> (Vec<Map<String, JsonValue>>, Option<u64>) {
        match payload {
            JsonValue::Null => (Vec::new(), None),
            JsonValue::Array(items) => (items.into_iter().map(into_row).collect(), None),
            JsonValue::Object(mut obj) => {
                if let Some(JsonValue::Array(rows)) = obj.remove("rows") {
                    return (rows.into_iter().map(into_row).collect(), None);
                }
                if let Some(JsonValue::Array(rows)) = obj.remove("recordset") {
                    let affected = obj.get("rowsAffected").and_then(sum_counts);
                    for (key, value) in obj {
                        if key != "recordsets" {
                            metadata.insert(key, value);
                        }
                    }
                    return (rows.into_iter().map(into_row).collect(), affected);
                }
                (vec![obj], None)
            }
            scalar => (vec![into_row(scalar)], None),
        }
    }
}

fn into_row(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        other => {
            let mut row = Map::new();
            row.insert(SCALAR_COLUMN.to_string(), other);
            row
        }
    }
}

fn sum_counts(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::Array(items) => Some(items.iter().filter_map(JsonValue::as_u64).sum()),
        _ => None,
    }
}

/// Type name inferred from a JSON value.
pub fn infer_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => "integer",
        JsonValue::Number(_) => "decimal",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Column metadata inferred from the first row's values.
pub fn infer_columns(rows: &[Map<String, JsonValue>]) -> Vec<ColumnMetadata> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    first
        .iter()
        .map(|(name, value)| ColumnMetadata::new(name.clone(), infer_type(value), value.is_null()))
        .collect()
}

/// Column names of a result: declared columns, else every key in row order.
pub fn column_names(result: &QueryResult) -> Vec<String> {
    if !result.columns.is_empty() {
        return result.columns.iter().map(|c| c.name.clone()).collect();
    }
    let mut names: Vec<String> = Vec::new();
    for row in &result.rows {
        for key in row.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(payload: JsonValue) -> RawResult {
        RawResult::new(payload)
    }

    #[test]
    fn test_plain_array() {
        let result = ResultParser::parse(raw(json!([{ "id": 1, "name": "a" }, { "id": 2, "name": null }])), 3);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.duration_ms, 3);
        assert_eq!(result.column_names(), vec!["id", "name"]);
        assert_eq!(result.columns[0].type_name, "integer");
        assert_eq!(result.columns[1].type_name, "string");
    }

    #[test]
    fn test_rows_wrapper() {
        let result = ResultParser::parse(raw(json!({ "rows": [{ "a": true }] })), 0);
        assert_eq!(result.rows, vec![json!({ "a": true }).as_object().unwrap().clone()]);
        assert_eq!(result.columns[0].type_name, "boolean");
    }

    #[test]
    fn test_recordset_wrapper() {
        let payload = json!({
            "recordset": [{ "n": 1.5 }],
            "recordsets": [[{ "n": 1.5 }]],
            "rowsAffected": [1, 2],
        });
        let result = ResultParser::parse(raw(payload), 0);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.affected_rows, Some(3));
        // affected rows take precedence over the sequence length
        assert_eq!(result.row_count, 3);
        assert_eq!(result.columns[0].type_name, "decimal");
        assert!(result.metadata.contains_key("rowsAffected"));
        assert!(!result.metadata.contains_key("recordsets"));
    }

    #[test]
    fn test_single_object_and_scalar() {
        let result = ResultParser::parse(raw(json!({ "ok": 1 })), 0);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.row_count, 1);

        let result = ResultParser::parse(raw(json!("PONG")), 0);
        assert_eq!(result.scalar(), Some(&json!("PONG")));
        assert_eq!(result.column_names(), vec![SCALAR_COLUMN]);
    }

    #[test]
    fn test_explicit_row_count_wins() {
        let mut r = raw(json!([{ "a": 1 }]));
        r.row_count = Some(40);
        r.affected_rows = Some(2);
        assert_eq!(ResultParser::parse(r, 0).row_count, 40);
    }

    #[test]
    fn test_affected_only() {
        let result = ResultParser::parse(RawResult::affected(7).with_command("UPDATE"), 0);
        assert!(result.rows.is_empty());
        assert_eq!(result.row_count, 7);
        assert_eq!(result.affected_rows, Some(7));
        assert_eq!(result.command.as_deref(), Some("UPDATE"));
        assert!(result.columns.is_empty());
    }

    #[test]
    fn test_declared_fields_kept() {
        let fields = vec![ColumnMetadata::new("id", "int4", false)];
        let mut row = Map::new();
        row.insert("id".into(), json!(1));
        let result = ResultParser::parse(RawResult::rows(vec![row], fields.clone()), 0);
        assert_eq!(result.columns, fields);
    }

    #[test]
    fn test_column_names_union_when_undeclared() {
        let mut result = ResultParser::parse(raw(json!([{ "a": 1 }, { "b": 2 }])), 0);
        result.columns.clear();
        assert_eq!(column_names(&result), vec!["a", "b"]);
    }
}
