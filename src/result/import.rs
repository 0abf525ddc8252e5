//! Result import: the inverse of the exporters.
//!
//! Untyped sources (CSV, XML, text tables, spreadsheet strings) go through
//! type coercion; JSON keeps the types it was written with.

use super::export::ExportFormat;
use super::parser::ResultParser;
use crate::error::{DbError, DbResult};
use crate::models::{QueryResult, RawResult};
use calamine::{Data, Reader as _, open_workbook_auto};
use chrono::{NaiveDate, NaiveDateTime};
use quick_xml::Reader as XmlReader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::info;

static INTEGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d+$").expect("valid integer regex"));
static DECIMAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(\d+\.\d*|\.\d+|\d+(\.\d*)?[eE][+-]?\d+)$").expect("valid decimal regex")
});

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%m-%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
];

/// Coerce a text cell into the most specific JSON value.
///
/// Integers and decimals by pattern, `true`/`false` (any case) to booleans,
/// and strings containing `-` or `/` that parse as a date or timestamp to a
/// normalized ISO-8601 string. Leading-zero integers such as ZIP codes stay
/// strings.
pub fn coerce_value(text: &str) -> JsonValue {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return JsonValue::String(text.to_string());
    }

    if INTEGER.is_match(trimmed) {
        let digits = trimmed.trim_start_matches(['+', '-']);
        if !(digits.len() > 1 && digits.starts_with('0')) {
            if let Ok(i) = trimmed.parse::<i64>() {
                return JsonValue::from(i);
            }
        }
    } else if DECIMAL.is_match(trimmed) {
        if let Some(n) = trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
        {
            return JsonValue::Number(n);
        }
    }

    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return JsonValue::Bool(true),
        "false" => return JsonValue::Bool(false),
        _ => {}
    }

    if trimmed.contains(['-', '/']) {
        if let Some(date) = parse_date(trimmed) {
            return JsonValue::String(date);
        }
    }

    JsonValue::String(text.to_string())
}

fn parse_date(text: &str) -> Option<String> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(dt.to_rfc3339());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.format("%Y-%m-%dT%H:%M:%S").to_string());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

/// Builder reading a file back into a result.
#[derive(Debug, Clone)]
pub struct ResultImporter {
    path: PathBuf,
    format: Option<ExportFormat>,
    delimiter: u8,
    coerce: bool,
    null_value: Option<String>,
    sheet: Option<String>,
}

impl ResultImporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: None,
            delimiter: b',',
            coerce: true,
            null_value: None,
            sheet: None,
        }
    }

    pub fn format(mut self, format: ExportFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Disable type coercion; every untyped cell stays a string.
    pub fn coerce(mut self, coerce: bool) -> Self {
        self.coerce = coerce;
        self
    }

    /// CSV cell text read back as NULL.
    pub fn null_value(mut self, value: impl Into<String>) -> Self {
        self.null_value = Some(value.into());
        self
    }

    /// Spreadsheet sheet to read; defaults to the first one.
    pub fn sheet(mut self, name: impl Into<String>) -> Self {
        self.sheet = Some(name.into());
        self
    }

    pub fn read(&self) -> DbResult<QueryResult> {
        let format = ExportFormat::resolve(self.format, &self.path)?;
        if !self.path.exists() {
            return Err(DbError::invalid_input(format!(
                "import file not found: {}",
                self.path.display()
            )));
        }

        let rows = match format {
            ExportFormat::Csv => self.read_csv()?,
            ExportFormat::Json => return self.read_json(),
            ExportFormat::Xml => self.read_xml()?,
            ExportFormat::Excel => self.read_workbook()?,
            ExportFormat::Text => self.read_text()?,
        };
        info!(path = %self.path.display(), format = %format, rows = rows.len(), "Result imported");
        Ok(ResultParser::parse(RawResult::new(rows_payload(rows)), 0))
    }

    fn cell(&self, text: &str) -> JsonValue {
        if self.null_value.as_deref() == Some(text) {
            return JsonValue::Null;
        }
        if self.coerce {
            coerce_value(text)
        } else {
            JsonValue::String(text.to_string())
        }
    }

    fn read_csv(&self) -> DbResult<Vec<Map<String, JsonValue>>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .from_path(&self.path)
            .map_err(csv_error)?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            let row = headers
                .iter()
                .zip(record.iter())
                .map(|(name, text)| (name.clone(), self.cell(text)))
                .collect();
            rows.push(row);
        }
        Ok(rows)
    }

    /// Accepts the export envelope (`{metadata, rows}`) or a bare row array.
    fn read_json(&self) -> DbResult<QueryResult> {
        let text = std::fs::read_to_string(&self.path)?;
        let document: JsonValue = serde_json::from_str(&text)?;

        let result = match document {
            JsonValue::Object(mut obj) if obj.contains_key("rows") => {
                let rows = obj.remove("rows").unwrap_or(JsonValue::Null);
                let mut raw = RawResult::new(rows);
                if let Some(JsonValue::Object(meta)) = obj.remove("metadata") {
                    raw.fields = meta
                        .get("columns")
                        .cloned()
                        .and_then(|c| serde_json::from_value(c).ok());
                    raw.affected_rows = meta.get("affected_rows").and_then(JsonValue::as_u64);
                    raw.command = meta.get("command").and_then(JsonValue::as_str).map(str::to_string);
                    if let Some(JsonValue::Object(extra)) = meta.get("extra") {
                        raw.metadata = extra.clone();
                    }
                }
                ResultParser::parse(raw, 0)
            }
            other => ResultParser::parse(RawResult::new(other), 0),
        };
        info!(path = %self.path.display(), rows = result.rows.len(), "Result imported");
        Ok(result)
    }

    /// Reads `<root><row><col>text</col>...</row>...</root>`.
    fn read_xml(&self) -> DbResult<Vec<Map<String, JsonValue>>> {
        let text = std::fs::read_to_string(&self.path)?;
        let mut reader = XmlReader::from_str(&text);
        reader.config_mut().trim_text(true);

        let mut rows = Vec::new();
        let mut row: Option<Map<String, JsonValue>> = None;
        let mut column: Option<String> = None;
        let mut depth = 0usize;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(start) => {
                    depth += 1;
                    match depth {
                        2 => row = Some(Map::new()),
                        3 => {
                            let name = column_name(&start)?;
                            if let Some(row) = row.as_mut() {
                                // present but empty text reads back as ""
                                row.insert(name.clone(), JsonValue::String(String::new()));
                            }
                            column = Some(name);
                        }
                        _ => {}
                    }
                }
                Event::Empty(start) if depth == 2 => {
                    let name = column_name(&start)?;
                    let null = start
                        .try_get_attribute("null")
                        .map_err(xml_error)?
                        .is_some_and(|a| a.value.as_ref() == b"true");
                    let value = if null {
                        JsonValue::Null
                    } else {
                        JsonValue::String(String::new())
                    };
                    if let Some(row) = row.as_mut() {
                        row.insert(name, value);
                    }
                }
                Event::Empty(_) if depth == 1 => rows.push(Map::new()),
                Event::Text(text) if depth == 3 => {
                    let text = text.unescape().map_err(xml_error)?;
                    if let (Some(row), Some(name)) = (row.as_mut(), column.as_ref()) {
                        row.insert(name.clone(), self.cell(&text));
                    }
                }
                Event::CData(data) if depth == 3 => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    if let (Some(row), Some(name)) = (row.as_mut(), column.as_ref()) {
                        row.insert(name.clone(), self.cell(&text));
                    }
                }
                Event::End(_) => {
                    match depth {
                        2 => rows.extend(row.take()),
                        3 => column = None,
                        _ => {}
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(rows)
    }

    /// First row is the header; later rows are data.
    fn read_workbook(&self) -> DbResult<Vec<Map<String, JsonValue>>> {
        let mut workbook = open_workbook_auto(&self.path).map_err(sheet_error)?;
        let sheet = match &self.sheet {
            Some(name) => name.clone(),
            None => workbook
                .sheet_names()
                .first()
                .cloned()
                .ok_or_else(|| DbError::invalid_input("workbook has no sheets"))?,
        };
        let range = workbook.worksheet_range(&sheet).map_err(sheet_error)?;

        let mut lines = range.rows();
        let Some(header) = lines.next() else {
            return Ok(Vec::new());
        };
        let headers: Vec<String> = header.iter().map(|c| c.to_string()).collect();

        let rows = lines
            .map(|cells| {
                headers
                    .iter()
                    .zip(cells)
                    .map(|(name, cell)| (name.clone(), self.sheet_cell(cell)))
                    .collect()
            })
            .collect();
        Ok(rows)
    }

    fn sheet_cell(&self, cell: &Data) -> JsonValue {
        match cell {
            Data::Empty => JsonValue::Null,
            Data::Int(i) => JsonValue::from(*i),
            Data::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => JsonValue::from(*f as i64),
            Data::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Data::Bool(b) => JsonValue::Bool(*b),
            Data::String(s) => self.cell(s),
            other => self.cell(&other.to_string()),
        }
    }

    /// Reads the `+---+` bordered table the text exporter writes.
    fn read_text(&self) -> DbResult<Vec<Map<String, JsonValue>>> {
        let text = std::fs::read_to_string(&self.path)?;
        let mut lines = text.lines().filter(|line| line.starts_with('|'));

        let Some(header) = lines.next() else {
            return Ok(Vec::new());
        };
        let headers = split_table_line(header);

        let rows = lines
            .map(|line| {
                headers
                    .iter()
                    .zip(split_table_line(line))
                    .map(|(name, cell)| {
                        let value = if cell == "NULL" {
                            JsonValue::Null
                        } else {
                            self.cell(&cell)
                        };
                        (name.clone(), value)
                    })
                    .collect()
            })
            .collect();
        Ok(rows)
    }
}

fn split_table_line(line: &str) -> Vec<String> {
    let inner = line.trim().trim_start_matches('|').trim_end_matches('|');
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

/// Original column name: the `name` attribute when the element name was
/// sanitized, else the element name.
fn column_name(start: &BytesStart<'_>) -> DbResult<String> {
    if let Some(attr) = start.try_get_attribute("name").map_err(xml_error)? {
        return Ok(attr.unescape_value().map_err(xml_error)?.into_owned());
    }
    Ok(String::from_utf8_lossy(start.name().as_ref()).into_owned())
}

fn rows_payload(rows: Vec<Map<String, JsonValue>>) -> JsonValue {
    JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect())
}

fn csv_error(err: csv::Error) -> DbError {
    DbError::invalid_input(format!("CSV read failed: {}", err))
}

fn xml_error(err: impl std::fmt::Display) -> DbError {
    DbError::invalid_input(format!("XML read failed: {}", err))
}

fn sheet_error(err: impl std::fmt::Display) -> DbError {
    DbError::invalid_input(format!("spreadsheet read failed: {}", err))
}

/// Shorthand for `ResultImporter::new(path).read()`.
pub fn import_file(path: impl AsRef<Path>) -> DbResult<QueryResult> {
    ResultImporter::new(path.as_ref()).read()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ResultExporter;
    use serde_json::json;

    fn sample() -> QueryResult {
        ResultParser::parse(
            RawResult::new(json!([
                { "id": 1, "price": 9.5, "active": true, "born": "1990-04-01", "zip": "02134", "note": null },
                { "id": 2, "price": 12.25, "active": false, "born": "2001-12-31", "zip": "02139", "note": "a, \"b\"" },
            ])),
            4,
        )
    }

    #[test]
    fn test_coerce_value() {
        assert_eq!(coerce_value("42"), json!(42));
        assert_eq!(coerce_value("-7"), json!(-7));
        assert_eq!(coerce_value("3.25"), json!(3.25));
        assert_eq!(coerce_value("1e3"), json!(1000.0));
        assert_eq!(coerce_value("TRUE"), json!(true));
        assert_eq!(coerce_value("false"), json!(false));
        assert_eq!(coerce_value("2024/01/05"), json!("2024-01-05"));
        assert_eq!(coerce_value("2024-01-05 10:30:00"), json!("2024-01-05T10:30:00"));
        assert_eq!(coerce_value("007"), json!("007"));
        assert_eq!(coerce_value("a-b"), json!("a-b"));
        assert_eq!(coerce_value("hello"), json!("hello"));
    }

    #[test]
    fn test_json_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.json");
        let original = sample();
        ResultExporter::new(&original).write(&path).unwrap();

        let imported = ResultImporter::new(&path).read().unwrap();
        assert_eq!(imported.rows, original.rows);
        assert_eq!(imported.columns, original.columns);
    }

    #[test]
    fn test_csv_round_trip_with_coercion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.csv");
        let original = sample();
        ResultExporter::new(&original).null_value("NULL").write(&path).unwrap();

        let imported = ResultImporter::new(&path).null_value("NULL").read().unwrap();
        assert_eq!(imported.rows, original.rows);
    }

    #[test]
    fn test_csv_without_coercion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.csv");
        std::fs::write(&path, "a;b\n1;true\n").unwrap();

        let imported = ResultImporter::new(&path).delimiter(b';').coerce(false).read().unwrap();
        assert_eq!(imported.rows[0]["a"], json!("1"));
        assert_eq!(imported.rows[0]["b"], json!("true"));
    }

    #[test]
    fn test_xml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.xml");
        let original = ResultParser::parse(
            RawResult::new(json!([{ "order id": 5, "name": "x & y", "gone": null }])),
            0,
        );
        ResultExporter::new(&original).write(&path).unwrap();

        let imported = ResultImporter::new(&path).read().unwrap();
        assert_eq!(imported.rows, original.rows);
    }

    #[test]
    fn test_text_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.txt");
        let original = ResultParser::parse(
            RawResult::new(json!([{ "id": 3, "name": "héllo", "n": null }])),
            0,
        );
        ResultExporter::new(&original).write(&path).unwrap();

        let imported = ResultImporter::new(&path).read().unwrap();
        assert_eq!(imported.rows, original.rows);
    }

    #[test]
    fn test_spreadsheet_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.xlsx");
        let original = ResultParser::parse(
            RawResult::new(json!([{ "id": 1, "ratio": 0.5, "ok": true, "name": "a" }])),
            0,
        );
        ResultExporter::new(&original).write(&path).unwrap();

        let imported = ResultImporter::new(&path).read().unwrap();
        assert_eq!(imported.rows, original.rows);

        let metadata = ResultImporter::new(&path).sheet("Metadata").read().unwrap();
        assert!(metadata.rows.iter().any(|r| r["key"] == json!("row_count")));
    }

    #[test]
    fn test_missing_file_and_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        assert!(import_file(dir.path().join("missing.csv")).is_err());
        assert!(import_file(dir.path().join("data.bin")).is_err());
    }
}
