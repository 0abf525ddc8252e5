//! Result export: CSV, JSON, XML, spreadsheet and fixed-width text.
//!
//! Exporters are builders over a borrowed [`QueryResult`]; writing a file
//! never changes the result itself.

use super::parser::column_names;
use crate::error::{DbError, DbResult};
use crate::models::QueryResult;
use quick_xml::Writer as XmlWriter;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::path::{Path, PathBuf};
use tracing::info;
use unicode_width::UnicodeWidthStr;

/// Supported file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
    Xml,
    Excel,
    Text,
}

impl ExportFormat {
    /// Detect the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "tsv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "xml" => Some(Self::Xml),
            "xlsx" | "xlsm" | "xls" => Some(Self::Excel),
            "txt" | "text" | "log" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Excel => "xlsx",
            Self::Text => "txt",
        }
    }

    /// Explicit format, else the path's extension.
    pub fn resolve(explicit: Option<Self>, path: &Path) -> DbResult<Self> {
        explicit.or_else(|| Self::from_path(path)).ok_or_else(|| {
            DbError::invalid_input(format!(
                "cannot detect a file format for '{}'; use csv, json, xml, xlsx or txt",
                path.display()
            ))
        })
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Excel => "excel",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

/// Export options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Detected from the file extension when `None`
    pub format: Option<ExportFormat>,
    /// Pretty print JSON output
    pub pretty: bool,
    /// CSV field delimiter
    pub delimiter: u8,
    /// Write a header row (CSV)
    pub include_header: bool,
    /// Text written for NULL in CSV and text tables
    pub null_value: String,
    /// Spreadsheet data sheet name
    pub sheet_name: String,
    /// Spreadsheet metadata sheet name
    pub metadata_sheet_name: String,
    /// XML root element
    pub root_element: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: None,
            pretty: true,
            delimiter: b',',
            include_header: true,
            null_value: String::new(),
            sheet_name: "Data".to_string(),
            metadata_sheet_name: "Metadata".to_string(),
            root_element: "results".to_string(),
        }
    }
}

/// What an export wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub format: ExportFormat,
    pub rows: usize,
    pub bytes: u64,
}

impl std::fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} rows exported to {} as {} ({})",
            self.rows,
            self.path.display(),
            self.format,
            humansize::format_size(self.bytes, humansize::DECIMAL)
        )
    }
}

/// Builder writing a result to a file.
pub struct ResultExporter<'a> {
    result: &'a QueryResult,
    options: ExportOptions,
}

impl<'a> ResultExporter<'a> {
    pub fn new(result: &'a QueryResult) -> Self {
        Self {
            result,
            options: ExportOptions::default(),
        }
    }

    pub fn with_options(result: &'a QueryResult, options: ExportOptions) -> Self {
        Self { result, options }
    }

    pub fn format(mut self, format: ExportFormat) -> Self {
        self.options.format = Some(format);
        self
    }

    pub fn pretty(mut self, pretty: bool) -> Self {
        self.options.pretty = pretty;
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.options.delimiter = delimiter;
        self
    }

    pub fn include_header(mut self, include: bool) -> Self {
        self.options.include_header = include;
        self
    }

    pub fn null_value(mut self, value: impl Into<String>) -> Self {
        self.options.null_value = value.into();
        self
    }

    pub fn sheet_name(mut self, name: impl Into<String>) -> Self {
        self.options.sheet_name = name.into();
        self
    }

    /// Render to bytes in the given format (spreadsheets included).
    pub fn render(&self, format: ExportFormat) -> DbResult<Vec<u8>> {
        match format {
            ExportFormat::Csv => self.to_csv(),
            ExportFormat::Json => self.to_json().map(String::into_bytes),
            ExportFormat::Xml => self.to_xml(),
            ExportFormat::Excel => self.to_workbook()?.save_to_buffer().map_err(xlsx_error),
            ExportFormat::Text => Ok(self.to_text().into_bytes()),
        }
    }

    /// Write the file and report what was written.
    pub fn write(&self, path: impl AsRef<Path>) -> DbResult<ExportSummary> {
        let path = path.as_ref();
        let format = ExportFormat::resolve(self.options.format, path)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        match format {
            ExportFormat::Excel => self.to_workbook()?.save(path).map_err(xlsx_error)?,
            other => std::fs::write(path, self.render(other)?)?,
        }

        let summary = ExportSummary {
            path: path.to_path_buf(),
            format,
            rows: self.result.rows.len(),
            bytes: std::fs::metadata(path)?.len(),
        };
        info!(path = %path.display(), format = %format, rows = summary.rows, bytes = summary.bytes, "Result exported");
        Ok(summary)
    }

    fn cell_text(&self, value: Option<&JsonValue>) -> String {
        match value {
            None | Some(JsonValue::Null) => self.options.null_value.clone(),
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    pub fn to_csv(&self) -> DbResult<Vec<u8>> {
        let columns = column_names(self.result);
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.options.delimiter)
            .from_writer(Vec::new());

        if self.options.include_header {
            writer.write_record(&columns).map_err(csv_error)?;
        }
        for row in &self.result.rows {
            let record: Vec<String> = columns.iter().map(|c| self.cell_text(row.get(c))).collect();
            writer.write_record(&record).map_err(csv_error)?;
        }
        writer
            .into_inner()
            .map_err(|e| DbError::internal(format!("CSV flush failed: {}", e)))
    }

    /// Rows plus a metadata envelope.
    pub fn to_json(&self) -> DbResult<String> {
        let result = self.result;
        let document = json!({
            "metadata": {
                "columns": result.columns,
                "row_count": result.row_count,
                "affected_rows": result.affected_rows,
                "duration_ms": result.duration_ms,
                "command": result.command,
                "exported_at": chrono::Utc::now().to_rfc3339(),
                "extra": result.metadata,
            },
            "rows": result.rows,
        });
        let text = if self.options.pretty {
            serde_json::to_string_pretty(&document)?
        } else {
            serde_json::to_string(&document)?
        };
        Ok(text)
    }

    pub fn to_xml(&self) -> DbResult<Vec<u8>> {
        let columns = column_names(self.result);
        let mut writer = XmlWriter::new_with_indent(Vec::new(), b' ', 2);

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;
        let row_count = self.result.rows.len().to_string();
        let mut root = BytesStart::new(self.options.root_element.as_str());
        root.push_attribute(("rowCount", row_count.as_str()));
        writer.write_event(Event::Start(root)).map_err(xml_error)?;

        for row in &self.result.rows {
            writer
                .write_event(Event::Start(BytesStart::new("row")))
                .map_err(xml_error)?;
            for column in &columns {
                let tag = xml_element_name(column);
                let mut start = BytesStart::new(tag.as_str());
                if tag != *column {
                    start.push_attribute(("name", column.as_str()));
                }
                match row.get(column) {
                    None | Some(JsonValue::Null) => {
                        start.push_attribute(("null", "true"));
                        writer.write_event(Event::Empty(start)).map_err(xml_error)?;
                    }
                    Some(value) => {
                        let text = match value {
                            JsonValue::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        writer.write_event(Event::Start(start)).map_err(xml_error)?;
                        writer
                            .write_event(Event::Text(BytesText::new(&text)))
                            .map_err(xml_error)?;
                        writer
                            .write_event(Event::End(BytesEnd::new(tag.as_str())))
                            .map_err(xml_error)?;
                    }
                }
            }
            writer
                .write_event(Event::End(BytesEnd::new("row")))
                .map_err(xml_error)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new(self.options.root_element.as_str())))
            .map_err(xml_error)?;
        Ok(writer.into_inner())
    }

    /// Workbook with a data sheet and a metadata sheet.
    pub fn to_workbook(&self) -> DbResult<Workbook> {
        let columns = column_names(self.result);
        let mut workbook = Workbook::new();
        let header = Format::new().set_bold();

        {
            let sheet = workbook.add_worksheet();
            sheet.set_name(&self.options.sheet_name).map_err(xlsx_error)?;
            for (col, name) in columns.iter().enumerate() {
                sheet
                    .write_string_with_format(0, col as u16, name, &header)
                    .map_err(xlsx_error)?;
            }
            for (idx, row) in self.result.rows.iter().enumerate() {
                for (col, name) in columns.iter().enumerate() {
                    write_cell(sheet, idx as u32 + 1, col as u16, row.get(name)).map_err(xlsx_error)?;
                }
            }
            sheet.autofit();
        }

        {
            let sheet = workbook.add_worksheet();
            sheet
                .set_name(&self.options.metadata_sheet_name)
                .map_err(xlsx_error)?;
            let mut entries: Vec<(String, JsonValue)> = vec![
                ("row_count".to_string(), self.result.row_count.into()),
                ("duration_ms".to_string(), self.result.duration_ms.into()),
                (
                    "affected_rows".to_string(),
                    self.result.affected_rows.map(JsonValue::from).unwrap_or(JsonValue::Null),
                ),
                (
                    "command".to_string(),
                    self.result.command.clone().map(JsonValue::from).unwrap_or(JsonValue::Null),
                ),
            ];
            for column in &self.result.columns {
                entries.push((
                    format!("column:{}", column.name),
                    JsonValue::String(column.type_name.clone()),
                ));
            }
            entries.extend(self.result.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

            sheet
                .write_string_with_format(0, 0, "key", &header)
                .map_err(xlsx_error)?;
            sheet
                .write_string_with_format(0, 1, "value", &header)
                .map_err(xlsx_error)?;
            for (idx, (key, value)) in entries.iter().enumerate() {
                let row = idx as u32 + 1;
                sheet.write_string(row, 0, key).map_err(xlsx_error)?;
                write_cell(sheet, row, 1, Some(value)).map_err(xlsx_error)?;
            }
            sheet.autofit();
        }

        Ok(workbook)
    }

    /// Fixed-width text table.
    pub fn to_text(&self) -> String {
        let columns = column_names(self.result);
        if columns.is_empty() {
            return format!("Empty set ({} rows affected)\n", self.result.affected_rows.unwrap_or(0));
        }

        let cells: Vec<Vec<String>> = self
            .result
            .rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| match row.get(c) {
                        None | Some(JsonValue::Null) => "NULL".to_string(),
                        Some(_) => self.cell_text(row.get(c)),
                    })
                    .collect()
            })
            .collect();

        let mut widths: Vec<usize> = columns.iter().map(|c| c.width()).collect();
        for row in &cells {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.width());
            }
        }

        let separator: String = widths
            .iter()
            .map(|w| format!("+{}", "-".repeat(w + 2)))
            .collect::<String>()
            + "+\n";

        let mut output = String::new();
        output.push_str(&separator);
        output.push_str(&text_line(&columns, &widths, |_| false));
        output.push_str(&separator);
        for (row, cells) in self.result.rows.iter().zip(&cells) {
            output.push_str(&text_line(cells, &widths, |i| {
                matches!(row.get(&columns[i]), Some(JsonValue::Number(_)))
            }));
        }
        output.push_str(&separator);

        let noun = if cells.len() == 1 { "row" } else { "rows" };
        output.push_str(&format!(
            "{} {} in set ({:.2} sec)\n",
            cells.len(),
            noun,
            self.result.duration_ms as f64 / 1000.0
        ));
        output
    }
}

/// One `| a | b |` line; cells are padded by display width.
fn text_line(cells: &[String], widths: &[usize], right_align: impl Fn(usize) -> bool) -> String {
    cells
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let pad = " ".repeat(widths[i].saturating_sub(cell.width()));
            if right_align(i) {
                format!("| {}{} ", pad, cell)
            } else {
                format!("| {}{} ", cell, pad)
            }
        })
        .collect::<String>()
        + "|\n"
}

fn write_cell(
    sheet: &mut Worksheet,
    row: u32,
    col: u16,
    value: Option<&JsonValue>,
) -> Result<(), XlsxError> {
    match value {
        None | Some(JsonValue::Null) => {}
        Some(JsonValue::Bool(b)) => {
            sheet.write_boolean(row, col, *b)?;
        }
        Some(JsonValue::Number(n)) => match n.as_f64() {
            Some(f) => {
                sheet.write_number(row, col, f)?;
            }
            None => {
                sheet.write_string(row, col, n.to_string())?;
            }
        },
        Some(JsonValue::String(s)) => {
            sheet.write_string(row, col, s)?;
        }
        Some(other) => {
            sheet.write_string(row, col, other.to_string())?;
        }
    }
    Ok(())
}

/// A valid XML element name for a column.
pub fn xml_element_name(column: &str) -> String {
    let mut name: String = column
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let bad_start = name
        .chars()
        .next()
        .is_none_or(|c| !(c.is_alphabetic() || c == '_'));
    if bad_start || name.to_ascii_lowercase().starts_with("xml") {
        name.insert(0, '_');
    }
    name
}

fn csv_error(err: csv::Error) -> DbError {
    DbError::internal(format!("CSV write failed: {}", err))
}

fn xml_error(err: impl std::fmt::Display) -> DbError {
    DbError::internal(format!("XML write failed: {}", err))
}

fn xlsx_error(err: XlsxError) -> DbError {
    DbError::internal(format!("spreadsheet write failed: {}", err))
}
