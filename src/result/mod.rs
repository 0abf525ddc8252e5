//! Result layer: normalization of adapter output plus file export/import.

pub mod export;
pub mod import;
pub mod parser;

pub use export::{ExportFormat, ExportOptions, ExportSummary, ResultExporter};
pub use import::{ResultImporter, coerce_value};
pub use parser::ResultParser;
