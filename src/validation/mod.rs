//! Stateless query validators.
//!
//! Four independent checks run over raw statement text:
//! - [`syntax`]: balanced delimiters and engine-specific dialect conflicts
//! - [`safety`]: dangerous DDL and injection heuristics
//! - [`params`]: placeholder count against the supplied parameters
//! - [`complexity`]: weighted score against a caller-supplied ceiling
//!
//! None of them touches a connection; each returns a [`ValidationResult`].

pub mod complexity;
pub mod params;
pub mod safety;
pub mod syntax;

use crate::config::EngineType;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::time::Instant;

pub use complexity::{ComplexityScore, DEFAULT_MAX_COMPLEXITY, validate_complexity};
pub use params::{expected_param_count, validate_params};
pub use safety::{DangerousOperation, validate_safety};
pub use syntax::validate_syntax;

/// Outcome of one validator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    /// Validator name: `syntax`, `safety`, `params` or `complexity`
    pub rule: String,
    pub message: String,
    pub details: Map<String, JsonValue>,
    pub duration_us: u64,
}

impl ValidationResult {
    pub(crate) fn finish(
        rule: &str,
        started: Instant,
        passed: bool,
        message: impl Into<String>,
        details: Map<String, JsonValue>,
    ) -> Self {
        Self {
            passed,
            rule: rule.to_string(),
            message: message.into(),
            details,
            duration_us: started.elapsed().as_micros() as u64,
        }
    }
}

/// Results of every validator for one statement.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    pub fn failures(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn get(&self, rule: &str) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.rule == rule)
    }
}

pub struct QueryValidator;

impl QueryValidator {
    /// Run all four validators.
    pub fn validate_all(
        sql: &str,
        engine: EngineType,
        param_count: usize,
        max_complexity: Option<u32>,
    ) -> ValidationReport {
        let results = vec![
            validate_syntax(sql, engine),
            validate_safety(sql),
            validate_params(sql, engine, param_count),
            validate_complexity(sql, max_complexity.unwrap_or(DEFAULT_MAX_COMPLEXITY)),
        ];
        ValidationReport {
            passed: results.iter().all(|r| r.passed),
            results,
        }
    }
}

/// Code with string literals and comments blanked out.
pub(crate) fn code_only(sql: &str) -> String {
    crate::adapters::common::code_segments(sql)
        .into_iter()
        .map(|(code, text)| if code { text } else { " " })
        .collect()
}
