//! Parameter count check.

use super::{ValidationResult, code_only};
use crate::adapters::common::count_placeholders;
use crate::config::EngineType;
use regex::Regex;
use serde_json::{Map, json};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Instant;

const RULE: &str = "params";

static DOLLAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("valid $n regex"));
static AT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^@\w])@(\w+)").expect("valid @name regex"));
static COLON_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^:\w]):(\w+)").expect("valid :name regex"));

/// Number of parameters a statement expects.
///
/// Canonical `?` placeholders are counted first. Statements written with
/// the engine's native markers count distinct markers instead: the highest
/// `$n` on PostgreSQL, distinct `@name` on SQL Server, distinct `:name` on
/// Oracle.
pub fn expected_param_count(sql: &str, engine: EngineType) -> usize {
    let canonical = count_placeholders(sql);
    if canonical > 0 {
        return canonical;
    }

    let code = code_only(sql);
    match engine {
        EngineType::Postgres => DOLLAR
            .captures_iter(&code)
            .filter_map(|c| c[1].parse::<usize>().ok())
            .max()
            .unwrap_or(0),
        EngineType::SqlServer => distinct(&AT_NAME, &code),
        EngineType::Oracle => distinct(&COLON_NAME, &code),
        _ => 0,
    }
}

fn distinct(re: &Regex, code: &str) -> usize {
    re.captures_iter(code)
        .map(|c| c[1].to_ascii_lowercase())
        .collect::<BTreeSet<_>>()
        .len()
}

/// Validate that `supplied` parameters match the statement's placeholders.
pub fn validate_params(sql: &str, engine: EngineType, supplied: usize) -> ValidationResult {
    let started = Instant::now();
    let expected = expected_param_count(sql, engine);

    let mut details = Map::new();
    details.insert("expected".to_string(), json!(expected));
    details.insert("supplied".to_string(), json!(supplied));

    if expected == supplied {
        ValidationResult::finish(RULE, started, true, "parameter count matches", details)
    } else {
        ValidationResult::finish(
            RULE,
            started,
            false,
            format!("statement expects {} parameters but {} were supplied", expected, supplied),
            details,
        )
    }
}
