//! Weighted complexity score.

use super::{ValidationResult, code_only};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::sync::LazyLock;
use std::time::Instant;

const RULE: &str = "complexity";

/// Ceiling used when the caller does not supply one.
pub const DEFAULT_MAX_COMPLEXITY: u32 = 50;

const JOIN_WEIGHT: u32 = 2;
const SUBQUERY_WEIGHT: u32 = 3;
const CTE_WEIGHT: u32 = 2;
const WINDOW_WEIGHT: u32 = 2;
const UNION_WEIGHT: u32 = 1;
const AGGREGATE_WEIGHT: u32 = 1;
const NESTING_WEIGHT: u32 = 2;

static JOIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bjoin\b").expect("valid JOIN regex"));
static SUBQUERY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\(\s*select\b").expect("valid subquery regex"));
static CTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bwith\s+(?:recursive\s+)?|,\s*)\w+\s*(?:\([^()]*\)\s*)?as\s*(?:(?:not\s+)?materialized\s*)?\(")
        .expect("valid CTE regex")
});
static WINDOW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bover\s*\(").expect("valid window regex"));
static UNION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:union|intersect|except)\b").expect("valid set-operation regex"));
static AGGREGATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bgroup\s+by\b|\bhaving\b").expect("valid GROUP BY regex"));

/// Score breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComplexityScore {
    pub joins: u32,
    pub subqueries: u32,
    pub ctes: u32,
    pub window_functions: u32,
    pub set_operations: u32,
    pub aggregations: u32,
    /// Deepest parenthesized SELECT nesting
    pub nesting_depth: u32,
    pub total: u32,
}

impl ComplexityScore {
    /// Score a statement; literals and comments are ignored.
    pub fn of(sql: &str) -> Self {
        let code = code_only(sql);
        let count = |re: &Regex| re.find_iter(&code).count() as u32;

        let mut score = Self {
            joins: count(&JOIN),
            subqueries: count(&SUBQUERY),
            ctes: count(&CTE),
            window_functions: count(&WINDOW),
            set_operations: count(&UNION),
            aggregations: count(&AGGREGATE),
            nesting_depth: select_depth(&code),
            total: 0,
        };
        score.total = score.joins * JOIN_WEIGHT
            + score.subqueries * SUBQUERY_WEIGHT
            + score.ctes * CTE_WEIGHT
            + score.window_functions * WINDOW_WEIGHT
            + score.set_operations * UNION_WEIGHT
            + score.aggregations * AGGREGATE_WEIGHT
            + score.nesting_depth * NESTING_WEIGHT;
        score
    }
}

/// Deepest nesting of parenthesized SELECTs.
fn select_depth(code: &str) -> u32 {
    let lower = code.to_ascii_lowercase();
    // each open paren records whether it starts a subquery
    let mut stack: Vec<bool> = Vec::new();
    let mut depth = 0u32;
    let mut max = 0u32;

    for (idx, c) in lower.char_indices() {
        match c {
            '(' => {
                let is_select = lower[idx + 1..].trim_start().starts_with("select");
                if is_select {
                    depth += 1;
                    max = max.max(depth);
                }
                stack.push(is_select);
            }
            ')' => {
                if stack.pop() == Some(true) {
                    depth = depth.saturating_sub(1);
                }
            }
            _ => {}
        }
    }
    max
}

/// Validate that the statement's score stays within `max_complexity`.
pub fn validate_complexity(sql: &str, max_complexity: u32) -> ValidationResult {
    let started = Instant::now();
    let score = ComplexityScore::of(sql);

    let mut details = match serde_json::to_value(&score) {
        Ok(JsonValue::Object(map)) => map,
        _ => Map::new(),
    };
    details.insert("max".to_string(), max_complexity.into());

    if score.total <= max_complexity {
        ValidationResult::finish(
            RULE,
            started,
            true,
            format!("complexity {} within {}", score.total, max_complexity),
            details,
        )
    } else {
        ValidationResult::finish(
            RULE,
            started,
            false,
            format!("complexity {} exceeds {}", score.total, max_complexity),
            details,
        )
    }
}
