//! Safety checks: dangerous DDL/DML and injection heuristics.
//!
//! Dangerous operations are found on the parsed AST when the statement
//! parses, so formatting tricks and comments cannot hide them; a keyword
//! scan takes over when it does not. Injection patterns are plain regex
//! heuristics over the raw text.

use super::{ValidationResult, code_only};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::sync::LazyLock;
use std::time::Instant;

const RULE: &str = "safety";

/// Dangerous operation found in a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DangerousOperation {
    DropDatabase,
    DropTable,
    DropIndex,
    AlterTableDropColumn,
    Truncate,
    DeleteWithoutWhere,
    UpdateWithoutWhere,
}

impl DangerousOperation {
    pub fn operation_name(&self) -> &'static str {
        match self {
            Self::DropDatabase => "DROP DATABASE",
            Self::DropTable => "DROP TABLE",
            Self::DropIndex => "DROP INDEX",
            Self::AlterTableDropColumn => "ALTER TABLE DROP COLUMN",
            Self::Truncate => "TRUNCATE",
            Self::DeleteWithoutWhere => "DELETE without WHERE",
            Self::UpdateWithoutWhere => "UPDATE without WHERE",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::DropDatabase => "removes the entire database and all its data",
            Self::DropTable => "removes the table and all its data",
            Self::DropIndex => "removes the index",
            Self::AlterTableDropColumn => "removes the column and all its data",
            Self::Truncate => "removes all rows from the table",
            Self::DeleteWithoutWhere => "deletes all rows from the table",
            Self::UpdateWithoutWhere => "updates all rows in the table",
        }
    }
}

fn statement_danger(stmt: &Statement) -> Option<DangerousOperation> {
    match stmt {
        Statement::Drop { object_type, .. } => {
            use sqlparser::ast::ObjectType;
            match object_type {
                ObjectType::Table => Some(DangerousOperation::DropTable),
                ObjectType::Index => Some(DangerousOperation::DropIndex),
                ObjectType::Database | ObjectType::Schema => Some(DangerousOperation::DropDatabase),
                _ => None,
            }
        }
        Statement::AlterTable(alter_table) => {
            use sqlparser::ast::AlterTableOperation;
            alter_table
                .operations
                .iter()
                .any(|op| matches!(op, AlterTableOperation::DropColumn { .. }))
                .then_some(DangerousOperation::AlterTableDropColumn)
        }
        Statement::Truncate { .. } => Some(DangerousOperation::Truncate),
        Statement::Delete(delete) if delete.selection.is_none() => {
            Some(DangerousOperation::DeleteWithoutWhere)
        }
        Statement::Update(update) if update.selection.is_none() => {
            Some(DangerousOperation::UpdateWithoutWhere)
        }
        _ => None,
    }
}

static DDL_KEYWORDS: LazyLock<Vec<(Regex, DangerousOperation)>> = LazyLock::new(|| {
    [
        (r"(?i)\bdrop\s+(database|schema)\b", DangerousOperation::DropDatabase),
        (r"(?i)\bdrop\s+table\b", DangerousOperation::DropTable),
        (r"(?i)\bdrop\s+index\b", DangerousOperation::DropIndex),
        (r"(?i)\balter\s+table\b[^;]*\bdrop\s+column\b", DangerousOperation::AlterTableDropColumn),
        (r"(?i)\btruncate\b", DangerousOperation::Truncate),
    ]
    .into_iter()
    .map(|(pattern, op)| (Regex::new(pattern).expect("valid DDL regex"), op))
    .collect()
});

/// Dangerous operations in `sql`, in statement order.
pub fn dangerous_operations(sql: &str) -> Vec<DangerousOperation> {
    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => statements.iter().filter_map(statement_danger).collect(),
        Err(_) => {
            let code = code_only(sql);
            DDL_KEYWORDS
                .iter()
                .filter(|(re, _)| re.is_match(&code))
                .map(|(_, op)| *op)
                .collect()
        }
    }
}

static TAUTOLOGY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:or|and|where|having)\s+('[^']*'|"[^"]*"|\d+|\w+)\s*=\s*('[^']*'|"[^"]*"|\d+|\w+)"#)
        .expect("valid tautology regex")
});
static ALWAYS_TRUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bor\s+(?:true|not\s+false)\b").expect("valid boolean regex"));
static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--|/\*|\*/|#\s*$").expect("valid comment regex"));
static STACKED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i);\s*(?:select|insert|update|delete|drop|create|alter|truncate|exec|execute|declare|grant|revoke|shutdown|merge|call)\b",
    )
    .expect("valid stacked statement regex")
});
static TIME_BASED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:sleep|pg_sleep|benchmark)\s*\(|\bwaitfor\s+(?:delay|time)\b|\bdbms_lock\.sleep\b|\bdbms_session\.sleep\b")
        .expect("valid time-based regex")
});
static OUT_OF_BAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bxp_cmdshell\b|\bxp_dirtree\b|\bload_file\s*\(|\binto\s+(?:out|dump)file\b|\butl_http\b|\butl_inaddr\b|\bdbms_ldap\b|\bopenrowset\b|\bopendatasource\b|\bcopy\b[^;]*\bprogram\b",
    )
    .expect("valid out-of-band regex")
});

/// `'a' = 'a'`, `1 = 1` and `x = x` always hold; `name = 'name'` is an
/// ordinary filter.
fn is_tautology(left: &str, right: &str) -> bool {
    let quoted = |s: &str| s.starts_with(['\'', '"']);
    let numeric = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if quoted(left) && quoted(right) {
        left[1..left.len() - 1].eq_ignore_ascii_case(&right[1..right.len() - 1])
    } else if numeric(left) && numeric(right) {
        left.trim_start_matches('0') == right.trim_start_matches('0')
    } else if !quoted(left) && !quoted(right) && !numeric(left) && !numeric(right) {
        left.eq_ignore_ascii_case(right)
    } else {
        false
    }
}

/// One injection heuristic hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternMatch {
    pub pattern: &'static str,
    pub fragment: String,
}

/// Injection heuristics over the raw text.
pub fn injection_patterns(sql: &str) -> Vec<PatternMatch> {
    let mut matches = Vec::new();

    for caps in TAUTOLOGY.captures_iter(sql) {
        if is_tautology(&caps[1], &caps[2]) {
            matches.push(PatternMatch {
                pattern: "tautology",
                fragment: caps[0].to_string(),
            });
        }
    }
    if let Some(m) = ALWAYS_TRUE.find(sql) {
        matches.push(PatternMatch {
            pattern: "tautology",
            fragment: m.as_str().to_string(),
        });
    }

    let checks: [(&'static str, &LazyLock<Regex>); 4] = [
        ("comment", &COMMENT),
        ("stacked_statement", &STACKED),
        ("time_based", &TIME_BASED),
        ("out_of_band", &OUT_OF_BAND),
    ];
    for (pattern, re) in checks {
        if let Some(m) = re.find(sql) {
            matches.push(PatternMatch {
                pattern,
                fragment: m.as_str().to_string(),
            });
        }
    }
    matches
}

/// Validate statement safety.
pub fn validate_safety(sql: &str) -> ValidationResult {
    let started = Instant::now();
    let dangerous = dangerous_operations(sql);
    let patterns = injection_patterns(sql);

    let mut details = Map::new();
    details.insert(
        "dangerous_operations".to_string(),
        JsonValue::Array(
            dangerous
                .iter()
                .map(|op| json!({ "operation": op.operation_name(), "reason": op.reason() }))
                .collect(),
        ),
    );
    details.insert("patterns".to_string(), json!(patterns));

    if dangerous.is_empty() && patterns.is_empty() {
        return ValidationResult::finish(RULE, started, true, "no unsafe patterns found", details);
    }

    let mut findings: Vec<&str> = dangerous.iter().map(|op| op.operation_name()).collect();
    for m in &patterns {
        if !findings.contains(&m.pattern) {
            findings.push(m.pattern);
        }
    }
    ValidationResult::finish(
        RULE,
        started,
        false,
        format!("unsafe statement: {}", findings.join(", ")),
        details,
    )
}
