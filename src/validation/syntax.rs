//! Syntax checks: delimiter balance and dialect conflicts.

use super::{ValidationResult, code_only};
use crate::adapters::command::{parse_document_command, parse_key_value_command};
use crate::config::EngineType;
use regex::Regex;
use serde_json::{Map, Value as JsonValue, json};
use sqlparser::dialect::{Dialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use std::sync::LazyLock;
use std::time::Instant;

const RULE: &str = "syntax";

static LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blimit\s+\d").expect("valid LIMIT regex"));
static TOP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bselect\s+(?:distinct\s+)?top\s*\(?\s*\d").expect("valid TOP regex")
});
static ILIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bilike\b").expect("valid ILIKE regex"));
static ROWNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\brownum\b").expect("valid ROWNUM regex"));

/// A construct one engine's dialect does not accept.
struct DialectRule {
    engines: &'static [EngineType],
    pattern: &'static LazyLock<Regex>,
    construct: &'static str,
    hint: &'static str,
}

static DIALECT_RULES: &[DialectRule] = &[
    DialectRule {
        engines: &[EngineType::Oracle, EngineType::SqlServer],
        pattern: &LIMIT,
        construct: "LIMIT",
        hint: "use FETCH FIRST n ROWS ONLY (or TOP n on SQL Server)",
    },
    DialectRule {
        engines: &[EngineType::MySql, EngineType::Postgres, EngineType::Oracle],
        pattern: &TOP,
        construct: "TOP",
        hint: "use LIMIT n (or FETCH FIRST n ROWS ONLY on Oracle)",
    },
    DialectRule {
        engines: &[EngineType::MySql, EngineType::SqlServer, EngineType::Oracle],
        pattern: &ILIKE,
        construct: "ILIKE",
        hint: "use LOWER(col) LIKE LOWER(pattern)",
    },
    DialectRule {
        engines: &[EngineType::MySql, EngineType::Postgres, EngineType::SqlServer],
        pattern: &ROWNUM,
        construct: "ROWNUM",
        hint: "ROWNUM is Oracle-only; use LIMIT or TOP",
    },
];

/// Parser dialect used for the AST pass.
fn dialect(engine: EngineType) -> Box<dyn Dialect> {
    match engine {
        EngineType::Postgres => Box::new(PostgreSqlDialect {}),
        EngineType::MySql => Box::new(MySqlDialect {}),
        EngineType::SqlServer => Box::new(MsSqlDialect {}),
        _ => Box::new(GenericDialect {}),
    }
}

/// Check parenthesis, quote and comment balance.
///
/// Returns the first problem found.
fn balance_issue(sql: &str) -> Option<String> {
    let mut depth: i64 = 0;
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == '\\' && q == '\'' {
                chars.next();
            } else if c == q {
                if chars.peek() == Some(&q) {
                    chars.next();
                } else {
                    quote = None;
                }
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut closed = false;
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        closed = true;
                        break;
                    }
                    prev = c;
                }
                if !closed {
                    return Some("unterminated block comment".to_string());
                }
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Some("unexpected closing parenthesis".to_string());
                }
            }
            _ => {}
        }
    }

    if let Some(q) = quote {
        return Some(format!("unterminated {} quote", q));
    }
    if depth > 0 {
        return Some(format!("{} unclosed parenthesis", depth));
    }
    None
}

/// Validate statement syntax for an engine.
///
/// Relational statements get a balance check, then dialect conflict rules,
/// then an AST parse whose failure is reported as a warning only (the
/// parser does not cover every vendor extension). Document and key-value
/// commands are checked with the command parsers their adapters use.
pub fn validate_syntax(sql: &str, engine: EngineType) -> ValidationResult {
    let started = Instant::now();
    let mut details = Map::new();
    details.insert("engine".to_string(), json!(engine.to_string()));

    if sql.trim().is_empty() {
        return ValidationResult::finish(RULE, started, false, "empty statement", details);
    }

    if !engine.is_relational() {
        let parsed = match engine {
            EngineType::MongoDb => parse_document_command(sql).map(|c| c.tag().to_string()),
            _ => parse_key_value_command(sql).map(|c| c.verb),
        };
        return match parsed {
            Ok(command) => {
                details.insert("command".to_string(), json!(command));
                ValidationResult::finish(RULE, started, true, "command parsed", details)
            }
            Err(e) => ValidationResult::finish(RULE, started, false, e.to_string(), details),
        };
    }

    if let Some(issue) = balance_issue(sql) {
        details.insert("issue".to_string(), json!(issue));
        return ValidationResult::finish(RULE, started, false, format!("unbalanced statement: {}", issue), details);
    }

    let code = code_only(sql);
    let conflicts: Vec<JsonValue> = DIALECT_RULES
        .iter()
        .filter(|rule| rule.engines.contains(&engine) && rule.pattern.is_match(&code))
        .map(|rule| json!({ "construct": rule.construct, "hint": rule.hint }))
        .collect();
    if !conflicts.is_empty() {
        let names: Vec<&str> = conflicts
            .iter()
            .filter_map(|c| c["construct"].as_str())
            .collect();
        let message = format!("{} not supported by {}", names.join(", "), engine);
        details.insert("conflicts".to_string(), JsonValue::Array(conflicts));
        return ValidationResult::finish(RULE, started, false, message, details);
    }

    match Parser::parse_sql(dialect(engine).as_ref(), sql) {
        Ok(statements) => {
            details.insert("statements".to_string(), json!(statements.len()));
        }
        Err(e) => {
            details.insert("parser_warning".to_string(), json!(e.to_string()));
        }
    }
    ValidationResult::finish(RULE, started, true, "syntax ok", details)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_issues() {
        assert_eq!(balance_issue("SELECT (1 + (2)"), Some("1 unclosed parenthesis".to_string()));
        assert_eq!(balance_issue("SELECT 1)"), Some("unexpected closing parenthesis".to_string()));
        assert_eq!(balance_issue("SELECT 'abc"), Some("unterminated ' quote".to_string()));
        assert_eq!(balance_issue("SELECT 1 /* x"), Some("unterminated block comment".to_string()));
        assert_eq!(balance_issue("SELECT ')' , 'it''s' -- (\n"), None);
    }

    #[test]
    fn test_top_rejected_for_limit_dialects() {
        let result = validate_syntax("SELECT TOP 10 * FROM t", EngineType::Postgres);
        assert!(!result.passed);
        assert!(result.message.contains("TOP"));

        assert!(!validate_syntax("SELECT TOP 10 * FROM t", EngineType::MySql).passed);
        assert!(validate_syntax("SELECT TOP 10 * FROM t", EngineType::SqlServer).passed);
    }

    #[test]
    fn test_limit_rejected_for_oracle() {
        let result = validate_syntax("SELECT * FROM t LIMIT 5", EngineType::Oracle);
        assert!(!result.passed);
        assert_eq!(result.details["conflicts"][0]["construct"], json!("LIMIT"));
        assert!(validate_syntax("SELECT * FROM t LIMIT 5", EngineType::Postgres).passed);
    }

    #[test]
    fn test_keywords_inside_literals_ignored() {
        assert!(validate_syntax("SELECT 'limit 5' FROM dual", EngineType::Oracle).passed);
    }

    #[test]
    fn test_empty_and_unbalanced() {
        assert!(!validate_syntax("   ", EngineType::MySql).passed);
        let result = validate_syntax("SELECT (1", EngineType::MySql);
        assert!(!result.passed);
        assert_eq!(result.rule, "syntax");
    }

    #[test]
    fn test_parser_failure_is_only_a_warning() {
        let result = validate_syntax("SELEKT nonsense here", EngineType::Postgres);
        assert!(result.passed);
        assert!(result.details.contains_key("parser_warning"));
    }

    #[test]
    fn test_non_relational_commands() {
        assert!(validate_syntax("db.users.find({ name: 'a' })", EngineType::MongoDb).passed);
        assert!(validate_syntax("SET k v", EngineType::Redis).passed);
        assert!(!validate_syntax("", EngineType::Redis).passed);
    }
}
