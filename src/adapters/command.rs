//! Command-string parsers for the document and key-value engines.
//!
//! Both parsers try, in order: a structured JSON literal, the shell
//! `target.method(args)` shape, a verb token found in the text, and finally
//! opaque forwarding to the server. Unknown methods and wrong argument
//! counts are reported as query errors, like SQL syntax errors.

use super::common::code_segments;
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use regex::Regex;
use serde_json::{Map, Value as JsonValue, json};
use std::sync::LazyLock;
use tracing::debug;

static SHELL_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)^(?:db\.)?(?:getCollection\(\s*['"]([^'"]+)['"]\s*\)|([A-Za-z_$][\w$-]*))\.(\w+)\((.*)\)\s*;?\s*$"#,
    )
    .expect("valid shell call pattern")
});

static CLIENT_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^[A-Za-z_$][\w$]*\.(\w+)\((.*)\)\s*;?\s*$").expect("valid client call pattern")
});

// =============================================================================
// Relaxed JSON
// =============================================================================

/// Rewrite shell-style JSON (unquoted keys, single quotes, trailing commas)
/// into strict JSON.
pub fn relax_json(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                out.push('"');
                i += 1;
                while i < chars.len() && chars[i] != c {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        // an escaped single quote is plain text inside double quotes
                        if chars[i + 1] != '\'' {
                            out.push('\\');
                        }
                        out.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    if chars[i] == '"' {
                        out.push('\\');
                    }
                    out.push(chars[i]);
                    i += 1;
                }
                out.push('"');
                i += 1;
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']') | None) {
                    out.push(',');
                }
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let next = chars[i..].iter().find(|ch| !ch.is_whitespace());
                if next == Some(&':') {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    out.push_str(&word);
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Parse a comma-separated shell argument list into JSON values.
fn parse_call_args(args: &str) -> DbResult<Vec<JsonValue>> {
    let trimmed = args.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let wrapped = format!("[{}]", relax_json(trimmed));
    match serde_json::from_str::<JsonValue>(&wrapped) {
        Ok(JsonValue::Array(values)) => Ok(values),
        Ok(_) => Err(syntax_error(args, "expected an argument list")),
        Err(e) => Err(syntax_error(args, &e.to_string())),
    }
}

/// Parse whitespace-separated JSON values (`{"a":1} {"b":2}`).
fn parse_value_sequence(text: &str) -> DbResult<Vec<JsonValue>> {
    let relaxed = relax_json(text.trim());
    serde_json::Deserializer::from_str(&relaxed)
        .into_iter::<JsonValue>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| syntax_error(text, &e.to_string()))
}

fn syntax_error(text: &str, reason: &str) -> DbError {
    DbError::query(
        format!("cannot parse command arguments '{}': {}", text.trim(), reason),
        "Use JSON literals or shell syntax such as db.users.find({ age: 30 })",
    )
}

fn arity_error(method: &str, expected: &str, got: usize) -> DbError {
    DbError::query(
        format!("{} expects {} argument(s), got {}", method, expected, got),
        "Check the number of arguments passed to the method",
    )
}

/// Substitute positional `?` placeholders (outside string literals) with
/// JSON renderings of `params`.
pub fn inline_params(text: &str, params: &[QueryParam]) -> DbResult<String> {
    if params.is_empty() {
        return Ok(text.to_string());
    }
    let mut out = String::with_capacity(text.len() + params.len() * 8);
    let mut values = params.iter();
    for (is_code, segment) in code_segments(text) {
        if !is_code {
            out.push_str(segment);
            continue;
        }
        for c in segment.chars() {
            if c != '?' {
                out.push(c);
                continue;
            }
            let param = values.next().ok_or_else(|| {
                DbError::query(
                    format!("command has more placeholders than the {} parameter(s) given", params.len()),
                    "Pass one parameter per ? placeholder",
                )
            })?;
            out.push_str(&param.to_json().to_string());
        }
    }
    if values.next().is_some() {
        return Err(DbError::query(
            format!("command has fewer placeholders than the {} parameter(s) given", params.len()),
            "Pass one parameter per ? placeholder",
        ));
    }
    Ok(out)
}

// =============================================================================
// Document store
// =============================================================================

/// A parsed document-store command.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentCommand {
    Find {
        collection: String,
        filter: JsonValue,
        projection: Option<JsonValue>,
        limit: Option<i64>,
    },
    Insert {
        collection: String,
        documents: Vec<JsonValue>,
    },
    Update {
        collection: String,
        filter: JsonValue,
        update: JsonValue,
        many: bool,
    },
    Delete {
        collection: String,
        filter: JsonValue,
        many: bool,
    },
    Aggregate {
        collection: String,
        pipeline: Vec<JsonValue>,
    },
    CreateIndex {
        collection: String,
        keys: JsonValue,
        options: Option<JsonValue>,
    },
    DropCollection {
        collection: String,
    },
    RunCommand {
        command: Map<String, JsonValue>,
    },
}

impl DocumentCommand {
    /// Command tag reported in results.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Find { .. } => "FIND",
            Self::Insert { .. } => "INSERT",
            Self::Update { .. } => "UPDATE",
            Self::Delete { .. } => "DELETE",
            Self::Aggregate { .. } => "AGGREGATE",
            Self::CreateIndex { .. } => "CREATE_INDEX",
            Self::DropCollection { .. } => "DROP_COLLECTION",
            Self::RunCommand { .. } => "COMMAND",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Insert { .. }
                | Self::Update { .. }
                | Self::Delete { .. }
                | Self::CreateIndex { .. }
                | Self::DropCollection { .. }
        )
    }
}

const DOCUMENT_VERBS: &[&str] = &[
    "find",
    "findone",
    "insert",
    "insertone",
    "insertmany",
    "update",
    "updateone",
    "updatemany",
    "replaceone",
    "delete",
    "deleteone",
    "deletemany",
    "remove",
    "aggregate",
    "createindex",
    "dropcollection",
    "drop",
    "count",
    "countdocuments",
    "runcommand",
];

fn object_or_empty(value: Option<JsonValue>, method: &str) -> DbResult<JsonValue> {
    match value {
        None | Some(JsonValue::Null) => Ok(json!({})),
        Some(v @ JsonValue::Object(_)) => Ok(v),
        Some(other) => Err(DbError::query(
            format!("{} expects a document, got {}", method, other),
            "Pass a JSON object such as { \"field\": value }",
        )),
    }
}

fn check_arity(method: &str, args: &[JsonValue], min: usize, max: usize) -> DbResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{}-{}", min, max)
        };
        return Err(arity_error(method, &expected, args.len()));
    }
    Ok(())
}

/// Map a method call on a collection to a command.
fn document_call(collection: &str, method: &str, args: Vec<JsonValue>) -> DbResult<DocumentCommand> {
    let collection = collection.to_string();
    let lower = method.to_ascii_lowercase();
    let mut it = args.clone().into_iter();

    let cmd = match lower.as_str() {
        "find" | "findone" => {
            let max = if lower == "find" { 3 } else { 2 };
            check_arity(method, &args, 0, max)?;
            let filter = object_or_empty(it.next(), method)?;
            let projection = it.next().filter(|p| !p.is_null());
            let options = it.next();
            let limit = if lower == "findone" {
                Some(1)
            } else {
                options.as_ref().and_then(|o| o.get("limit")).and_then(JsonValue::as_i64)
            };
            DocumentCommand::Find {
                collection,
                filter,
                projection,
                limit,
            }
        }
        "insert" | "insertone" | "insertmany" => {
            check_arity(method, &args, 1, 2)?;
            let documents = match it.next() {
                Some(JsonValue::Array(docs)) if lower != "insertone" => docs,
                Some(doc @ JsonValue::Object(_)) if lower != "insertmany" => vec![doc],
                Some(other) => {
                    return Err(DbError::query(
                        format!("{} got an invalid document argument: {}", method, other),
                        "insertOne takes a document, insertMany an array of documents",
                    ));
                }
                None => Vec::new(),
            };
            DocumentCommand::Insert {
                collection,
                documents,
            }
        }
        "update" | "updateone" | "updatemany" | "replaceone" => {
            check_arity(method, &args, 2, 3)?;
            let filter = object_or_empty(it.next(), method)?;
            let update = object_or_empty(it.next(), method)?;
            let options = it.next();
            let many = lower == "updatemany"
                || options
                    .as_ref()
                    .and_then(|o| o.get("multi"))
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false);
            DocumentCommand::Update {
                collection,
                filter,
                update,
                many,
            }
        }
        "delete" | "deleteone" | "deletemany" | "remove" => {
            check_arity(method, &args, 0, 1)?;
            let filter = object_or_empty(it.next(), method)?;
            DocumentCommand::Delete {
                collection,
                filter,
                many: lower != "deleteone",
            }
        }
        "aggregate" => {
            // shell accepts both aggregate([stages]) and aggregate(stage, stage, ...)
            let pipeline = match args.as_slice() {
                [] => Vec::new(),
                [JsonValue::Array(stages)] => stages.clone(),
                stages if stages.iter().all(JsonValue::is_object) => stages.to_vec(),
                _ => return Err(arity_error(method, "a pipeline array", args.len())),
            };
            DocumentCommand::Aggregate {
                collection,
                pipeline,
            }
        }
        "createindex" => {
            check_arity(method, &args, 1, 2)?;
            let keys = object_or_empty(it.next(), method)?;
            DocumentCommand::CreateIndex {
                collection,
                keys,
                options: it.next(),
            }
        }
        "drop" | "dropcollection" => {
            check_arity(method, &args, 0, 0)?;
            DocumentCommand::DropCollection { collection }
        }
        "count" | "countdocuments" => {
            check_arity(method, &args, 0, 1)?;
            let filter = object_or_empty(it.next(), method)?;
            let mut command = Map::new();
            command.insert("count".to_string(), JsonValue::String(collection));
            command.insert("query".to_string(), filter);
            DocumentCommand::RunCommand { command }
        }
        "runcommand" => {
            check_arity(method, &args, 1, 1)?;
            match it.next() {
                Some(JsonValue::Object(command)) => DocumentCommand::RunCommand { command },
                Some(JsonValue::String(name)) => DocumentCommand::RunCommand {
                    command: opaque_command(&name),
                },
                _ => return Err(arity_error(method, "a command document", args.len())),
            }
        }
        _ => {
            return Err(DbError::query(
                format!("unknown method '{}' on collection '{}'", method, collection),
                "Supported methods: find, findOne, insertOne, insertMany, updateOne, updateMany, deleteOne, deleteMany, aggregate, createIndex, drop, countDocuments, runCommand",
            ));
        }
    };
    Ok(cmd)
}

fn opaque_command(name: &str) -> Map<String, JsonValue> {
    let mut command = Map::new();
    command.insert(name.to_string(), json!(1));
    command
}

/// Structured JSON form: `{"operation": "find", "collection": "users", ...}`,
/// otherwise the object is a raw server command.
fn document_from_json(value: JsonValue) -> DbResult<DocumentCommand> {
    let JsonValue::Object(mut obj) = value else {
        return Err(DbError::query(
            "document command literal must be a JSON object",
            "Use {\"operation\": \"find\", \"collection\": \"users\", \"filter\": {}}",
        ));
    };
    let operation = obj
        .get("operation")
        .or_else(|| obj.get("op"))
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    let Some(operation) = operation else {
        return Ok(DocumentCommand::RunCommand { command: obj });
    };
    let collection = obj
        .remove("collection")
        .and_then(|c| c.as_str().map(str::to_string))
        .ok_or_else(|| {
            DbError::query(
                format!("operation '{}' requires a collection", operation),
                "Add a \"collection\" field",
            )
        })?;

    let mut take = |key: &str| obj.remove(key);
    let args: Vec<JsonValue> = match operation.to_ascii_lowercase().as_str() {
        "find" | "findone" => {
            let options = take("limit").map(|l| json!({ "limit": l }));
            let projection = take("projection");
            let mut args = vec![take("filter").unwrap_or(json!({}))];
            if projection.is_some() || options.is_some() {
                args.push(projection.unwrap_or(JsonValue::Null));
            }
            args.extend(options);
            args
        }
        "insert" | "insertone" | "insertmany" => {
            vec![take("documents").or_else(|| take("document")).unwrap_or(JsonValue::Null)]
        }
        "update" | "updateone" | "updatemany" | "replaceone" => {
            let mut args = vec![
                take("filter").unwrap_or(json!({})),
                take("update").unwrap_or(JsonValue::Null),
            ];
            if let Some(many) = take("many") {
                args.push(json!({ "multi": many }));
            }
            args
        }
        "delete" | "deleteone" | "deletemany" | "remove" => {
            vec![take("filter").unwrap_or(json!({}))]
        }
        "aggregate" => vec![take("pipeline").unwrap_or(json!([]))],
        "createindex" => {
            let mut args = vec![take("keys").unwrap_or(JsonValue::Null)];
            args.extend(take("options"));
            args
        }
        "count" | "countdocuments" => vec![take("filter").unwrap_or(json!({}))],
        _ => Vec::new(),
    };
    document_call(&collection, &operation, args)
}

/// Text after token `idx`, given `(byte offset, token)` pairs of `text`.
fn token_tail<'a>(text: &'a str, tokens: &[(usize, &str)], idx: usize) -> &'a str {
    tokens
        .get(idx)
        .map_or("", |(offset, tok)| &text[offset + tok.len()..])
}

/// Parse a document-store command string.
pub fn parse_document_command(text: &str) -> DbResult<DocumentCommand> {
    let text = text.trim();
    if text.is_empty() {
        return Err(DbError::invalid_input("empty command"));
    }

    if text.starts_with('{') {
        let value: JsonValue = serde_json::from_str(text)
            .or_else(|_| serde_json::from_str(&relax_json(text)))
            .map_err(|e| syntax_error(text, &e.to_string()))?;
        return document_from_json(value);
    }

    if let Some(caps) = SHELL_CALL.captures(text) {
        let method = &caps[3];
        let args = parse_call_args(caps.get(4).map_or("", |m| m.as_str()))?;
        let target = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map_or("", |m| m.as_str());
        // db.runCommand({...}) parses with "db" as the target
        if target == "db" && method.eq_ignore_ascii_case("runCommand") {
            return document_call("", method, args);
        }
        return document_call(target, method, args);
    }

    // (byte offset, token) so the argument tail keeps its original spacing
    let tokens: Vec<(usize, &str)> = text
        .split_whitespace()
        .map(|t| (t.as_ptr() as usize - text.as_ptr() as usize, t))
        .collect();
    if let Some(pos) = tokens
        .iter()
        .position(|(_, t)| DOCUMENT_VERBS.contains(&t.to_ascii_lowercase().as_str()))
    {
        let verb = tokens[pos].1;
        if pos > 0 {
            debug!(command = %text, verb, "document verb located by substring search");
        }
        if verb.eq_ignore_ascii_case("runCommand") {
            return document_call("", verb, parse_value_sequence(token_tail(text, &tokens, pos))?);
        }
        if let Some((_, collection)) = tokens.get(pos + 1) {
            return document_call(collection, verb, parse_value_sequence(token_tail(text, &tokens, pos + 1))?);
        }
    }

    // opaque: `<name> [argument | {fields}]` goes to the server as `{ <name>: .., ..fields }`
    let name = tokens[0].1;
    let mut command = opaque_command(name);
    let tail = token_tail(text, &tokens, 0).trim();
    if !tail.is_empty() {
        let values = if tail.starts_with('{') || tail.starts_with('[') {
            parse_value_sequence(tail)?
        } else {
            parse_value_sequence(tail).unwrap_or_else(|_| vec![JsonValue::String(tail.to_string())])
        };
        for value in values {
            match value {
                JsonValue::Object(fields) => command.extend(fields),
                other => {
                    command.insert(name.to_string(), other);
                }
            }
        }
    }
    debug!(command = %text, name, "forwarding opaque document command");
    Ok(DocumentCommand::RunCommand { command })
}

// =============================================================================
// Key-value store
// =============================================================================

/// A parsed key-value command: verb, key and remaining arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueCommand {
    /// Upper-cased command name
    pub verb: String,
    pub key: Option<String>,
    pub args: Vec<String>,
}

impl KeyValueCommand {
    pub fn new(verb: impl Into<String>, mut arguments: Vec<String>) -> Self {
        let verb = verb.into().to_ascii_uppercase();
        let key = if arguments.is_empty() || KEYLESS_VERBS.contains(&verb.as_str()) {
            None
        } else {
            Some(arguments.remove(0))
        };
        Self {
            verb,
            key,
            args: arguments,
        }
    }

    /// All arguments in wire order (key first).
    pub fn wire_args(&self) -> Vec<&str> {
        self.key
            .iter()
            .map(String::as_str)
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    pub fn arg_count(&self) -> usize {
        self.args.len() + usize::from(self.key.is_some())
    }

    pub fn is_transaction_control(&self) -> bool {
        matches!(self.verb.as_str(), "MULTI" | "EXEC" | "DISCARD")
    }
}

const KEYLESS_VERBS: &[&str] = &[
    "PING", "ECHO", "INFO", "DBSIZE", "FLUSHDB", "FLUSHALL", "TIME", "MULTI", "EXEC", "DISCARD",
    "UNWATCH", "SELECT", "KEYS", "SCAN", "MGET", "MSET", "DEL", "EXISTS", "CONFIG", "CLIENT",
];

/// Known verbs with (minimum, maximum) argument counts; `None` is unbounded.
const KEY_VALUE_ARITY: &[(&str, usize, Option<usize>)] = &[
    ("GET", 1, Some(1)),
    ("SET", 2, None),
    ("SETEX", 3, Some(3)),
    ("SETNX", 2, Some(2)),
    ("GETSET", 2, Some(2)),
    ("DEL", 1, None),
    ("EXISTS", 1, None),
    ("EXPIRE", 2, Some(3)),
    ("PEXPIRE", 2, Some(3)),
    ("PERSIST", 1, Some(1)),
    ("TTL", 1, Some(1)),
    ("PTTL", 1, Some(1)),
    ("TYPE", 1, Some(1)),
    ("RENAME", 2, Some(2)),
    ("INCR", 1, Some(1)),
    ("DECR", 1, Some(1)),
    ("INCRBY", 2, Some(2)),
    ("DECRBY", 2, Some(2)),
    ("APPEND", 2, Some(2)),
    ("STRLEN", 1, Some(1)),
    ("MGET", 1, None),
    ("MSET", 2, None),
    ("HGET", 2, Some(2)),
    ("HSET", 3, None),
    ("HDEL", 2, None),
    ("HGETALL", 1, Some(1)),
    ("HEXISTS", 2, Some(2)),
    ("HKEYS", 1, Some(1)),
    ("HVALS", 1, Some(1)),
    ("HLEN", 1, Some(1)),
    ("HINCRBY", 3, Some(3)),
    ("LPUSH", 2, None),
    ("RPUSH", 2, None),
    ("LPOP", 1, Some(2)),
    ("RPOP", 1, Some(2)),
    ("LRANGE", 3, Some(3)),
    ("LLEN", 1, Some(1)),
    ("LINDEX", 2, Some(2)),
    ("SADD", 2, None),
    ("SREM", 2, None),
    ("SMEMBERS", 1, Some(1)),
    ("SISMEMBER", 2, Some(2)),
    ("SCARD", 1, Some(1)),
    ("ZADD", 3, None),
    ("ZREM", 2, None),
    ("ZRANGE", 3, None),
    ("ZSCORE", 2, Some(2)),
    ("ZCARD", 1, Some(1)),
    ("KEYS", 1, Some(1)),
    ("SCAN", 1, None),
    ("PING", 0, Some(1)),
    ("ECHO", 1, Some(1)),
    ("INFO", 0, Some(1)),
    ("DBSIZE", 0, Some(0)),
    ("FLUSHDB", 0, Some(1)),
    ("SELECT", 1, Some(1)),
    ("TIME", 0, Some(0)),
    ("PUBLISH", 2, Some(2)),
    ("MULTI", 0, Some(0)),
    ("EXEC", 0, Some(0)),
    ("DISCARD", 0, Some(0)),
    ("WATCH", 1, None),
    ("UNWATCH", 0, Some(0)),
];

fn known_verb(token: &str) -> Option<&'static (&'static str, usize, Option<usize>)> {
    KEY_VALUE_ARITY
        .iter()
        .find(|(verb, _, _)| verb.eq_ignore_ascii_case(token))
}

fn check_key_value_arity(cmd: &KeyValueCommand) -> DbResult<()> {
    if let Some((verb, min, max)) = known_verb(&cmd.verb) {
        let count = cmd.arg_count();
        if count < *min || max.is_some_and(|m| count > m) {
            let expected = match max {
                Some(m) if m == min => min.to_string(),
                Some(m) => format!("{}-{}", min, m),
                None => format!("at least {}", min),
            };
            return Err(arity_error(verb, &expected, count));
        }
    }
    Ok(())
}

/// Plain command words: `GET`, `lpushx`, module verbs such as `JSON.GET`.
fn is_verb_word(token: &str) -> bool {
    let mut chars = token.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Render a JSON argument as a wire string.
fn wire_string(value: JsonValue) -> String {
    match value {
        JsonValue::String(s) => s,
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Split on whitespace, keeping single- and double-quoted tokens together.
pub fn tokenize(text: &str) -> DbResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(DbError::query(
            format!("unterminated quote in command: {}", text),
            "Close every quoted argument",
        ));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn key_value_from_json(value: JsonValue) -> DbResult<KeyValueCommand> {
    let parts: Vec<JsonValue> = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut obj) => {
            let verb = obj
                .remove("command")
                .or_else(|| obj.remove("cmd"))
                .ok_or_else(|| {
                    DbError::query(
                        "key-value command object needs a \"command\" field",
                        "Use {\"command\": \"SET\", \"args\": [\"key\", \"value\"]}",
                    )
                })?;
            let mut parts = vec![verb];
            parts.extend(obj.remove("key"));
            match obj.remove("args") {
                Some(JsonValue::Array(args)) => parts.extend(args),
                Some(single) => parts.push(single),
                None => {}
            }
            parts
        }
        other => {
            return Err(DbError::query(
                format!("unsupported key-value command literal: {}", other),
                "Use a JSON array such as [\"GET\", \"key\"]",
            ));
        }
    };
    let mut parts = parts.into_iter().map(wire_string);
    let verb = parts
        .next()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DbError::invalid_input("empty key-value command"))?;
    Ok(KeyValueCommand::new(verb, parts.collect()))
}

/// Parse a key-value command string.
pub fn parse_key_value_command(text: &str) -> DbResult<KeyValueCommand> {
    let text = text.trim().trim_end_matches(';').trim();
    if text.is_empty() {
        return Err(DbError::invalid_input("empty command"));
    }

    let cmd = if text.starts_with('[') || text.starts_with('{') {
        let value: JsonValue = serde_json::from_str(text)
            .or_else(|_| serde_json::from_str(&relax_json(text)))
            .map_err(|e| syntax_error(text, &e.to_string()))?;
        key_value_from_json(value)?
    } else if let Some(caps) = CLIENT_CALL.captures(text) {
        let args = parse_call_args(caps.get(2).map_or("", |m| m.as_str()))?;
        let args = args
            .into_iter()
            .flat_map(|arg| match arg {
                // client.mset({a: 1, b: 2}) and client.hset("h", {f: "v"})
                JsonValue::Object(map) => map
                    .into_iter()
                    .flat_map(|(k, v)| [k, wire_string(v)])
                    .collect::<Vec<_>>(),
                JsonValue::Array(items) => items.into_iter().map(wire_string).collect(),
                other => vec![wire_string(other)],
            })
            .collect();
        KeyValueCommand::new(&caps[1], args)
    } else {
        let mut tokens = tokenize(text)?;
        // a leading word is the verb even when unknown; the server reports unknown commands
        let pos = if is_verb_word(&tokens[0]) {
            0
        } else {
            match tokens.iter().position(|t| known_verb(t).is_some()) {
                Some(pos) => {
                    debug!(command = %text, verb = %tokens[pos], "key-value verb located by substring search");
                    pos
                }
                None => 0,
            }
        };
        let rest = tokens.split_off(pos + 1);
        KeyValueCommand::new(tokens.remove(pos), rest)
    };

    check_key_value_arity(&cmd)?;
    Ok(cmd)
}
