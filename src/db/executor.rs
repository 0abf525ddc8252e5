//! Query execution engine.
//!
//! Wraps adapter calls with:
//! - a per-call timeout, with best-effort cancellation when it fires
//! - classified retries with exponential backoff (never inside a transaction)
//! - normalization of the adapter's raw output into a [`QueryResult`]
//! - row streaming, falling back to buffering when the adapter cannot stream

use crate::adapters::{Adapter, RowStream};
use crate::error::{DbError, DbResult};
use crate::models::{Connection, PreparedStatement, QueryOptions, QueryParam, QueryResult, RawResult};
use crate::result::ResultParser;
use futures_util::{StreamExt, stream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Error codes and message fragments treated as transient by default.
pub const DEFAULT_RETRYABLE: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ENOTFOUND",
    "ECONNREFUSED",
    "EPIPE",
    "connection reset",
    "timed out",
    "timeout",
    "host not found",
    "refused",
    "broken pipe",
];

/// Retry classification and backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Matched case-insensitively against the error's native code and message
    pub retryable: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            retryable: DEFAULT_RETRYABLE.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn is_retryable(&self, err: &DbError) -> bool {
        let text = err.diagnostic_text().to_lowercase();
        self.retryable
            .iter()
            .any(|code| text.contains(&code.to_lowercase()))
    }

    /// Delay before retry `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(Duration::MAX)
    }
}

/// The adapter call an execution wraps.
#[derive(Debug, Clone, Copy)]
pub enum Statement<'a> {
    Query(&'a str),
    Procedure(&'a str),
    Function(&'a str),
    Prepared(&'a PreparedStatement),
}

impl Statement<'_> {
    fn label(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Procedure(_) => "procedure",
            Self::Function(_) => "function",
            Self::Prepared(_) => "prepared statement",
        }
    }
}

/// Query executor bound to one adapter.
#[derive(Clone)]
pub struct QueryExecutor {
    adapter: Arc<dyn Adapter>,
    policy: RetryPolicy,
    default_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(adapter: Arc<dyn Adapter>, policy: RetryPolicy, default_timeout: Duration) -> Self {
        Self {
            adapter,
            policy,
            default_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run a query and normalize its result.
    pub async fn execute(
        &self,
        conn: &mut Connection,
        text: &str,
        params: &[QueryParam],
        opts: &QueryOptions,
    ) -> DbResult<QueryResult> {
        self.run(conn, Statement::Query(text), params, opts).await
    }

    /// Run any statement kind with timeout, cancellation and retries.
    pub async fn run(
        &self,
        conn: &mut Connection,
        statement: Statement<'_>,
        params: &[QueryParam],
        opts: &QueryOptions,
    ) -> DbResult<QueryResult> {
        let max_retries = if conn.in_transaction {
            0
        } else {
            opts.max_retries.unwrap_or(self.policy.max_retries)
        };
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            match self.run_timed(conn, statement, params, opts).await {
                Ok(raw) => {
                    let duration_ms = start.elapsed().as_millis() as u64;
                    let mut result = ResultParser::parse(raw, duration_ms);
                    if let Some(cap) = opts.max_rows {
                        if result.rows.len() > cap {
                            result.rows.truncate(cap);
                            result
                                .metadata
                                .insert("truncated".to_string(), true.into());
                        }
                    }
                    if attempt > 0 {
                        result
                            .metadata
                            .insert("attempts".to_string(), (attempt + 1).into());
                    }
                    return Ok(result);
                }
                // a broken connection (e.g. after a timeout) is the caller's to replace
                Err(e) if attempt < max_retries && self.policy.is_retryable(&e) && conn.is_usable() => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        connection_id = %conn.id(),
                        attempt = attempt + 1,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying {}",
                        statement.label()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt, raced against the timeout.
    async fn run_timed(
        &self,
        conn: &mut Connection,
        statement: Statement<'_>,
        params: &[QueryParam],
        opts: &QueryOptions,
    ) -> DbResult<RawResult> {
        let limit = opts.timeout.unwrap_or(self.default_timeout);
        let canceller = if self.adapter.capabilities().cancel {
            self.adapter.canceller(conn)
        } else {
            None
        };

        debug!(
            connection_id = %conn.id(),
            kind = statement.label(),
            params = params.len(),
            timeout_ms = limit.as_millis() as u64,
            "Executing"
        );

        let call = async {
            match statement {
                Statement::Query(text) => self.adapter.query(conn, text, params, opts).await,
                Statement::Procedure(name) => {
                    self.adapter.execute_procedure(conn, name, params).await
                }
                Statement::Function(name) => {
                    self.adapter.execute_function(conn, name, params).await
                }
                Statement::Prepared(stmt) => {
                    self.adapter.execute_prepared(conn, stmt, params).await
                }
            }
        };

        let outcome = timeout(limit, call).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // the statement may still be running server-side
                conn.mark_broken();
                if let Some(canceller) = canceller {
                    match canceller.cancel().await {
                        Ok(()) => debug!(connection_id = %conn.id(), "Cancelled timed-out statement"),
                        Err(e) => warn!(connection_id = %conn.id(), error = %e, "Cancel after timeout failed"),
                    }
                }
                Err(DbError::timeout(statement.label(), limit.as_millis() as u64))
            }
        }
    }

    /// Stream rows lazily when the adapter can, else buffer and replay.
    pub async fn stream<'c>(
        &'c self,
        conn: &'c mut Connection,
        text: &'c str,
        params: &'c [QueryParam],
    ) -> DbResult<RowStream<'c>> {
        if self.adapter.capabilities().streaming {
            return self.adapter.stream(conn, text, params);
        }
        let result = self.execute(conn, text, params, &QueryOptions::default()).await?;
        Ok(stream::iter(result.rows.into_iter().map(Ok)).boxed())
    }
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("engine", &self.adapter.engine())
            .field("policy", &self.policy)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
