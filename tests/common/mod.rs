//! Scripted in-memory adapter shared by the integration suites.
//!
//! Every engine call is recorded as a short string (`BEGIN`, `COMMIT`,
//! `SAVEPOINT sp_2_ab12cd34`, `QUERY SELECT 1`, ...) so tests can assert on
//! the exact sequence the core sent to the engine. Pings are counted but
//! not recorded, since pool validation issues them at arbitrary points.
//! Any statement containing `INVALID` fails with a syntax error.

#![allow(dead_code)]

use async_trait::async_trait;
use db_bridge::adapters::{Adapter, Canceller, Capabilities};
use db_bridge::config::{EndpointConfig, EngineType, PoolOptions};
use db_bridge::error::{DbError, DbResult, ErrorKind, NativeError};
use db_bridge::models::{
    ColumnMetadata, Connection, IsolationLevel, QueryOptions, QueryParam, RawResult, ServerMetadata,
};
use serde_json::{Map, Value as JsonValue, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Driver handle stored inside mock connections.
#[derive(Debug)]
pub struct MockHandle {
    pub serial: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Matches the default retryable set (`ECONNRESET`)
    Retryable,
    /// Plain syntax error, never retried
    Fatal,
}

#[derive(Default)]
struct Script {
    query_failures: u32,
    failure: Option<Failure>,
    latency: Option<Duration>,
    rows: Option<Vec<Map<String, JsonValue>>>,
}

pub struct MockAdapter {
    engine: EngineType,
    capabilities: Capabilities,
    calls: Mutex<Vec<String>>,
    script: Mutex<Script>,
    fail_connect: AtomicBool,
    fail_ping: AtomicBool,
    fail_commit: AtomicBool,
    fail_disconnect: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    pings: AtomicUsize,
    query_attempts: AtomicUsize,
    cancels: Arc<AtomicUsize>,
}

impl MockAdapter {
    pub fn new(engine: EngineType) -> Arc<Self> {
        Self::with_capabilities(engine, Capabilities::relational())
    }

    pub fn with_capabilities(engine: EngineType, capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            engine,
            capabilities,
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            fail_connect: AtomicBool::new(false),
            fail_ping: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            query_attempts: AtomicUsize::new(0),
            cancels: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Relational mock whose engine has no savepoints at all.
    pub fn without_savepoints(engine: EngineType) -> Arc<Self> {
        Self::with_capabilities(
            engine,
            Capabilities {
                savepoints: false,
                release_savepoint: false,
                ..Capabilities::relational()
            },
        )
    }

    /// Relational mock that supports cancelling in-flight statements.
    pub fn cancellable(engine: EngineType) -> Arc<Self> {
        Self::with_capabilities(
            engine,
            Capabilities {
                cancel: true,
                ..Capabilities::relational()
            },
        )
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of recorded calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn fail_next_queries(&self, count: u32, failure: Failure) {
        let mut script = self.script();
        script.query_failures = count;
        script.failure = Some(failure);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.script().latency = latency;
    }

    pub fn set_rows(&self, rows: Vec<Map<String, JsonValue>>) {
        self.script().rows = Some(rows);
    }

    pub fn fail_connects(&self, on: bool) {
        self.fail_connect.store(on, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, on: bool) {
        self.fail_ping.store(on, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, on: bool) {
        self.fail_commit.store(on, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_disconnects(&self, on: bool) {
        self.fail_disconnect.store(on, Ordering::SeqCst);
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn query_attempts(&self) -> usize {
        self.query_attempts.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn native_error(&self, failure: Failure) -> DbError {
        match failure {
            Failure::Retryable => DbError::classified(
                ErrorKind::Connection,
                NativeError::new(self.engine, Some("ECONNRESET".to_string()), "connection reset by peer"),
                "Check the network path to the server",
            ),
            Failure::Fatal => DbError::query("syntax error at or near \"FORM\"", "Check the SQL syntax"),
        }
    }
}

pub fn default_rows() -> Vec<Map<String, JsonValue>> {
    [json!({"id": 1, "name": "alice"}), json!({"id": 2, "name": "bob"})]
        .into_iter()
        .filter_map(|row| match row {
            JsonValue::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

struct MockCanceller(Arc<AtomicUsize>);

#[async_trait]
impl Canceller for MockCanceller {
    async fn cancel(&self) -> DbResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn engine(&self) -> EngineType {
        self.engine
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn connect(&self, _config: &EndpointConfig) -> DbResult<Connection> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection refused", "Check that the server is running"));
        }
        let serial = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Connection::new(self.engine, MockHandle { serial }))
    }

    async fn disconnect(&self, conn: &mut Connection) -> DbResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        conn.connected = false;
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(DbError::classified(
                ErrorKind::Connection,
                NativeError::new(self.engine, Some("EPIPE".to_string()), "broken pipe"),
                "The connection was already gone",
            ));
        }
        Ok(())
    }

    async fn query(
        &self,
        conn: &mut Connection,
        text: &str,
        params: &[QueryParam],
        _opts: &QueryOptions,
    ) -> DbResult<RawResult> {
        conn.native::<MockHandle>()?;
        self.query_attempts.fetch_add(1, Ordering::SeqCst);
        self.record(format!("QUERY {}", text));

        let (latency, failure, rows) = {
            let mut script = self.script();
            let failure = if script.query_failures > 0 {
                script.query_failures -= 1;
                script.failure
            } else {
                None
            };
            (script.latency, failure, script.rows.clone())
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(failure) = failure {
            return Err(self.native_error(failure));
        }
        if text.contains("INVALID") {
            return Err(self.native_error(Failure::Fatal));
        }

        let verb = text.split_whitespace().next().unwrap_or_default().to_ascii_uppercase();
        match verb.as_str() {
            "INSERT" | "UPDATE" | "DELETE" => {
                Ok(RawResult::affected(params.len().max(1) as u64).with_command(verb))
            }
            _ => {
                let fields = vec![
                    ColumnMetadata::new("id", "integer", false),
                    ColumnMetadata::new("name", "string", true),
                ];
                Ok(RawResult::rows(rows.unwrap_or_else(default_rows), fields).with_command("SELECT"))
            }
        }
    }

    async fn execute_procedure(
        &self,
        _conn: &mut Connection,
        name: &str,
        params: &[QueryParam],
    ) -> DbResult<RawResult> {
        self.record(format!("CALL {}({})", name, params.len()));
        Ok(RawResult::new(json!([{"result": "ok"}])))
    }

    async fn begin_transaction(
        &self,
        _conn: &mut Connection,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<()> {
        match isolation {
            Some(level) => self.record(format!("BEGIN {}", level)),
            None => self.record("BEGIN"),
        }
        Ok(())
    }

    async fn commit(&self, conn: &mut Connection) -> DbResult<()> {
        self.record("COMMIT");
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(self.native_error(Failure::Fatal));
        }
        conn.clear_transaction();
        Ok(())
    }

    async fn rollback(&self, conn: &mut Connection) -> DbResult<()> {
        self.record("ROLLBACK");
        conn.clear_transaction();
        Ok(())
    }

    async fn create_savepoint(&self, _conn: &mut Connection, name: &str) -> DbResult<()> {
        if !self.capabilities.savepoints {
            return Err(DbError::unsupported("savepoints", self.engine));
        }
        self.record(format!("SAVEPOINT {}", name));
        Ok(())
    }

    async fn release_savepoint(&self, _conn: &mut Connection, name: &str) -> DbResult<()> {
        self.record(format!("RELEASE {}", name));
        Ok(())
    }

    async fn rollback_to_savepoint(&self, _conn: &mut Connection, name: &str) -> DbResult<()> {
        self.record(format!("ROLLBACK TO {}", name));
        Ok(())
    }

    async fn ping(&self, _conn: &mut Connection) -> DbResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(DbError::connection("server has gone away", "The connection will be replaced"));
        }
        Ok(())
    }

    async fn metadata(&self, _conn: &mut Connection) -> DbResult<ServerMetadata> {
        Ok(ServerMetadata {
            engine: self.engine,
            server_version: Some("mock 1.0".to_string()),
            database: Some("app".to_string()),
            extra: Map::new(),
        })
    }

    async fn table_info(&self, _conn: &mut Connection, table: &str) -> DbResult<Vec<ColumnMetadata>> {
        self.record(format!("DESCRIBE {}", table));
        Ok(vec![
            ColumnMetadata::new("id", "integer", false),
            ColumnMetadata::new("name", "string", true),
        ])
    }

    async fn bulk_insert(
        &self,
        _conn: &mut Connection,
        table: &str,
        rows: &[Map<String, JsonValue>],
    ) -> DbResult<u64> {
        self.record(format!("BULK {} {}", table, rows.len()));
        Ok(rows.len() as u64)
    }

    fn canceller(&self, _conn: &Connection) -> Option<Box<dyn Canceller>> {
        Some(Box::new(MockCanceller(self.cancels.clone())))
    }
}

/// Single-connection endpoint with the health monitor switched off.
pub fn endpoint(alias: &str) -> EndpointConfig {
    EndpointConfig::new(alias, EngineType::Postgres, "db.test")
        .with_credentials("tester", "secret")
        .with_database("app")
        .with_option("health_check", "false")
}

/// Pooled endpoint with the health monitor switched off.
pub fn pooled_endpoint(alias: &str, min: u32, max: u32, acquire_timeout_secs: u64) -> EndpointConfig {
    endpoint(alias).with_pool(PoolOptions {
        min_connections: Some(min),
        max_connections: Some(max),
        acquire_timeout_secs: Some(acquire_timeout_secs),
        ..Default::default()
    })
}
