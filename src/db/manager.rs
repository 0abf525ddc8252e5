//! Connection manager: one alias's connection source plus health monitoring.
//!
//! The source is either a single bare connection or a [`ConnectionPool`].
//! A background task pings the source on a fixed interval; on failure the
//! manager reconnects with exponential backoff and, once the attempts are
//! exhausted, stops monitoring and fails every later checkout with
//! `ReconnectFailed`.

use super::pool::{ConnectionPool, PoolStats};
use crate::adapters::Adapter;
use crate::config::EndpointConfig;
use crate::error::{DbError, DbResult};
use crate::models::Connection;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

/// A source is healthy only if its last successful check is this recent.
pub const HEALTH_FRESHNESS: Duration = Duration::from_secs(30);

/// Upper bound of the reconnection backoff.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Health monitor tuning, read from the endpoint's option bag
/// (`health_check_interval`, `health_check`, `reconnect_attempts`,
/// `reconnect_delay_ms`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthOptions {
    pub enabled: bool,
    pub interval: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl HealthOptions {
    pub fn from_config(config: &EndpointConfig) -> Self {
        let parse = |key: &str| config.option(key).and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            enabled: config
                .option("health_check")
                .map(|v| !matches!(v.trim(), "false" | "0" | "off" | "no"))
                .unwrap_or(true),
            interval: Duration::from_secs(
                parse("health_check_interval")
                    .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS)
                    .max(1),
            ),
            max_attempts: parse("reconnect_attempts")
                .map(|n| n as u32)
                .unwrap_or(DEFAULT_RECONNECT_ATTEMPTS),
            base_delay: Duration::from_millis(
                parse("reconnect_delay_ms").unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
        }
    }

    /// Delay before reconnection attempt `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(MAX_RECONNECT_DELAY)
            .min(MAX_RECONNECT_DELAY)
    }
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        }
    }
}

/// Snapshot returned by [`ConnectionManager::health`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u32,
    pub fatal: bool,
}

#[derive(Default)]
struct HealthState {
    last_success: Option<(Instant, DateTime<Utc>)>,
    consecutive_failures: u32,
    reconnect_attempts: u32,
    fatal: Option<String>,
}

enum Source {
    Single {
        slot: tokio::sync::Mutex<Option<Connection>>,
        /// One permit: the single connection is checked out by one caller at a time
        gate: Semaphore,
    },
    Pool(Arc<ConnectionPool>),
}

pub struct ConnectionManager {
    adapter: Arc<dyn Adapter>,
    config: Arc<EndpointConfig>,
    source: Source,
    options: HealthOptions,
    health: Mutex<HealthState>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Connect according to the endpoint (pooled when it has pool options)
    /// and start the health monitor.
    pub async fn open(adapter: Arc<dyn Adapter>, config: EndpointConfig) -> DbResult<Arc<Self>> {
        config.validate().map_err(DbError::invalid_input)?;
        let config = Arc::new(config);

        let source = if config.pool.is_some() {
            Source::Pool(ConnectionPool::new(adapter.clone(), config.clone()).await?)
        } else {
            let conn = Self::connect_single(adapter.as_ref(), &config).await?;
            Source::Single {
                slot: tokio::sync::Mutex::new(Some(conn)),
                gate: Semaphore::new(1),
            }
        };

        let manager = Arc::new(Self {
            options: HealthOptions::from_config(&config),
            adapter,
            config,
            source,
            health: Mutex::new(HealthState::default()),
            monitor: Mutex::new(None),
        });
        manager.record_success();

        if manager.options.enabled {
            manager.start_monitor();
        }

        info!(
            alias = %manager.config.alias,
            target = %manager.config.masked(),
            pooled = manager.is_pooled(),
            "Connection manager opened"
        );
        Ok(manager)
    }

    async fn connect_single(adapter: &dyn Adapter, config: &EndpointConfig) -> DbResult<Connection> {
        let connect_timeout = config.connect_timeout();
        timeout(connect_timeout, adapter.connect(config))
            .await
            .map_err(|_| DbError::timeout("connect", connect_timeout.as_millis() as u64))?
    }

    async fn disconnect(&self, conn: &mut Connection) {
        if let Err(e) = self.adapter.disconnect(conn).await {
            debug!(alias = %self.config.alias, connection_id = %conn.id(), error = %e, "Error closing connection");
        }
    }

    fn health_state(&self) -> MutexGuard<'_, HealthState> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn alias(&self) -> &str {
        &self.config.alias
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.source, Source::Pool(_))
    }

    /// Check out a connection.
    pub async fn acquire(&self) -> DbResult<Connection> {
        if let Some(message) = self.health_state().fatal.clone() {
            return Err(DbError::reconnect_failed(self.options.max_attempts, message));
        }

        match &self.source {
            Source::Pool(pool) => pool.acquire().await,
            Source::Single { slot, gate } => {
                let acquire_timeout = self
                    .config
                    .pool
                    .clone()
                    .unwrap_or_default()
                    .acquire_timeout_or_default();
                let started = Instant::now();
                let permit = timeout(acquire_timeout, gate.acquire())
                    .await
                    .map_err(|_| DbError::acquire_timeout(started.elapsed().as_millis() as u64))?
                    .map_err(|_| DbError::connection("connection is closed", "Reopen the alias"))?;
                permit.forget();

                let existing = slot.lock().await.take();
                match existing {
                    Some(mut conn) if conn.is_usable() => {
                        conn.touch();
                        Ok(conn)
                    }
                    stale => {
                        if let Some(mut old) = stale {
                            self.disconnect(&mut old).await;
                        }
                        debug!(alias = %self.config.alias, "Reopening single connection");
                        match Self::connect_single(self.adapter.as_ref(), &self.config).await {
                            Ok(conn) => Ok(conn),
                            Err(e) => {
                                gate.add_permits(1);
                                Err(e)
                            }
                        }
                    }
                }
            }
        }
    }

    /// Return a checked-out connection.
    pub async fn release(&self, mut conn: Connection) {
        match &self.source {
            Source::Pool(pool) => pool.release(conn).await,
            Source::Single { slot, gate } => {
                if conn.in_transaction && conn.is_usable() {
                    warn!(
                        alias = %self.config.alias,
                        connection_id = %conn.id(),
                        "Connection released inside a transaction, rolling back"
                    );
                    if let Err(e) = self.adapter.rollback(&mut conn).await {
                        warn!(connection_id = %conn.id(), error = %e, "Rollback on release failed");
                        conn.mark_broken();
                    }
                }
                if conn.is_usable() {
                    *slot.lock().await = Some(conn);
                } else {
                    self.disconnect(&mut conn).await;
                }
                gate.add_permits(1);
            }
        }
    }

    /// Run `op` on a checked-out connection, releasing it afterwards even if
    /// `op` fails or panics.
    pub async fn execute_with_connection<T, F>(&self, op: F) -> DbResult<T>
    where
        F: AsyncFnOnce(&mut Connection) -> DbResult<T>,
    {
        let mut conn = self.acquire().await?;
        let outcome = AssertUnwindSafe(op(&mut conn)).catch_unwind().await;
        match outcome {
            Ok(result) => {
                self.release(conn).await;
                result
            }
            Err(panic) => {
                conn.mark_broken();
                self.release(conn).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.health_state();
        state.last_success = Some((Instant::now(), Utc::now()));
        state.consecutive_failures = 0;
    }

    /// Ping the source once. Connections busy with callers count as alive.
    async fn probe(&self) -> DbResult<()> {
        match &self.source {
            Source::Pool(pool) => {
                let stats = pool.stats();
                if stats.idle == 0 && stats.total >= stats.max {
                    return Ok(());
                }
                let mut conn = pool.acquire().await?;
                let result = self.adapter.ping(&mut conn).await;
                if result.is_err() {
                    conn.mark_broken();
                }
                pool.release(conn).await;
                result
            }
            Source::Single { slot, gate } => {
                let Ok(permit) = gate.try_acquire() else {
                    return Ok(());
                };
                let mut guard = slot.lock().await;
                let result = match guard.as_mut() {
                    Some(conn) => {
                        let result = timeout(self.config.connect_timeout(), self.adapter.ping(conn))
                            .await
                            .unwrap_or_else(|_| {
                                Err(DbError::timeout(
                                    "ping",
                                    self.config.connect_timeout().as_millis() as u64,
                                ))
                            });
                        if result.is_err() {
                            conn.mark_broken();
                        }
                        result
                    }
                    None => Err(DbError::connection(
                        "single connection is closed",
                        "The connection will be reopened",
                    )),
                };
                drop(guard);
                drop(permit);
                result
            }
        }
    }

    /// Run one health check, reconnecting on failure.
    pub async fn check_health(&self) -> DbResult<()> {
        if let Some(message) = self.health_state().fatal.clone() {
            return Err(DbError::reconnect_failed(self.options.max_attempts, message));
        }
        match self.probe().await {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(e) => {
                self.health_state().consecutive_failures += 1;
                warn!(alias = %self.config.alias, error = %e, "Health check failed");
                self.recover().await
            }
        }
    }

    /// Reconnect with exponential backoff.
    async fn recover(&self) -> DbResult<()> {
        let mut last_error = String::new();
        for attempt in 0..self.options.max_attempts {
            let delay = self.options.backoff(attempt);
            self.health_state().reconnect_attempts = attempt + 1;
            info!(
                alias = %self.config.alias,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            tokio::time::sleep(delay).await;

            match self.reconnect().await {
                Ok(()) => {
                    self.record_success();
                    self.health_state().reconnect_attempts = 0;
                    info!(alias = %self.config.alias, attempt = attempt + 1, "Reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(alias = %self.config.alias, attempt = attempt + 1, error = %e, "Reconnection attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        error!(
            alias = %self.config.alias,
            attempts = self.options.max_attempts,
            "Reconnection attempts exhausted, health monitoring stopped"
        );
        self.health_state().fatal = Some(last_error.clone());
        Err(DbError::reconnect_failed(self.options.max_attempts, last_error))
    }

    /// Replace the underlying connection(s).
    pub async fn reconnect(&self) -> DbResult<()> {
        match &self.source {
            Source::Pool(pool) => pool.reconnect().await,
            Source::Single { slot, gate } => {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| DbError::connection("connection is closed", "Reopen the alias"))?;
                let mut guard = slot.lock().await;
                if let Some(mut old) = guard.take() {
                    self.disconnect(&mut old).await;
                }
                let conn = Self::connect_single(self.adapter.as_ref(), &self.config).await?;
                *guard = Some(conn);
                drop(permit);
                Ok(())
            }
        }
    }

    fn start_monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.options.interval;
        let handle = tokio::spawn(async move {
            Self::monitor_task(weak, interval).await;
        });
        if let Some(old) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            old.abort();
        }
    }

    async fn monitor_task(weak: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if manager.check_health().await.is_err() && manager.health_state().fatal.is_some() {
                return;
            }
            drop(manager);
        }
    }

    pub fn health(&self) -> HealthStatus {
        let state = self.health_state();
        let fresh = state
            .last_success
            .is_some_and(|(at, _)| at.elapsed() <= HEALTH_FRESHNESS);
        HealthStatus {
            healthy: fresh && state.fatal.is_none(),
            last_success: state.last_success.map(|(_, at)| at),
            consecutive_failures: state.consecutive_failures,
            reconnect_attempts: state.reconnect_attempts,
            fatal: state.fatal.is_some(),
        }
    }

    /// Pool counters; a single connection reports a pool of one.
    pub fn stats(&self) -> PoolStats {
        match &self.source {
            Source::Pool(pool) => pool.stats(),
            Source::Single { gate, .. } => {
                let active = usize::from(gate.available_permits() == 0);
                PoolStats {
                    total: 1,
                    active,
                    idle: 1 - active,
                    waiting: 0,
                    min: 1,
                    max: 1,
                }
            }
        }
    }

    /// Forget a checked-out connection that will never be released.
    pub fn forget(&self, connection_id: &str) {
        match &self.source {
            Source::Pool(pool) => pool.forget(connection_id),
            Source::Single { gate, .. } => gate.add_permits(1),
        }
    }

    /// Stop monitoring and close every connection.
    pub async fn close(&self) {
        if let Some(handle) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        match &self.source {
            Source::Pool(pool) => pool.drain().await,
            Source::Single { slot, gate } => {
                if let Some(mut conn) = slot.lock().await.take() {
                    self.disconnect(&mut conn).await;
                }
                gate.close();
            }
        }
        info!(alias = %self.config.alias, "Connection manager closed");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("alias", &self.config.alias)
            .field("engine", &self.config.engine)
            .field("pooled", &self.is_pooled())
            .field("health", &self.health())
            .finish()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
