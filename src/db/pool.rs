//! Connection pool.
//!
//! A bounded set of physical connections for one adapter + endpoint pair.
//! Idle connections are handed out first, new ones are opened while the
//! pool is below `max`, and everyone else waits in a FIFO queue with a
//! deadline. Released connections go straight to the oldest waiter.
//!
//! The pool state lives behind a synchronous mutex that is never held
//! across an `.await`; driver calls (connect, ping, disconnect) always
//! happen outside the lock.

use crate::adapters::Adapter;
use crate::config::{EndpointConfig, PoolOptions};
use crate::error::{DbError, DbResult};
use crate::models::Connection;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

/// Pool counters reported by [`ConnectionPool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub min: usize,
    pub max: usize,
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

/// What a waiter receives when it reaches the head of the queue.
enum Handoff {
    /// A released connection, already counted as active
    Connection(Connection),
    /// A reserved slot; the waiter opens the connection itself
    Slot,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Handoff>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConnection>,
    active: usize,
    /// Open connections plus slots reserved for connections being opened
    total: usize,
    waiters: VecDeque<Waiter>,
    /// Ids of connections owned by the current generation
    members: HashSet<String>,
    next_waiter: u64,
    closed: bool,
}

enum Step {
    Reuse(Connection),
    Open,
    Wait(u64, oneshot::Receiver<Handoff>),
}

pub struct ConnectionPool {
    adapter: Arc<dyn Adapter>,
    config: Arc<EndpointConfig>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create the pool, open `min` connections and start the idle reaper.
    ///
    /// Fails if the first connection cannot be opened.
    pub async fn new(adapter: Arc<dyn Adapter>, config: Arc<EndpointConfig>) -> DbResult<Arc<Self>> {
        let options = config.pool.clone().unwrap_or_default();
        options.validate().map_err(DbError::invalid_input)?;

        let pool = Arc::new(Self {
            adapter,
            config,
            options,
            state: Mutex::new(PoolState::default()),
            reaper: Mutex::new(None),
        });
        pool.initialize().await?;
        Ok(pool)
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn max(&self) -> usize {
        self.options.max_connections_or_default() as usize
    }

    fn min(&self) -> usize {
        self.options.min_connections_or_default() as usize
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    async fn initialize(self: &Arc<Self>) -> DbResult<()> {
        self.state().closed = false;

        if self.min() > 0 {
            // the first failure is surfaced; later ones are filled in by ensure_min
            self.state().total += 1;
            let conn = match self.open().await {
                Ok(conn) => conn,
                Err(e) => {
                    let mut state = self.state();
                    state.total = state.total.saturating_sub(1);
                    return Err(e);
                }
            };
            self.admit_idle(conn).await;
            self.ensure_min().await;
        }

        let weak = Arc::downgrade(self);
        let interval = self.options.reap_interval_or_default();
        let handle = tokio::spawn(async move {
            Self::reap_task(weak, interval).await;
        });
        if let Some(old) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            old.abort();
        }

        info!(
            alias = %self.config.alias,
            engine = %self.config.engine,
            min = self.min(),
            max = self.max(),
            "Connection pool initialized"
        );
        Ok(())
    }

    /// Open a physical connection, registering it with this generation.
    ///
    /// The caller must already hold a reserved slot.
    async fn open(&self) -> DbResult<Connection> {
        let connect_timeout = self.config.connect_timeout();
        let conn = timeout(connect_timeout, self.adapter.connect(&self.config))
            .await
            .map_err(|_| DbError::timeout("connect", connect_timeout.as_millis() as u64))??;
        self.state().members.insert(conn.id().to_string());
        debug!(alias = %self.config.alias, connection_id = %conn.id(), "Opened pooled connection");
        Ok(conn)
    }

    async fn validate(&self, conn: &mut Connection) -> bool {
        if !conn.is_usable() {
            return false;
        }
        match timeout(self.config.connect_timeout(), self.adapter.ping(conn)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(connection_id = %conn.id(), error = %e, "Connection failed validation");
                false
            }
            Err(_) => {
                debug!(connection_id = %conn.id(), "Connection validation timed out");
                false
            }
        }
    }

    /// Check out a connection, waiting up to the acquire timeout.
    pub async fn acquire(&self) -> DbResult<Connection> {
        let acquire_timeout = self.options.acquire_timeout_or_default();
        let started = Instant::now();
        let deadline = started + acquire_timeout;

        loop {
            let step = {
                let mut state = self.state();
                if state.closed {
                    return Err(DbError::connection(
                        format!("pool for '{}' is closed", self.config.alias),
                        "Reopen the connection before using it",
                    ));
                }
                if let Some(idle) = state.idle.pop_front() {
                    state.active += 1;
                    Step::Reuse(idle.conn)
                } else if state.total < self.max() {
                    state.total += 1;
                    state.active += 1;
                    Step::Open
                } else {
                    let id = state.next_waiter;
                    state.next_waiter += 1;
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(Waiter { id, tx });
                    Step::Wait(id, rx)
                }
            };

            match step {
                Step::Reuse(mut conn) => {
                    if self.options.validate_on_acquire_or_default() && !self.validate(&mut conn).await
                    {
                        warn!(
                            alias = %self.config.alias,
                            connection_id = %conn.id(),
                            "Idle connection failed validation, replacing"
                        );
                        self.destroy(conn).await;
                        continue;
                    }
                    conn.touch();
                    return Ok(conn);
                }
                Step::Open => return self.open_reserved().await,
                Step::Wait(id, mut rx) => {
                    debug!(alias = %self.config.alias, waiter = id, "Waiting for a pooled connection");
                    match timeout_at(deadline, &mut rx).await {
                        Ok(Ok(Handoff::Connection(mut conn))) => {
                            conn.touch();
                            return Ok(conn);
                        }
                        Ok(Ok(Handoff::Slot)) => return self.open_reserved().await,
                        // queue dropped by drain; the loop reports the closed pool
                        Ok(Err(_)) => continue,
                        Err(_) => {
                            let removed = {
                                let mut state = self.state();
                                let before = state.waiters.len();
                                state.waiters.retain(|w| w.id != id);
                                state.waiters.len() != before
                            };
                            if !removed {
                                // handed off between the deadline and the lock
                                match rx.try_recv() {
                                    Ok(Handoff::Connection(conn)) => return Ok(conn),
                                    Ok(Handoff::Slot) => return self.open_reserved().await,
                                    Err(_) => {}
                                }
                            }
                            let waited_ms = started.elapsed().as_millis() as u64;
                            warn!(alias = %self.config.alias, waited_ms, "Timed out acquiring a pooled connection");
                            return Err(DbError::acquire_timeout(waited_ms));
                        }
                    }
                }
            }
        }
    }

    /// Open a connection into a slot reserved by the caller.
    async fn open_reserved(&self) -> DbResult<Connection> {
        match self.open().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.free_slot();
                Err(e)
            }
        }
    }

    /// Give up an active slot, passing it to the next waiter if any.
    fn free_slot(&self) {
        let mut state = self.state();
        state.total = state.total.saturating_sub(1);
        state.active = state.active.saturating_sub(1);
        Self::grant_slot(&mut state, self.max());
    }

    fn grant_slot(state: &mut PoolState, max: usize) {
        while state.total < max {
            let Some(waiter) = state.waiters.pop_front() else {
                return;
            };
            state.total += 1;
            state.active += 1;
            if waiter.tx.send(Handoff::Slot).is_ok() {
                return;
            }
            // waiter gave up; take the slot back
            state.total -= 1;
            state.active -= 1;
        }
    }

    /// Pass a connection to the oldest live waiter, or park it as idle.
    ///
    /// The connection must not be counted as active on entry.
    fn hand_off(state: &mut PoolState, mut conn: Connection) {
        while let Some(waiter) = state.waiters.pop_front() {
            state.active += 1;
            match waiter.tx.send(Handoff::Connection(conn)) {
                Ok(()) => return,
                Err(back) => {
                    state.active -= 1;
                    match back {
                        Handoff::Connection(back) => conn = back,
                        Handoff::Slot => return,
                    }
                }
            }
        }
        state.idle.push_back(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }

    /// Add a freshly opened connection (slot already reserved) to the pool.
    async fn admit_idle(&self, conn: Connection) {
        let rejected = {
            let mut state = self.state();
            if state.closed {
                Some(conn)
            } else {
                Self::hand_off(&mut state, conn);
                None
            }
        };
        if let Some(conn) = rejected {
            self.disconnect(conn).await;
        }
    }

    /// Return a connection to the pool.
    ///
    /// A connection still inside a transaction is rolled back first. Broken
    /// connections, and ones failing release validation when it is enabled,
    /// are closed and replaced instead of reused.
    pub async fn release(&self, mut conn: Connection) {
        if !self.state().members.contains(conn.id()) {
            // from a drained generation
            self.disconnect(conn).await;
            return;
        }

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

        if conn.is_usable()
            && self.options.validate_on_release_or_default()
            && !self.validate(&mut conn).await
        {
            conn.mark_broken();
        }

        if !conn.is_usable() {
            self.destroy(conn).await;
            self.ensure_min().await;
            return;
        }

        conn.touch();
        let rejected = {
            let mut state = self.state();
            state.active = state.active.saturating_sub(1);
            if state.closed {
                state.members.remove(conn.id());
                state.total = state.total.saturating_sub(1);
                Some(conn)
            } else {
                Self::hand_off(&mut state, conn);
                None
            }
        };
        if let Some(conn) = rejected {
            self.disconnect(conn).await;
        }
    }

    /// Close an active connection and free its slot.
    async fn destroy(&self, conn: Connection) {
        let member = self.state().members.remove(conn.id());
        self.disconnect(conn).await;
        if member {
            self.free_slot();
        }
    }

    /// Forget an active connection that was lost without being released.
    pub fn forget(&self, connection_id: &str) {
        let member = self.state().members.remove(connection_id);
        if member {
            warn!(alias = %self.config.alias, connection_id, "Pooled connection lost, freeing its slot");
            self.free_slot();
        }
    }

    async fn disconnect(&self, mut conn: Connection) {
        if !conn.connected {
            return;
        }
        if let Err(e) = self.adapter.disconnect(&mut conn).await {
            debug!(connection_id = %conn.id(), error = %e, "Error closing connection");
        }
    }

    /// Best-effort restoration of the minimum pool size.
    async fn ensure_min(&self) {
        loop {
            {
                let mut state = self.state();
                if state.closed || state.total >= self.min() {
                    return;
                }
                state.total += 1;
            }
            match self.open().await {
                Ok(conn) => self.admit_idle(conn).await,
                Err(e) => {
                    {
                        let mut state = self.state();
                        state.total = state.total.saturating_sub(1);
                    }
                    warn!(alias = %self.config.alias, error = %e, "Could not restore minimum pool size");
                    return;
                }
            }
        }
    }

    /// Close idle connections past the idle timeout, never going below `min`.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.options.idle_timeout_or_default();
        let expired: Vec<Connection> = {
            let mut state = self.state();
            let now = Instant::now();
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            while let Some(idle) = state.idle.pop_front() {
                let surplus = state.total > self.min();
                if surplus && now.saturating_duration_since(idle.since) > idle_timeout {
                    state.total -= 1;
                    state.members.remove(idle.conn.id());
                    expired.push(idle.conn);
                } else {
                    kept.push_back(idle);
                }
            }
            state.idle = kept;
            expired
        };

        let count = expired.len();
        for conn in expired {
            debug!(alias = %self.config.alias, connection_id = %conn.id(), "Closing idle connection");
            self.disconnect(conn).await;
        }
        count
    }

    async fn reap_task(weak: Weak<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = weak.upgrade() else {
                return;
            };
            let reaped = pool.reap_idle().await;
            if reaped > 0 {
                info!(alias = %pool.config.alias, reaped, "Reaped idle connections");
            }
            pool.ensure_min().await;
            drop(pool);
        }
    }

    /// Reject all waiters, close every idle connection and reset the counters.
    ///
    /// Connections still checked out are closed when they are released.
    pub async fn drain(&self) {
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let (idle, waiters) = {
            let mut state = self.state();
            let old = std::mem::take(&mut *state);
            state.closed = true;
            state.next_waiter = old.next_waiter;
            (old.idle, old.waiters)
        };

        let rejected = waiters.len();
        drop(waiters);
        let closed = idle.len();
        for idle in idle {
            self.disconnect(idle.conn).await;
        }
        info!(alias = %self.config.alias, closed, rejected, "Connection pool drained");
    }

    /// Drain, then open a fresh generation.
    pub async fn reconnect(self: &Arc<Self>) -> DbResult<()> {
        self.drain().await;
        self.initialize().await
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            total: state.total,
            active: state.active,
            idle: state.idle.len(),
            waiting: state.waiters.len(),
            min: self.min(),
            max: self.max(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("alias", &self.config.alias)
            .field("engine", &self.config.engine)
            .field("stats", &self.stats())
            .finish()
    }
}
