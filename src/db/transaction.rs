//! Nested transaction manager.
//!
//! Each connection gets a stack of transaction levels. The outermost level
//! is a real BEGIN/COMMIT/ROLLBACK; every inner level is emulated with a
//! generated savepoint. Engines without savepoints reject nesting with
//! `UnsupportedOperation` instead of silently flattening it.
//!
//! Stacks are keyed by connection id and only mutated by whoever holds that
//! connection, so the lock is never held across an engine call.

use crate::adapters::Adapter;
use crate::error::{DbError, DbResult};
use crate::models::{Connection, TransactionOptions};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One nesting level.
#[derive(Debug, Clone)]
pub struct TransactionLevel {
    /// 1 for the outermost transaction
    pub level: u32,
    /// Savepoint emulating this level; `None` for the outermost level
    pub savepoint: Option<String>,
    pub started_at: Instant,
    /// Explicit savepoints created inside this level, oldest first
    pub savepoints: Vec<String>,
}

/// Read-only view of a connection's transaction stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionInfo {
    pub connection_id: String,
    pub depth: u32,
    pub savepoints: Vec<String>,
    pub elapsed_ms: u64,
}

pub struct TransactionManager {
    adapter: Arc<dyn Adapter>,
    stacks: Mutex<HashMap<String, Vec<TransactionLevel>>>,
}

/// Generate a savepoint name unique within a connection.
fn savepoint_name(level: u32) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("sp_{}_{}", level, &id[..8])
}

impl TransactionManager {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            adapter,
            stacks: Mutex::new(HashMap::new()),
        }
    }

    fn stacks(&self) -> MutexGuard<'_, HashMap<String, Vec<TransactionLevel>>> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn depth(&self, connection_id: &str) -> u32 {
        self.stacks()
            .get(connection_id)
            .map(|stack| stack.len() as u32)
            .unwrap_or(0)
    }

    pub fn is_active(&self, connection_id: &str) -> bool {
        self.depth(connection_id) > 0
    }

    pub fn info(&self, connection_id: &str) -> Option<TransactionInfo> {
        let stacks = self.stacks();
        let stack = stacks.get(connection_id)?;
        Some(TransactionInfo {
            connection_id: connection_id.to_string(),
            depth: stack.len() as u32,
            savepoints: flatten_savepoints(stack),
            elapsed_ms: stack
                .first()
                .map(|outer| outer.started_at.elapsed().as_millis() as u64)
                .unwrap_or(0),
        })
    }

    /// Age of the outermost level.
    pub fn elapsed(&self, connection_id: &str) -> Option<Duration> {
        self.stacks()
            .get(connection_id)
            .and_then(|stack| stack.first())
            .map(|outer| outer.started_at.elapsed())
    }

    /// Drop the stack of a connection that is going away.
    pub fn discard(&self, connection_id: &str) {
        if self.stacks().remove(connection_id).is_some() {
            debug!(connection_id, "Discarded transaction stack");
        }
    }

    fn sync_envelope(&self, conn: &mut Connection) {
        let stacks = self.stacks();
        match stacks.get(conn.id()) {
            Some(stack) => {
                conn.in_transaction = true;
                conn.transaction_level = stack.len() as u32;
                conn.savepoints = flatten_savepoints(stack);
            }
            None => {
                drop(stacks);
                conn.clear_transaction();
            }
        }
    }

    /// Open a transaction level; returns the new depth.
    pub async fn begin(&self, conn: &mut Connection, opts: &TransactionOptions) -> DbResult<u32> {
        let depth = self.depth(conn.id());

        if depth == 0 {
            self.adapter.begin_transaction(conn, opts.isolation).await?;
            self.stacks().insert(
                conn.id().to_string(),
                vec![TransactionLevel {
                    level: 1,
                    savepoint: None,
                    started_at: Instant::now(),
                    savepoints: Vec::new(),
                }],
            );
            self.sync_envelope(conn);
            info!(connection_id = %conn.id(), isolation = ?opts.isolation, "Transaction started");
            return Ok(1);
        }

        if !self.adapter.capabilities().savepoints {
            return Err(DbError::unsupported(
                "nested transactions (savepoints)",
                self.adapter.engine(),
            ));
        }
        if opts.isolation.is_some() {
            debug!(connection_id = %conn.id(), "Isolation level ignored for a nested level");
        }

        let level = depth + 1;
        let name = savepoint_name(level);
        self.adapter.create_savepoint(conn, &name).await?;
        if let Some(stack) = self.stacks().get_mut(conn.id()) {
            stack.push(TransactionLevel {
                level,
                savepoint: Some(name.clone()),
                started_at: Instant::now(),
                savepoints: Vec::new(),
            });
        }
        self.sync_envelope(conn);
        debug!(connection_id = %conn.id(), level, savepoint = %name, "Nested transaction level opened");
        Ok(level)
    }

    /// Close the innermost level; the outermost one issues the real COMMIT.
    pub async fn commit(&self, conn: &mut Connection) -> DbResult<()> {
        let popped = {
            let mut stacks = self.stacks();
            let stack = stacks
                .get_mut(conn.id())
                .filter(|stack| !stack.is_empty())
                .ok_or_else(|| DbError::no_active_transaction(conn.id()))?;
            let top = stack.pop();
            if stack.is_empty() {
                stacks.remove(conn.id());
            }
            top
        };

        match popped.and_then(|level| level.savepoint) {
            None => {
                let result = self.adapter.commit(conn).await;
                self.sync_envelope(conn);
                result?;
                info!(connection_id = %conn.id(), "Transaction committed");
            }
            Some(name) => {
                if self.adapter.capabilities().release_savepoint {
                    // some engines reject an explicit release; the level is closed either way
                    if let Err(e) = self.adapter.release_savepoint(conn, &name).await {
                        warn!(connection_id = %conn.id(), savepoint = %name, error = %e, "Release savepoint failed");
                    }
                }
                self.sync_envelope(conn);
                debug!(connection_id = %conn.id(), savepoint = %name, "Nested level committed");
            }
        }
        Ok(())
    }

    /// Roll back.
    ///
    /// With a name, rolls back to that savepoint and drops every level
    /// opened after it. Without one, the outermost level issues the real
    /// ROLLBACK and inner levels roll back to their own savepoint.
    pub async fn rollback(&self, conn: &mut Connection, savepoint: Option<&str>) -> DbResult<()> {
        if self.depth(conn.id()) == 0 {
            return Err(DbError::no_active_transaction(conn.id()));
        }

        if let Some(name) = savepoint {
            return self.rollback_to(conn, name).await;
        }

        let popped = {
            let mut stacks = self.stacks();
            let Some(stack) = stacks.get_mut(conn.id()) else {
                return Err(DbError::no_active_transaction(conn.id()));
            };
            let top = stack.pop();
            if stack.is_empty() {
                stacks.remove(conn.id());
            }
            top
        };

        match popped.and_then(|level| level.savepoint) {
            None => {
                let result = self.adapter.rollback(conn).await;
                self.sync_envelope(conn);
                result?;
                info!(connection_id = %conn.id(), "Transaction rolled back");
            }
            Some(name) => {
                let result = self.adapter.rollback_to_savepoint(conn, &name).await;
                self.sync_envelope(conn);
                result?;
                debug!(connection_id = %conn.id(), savepoint = %name, "Nested level rolled back");
            }
        }
        Ok(())
    }

    async fn rollback_to(&self, conn: &mut Connection, name: &str) -> DbResult<()> {
        // (levels to keep, explicit savepoints to keep in the last kept level)
        let cut = {
            let stacks = self.stacks();
            let stack = stacks.get(conn.id()).map(Vec::as_slice).unwrap_or_default();
            stack.iter().enumerate().rev().find_map(|(idx, level)| {
                if level.savepoint.as_deref() == Some(name) {
                    Some((idx, None))
                } else {
                    level
                        .savepoints
                        .iter()
                        .position(|sp| sp == name)
                        .map(|pos| (idx + 1, Some(pos + 1)))
                }
            })
        };
        let Some((keep_levels, keep_savepoints)) = cut else {
            return Err(DbError::invalid_input(format!(
                "no savepoint named '{}' on connection {}",
                name,
                conn.id()
            )));
        };

        self.adapter.rollback_to_savepoint(conn, name).await?;

        if let Some(stack) = self.stacks().get_mut(conn.id()) {
            stack.truncate(keep_levels);
            if let (Some(keep), Some(last)) = (keep_savepoints, stack.last_mut()) {
                last.savepoints.truncate(keep);
            }
        }
        self.sync_envelope(conn);
        debug!(connection_id = %conn.id(), savepoint = %name, depth = keep_levels, "Rolled back to savepoint");
        Ok(())
    }

    /// Create an explicit savepoint inside the current level.
    pub async fn savepoint(&self, conn: &mut Connection, name: &str) -> DbResult<()> {
        if self.depth(conn.id()) == 0 {
            return Err(DbError::no_active_transaction(conn.id()));
        }
        if !self.adapter.capabilities().savepoints {
            return Err(DbError::unsupported("savepoints", self.adapter.engine()));
        }
        if self
            .info(conn.id())
            .is_some_and(|info| info.savepoints.iter().any(|sp| sp == name))
        {
            return Err(DbError::invalid_input(format!(
                "savepoint '{}' already exists on connection {}",
                name,
                conn.id()
            )));
        }

        self.adapter.create_savepoint(conn, name).await?;
        if let Some(level) = self.stacks().get_mut(conn.id()).and_then(|s| s.last_mut()) {
            level.savepoints.push(name.to_string());
        }
        self.sync_envelope(conn);
        Ok(())
    }

    /// Release an explicit savepoint of the current level.
    pub async fn release_savepoint(&self, conn: &mut Connection, name: &str) -> DbResult<()> {
        let found = self
            .stacks()
            .get(conn.id())
            .and_then(|s| s.last())
            .and_then(|level| level.savepoints.iter().position(|sp| sp == name));
        let Some(pos) = found else {
            return Err(DbError::invalid_input(format!(
                "no savepoint named '{}' in the current transaction level",
                name
            )));
        };

        if self.adapter.capabilities().release_savepoint {
            self.adapter.release_savepoint(conn, name).await?;
        }
        // releasing a savepoint also releases the ones created after it
        if let Some(level) = self.stacks().get_mut(conn.id()).and_then(|s| s.last_mut()) {
            level.savepoints.truncate(pos);
        }
        self.sync_envelope(conn);
        Ok(())
    }
}

fn flatten_savepoints(stack: &[TransactionLevel]) -> Vec<String> {
    stack
        .iter()
        .flat_map(|level| level.savepoint.iter().chain(level.savepoints.iter()))
        .cloned()
        .collect()
}
