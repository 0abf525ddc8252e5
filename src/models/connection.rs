//! Connection handle envelope and transaction option types.
//!
//! A [`Connection`] pairs the engine-native driver object with the
//! normalized state every layer above the adapters relies on. It is owned
//! by exactly one holder at a time: the pool while idle, the caller while
//! checked out.

use crate::config::EngineType;
use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::time::Instant;

/// A physical connection plus its normalized envelope.
pub struct Connection {
    id: String,
    engine: EngineType,
    /// Cleared by `disconnect` or when the adapter observes a dead socket
    pub connected: bool,
    pub last_activity: Instant,
    pub in_transaction: bool,
    pub transaction_level: u32,
    /// Active savepoint names, oldest first
    pub savepoints: Vec<String>,
    created_at: Instant,
    broken: bool,
    native: Box<dyn Any + Send>,
}

impl Connection {
    pub fn new<T: Any + Send>(engine: EngineType, native: T) -> Self {
        let now = Instant::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            engine,
            connected: true,
            last_activity: now,
            in_transaction: false,
            transaction_level: 0,
            savepoints: Vec::new(),
            created_at: now,
            broken: false,
            native: Box::new(native),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> EngineType {
        self.engine
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Borrow the driver object, failing if it is not a `T`.
    pub fn native<T: Any>(&self) -> DbResult<&T> {
        self.native.downcast_ref::<T>().ok_or_else(|| {
            DbError::internal(format!(
                "connection {} does not hold a {} driver handle",
                self.id, self.engine
            ))
        })
    }

    /// Mutably borrow the driver object, failing if it is not a `T`.
    pub fn native_mut<T: Any>(&mut self) -> DbResult<&mut T> {
        let (id, engine) = (self.id.clone(), self.engine);
        self.native.downcast_mut::<T>().ok_or_else(|| {
            DbError::internal(format!(
                "connection {} does not hold a {} driver handle",
                id, engine
            ))
        })
    }

    /// Move the driver object out, leaving the envelope disconnected.
    pub fn take_native<T: Any>(&mut self) -> DbResult<T> {
        if !self.native.is::<T>() {
            return Err(DbError::internal(format!(
                "connection {} does not hold a {} driver handle",
                self.id, self.engine
            )));
        }
        let native = std::mem::replace(&mut self.native, Box::new(()));
        self.connected = false;
        native
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| DbError::internal("driver handle type changed during take"))
    }

    /// Record activity on this connection.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Flag the connection so the pool destroys it instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn is_usable(&self) -> bool {
        self.connected && !self.broken
    }

    /// Reset the transaction envelope after a real COMMIT or ROLLBACK.
    pub fn clear_transaction(&mut self) {
        self.in_transaction = false;
        self.transaction_level = 0;
        self.savepoints.clear();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("connected", &self.connected)
            .field("in_transaction", &self.in_transaction)
            .field("transaction_level", &self.transaction_level)
            .field("savepoints", &self.savepoints)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    /// SQL Server only
    Snapshot,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Options for opening a transaction level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub isolation: Option<IsolationLevel>,
}

impl TransactionOptions {
    pub fn with_isolation(isolation: IsolationLevel) -> Self {
        Self {
            isolation: Some(isolation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDriver(u32);

    #[test]
    fn test_native_downcast() {
        let mut conn = Connection::new(EngineType::Postgres, FakeDriver(7));
        assert_eq!(conn.native::<FakeDriver>().unwrap().0, 7);
        conn.native_mut::<FakeDriver>().unwrap().0 = 9;
        assert_eq!(conn.native::<FakeDriver>().unwrap().0, 9);
        assert!(conn.native::<String>().is_err());
    }

    #[test]
    fn test_take_native_disconnects() {
        let mut conn = Connection::new(EngineType::Redis, FakeDriver(1));
        assert!(conn.take_native::<String>().is_err());
        assert!(conn.connected);
        let driver = conn.take_native::<FakeDriver>().unwrap();
        assert_eq!(driver.0, 1);
        assert!(!conn.connected);
        assert!(conn.native::<FakeDriver>().is_err());
    }

    #[test]
    fn test_broken_connection_not_usable() {
        let mut conn = Connection::new(EngineType::MySql, ());
        assert!(conn.is_usable());
        conn.mark_broken();
        assert!(!conn.is_usable());
    }

    #[test]
    fn test_unique_ids() {
        let a = Connection::new(EngineType::MySql, ());
        let b = Connection::new(EngineType::MySql, ());
        assert_ne!(a.id(), b.id());
    }
}
