//! Connection, transaction and execution layer.
//!
//! - [`pool`]: bounded connection pool with FIFO waiters and idle reaping
//! - [`manager`]: per-alias connection source with health monitoring
//! - [`transaction`]: nested transactions emulated with savepoints
//! - [`executor`]: timeouts, cancellation and retries around adapter calls
//! - [`registry`]: the alias-keyed facade callers use

pub mod executor;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod transaction;

pub use executor::{QueryExecutor, RetryPolicy, Statement};
pub use manager::{ConnectionManager, HealthOptions, HealthStatus};
pub use pool::{ConnectionPool, PoolStats};
pub use registry::{ConnectionStats, DatabaseRegistry};
pub use transaction::{TransactionInfo, TransactionManager};
