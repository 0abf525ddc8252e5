//! db-bridge library
//!
//! A database-access layer for test automation: one uniform contract over
//! SQL Server, MySQL, PostgreSQL, Oracle, MongoDB and Redis, with pooling,
//! health monitoring, nested transactions, retrying execution, result
//! normalization/export and query validation.

pub mod adapters;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod result;
pub mod validation;

pub use config::{EndpointConfig, EngineType, PoolOptions};
pub use db::DatabaseRegistry;
pub use error::{DbError, DbResult, ErrorKind};
pub use models::{Connection, QueryParam, QueryResult};
