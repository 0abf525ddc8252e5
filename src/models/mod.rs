//! Data models for db-bridge.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{Connection, IsolationLevel, TransactionOptions};
pub use query::{
    ColumnMetadata, PreparedStatement, QueryOptions, QueryParam, QueryResult, RawResult,
    ServerMetadata,
};
