//! Core types for tidepool.
//!
//! This crate provides the foundational pieces shared by the pool crates:
//!
//! - `Error` and `Result` for every pool, connection and config failure
//! - `PreparedStatement` and the per-connection `StatementCache`

pub mod error;
pub mod statement;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, PoolError, PoolErrorKind, Result,
};
pub use statement::{PreparedStatement, StatementCache};
