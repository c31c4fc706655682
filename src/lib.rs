//! DB Session Manager Library
//!
//! This library manages pooled sessions against SQL databases (PostgreSQL,
//! MySQL, SQLite): a shared pool cache keyed by target, per-caller
//! connections that reconnect on their own, timeouts and transactions with
//! guaranteed rollback.

pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{Connection, PoolRegistry, Transaction};
pub use error::{DbError, DbResult};
